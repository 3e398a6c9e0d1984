//! Catalog updater
//!
//! Runs one full update pass: discover files, diff them against the current
//! catalog, scan new and changed files through the reader capability,
//! quarantine failures, recompute aggregates and persist the result
//! atomically. Only one updater runs at a time (the engine serializes
//! invocations); the query path keeps reading the previous snapshot until
//! the new one is swapped in.

use crate::catalog::{persist, BadFileRegistry, ColumnRange, DirTable, FileRecord, FileTable};
use crate::config::{DatasetConfig, MetadataFrom};
use crate::data::{
    almost_equal, numeric_values, text_values, time, Attributes, CellValue, ColumnMeta,
    ColumnType, DatasetSchema, TimeEncoding,
};
use crate::notify::Notifier;
use crate::reader::{FileReader, ReadRequest};
use crate::scan::SchemaSentinel;
use crate::{FuseError, Result};
use ahash::AHashMap;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Counters from one update pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub n_unchanged: usize,
    pub n_removed: usize,
    pub n_new: usize,
    pub n_different_mod_time: usize,
    pub n_read_file: usize,
    pub n_no_last_mod: usize,
}

/// Everything an update pass produces.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub dirs: DirTable,
    pub files: FileTable,
    pub aggregate: Vec<ColumnRange>,
    pub metas: Vec<ColumnMeta>,
    pub global_attrs: Attributes,
    pub stats: UpdateStats,
}

/// One file found by the directory scan.
#[derive(Debug, Clone)]
struct ScanEntry {
    dir_index: u16,
    name: String,
    /// 0.0 when the modification time could not be read.
    last_mod_ms: f64,
}

pub struct CatalogUpdater<'a> {
    pub config: &'a DatasetConfig,
    pub schema: &'a DatasetSchema,
    pub reader: &'a dyn FileReader,
    pub bad_files: &'a BadFileRegistry,
}

impl<'a> CatalogUpdater<'a> {
    /// Run one update pass against the previous catalog state and persist
    /// the result. On error the previous on-disk state is left untouched.
    pub fn run(
        &self,
        prev_dirs: DirTable,
        prev_files: FileTable,
        state_dir: &Path,
        notifier: &dyn Notifier,
    ) -> Result<UpdateOutcome> {
        if !self.config.files_are_local {
            // transient remote failures must not exclude files permanently
            self.bad_files.clear();
        }

        let mut dirs = prev_dirs;
        let scan = self.discover(&mut dirs)?;
        if scan.is_empty() {
            // don't touch the previous state; a drive may just be unmounted
            return Err(FuseError::Scan(format!(
                "0 files found in {} (regex={:?}, recursive={})",
                self.config.file_dir, self.config.file_name_regex, self.config.recursive
            )));
        }
        log::info!(
            "{}: {} files found in {}",
            self.config.dataset_id,
            scan.len(),
            self.config.file_dir
        );

        let present: HashSet<(u16, String)> =
            scan.iter().map(|e| (e.dir_index, e.name.clone())).collect();
        let n_pruned = self.bad_files.prune_missing(&present);
        if n_pruned > 0 {
            log::debug!("{} previously bad file(s) now missing", n_pruned);
        }

        let mut old = prev_files;
        old.sort_by_path();

        let mut sentinel = SchemaSentinel::new(&self.schema.columns);
        self.seed_expected(&dirs, &old, &scan, &mut sentinel);

        let mut stats = UpdateStats::default();
        let mut rows: Vec<FileRecord> = Vec::with_capacity(scan.len());
        let now_ms = now_millis();
        let old_rows = old.rows();
        let mut ci = 0;

        for entry in &scan {
            while ci < old_rows.len() && old_rows[ci].key() < (entry.dir_index, entry.name.as_str())
            {
                log::debug!("previously valid file now missing: {}", old_rows[ci].name);
                ci += 1;
                stats.n_removed += 1;
            }
            let matches_old = ci < old_rows.len()
                && old_rows[ci].key() == (entry.dir_index, entry.name.as_str());

            if entry.last_mod_ms == 0.0 {
                stats.n_no_last_mod += 1;
                self.bad_files.mark(
                    entry.dir_index,
                    &entry.name,
                    0.0,
                    "unable to get last-modified time",
                );
                if matches_old {
                    ci += 1;
                    stats.n_removed += 1;
                }
                continue;
            }

            if let Some(bad) = self.bad_files.entry(entry.dir_index, &entry.name) {
                if bad.last_mod_ms == entry.last_mod_ms {
                    // still quarantined; drop any stale catalog row too
                    if matches_old {
                        ci += 1;
                        stats.n_removed += 1;
                    }
                    continue;
                }
                // changed since being marked bad: give it another chance
                self.bad_files.remove(entry.dir_index, &entry.name);
            }

            if matches_old && old_rows[ci].last_mod_ms == entry.last_mod_ms {
                rows.push(old_rows[ci].clone());
                ci += 1;
                stats.n_unchanged += 1;
                continue;
            }
            if matches_old {
                ci += 1;
                stats.n_different_mod_time += 1;
            } else {
                stats.n_new += 1;
            }

            stats.n_read_file += 1;
            match self.scan_file(&mut sentinel, &dirs, entry) {
                Ok(record) => rows.push(record),
                Err(e) => {
                    log::warn!(
                        "bad file, no catalog row for {}/{}: {}",
                        dirs.get(entry.dir_index).unwrap_or("?"),
                        entry.name,
                        e
                    );
                    stats.n_removed += 1;
                    let age_ms = now_ms - entry.last_mod_ms;
                    if age_ms > self.config.bad_file_min_age_minutes * 60_000.0 {
                        // old enough that it is not an in-flight transfer
                        self.bad_files.mark(
                            entry.dir_index,
                            &entry.name,
                            entry.last_mod_ms,
                            e.to_string(),
                        );
                    }
                }
            }
        }
        stats.n_removed += old_rows.len() - ci;

        let mut files = FileTable::from_rows(self.schema.n_columns(), rows);
        files.sort_by_column_mins(&self.schema.sort_by_indices);
        let aggregate = files.aggregate();

        if files.is_empty() {
            return Err(FuseError::Scan("no valid files were found".to_string()));
        }

        let global_attrs = self.dataset_metadata(&dirs, &files)?;
        let metas = (0..self.schema.n_columns())
            .map(|col| ColumnMeta {
                packing: sentinel.packing(col),
                time: self.resolve_time(col, &sentinel),
            })
            .collect();

        if let Err(e) = persist::save_state(state_dir, &dirs, &files, &self.schema.columns, self.bad_files)
        {
            notifier.notify(
                &format!("{}: catalog persistence failed", self.config.dataset_id),
                &e.to_string(),
            );
            return Err(e);
        }

        if !self.bad_files.is_empty() {
            notifier.notify(
                &format!("{}: quarantined files", self.config.dataset_id),
                &self.bad_files.summary(&dirs),
            );
        }
        log::info!(
            "{}: catalog updated, {} file(s) (unchanged={} read={} new={} changed={} removed={})",
            self.config.dataset_id,
            files.len(),
            stats.n_unchanged,
            stats.n_read_file,
            stats.n_new,
            stats.n_different_mod_time,
            stats.n_removed
        );

        Ok(UpdateOutcome { dirs, files, aggregate, metas, global_attrs, stats })
    }

    /// List files matching the name regex, interning their directories.
    fn discover(&self, dirs: &mut DirTable) -> Result<Vec<ScanEntry>> {
        let pattern = Regex::new(&format!("^(?:{})$", self.config.file_name_regex))
            .map_err(|e| FuseError::Config(format!("invalid fileNameRegex: {}", e)))?;
        let max_depth = if self.config.recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.config.file_dir)
            .max_depth(max_depth)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !pattern.is_match(&name) {
                continue;
            }
            let dir = entry
                .path()
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let dir_index = dirs.intern(&dir)?;
            let last_mod_ms = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as f64)
                .unwrap_or(0.0);
            entries.push(ScanEntry { dir_index, name, last_mod_ms });
        }
        entries.sort_by(|a, b| {
            (a.dir_index, a.name.as_str()).cmp(&(b.dir_index, b.name.as_str()))
        });
        Ok(entries)
    }

    /// Seed the sentinel from the first unchanged, still-present file, so
    /// the expected attributes come from a known-good file.
    fn seed_expected(
        &self,
        dirs: &DirTable,
        old: &FileTable,
        scan: &[ScanEntry],
        sentinel: &mut SchemaSentinel,
    ) {
        let last_mods: AHashMap<(u16, &str), f64> = scan
            .iter()
            .map(|e| ((e.dir_index, e.name.as_str()), e.last_mod_ms))
            .collect();
        for row in old.rows() {
            match last_mods.get(&(row.dir_index, row.name.as_str())) {
                Some(&lm) if lm != 0.0 && lm == row.last_mod_ms => {}
                _ => continue,
            }
            let request = self.read_request(dirs, row.dir_index, &row.name, true, false);
            let table = match self.reader.read(&request) {
                Ok(t) => t,
                Err(e) => {
                    log::debug!("could not read expected attributes from {}: {}", row.name, e);
                    continue;
                }
            };
            for (col, spec) in self.schema.columns.iter().enumerate() {
                if self.schema.is_id(col)
                    || table.batch.column_by_name(&spec.source_name).is_none()
                {
                    continue;
                }
                // first observation only captures, it cannot mismatch
                let _ = sentinel.observe(col, &spec.source_name, &table.attrs_for(&spec.source_name));
            }
            log::debug!("expected attributes read from {}/{}", row.dir_index, row.name);
            return;
        }
        log::debug!("no previously valid unchanged file to read expected attributes from");
    }

    /// Read one file completely and compute its catalog record.
    fn scan_file(
        &self,
        sentinel: &mut SchemaSentinel,
        dirs: &DirTable,
        entry: &ScanEntry,
    ) -> Result<FileRecord> {
        let request = self.read_request(dirs, entry.dir_index, &entry.name, true, true);
        let table = self.reader.read(&request)?;
        let mut record = FileRecord::blank(entry.dir_index, &entry.name, self.schema.n_columns());
        record.last_mod_ms = entry.last_mod_ms;

        for (col, spec) in self.schema.columns.iter().enumerate() {
            if self.schema.is_id(col) {
                let id = self
                    .schema
                    .id_extract
                    .as_ref()
                    .map(|ex| ex.extract(&entry.name))
                    .unwrap_or_default();
                record.ranges[col] = ColumnRange {
                    has_missing: id.is_empty(),
                    min: Some(CellValue::Text(id.clone())),
                    max: Some(CellValue::Text(id)),
                };
                continue;
            }
            let array = match table.batch.column_by_name(&spec.source_name) {
                Some(a) => a,
                // the column isn't in this file: leave the empty range
                None => continue,
            };
            sentinel.observe(col, &spec.source_name, &table.attrs_for(&spec.source_name))?;
            let packing = sentinel.packing(col);

            if spec.ctype == ColumnType::Text {
                let values = text_values(array)?;
                let mut min: Option<&str> = None;
                let mut max: Option<&str> = None;
                let mut has_missing = false;
                for value in &values {
                    match value.as_deref() {
                        None | Some("") => has_missing = true,
                        Some(s) => {
                            if min.map(|m| s < m).unwrap_or(true) {
                                min = Some(s);
                            }
                            if max.map(|m| s > m).unwrap_or(true) {
                                max = Some(s);
                            }
                        }
                    }
                }
                if self.schema.time_index == Some(col) {
                    // lexicographic min/max only order correctly for
                    // ISO-8601 text
                    for value in [min, max].into_iter().flatten() {
                        if !time::looks_iso(value) {
                            return Err(FuseError::Scan(format!(
                                "text time column {:?} holds non-ISO-8601 value {:?}",
                                spec.source_name, value
                            )));
                        }
                    }
                }
                record.ranges[col] = ColumnRange {
                    min: min.map(|s| CellValue::Text(s.to_string())),
                    max: max.map(|s| CellValue::Text(s.to_string())),
                    has_missing,
                };
            } else {
                let raw = numeric_values(array, spec.ctype)?;
                let mut min = f64::INFINITY;
                let mut max = f64::NEG_INFINITY;
                let mut n_valid = 0usize;
                let mut has_missing = false;
                let is_sorted_col = self.schema.sorted_index == Some(col);
                let mut ordered: Vec<f64> = Vec::new();
                for value in &raw {
                    match value {
                        Some(v) if !packing.is_sentinel(*v) => {
                            n_valid += 1;
                            min = min.min(*v);
                            max = max.max(*v);
                            if is_sorted_col {
                                ordered.push(*v);
                            }
                        }
                        _ => has_missing = true,
                    }
                }
                if n_valid > 0 {
                    record.ranges[col] = ColumnRange {
                        min: Some(CellValue::from_f64(spec.ctype, min)),
                        max: Some(CellValue::from_f64(spec.ctype, max)),
                        has_missing,
                    };
                } else {
                    record.ranges[col].has_missing = has_missing;
                }
                if is_sorted_col {
                    record.sorted_spacing = sorted_spacing_of(&ordered);
                }
            }
        }
        Ok(record)
    }

    /// Dataset-level metadata comes from the earliest or latest modified
    /// file, with the configured override layer applied on top.
    fn dataset_metadata(&self, dirs: &DirTable, files: &FileTable) -> Result<Attributes> {
        let row = match self.config.metadata_from {
            MetadataFrom::First => files
                .rows()
                .iter()
                .min_by(|a, b| a.last_mod_ms.total_cmp(&b.last_mod_ms)),
            MetadataFrom::Last => files
                .rows()
                .iter()
                .max_by(|a, b| a.last_mod_ms.total_cmp(&b.last_mod_ms)),
        }
        .ok_or_else(|| FuseError::Scan("no valid files were found".to_string()))?;

        let request = self.read_request(dirs, row.dir_index, &row.name, true, false);
        let table = self.reader.read(&request).map_err(|e| {
            FuseError::Scan(format!("reading dataset metadata from {}: {}", row.name, e))
        })?;
        Ok(Attributes::combine(&self.config.add_global_attributes, &table.global_attrs))
    }

    fn resolve_time(&self, col: usize, sentinel: &SchemaSentinel) -> Option<TimeEncoding> {
        let spec = self.schema.column(col);
        if spec.ctype == ColumnType::Text {
            return (self.schema.time_index == Some(col)).then_some(TimeEncoding::IsoText);
        }
        // a units attribute override wins over what the files report
        if let Some(units) = spec.add_attrs.get_text("units") {
            if let Some(encoding) = TimeEncoding::parse_units(units) {
                return Some(encoding);
            }
        }
        if let Some(encoding) = sentinel.time_encoding(col) {
            return Some(encoding);
        }
        if self.schema.time_index == Some(col) {
            // the time role without declared units: values are epoch seconds
            return Some(TimeEncoding::Numeric { seconds_per_unit: 1.0, base_epoch_seconds: 0.0 });
        }
        None
    }

    fn read_request(
        &self,
        dirs: &DirTable,
        dir_index: u16,
        name: &str,
        get_metadata: bool,
        must_get_all: bool,
    ) -> ReadRequest {
        ReadRequest {
            dir: dirs.get(dir_index).unwrap_or("").to_string(),
            file_name: name.to_string(),
            columns: self
                .schema
                .columns
                .iter()
                .enumerate()
                .filter(|(i, _)| !self.schema.is_id(*i))
                .map(|(_, c)| (c.source_name.clone(), c.ctype))
                .collect(),
            sorted_spacing: -1.0,
            min_sorted: f64::NAN,
            max_sorted: f64::NAN,
            get_metadata,
            must_get_all_data: must_get_all,
        }
    }
}

pub(crate) fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

/// Sorted-column state for one file's values, in row order:
/// -1 not ascending (or fewer than two values), 0 ascending but unevenly
/// spaced, otherwise the even stride.
fn sorted_spacing_of(values: &[f64]) -> f64 {
    if values.len() <= 1 {
        return -1.0;
    }
    for pair in values.windows(2) {
        if pair[1] < pair[0] {
            return -1.0;
        }
    }
    let n = values.len();
    let expected = (values[n - 1] - values[0]) / (n as f64 - 1.0);
    for pair in values.windows(2) {
        if !almost_equal(9, pair[1] - pair[0], expected) {
            return 0.0;
        }
    }
    expected
}
