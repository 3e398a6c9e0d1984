//! Dataset schema: column descriptors, packing attributes, distinguished
//! roles and file-name id synthesis

use crate::data::{Attributes, ColumnType, TimeEncoding};
use crate::{FuseError, Result};
use ahash::AHashMap;
use regex::Regex;

/// Packing attributes by which raw source values are linearized to physical
/// values: physical = raw * scale + offset, with fill/missing sentinels in
/// raw space. NaN means unspecified.
#[derive(Debug, Clone, Copy)]
pub struct Packing {
    pub scale: f64,
    pub offset: f64,
    pub fill: f64,
    pub missing: f64,
}

impl Default for Packing {
    fn default() -> Self {
        Self { scale: f64::NAN, offset: f64::NAN, fill: f64::NAN, missing: f64::NAN }
    }
}

impl Packing {
    pub fn from_attrs(atts: &Attributes) -> Self {
        Self {
            scale: atts.get_number("scale_factor"),
            offset: atts.get_number("add_offset"),
            fill: atts.get_number("_FillValue"),
            missing: atts.get_number("missing_value"),
        }
    }

    pub fn is_trivial(&self) -> bool {
        (self.scale.is_nan() || self.scale == 1.0) && (self.offset.is_nan() || self.offset == 0.0)
    }

    /// Raw source value to physical value.
    pub fn apply(&self, raw: f64) -> f64 {
        let scale = if self.scale.is_nan() { 1.0 } else { self.scale };
        let offset = if self.offset.is_nan() { 0.0 } else { self.offset };
        raw * scale + offset
    }

    /// Physical value back to raw source value.
    pub fn unapply(&self, physical: f64) -> f64 {
        let scale = if self.scale.is_nan() { 1.0 } else { self.scale };
        let offset = if self.offset.is_nan() { 0.0 } else { self.offset };
        (physical - offset) / scale
    }

    /// Is this raw value one of the missing-data sentinels?
    pub fn is_sentinel(&self, raw: f64) -> bool {
        raw.is_nan()
            || (!self.fill.is_nan() && raw == self.fill)
            || (!self.missing.is_nan() && raw == self.missing)
    }
}

/// One data column of the dataset.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    /// Name in the source files.
    pub source_name: String,
    /// Name in query results. Defaults to the source name.
    pub dest_name: String,
    pub ctype: ColumnType,
    /// Caller-supplied attribute overrides for this column.
    pub add_attrs: Attributes,
}

/// Per-column metadata resolved after the catalog update pass: effective
/// packing (overrides applied) and the time encoding, if any.
#[derive(Debug, Clone, Default)]
pub struct ColumnMeta {
    pub packing: Packing,
    pub time: Option<TimeEncoding>,
}

/// File-name id synthesis: strip the first prefix match, strip the first
/// suffix match, then capture the first match of the extract pattern.
#[derive(Debug, Clone)]
pub struct IdExtract {
    pre: Option<Regex>,
    post: Option<Regex>,
    extract: Regex,
}

impl IdExtract {
    pub fn new(pre: &str, post: &str, extract: &str) -> Result<Self> {
        let compile = |pattern: &str| -> Result<Option<Regex>> {
            if pattern.is_empty() {
                Ok(None)
            } else {
                Regex::new(pattern)
                    .map(Some)
                    .map_err(|e| FuseError::Config(format!("invalid extract regex {:?}: {}", pattern, e)))
            }
        };
        let extract = compile(extract)?
            .ok_or_else(|| FuseError::Config("extractRegex must not be empty".to_string()))?;
        Ok(Self { pre: compile(pre)?, post: compile(post)?, extract })
    }

    /// Derive the id value from a file name. An empty string means the
    /// extraction failed; the caller records that as a missing value.
    pub fn extract(&self, file_name: &str) -> String {
        let mut name = file_name.to_string();
        if let Some(re) = &self.pre {
            if let Some(m) = re.find(&name) {
                name.replace_range(m.range(), "");
            }
        }
        if let Some(re) = &self.post {
            if let Some(m) = re.find(&name) {
                name.replace_range(m.range(), "");
            }
        }
        match self.extract.find(&name) {
            Some(m) => m.as_str().to_string(),
            None => String::new(),
        }
    }
}

/// Resolved schema for one dataset: the ordered columns plus the
/// distinguished roles (time, latitude, longitude, altitude, id, sorted).
#[derive(Debug, Clone)]
pub struct DatasetSchema {
    pub columns: Vec<ColumnSpec>,
    source_to_idx: AHashMap<String, usize>,
    dest_to_idx: AHashMap<String, usize>,
    pub time_index: Option<usize>,
    pub lat_index: Option<usize>,
    pub lon_index: Option<usize>,
    pub alt_index: Option<usize>,
    pub id_index: Option<usize>,
    pub sorted_index: Option<usize>,
    pub id_extract: Option<IdExtract>,
    pub sort_by_indices: Vec<usize>,
}

impl DatasetSchema {
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn source_index(&self, name: &str) -> Option<usize> {
        self.source_to_idx.get(name).copied()
    }

    pub fn dest_index(&self, name: &str) -> Option<usize> {
        self.dest_to_idx.get(name).copied()
    }

    pub fn column(&self, idx: usize) -> &ColumnSpec {
        &self.columns[idx]
    }

    pub fn is_id(&self, idx: usize) -> bool {
        self.id_index == Some(idx)
    }

    /// Build and validate the schema from column specs and role names.
    pub fn build(
        columns: Vec<ColumnSpec>,
        column_name_for_extract: &str,
        id_extract: Option<IdExtract>,
        sorted_column_source_name: &str,
        sort_files_by_source_names: &str,
    ) -> Result<DatasetSchema> {
        if columns.is_empty() {
            return Err(FuseError::Config("at least one data variable is required".to_string()));
        }

        let mut source_to_idx = AHashMap::new();
        let mut dest_to_idx = AHashMap::new();
        for (i, col) in columns.iter().enumerate() {
            if source_to_idx.insert(col.source_name.clone(), i).is_some() {
                return Err(FuseError::Config(format!(
                    "duplicate source column name {:?}",
                    col.source_name
                )));
            }
            if dest_to_idx.insert(col.dest_name.clone(), i).is_some() {
                return Err(FuseError::Config(format!(
                    "duplicate destination column name {:?}",
                    col.dest_name
                )));
            }
        }

        let role = |dest: &str| dest_to_idx.get(dest).copied();
        let time_index = role("time");
        let lat_index = role("latitude");
        let lon_index = role("longitude");
        let alt_index = role("altitude");

        let id_index = if column_name_for_extract.is_empty() {
            None
        } else {
            let idx = source_to_idx.get(column_name_for_extract).copied().ok_or_else(|| {
                FuseError::Config(format!(
                    "columnNameForExtract={:?} is not a data variable",
                    column_name_for_extract
                ))
            })?;
            if columns[idx].ctype != ColumnType::Text {
                return Err(FuseError::Config(format!(
                    "columnNameForExtract={:?} must be a text column",
                    column_name_for_extract
                )));
            }
            if id_extract.is_none() {
                return Err(FuseError::Config(format!(
                    "columnNameForExtract={:?} was specified but extractRegex is empty",
                    column_name_for_extract
                )));
            }
            Some(idx)
        };
        if id_index.is_none() && id_extract.is_some() {
            return Err(FuseError::Config(
                "extractRegex was specified but columnNameForExtract is empty".to_string(),
            ));
        }

        let sorted_index = if sorted_column_source_name.is_empty() {
            None
        } else {
            let idx = source_to_idx.get(sorted_column_source_name).copied().ok_or_else(|| {
                FuseError::Config(format!(
                    "sortedColumnSourceName={:?} is not a data variable",
                    sorted_column_source_name
                ))
            })?;
            if !columns[idx].ctype.is_numeric() {
                return Err(FuseError::Config(format!(
                    "sorted column {:?} must be numeric",
                    sorted_column_source_name
                )));
            }
            Some(idx)
        };

        if sort_files_by_source_names.contains(',') {
            return Err(FuseError::Config(
                "sortFilesBySourceNames should be space separated, not comma separated".to_string(),
            ));
        }
        let mut sort_by_indices = Vec::new();
        for name in sort_files_by_source_names.split_whitespace() {
            let idx = source_to_idx.get(name).copied().ok_or_else(|| {
                FuseError::Config(format!("unknown sortFilesBySourceNames name {:?}", name))
            })?;
            sort_by_indices.push(idx);
        }

        Ok(DatasetSchema {
            columns,
            source_to_idx,
            dest_to_idx,
            time_index,
            lat_index,
            lon_index,
            alt_index,
            id_index,
            sorted_index,
            id_extract,
            sort_by_indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(source: &str, dest: &str, ctype: ColumnType) -> ColumnSpec {
        ColumnSpec {
            source_name: source.to_string(),
            dest_name: dest.to_string(),
            ctype,
            add_attrs: Attributes::new(),
        }
    }

    #[test]
    fn test_packing() {
        let mut atts = Attributes::new();
        atts.set("scale_factor", crate::AttrValue::Number(0.1));
        atts.set("add_offset", crate::AttrValue::Number(5.0));
        atts.set("_FillValue", crate::AttrValue::Number(-999.0));
        let p = Packing::from_attrs(&atts);
        assert_eq!(p.apply(10.0), 6.0);
        assert_eq!(p.unapply(6.0), 10.0);
        assert!(p.is_sentinel(-999.0));
        assert!(p.is_sentinel(f64::NAN));
        assert!(!p.is_sentinel(0.0));

        let trivial = Packing::default();
        assert!(trivial.is_trivial());
        assert_eq!(trivial.apply(3.5), 3.5);
    }

    #[test]
    fn test_id_extract() {
        let ex = IdExtract::new(r"^station_", r"\.dat$", r".*").unwrap();
        assert_eq!(ex.extract("station_A12.dat"), "A12");
        // no prefix match: prefix stays, extract still captures everything
        assert_eq!(ex.extract("A12.dat"), "A12");

        let ex = IdExtract::new("", "", r"[0-9]+").unwrap();
        assert_eq!(ex.extract("file123.dat"), "123");
        assert_eq!(ex.extract("file.dat"), "");
    }

    #[test]
    fn test_build_roles() {
        let schema = DatasetSchema::build(
            vec![
                col("TIME", "time", ColumnType::Float64),
                col("LAT", "latitude", ColumnType::Float32),
                col("station", "station", ColumnType::Text),
            ],
            "station",
            Some(IdExtract::new("", "", ".*").unwrap()),
            "TIME",
            "TIME",
        )
        .unwrap();
        assert_eq!(schema.time_index, Some(0));
        assert_eq!(schema.lat_index, Some(1));
        assert_eq!(schema.id_index, Some(2));
        assert_eq!(schema.sorted_index, Some(0));
        assert_eq!(schema.sort_by_indices, vec![0]);
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let cols = vec![col("TIME", "time", ColumnType::Float64)];
        // unknown sorted column
        assert!(DatasetSchema::build(cols.clone(), "", None, "DEPTH", "").is_err());
        // comma separated sort list
        assert!(DatasetSchema::build(cols.clone(), "", None, "", "TIME,TIME").is_err());
        // extract regex without column
        assert!(DatasetSchema::build(
            cols,
            "",
            Some(IdExtract::new("", "", ".*").unwrap()),
            "",
            ""
        )
        .is_err());
    }
}
