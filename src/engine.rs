//! Dataset engine
//!
//! Ties the pieces together for one dataset: construction (load persisted
//! state, run a full update pass), reload, and the query entry point.
//! Queries read an immutable snapshot; the updater builds a new snapshot
//! and swaps it in, so the query path never locks against catalog
//! maintenance.

use crate::catalog::{persist, BadFileRegistry, CatalogSnapshot, DirTable, FileTable};
use crate::config::DatasetConfig;
use crate::data::{Attributes, DatasetSchema};
use crate::notify::Notifier;
use crate::query::{execute_query, plan_query, TableQuery};
use crate::reader::FileReader;
use crate::scan::{CatalogUpdater, UpdateOutcome, UpdateStats};
use crate::sink::ResultSink;
use crate::{FuseError, Result};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// External cancellation signal for one query. Checked between file scans
/// and between emitted chunks; cancellation is a clean termination, not an
/// error.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One dataset: a set of same-schema files served as a single virtual
/// table.
pub struct FileSetDataset {
    config: DatasetConfig,
    schema: DatasetSchema,
    reader: Arc<dyn FileReader>,
    notifier: Arc<dyn Notifier>,
    state_dir: PathBuf,
    bad_files: BadFileRegistry,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    /// Two update passes must never overlap.
    update_lock: Mutex<()>,
    reload_needed: AtomicBool,
    last_reload: Mutex<Instant>,
    last_stats: Mutex<UpdateStats>,
}

impl std::fmt::Debug for FileSetDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSetDataset")
            .field("config", &self.config)
            .field("schema", &self.schema)
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

impl FileSetDataset {
    /// Construct the dataset: validate configuration, load any persisted
    /// catalog state from `state_dir`, then run one full update pass
    /// (blocking). Fails on configuration or persistence errors and when no
    /// valid files exist.
    pub fn open(
        config: DatasetConfig,
        reader: Arc<dyn FileReader>,
        notifier: Arc<dyn Notifier>,
        state_dir: &Path,
    ) -> Result<Self> {
        let schema = config.resolve_schema()?;
        let (dirs, files, bad_entries) = persist::load_state(state_dir, &schema.columns);
        let bad_files = if config.files_are_local {
            BadFileRegistry::from_entries(bad_entries)
        } else {
            BadFileRegistry::new()
        };
        // a file table without its directory table would hold dangling
        // indices; discard both unless both loaded
        let (dirs, files) = match (dirs, files) {
            (Some(dirs), Some(files)) => (dirs, files),
            _ => (DirTable::new(), FileTable::new(schema.n_columns())),
        };

        let updater = CatalogUpdater {
            config: &config,
            schema: &schema,
            reader: reader.as_ref(),
            bad_files: &bad_files,
        };
        let outcome = updater.run(dirs, files, state_dir, notifier.as_ref())?;
        let stats = outcome.stats;

        Ok(Self {
            config,
            schema,
            reader,
            notifier,
            state_dir: state_dir.to_path_buf(),
            bad_files,
            snapshot: RwLock::new(Arc::new(Self::snapshot_from(outcome))),
            update_lock: Mutex::new(()),
            reload_needed: AtomicBool::new(false),
            last_reload: Mutex::new(Instant::now()),
            last_stats: Mutex::new(stats),
        })
    }

    fn snapshot_from(outcome: UpdateOutcome) -> CatalogSnapshot {
        CatalogSnapshot {
            dirs: outcome.dirs,
            files: outcome.files,
            aggregate: outcome.aggregate,
            metas: outcome.metas,
            global_attrs: outcome.global_attrs,
        }
    }

    /// Current immutable catalog view.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Dataset-level metadata from the last update pass.
    pub fn global_attrs(&self) -> Attributes {
        self.snapshot().global_attrs.clone()
    }

    pub fn last_update_stats(&self) -> UpdateStats {
        *self.last_stats.lock()
    }

    /// Run a full diff+rescan pass and swap in the new snapshot. Serialized
    /// against concurrent reloads; queries keep using the old snapshot
    /// until the swap.
    pub fn reload(&self) -> Result<()> {
        let _guard = self.update_lock.lock();
        let prev = self.snapshot();
        let updater = CatalogUpdater {
            config: &self.config,
            schema: &self.schema,
            reader: self.reader.as_ref(),
            bad_files: &self.bad_files,
        };
        let outcome = updater.run(
            prev.dirs.clone(),
            prev.files.clone(),
            &self.state_dir,
            self.notifier.as_ref(),
        )?;
        *self.last_stats.lock() = outcome.stats;
        *self.snapshot.write() = Arc::new(Self::snapshot_from(outcome));
        self.reload_needed.store(false, Ordering::Relaxed);
        *self.last_reload.lock() = Instant::now();
        Ok(())
    }

    /// Answer one parsed query, streaming chunks to `sink`.
    pub fn query(
        &self,
        query: &TableQuery,
        sink: &mut dyn ResultSink,
        cancel: &CancelToken,
    ) -> Result<()> {
        let snapshot = self.snapshot();
        let plan = plan_query(query, &self.schema, &self.config, &snapshot)?;
        let result = execute_query(
            &plan,
            &self.schema,
            &self.config,
            &snapshot,
            self.reader.as_ref(),
            &self.bad_files,
            sink,
            cancel,
        );
        if matches!(&result, Err(FuseError::RetryLater(_))) {
            // the catalog no longer reflects this file; refresh soon
            self.mark_reload_needed();
        }
        result
    }

    pub fn mark_reload_needed(&self) {
        self.reload_needed.store(true, Ordering::Relaxed);
    }

    /// Whether the surrounding server should schedule a reload now, either
    /// because a query hit a stale file or because the configured cadence
    /// elapsed.
    pub fn needs_reload(&self) -> bool {
        if self.reload_needed.load(Ordering::Relaxed) {
            return true;
        }
        self.last_reload.lock().elapsed().as_secs() / 60 >= self.config.reload_every_n_minutes
    }
}
