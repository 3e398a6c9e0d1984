//! Persistent file catalog: directory table, per-file ranges, bad-file
//! registry and their on-disk representation

pub mod bad_files;
pub mod dir_table;
pub mod file_table;
pub mod persist;

pub use bad_files::{BadFileEntry, BadFileRegistry};
pub use dir_table::DirTable;
pub use file_table::{ColumnRange, FileRecord, FileTable};
pub use persist::{load_state, save_state, BAD_FILES_FILENAME, DIR_TABLE_FILENAME, FILE_TABLE_FILENAME};

use crate::data::{Attributes, ColumnMeta};

/// An immutable view of the catalog taken by the query path. The updater
/// builds a fresh snapshot and swaps it in; readers never see partial state.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub dirs: DirTable,
    pub files: FileTable,
    /// One entry per column: min of file mins, max of file maxes, OR of
    /// has-missing bits.
    pub aggregate: Vec<ColumnRange>,
    /// Effective packing and time encoding per column.
    pub metas: Vec<ColumnMeta>,
    /// Dataset-level metadata from the metadataFrom file, override layer
    /// applied.
    pub global_attrs: Attributes,
}
