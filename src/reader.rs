//! File reader capability
//!
//! The engine knows nothing about file formats. A reader opens one file and
//! returns a sub-table for the requested column subset, optionally
//! restricted to a sorted-column range. File handles are scoped to one
//! `read` call; implementations release them on all exit paths.

use crate::data::{Attributes, ColumnType};
use crate::Result;
use ahash::AHashMap;
use arrow::record_batch::RecordBatch;

/// One read request against one file.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    /// Directory path (from the directory table).
    pub dir: String,
    /// File name relative to `dir`.
    pub file_name: String,
    /// Requested source columns with their types. A file missing one of
    /// these is not an error; the reader just omits that column.
    pub columns: Vec<(String, ColumnType)>,
    /// Sorted-column state for this file: -1 unknown, 0 ascending,
    /// positive = ascending with this even stride.
    pub sorted_spacing: f64,
    /// Desired sorted-column bounds in source encoding; NaN = unbounded.
    /// Readers may ignore these and return extra rows.
    pub min_sorted: f64,
    pub max_sorted: f64,
    /// Also return per-column and global metadata.
    pub get_metadata: bool,
    /// The caller needs actual data rows, not just ranges.
    pub must_get_all_data: bool,
}

/// What a reader hands back: raw source values plus attributes.
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub batch: RecordBatch,
    /// Per-column attributes keyed by source column name.
    pub column_attrs: AHashMap<String, Attributes>,
    pub global_attrs: Attributes,
}

impl SourceTable {
    pub fn attrs_for(&self, column: &str) -> Attributes {
        self.column_attrs.get(column).cloned().unwrap_or_default()
    }
}

/// Pluggable capability to read one file. Implementations per format (text,
/// binary, ...) live outside the engine.
pub trait FileReader: Send + Sync {
    fn read(&self, request: &ReadRequest) -> Result<SourceTable>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::FuseError;
    use arrow::array::{ArrayRef, Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory reader keyed by "dir/name", with failure injection.
    #[derive(Default)]
    pub struct FakeReader {
        tables: Mutex<AHashMap<String, SourceTable>>,
        fail: Mutex<AHashMap<String, usize>>,
        reads: Mutex<Vec<String>>,
    }

    impl FakeReader {
        pub fn new() -> Self {
            Self::default()
        }

        fn key(dir: &str, name: &str) -> String {
            format!("{}/{}", dir, name)
        }

        pub fn insert(&self, dir: &str, name: &str, table: SourceTable) {
            self.tables.lock().insert(Self::key(dir, name), table);
        }

        /// The next `n` reads of this file fail.
        pub fn fail_times(&self, dir: &str, name: &str, n: usize) {
            self.fail.lock().insert(Self::key(dir, name), n);
        }

        pub fn read_count(&self, dir: &str, name: &str) -> usize {
            let key = Self::key(dir, name);
            self.reads.lock().iter().filter(|k| **k == key).count()
        }
    }

    impl FileReader for FakeReader {
        fn read(&self, request: &ReadRequest) -> Result<SourceTable> {
            let key = Self::key(&request.dir, &request.file_name);
            self.reads.lock().push(key.clone());
            if let Some(n) = self.fail.lock().get_mut(&key) {
                if *n > 0 {
                    *n -= 1;
                    return Err(FuseError::Scan(format!("injected failure for {}", key)));
                }
            }
            self.tables
                .lock()
                .get(&key)
                .cloned()
                .ok_or_else(|| FuseError::Scan(format!("no table prepared for {}", key)))
        }
    }

    /// Build a SourceTable from f64 and text columns (all nullable).
    pub fn source_table(
        float_cols: &[(&str, Vec<Option<f64>>)],
        text_cols: &[(&str, Vec<Option<&str>>)],
    ) -> SourceTable {
        let mut fields = Vec::new();
        let mut arrays: Vec<ArrayRef> = Vec::new();
        for (name, values) in float_cols {
            fields.push(Field::new(*name, DataType::Float64, true));
            arrays.push(Arc::new(Float64Array::from(values.clone())));
        }
        for (name, values) in text_cols {
            fields.push(Field::new(*name, DataType::Utf8, true));
            arrays.push(Arc::new(StringArray::from(values.clone())));
        }
        let batch =
            RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).expect("test batch");
        SourceTable {
            batch,
            column_attrs: AHashMap::new(),
            global_attrs: Attributes::new(),
        }
    }
}
