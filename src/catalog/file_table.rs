//! File catalog: one row per data file with per-column value ranges

use crate::data::{CellValue, ColumnType};
use std::cmp::Ordering;

/// The range of one column's values within one file. `None` min/max means
/// the file had no valid values for the column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColumnRange {
    pub min: Option<CellValue>,
    pub max: Option<CellValue>,
    pub has_missing: bool,
}

impl ColumnRange {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Numeric view of min; NaN when absent.
    pub fn min_f64(&self) -> f64 {
        self.min.as_ref().map(|v| v.as_f64()).unwrap_or(f64::NAN)
    }

    pub fn max_f64(&self) -> f64 {
        self.max.as_ref().map(|v| v.as_f64()).unwrap_or(f64::NAN)
    }

    /// Text view of min; "" when absent.
    pub fn min_text(&self) -> &str {
        self.min.as_ref().and_then(|v| v.as_text()).unwrap_or("")
    }

    pub fn max_text(&self) -> &str {
        self.max.as_ref().and_then(|v| v.as_text()).unwrap_or("")
    }

    /// Does this file hold exactly one value for the column?
    pub fn is_uniform(&self, ctype: ColumnType) -> bool {
        match (&self.min, &self.max) {
            (Some(min), Some(max)) => {
                if ctype == ColumnType::Text {
                    min.as_text() == max.as_text()
                } else {
                    min.as_f64() == max.as_f64()
                }
            }
            _ => false,
        }
    }
}

/// One file's record in the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub dir_index: u16,
    /// Path relative to the directory at `dir_index`.
    pub name: String,
    /// Wall-clock modification time, milliseconds.
    pub last_mod_ms: f64,
    /// Sorted-column state: -1 not ascending, 0 ascending but uneven,
    /// positive stride when evenly spaced.
    pub sorted_spacing: f64,
    /// One range per dataset column.
    pub ranges: Vec<ColumnRange>,
}

impl FileRecord {
    pub fn blank(dir_index: u16, name: &str, n_columns: usize) -> Self {
        Self {
            dir_index,
            name: name.to_string(),
            last_mod_ms: 0.0,
            sorted_spacing: -1.0,
            ranges: vec![ColumnRange::empty(); n_columns],
        }
    }

    pub fn key(&self) -> (u16, &str) {
        (self.dir_index, self.name.as_str())
    }
}

/// The catalog proper: rows sorted ascending by (dir_index, name), unique.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileTable {
    rows: Vec<FileRecord>,
    n_columns: usize,
}

impl FileTable {
    pub fn new(n_columns: usize) -> Self {
        Self { rows: Vec::new(), n_columns }
    }

    pub fn from_rows(n_columns: usize, mut rows: Vec<FileRecord>) -> Self {
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Self { rows, n_columns }
    }

    pub fn n_columns(&self) -> usize {
        self.n_columns
    }

    pub fn rows(&self) -> &[FileRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn sort_by_path(&mut self) {
        self.rows.sort_by(|a, b| a.key().cmp(&b.key()));
    }

    /// Binary search by (dir_index, name).
    pub fn position(&self, dir_index: u16, name: &str) -> std::result::Result<usize, usize> {
        self.rows.binary_search_by(|r| r.key().cmp(&(dir_index, name)))
    }

    /// Per-column aggregate over all rows: min of mins (ignoring files with
    /// no valid values), max of maxes, OR of has-missing.
    pub fn aggregate(&self) -> Vec<ColumnRange> {
        let mut agg = vec![ColumnRange::empty(); self.n_columns];
        for row in &self.rows {
            for (col, range) in row.ranges.iter().enumerate() {
                let out = &mut agg[col];
                if let Some(min) = &range.min {
                    let replace = match &out.min {
                        Some(cur) => min.range_cmp(cur) == Ordering::Less,
                        None => true,
                    };
                    if replace {
                        out.min = Some(min.clone());
                    }
                }
                if let Some(max) = &range.max {
                    let replace = match &out.max {
                        Some(cur) => max.range_cmp(cur) == Ordering::Greater,
                        None => true,
                    };
                    if replace {
                        out.max = Some(max.clone());
                    }
                }
                out.has_missing |= range.has_missing;
            }
        }
        agg
    }

    /// Re-sort rows by the named columns' min values ascending, falling back
    /// to (dir_index, name). This defines file visitation order at query
    /// time, and thereby output row order for unsorted queries.
    pub fn sort_by_column_mins(&mut self, col_indices: &[usize]) {
        if col_indices.is_empty() {
            return;
        }
        self.rows.sort_by(|a, b| {
            for &col in col_indices {
                let (ra, rb) = (&a.ranges[col], &b.ranges[col]);
                let ord = match (&ra.min, &rb.min) {
                    (Some(x), Some(y)) => x.range_cmp(y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.key().cmp(&b.key())
        });
    }
}
