//! Row standardization
//!
//! Converts raw source chunks into result chunks: missing-value sentinels
//! become nulls, packing is applied, timestamps become epoch seconds, every
//! constraint is re-applied precisely per row (pruning only said a file
//! *may* match), and the surviving rows are projected to the requested
//! columns under their destination names.

use crate::data::{
    almost_equal, numeric_values, text_values, CellValue, ColumnMeta, ColumnType, DatasetSchema,
    TimeEncoding,
};
use crate::query::{CompareOp, QueryPlan};
use crate::{FuseError, Result};
use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use regex::Regex;
use std::sync::Arc;

/// Row-test precision: tighter than range pruning, loose enough to absorb
/// float packing drift.
const ROW_PRECISION: i32 = 9;

/// One column's values in destination space.
enum DestColumn {
    Number(Vec<Option<f64>>),
    Text(Vec<String>),
}

pub struct Standardizer<'a> {
    schema: &'a DatasetSchema,
    metas: &'a [ColumnMeta],
    plan: &'a QueryPlan,
}

impl<'a> Standardizer<'a> {
    pub fn new(schema: &'a DatasetSchema, metas: &'a [ColumnMeta], plan: &'a QueryPlan) -> Self {
        Self { schema, metas, plan }
    }

    /// Standardize one raw chunk. `id_value` supplies the id column when
    /// the chunk itself doesn't carry it. Returns None when no rows
    /// survive.
    pub fn standardize(
        &self,
        batch: &RecordBatch,
        id_value: Option<&str>,
    ) -> Result<Option<RecordBatch>> {
        let n_rows = batch.num_rows();
        if n_rows == 0 {
            return Ok(None);
        }

        // destination-space values for every column the query touches
        let mut dest: Vec<(usize, DestColumn)> = Vec::with_capacity(self.plan.read_cols.len());
        for &col in &self.plan.read_cols {
            dest.push((col, self.dest_column(batch, col, id_value, n_rows)?));
        }
        let column_for = |col: usize| -> Result<&DestColumn> {
            dest.iter()
                .find(|(c, _)| *c == col)
                .map(|(_, v)| v)
                .ok_or_else(|| FuseError::BadRequest("constraint column not in read set".to_string()))
        };

        // precise per-row re-application of every constraint
        let mut keep = vec![true; n_rows];
        for c in &self.plan.constraints {
            let values = column_for(c.col)?;
            for (row, keep_row) in keep.iter_mut().enumerate() {
                if !*keep_row {
                    continue;
                }
                let passes = match values {
                    DestColumn::Number(v) => {
                        let value = v[row].unwrap_or(f64::NAN);
                        match c.op {
                            CompareOp::Regex => {
                                test_text(c.op, &format_number(v[row]), &c.text, c.pattern.as_ref())
                            }
                            _ => test_number(c.op, value, c.number),
                        }
                    }
                    DestColumn::Text(v) => test_text(c.op, &v[row], &c.text, c.pattern.as_ref()),
                };
                if !passes {
                    *keep_row = false;
                }
            }
        }
        let n_kept = keep.iter().filter(|k| **k).count();
        if n_kept == 0 {
            return Ok(None);
        }

        // project to the requested columns, in order, under destination
        // names
        let mut fields = Vec::with_capacity(self.plan.result_cols.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.plan.result_cols.len());
        for &col in &self.plan.result_cols {
            let spec = self.schema.column(col);
            let (dtype, array) = build_array(column_for(col)?, self.dest_type(col), &keep)?;
            fields.push(Field::new(spec.dest_name.clone(), dtype, true));
            arrays.push(array);
        }
        Ok(Some(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?))
    }

    /// The result type of a column: text stays text, timestamps and packed
    /// numerics become Float64, plain numerics keep their source type.
    fn dest_type(&self, col: usize) -> ColumnType {
        let spec = self.schema.column(col);
        let meta = &self.metas[col];
        if spec.ctype == ColumnType::Text && meta.time.is_none() {
            return ColumnType::Text;
        }
        if meta.time.is_some() || !meta.packing.is_trivial() {
            return ColumnType::Float64;
        }
        spec.ctype
    }

    fn dest_column(
        &self,
        batch: &RecordBatch,
        col: usize,
        id_value: Option<&str>,
        n_rows: usize,
    ) -> Result<DestColumn> {
        let spec = self.schema.column(col);
        let meta = &self.metas[col];
        let array = batch.column_by_name(&spec.source_name);

        if self.schema.is_id(col) && array.is_none() {
            // constant id derived from the file name
            let id = id_value.unwrap_or("").to_string();
            return Ok(DestColumn::Text(vec![id; n_rows]));
        }
        let array = match array {
            Some(a) => a,
            None => {
                // the column isn't in this file: all values are missing
                return Ok(match spec.ctype {
                    ColumnType::Text => DestColumn::Text(vec![String::new(); n_rows]),
                    _ => DestColumn::Number(vec![None; n_rows]),
                });
            }
        };

        if spec.ctype == ColumnType::Text {
            let raw = text_values(array)?;
            if meta.time == Some(TimeEncoding::IsoText) {
                // text-encoded time becomes numeric epoch seconds
                let values = raw
                    .iter()
                    .map(|v| match v.as_deref() {
                        None | Some("") => None,
                        Some(s) => {
                            let eps = TimeEncoding::text_to_epoch(s);
                            (!eps.is_nan()).then_some(eps)
                        }
                    })
                    .collect();
                return Ok(DestColumn::Number(values));
            }
            // text missing value is ""
            return Ok(DestColumn::Text(
                raw.into_iter().map(|v| v.unwrap_or_default()).collect(),
            ));
        }

        let raw = numeric_values(array, spec.ctype)?;
        let values = raw
            .iter()
            .map(|v| match v {
                Some(raw) if !meta.packing.is_sentinel(*raw) => Some(match &meta.time {
                    Some(encoding) => encoding.to_epoch_seconds(*raw),
                    None => meta.packing.apply(*raw),
                }),
                _ => None,
            })
            .collect();
        Ok(DestColumn::Number(values))
    }
}

/// Build a raw source batch from catalog cell values, one inner vec per
/// row, columns ordered as `read_cols`. Used for rows answered from the
/// catalog alone.
pub fn source_batch_from_rows(
    schema: &DatasetSchema,
    read_cols: &[usize],
    rows: &[Vec<Option<CellValue>>],
) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(read_cols.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(read_cols.len());
    for (pos, &col) in read_cols.iter().enumerate() {
        let spec = schema.column(col);
        let cell = |row: &Vec<Option<CellValue>>| row.get(pos).cloned().flatten();
        macro_rules! numeric {
            ($arr_ty:ty, $prim:ty) => {{
                let values: Vec<Option<$prim>> =
                    rows.iter().map(|r| cell(r).map(|v| v.as_f64() as $prim)).collect();
                (arrow_dtype(spec.ctype), Arc::new(<$arr_ty>::from(values)) as ArrayRef)
            }};
        }
        let (dtype, array) = match spec.ctype {
            ColumnType::Int8 => numeric!(Int8Array, i8),
            ColumnType::Int16 => numeric!(Int16Array, i16),
            ColumnType::Int32 => numeric!(Int32Array, i32),
            ColumnType::Int64 => numeric!(Int64Array, i64),
            ColumnType::Float32 => numeric!(Float32Array, f32),
            ColumnType::Float64 => numeric!(Float64Array, f64),
            ColumnType::Text => {
                let values: Vec<Option<String>> = rows
                    .iter()
                    .map(|r| cell(r).map(|v| v.as_text().unwrap_or("").to_string()))
                    .collect();
                (DataType::Utf8, Arc::new(StringArray::from(values)) as ArrayRef)
            }
        };
        fields.push(Field::new(spec.source_name.clone(), dtype, true));
        arrays.push(array);
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

/// Sort all rows and drop duplicates; used for distinct() results. Returns
/// None when there is nothing to emit.
pub fn sort_dedup(batches: &[RecordBatch]) -> Result<Option<RecordBatch>> {
    let first = match batches.iter().find(|b| b.num_rows() > 0) {
        Some(b) => b,
        None => return Ok(None),
    };
    let schema = first.schema();

    #[derive(PartialEq)]
    enum SortKey {
        Num(Option<f64>),
        Str(String),
    }
    impl SortKey {
        fn order(&self, other: &SortKey) -> std::cmp::Ordering {
            use std::cmp::Ordering;
            match (self, other) {
                (SortKey::Num(a), SortKey::Num(b)) => match (a, b) {
                    (Some(x), Some(y)) => x.total_cmp(y),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                },
                (SortKey::Str(a), SortKey::Str(b)) => a.cmp(b),
                _ => Ordering::Equal,
            }
        }
    }

    let mut rows: Vec<Vec<SortKey>> = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let mut key = Vec::with_capacity(batch.num_columns());
            for col in 0..batch.num_columns() {
                let array = batch.column(col);
                key.push(match schema.field(col).data_type() {
                    DataType::Utf8 => {
                        let arr = array.as_any().downcast_ref::<StringArray>().ok_or_else(|| {
                            FuseError::BadRequest("mismatched chunk schema".to_string())
                        })?;
                        SortKey::Str(arr.value(row).to_string())
                    }
                    _ => SortKey::Num(cell_as_f64(array, row)?),
                });
            }
            rows.push(key);
        }
    }
    rows.sort_by(|a, b| {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| x.order(y))
            .find(|o| *o != std::cmp::Ordering::Equal)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows.dedup_by(|a, b| {
        a.iter().zip(b.iter()).all(|(x, y)| x.order(y) == std::cmp::Ordering::Equal)
    });

    // rebuild arrays in the batches' common schema
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for col in 0..schema.fields().len() {
        let values = rows.iter().map(|r| &r[col]);
        let array: ArrayRef = match schema.field(col).data_type() {
            DataType::Utf8 => Arc::new(StringArray::from(
                values
                    .map(|k| match k {
                        SortKey::Str(s) => s.clone(),
                        SortKey::Num(_) => String::new(),
                    })
                    .collect::<Vec<_>>(),
            )),
            dtype => {
                let numbers: Vec<Option<f64>> = values
                    .map(|k| match k {
                        SortKey::Num(v) => *v,
                        SortKey::Str(_) => None,
                    })
                    .collect();
                rebuild_numeric(dtype, &numbers)?
            }
        };
        arrays.push(array);
    }
    Ok(Some(RecordBatch::try_new(schema, arrays)?))
}

// ======================== row tests ========================

/// Precise numeric row test in destination space. NaN equals NaN here, so
/// `=NaN` selects missing rows.
pub(crate) fn test_number(op: CompareOp, value: f64, constraint: f64) -> bool {
    let equal = (value.is_nan() && constraint.is_nan()) || almost_equal(ROW_PRECISION, value, constraint);
    match op {
        CompareOp::Eq => equal,
        CompareOp::Ne => !equal,
        CompareOp::Lt => value < constraint,
        CompareOp::Le => value < constraint || equal,
        CompareOp::Gt => value > constraint,
        CompareOp::Ge => value > constraint || equal,
        CompareOp::Regex => false,
    }
}

/// Precise text row test.
pub(crate) fn test_text(op: CompareOp, value: &str, constraint: &str, pattern: Option<&Regex>) -> bool {
    match op {
        CompareOp::Eq => value == constraint,
        CompareOp::Ne => value != constraint,
        CompareOp::Lt => value < constraint,
        CompareOp::Le => value <= constraint,
        CompareOp::Gt => value > constraint,
        CompareOp::Ge => value >= constraint,
        CompareOp::Regex => pattern.map(|p| p.is_match(value)).unwrap_or(false),
    }
}

fn format_number(value: Option<f64>) -> String {
    match value {
        None => String::new(),
        Some(v) if v.is_nan() => String::new(),
        Some(v) if v == v.trunc() && v.abs() < 1e15 => format!("{}", v as i64),
        Some(v) => format!("{}", v),
    }
}

// ======================== array building ========================

fn arrow_dtype(ctype: ColumnType) -> DataType {
    match ctype {
        ColumnType::Int8 => DataType::Int8,
        ColumnType::Int16 => DataType::Int16,
        ColumnType::Int32 => DataType::Int32,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float32 => DataType::Float32,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Text => DataType::Utf8,
    }
}

fn build_array(
    values: &DestColumn,
    dest_type: ColumnType,
    keep: &[bool],
) -> Result<(DataType, ArrayRef)> {
    match values {
        DestColumn::Text(v) => {
            let kept: Vec<&str> = v
                .iter()
                .zip(keep)
                .filter(|(_, k)| **k)
                .map(|(s, _)| s.as_str())
                .collect();
            Ok((DataType::Utf8, Arc::new(StringArray::from(kept))))
        }
        DestColumn::Number(v) => {
            let kept: Vec<Option<f64>> =
                v.iter().zip(keep).filter(|(_, k)| **k).map(|(v, _)| *v).collect();
            let dtype = arrow_dtype(dest_type);
            let array = rebuild_numeric(&dtype, &kept)?;
            Ok((dtype, array))
        }
    }
}

fn rebuild_numeric(dtype: &DataType, values: &[Option<f64>]) -> Result<ArrayRef> {
    macro_rules! numeric {
        ($arr_ty:ty, $prim:ty) => {
            Ok(Arc::new(<$arr_ty>::from(
                values.iter().map(|v| v.map(|x| x as $prim)).collect::<Vec<_>>(),
            )) as ArrayRef)
        };
    }
    match dtype {
        DataType::Int8 => numeric!(Int8Array, i8),
        DataType::Int16 => numeric!(Int16Array, i16),
        DataType::Int32 => numeric!(Int32Array, i32),
        DataType::Int64 => numeric!(Int64Array, i64),
        DataType::Float32 => numeric!(Float32Array, f32),
        DataType::Float64 => numeric!(Float64Array, f64),
        other => Err(FuseError::BadRequest(format!(
            "unsupported result column type {:?}",
            other
        ))),
    }
}

fn cell_as_f64(array: &ArrayRef, row: usize) -> Result<Option<f64>> {
    macro_rules! get {
        ($arr_ty:ty) => {{
            let arr = array
                .as_any()
                .downcast_ref::<$arr_ty>()
                .ok_or_else(|| FuseError::BadRequest("mismatched chunk schema".to_string()))?;
            if arr.is_null(row) {
                Ok(None)
            } else {
                Ok(Some(arr.value(row) as f64))
            }
        }};
    }
    match array.data_type() {
        DataType::Int8 => get!(Int8Array),
        DataType::Int16 => get!(Int16Array),
        DataType::Int32 => get!(Int32Array),
        DataType::Int64 => get!(Int64Array),
        DataType::Float32 => get!(Float32Array),
        DataType::Float64 => get!(Float64Array),
        other => Err(FuseError::BadRequest(format!(
            "unsupported result column type {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_number() {
        assert!(test_number(CompareOp::Eq, 3.0, 3.0));
        assert!(test_number(CompareOp::Eq, 3.0000000001, 3.0));
        assert!(!test_number(CompareOp::Eq, 3.1, 3.0));
        assert!(test_number(CompareOp::Eq, f64::NAN, f64::NAN));
        assert!(test_number(CompareOp::Ne, 3.0, f64::NAN));
        assert!(!test_number(CompareOp::Ne, f64::NAN, f64::NAN));
        assert!(!test_number(CompareOp::Lt, f64::NAN, 3.0));
        assert!(test_number(CompareOp::Le, 3.0, 3.0));
        assert!(test_number(CompareOp::Ge, 4.0, 3.0));
    }

    #[test]
    fn test_test_text() {
        let pattern = Regex::new("^(?:[0-9]+)$").unwrap();
        assert!(test_text(CompareOp::Eq, "abc", "abc", None));
        assert!(test_text(CompareOp::Lt, "abc", "abd", None));
        assert!(test_text(CompareOp::Regex, "123", "", Some(&pattern)));
        assert!(!test_text(CompareOp::Regex, "12x", "", Some(&pattern)));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(Some(3.0)), "3");
        assert_eq!(format_number(Some(3.5)), "3.5");
        assert_eq!(format_number(None), "");
        assert_eq!(format_number(Some(f64::NAN)), "");
    }

    #[test]
    fn test_sort_dedup() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("station", DataType::Utf8, true),
            Field::new("depth", DataType::Float64, true),
        ]));
        let batch = |stations: Vec<&str>, depths: Vec<Option<f64>>| {
            RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(StringArray::from(stations)) as ArrayRef,
                    Arc::new(Float64Array::from(depths)) as ArrayRef,
                ],
            )
            .unwrap()
        };
        let a = batch(vec!["B", "A"], vec![Some(2.0), Some(1.0)]);
        let b = batch(vec!["A", "B"], vec![Some(1.0), Some(2.0)]);
        let out = sort_dedup(&[a, b]).unwrap().unwrap();
        assert_eq!(out.num_rows(), 2);
        let stations = out.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(stations.value(0), "A");
        assert_eq!(stations.value(1), "B");
    }

    #[test]
    fn test_sort_dedup_empty() {
        assert!(sort_dedup(&[]).unwrap().is_none());
    }
}
