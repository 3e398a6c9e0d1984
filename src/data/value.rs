//! Column types, cell scalars and tolerant numeric comparison

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Logical column type. Timestamp columns are ordinary numeric or text
/// columns distinguished by their units attribute, not by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Text,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ColumnType::Text)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ColumnType::Int8 | ColumnType::Int16 | ColumnType::Int32 | ColumnType::Int64
        )
    }
}

/// A single scalar of a column's native type. The catalog stores two of
/// these (min, max) per file per column without boxing.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
}

impl CellValue {
    /// Numeric view. Text yields NaN.
    pub fn as_f64(&self) -> f64 {
        match self {
            CellValue::Int8(v) => *v as f64,
            CellValue::Int16(v) => *v as f64,
            CellValue::Int32(v) => *v as f64,
            CellValue::Int64(v) => *v as f64,
            CellValue::Float32(v) => *v as f64,
            CellValue::Float64(v) => *v as f64,
            CellValue::Text(_) => f64::NAN,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Build a cell of the given type from an f64, truncating as needed.
    pub fn from_f64(ctype: ColumnType, v: f64) -> CellValue {
        match ctype {
            ColumnType::Int8 => CellValue::Int8(v as i8),
            ColumnType::Int16 => CellValue::Int16(v as i16),
            ColumnType::Int32 => CellValue::Int32(v as i32),
            ColumnType::Int64 => CellValue::Int64(v as i64),
            ColumnType::Float32 => CellValue::Float32(v as f32),
            ColumnType::Float64 => CellValue::Float64(v),
            ColumnType::Text => CellValue::Text(String::new()),
        }
    }

    /// Range order: text lexicographic, numeric by value. Mixed kinds and
    /// NaN compare as equal so folds keep the first operand.
    pub fn range_cmp(&self, other: &CellValue) -> Ordering {
        match (self, other) {
            (CellValue::Text(a), CellValue::Text(b)) => a.cmp(b),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
        }
    }
}

/// Equality tolerant to `sig` significant digits of accumulated rounding.
/// NaN is never almost-equal to anything here; callers that want NaN==NaN
/// must test for it first.
pub fn almost_equal(sig: i32, a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs());
    (a - b).abs() / scale < 0.5 * 10f64.powi(-sig)
}

/// a < b, or almost equal at `sig` significant digits.
pub fn less_than_ae(sig: i32, a: f64, b: f64) -> bool {
    a < b || almost_equal(sig, a, b)
}

/// a > b, or almost equal at `sig` significant digits.
pub fn greater_than_ae(sig: i32, a: f64, b: f64) -> bool {
    a > b || almost_equal(sig, a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_f64() {
        assert_eq!(CellValue::Int16(-3).as_f64(), -3.0);
        assert_eq!(CellValue::Float32(1.5).as_f64(), 1.5);
        assert!(CellValue::Text("x".into()).as_f64().is_nan());
    }

    #[test]
    fn test_range_cmp() {
        assert_eq!(
            CellValue::Int32(2).range_cmp(&CellValue::Float64(3.0)),
            Ordering::Less
        );
        assert_eq!(
            CellValue::Text("a".into()).range_cmp(&CellValue::Text("b".into())),
            Ordering::Less
        );
    }

    #[test]
    fn test_almost_equal() {
        assert!(almost_equal(5, 1.000001, 1.000002));
        assert!(!almost_equal(5, 1.0, 1.001));
        assert!(!almost_equal(5, f64::NAN, f64::NAN));
        assert!(almost_equal(5, 0.0, 0.0));
    }

    #[test]
    fn test_tolerant_ordering() {
        assert!(less_than_ae(5, 1.0, 2.0));
        assert!(less_than_ae(5, 2.0000001, 2.0));
        assert!(!less_than_ae(5, 2.1, 2.0));
        assert!(greater_than_ae(5, 2.0, 2.0000001));
        assert!(!greater_than_ae(5, 1.9, 2.0));
    }
}
