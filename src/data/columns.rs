//! Typed access to Arrow columns

use crate::data::ColumnType;
use crate::{FuseError, Result};
use arrow::array::{
    Array, ArrayRef, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array,
    StringArray,
};

/// Read a numeric column as f64 values; nulls become None.
pub fn numeric_values(array: &ArrayRef, ctype: ColumnType) -> Result<Vec<Option<f64>>> {
    macro_rules! collect {
        ($arr_ty:ty) => {{
            let arr = array
                .as_any()
                .downcast_ref::<$arr_ty>()
                .ok_or_else(|| type_error(ctype, array))?;
            Ok((0..arr.len())
                .map(|i| if arr.is_null(i) { None } else { Some(arr.value(i) as f64) })
                .collect())
        }};
    }
    match ctype {
        ColumnType::Int8 => collect!(Int8Array),
        ColumnType::Int16 => collect!(Int16Array),
        ColumnType::Int32 => collect!(Int32Array),
        ColumnType::Int64 => collect!(Int64Array),
        ColumnType::Float32 => collect!(Float32Array),
        ColumnType::Float64 => collect!(Float64Array),
        ColumnType::Text => Err(FuseError::Scan(
            "numeric access to a text column".to_string(),
        )),
    }
}

/// Read a text column; nulls become None.
pub fn text_values(array: &ArrayRef) -> Result<Vec<Option<String>>> {
    let arr = array
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| type_error(ColumnType::Text, array))?;
    Ok((0..arr.len())
        .map(|i| if arr.is_null(i) { None } else { Some(arr.value(i).to_string()) })
        .collect())
}

fn type_error(expected: ColumnType, array: &ArrayRef) -> FuseError {
    FuseError::Scan(format!(
        "column has Arrow type {:?}, expected {:?}",
        array.data_type(),
        expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_numeric_values() {
        let arr: ArrayRef = Arc::new(Int16Array::from(vec![Some(1), None, Some(-3)]));
        let vals = numeric_values(&arr, ColumnType::Int16).unwrap();
        assert_eq!(vals, vec![Some(1.0), None, Some(-3.0)]);

        // wrong physical type is an error, not a panic
        assert!(numeric_values(&arr, ColumnType::Float64).is_err());
    }

    #[test]
    fn test_text_values() {
        let arr: ArrayRef = Arc::new(StringArray::from(vec![Some("a"), None, Some("")]));
        let vals = text_values(&arr).unwrap();
        assert_eq!(vals, vec![Some("a".to_string()), None, Some(String::new())]);
    }
}
