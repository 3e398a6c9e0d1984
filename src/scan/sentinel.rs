//! Schema sentinel: enforces that packing attributes agree across files
//!
//! The first successfully scanned file in each catalog-update session sets
//! the expected scale/offset/fill/missing/units per column; every later file
//! must agree or it is quarantined. A missing attribute on a later file is
//! not a mismatch. Caller-supplied fill/missing overrides take precedence
//! over whatever the files claim.

use crate::data::{Attributes, ColumnSpec, Packing, TimeEncoding};
use crate::{FuseError, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Expected packing attributes for one column. NaN / None means not yet
/// observed.
#[derive(Debug, Clone)]
pub struct ExpectedAttrs {
    pub add_offset: f64,
    pub fill_value: f64,
    pub missing_value: f64,
    pub scale_factor: f64,
    pub units: Option<String>,
}

impl Default for ExpectedAttrs {
    fn default() -> Self {
        Self {
            add_offset: f64::NAN,
            fill_value: f64::NAN,
            missing_value: f64::NAN,
            scale_factor: f64::NAN,
            units: None,
        }
    }
}

/// Captures expected per-column packing attributes and verifies each
/// scanned file against them.
#[derive(Debug, Clone)]
pub struct SchemaSentinel {
    expected: Vec<ExpectedAttrs>,
    override_fill: Vec<f64>,
    override_missing: Vec<f64>,
}

impl SchemaSentinel {
    pub fn new(columns: &[ColumnSpec]) -> Self {
        Self {
            expected: vec![ExpectedAttrs::default(); columns.len()],
            override_fill: columns.iter().map(|c| c.add_attrs.get_number("_FillValue")).collect(),
            override_missing: columns
                .iter()
                .map(|c| c.add_attrs.get_number("missing_value"))
                .collect(),
        }
    }

    /// Record one file's attributes for `col`, capturing any not yet seen
    /// and verifying the rest. The error message names the offending
    /// attribute and column.
    pub fn observe(&mut self, col: usize, name: &str, atts: &Attributes) -> Result<()> {
        let observed_offset = atts.get_number("add_offset");
        let observed_fill = atts.get_number("_FillValue");
        let observed_missing = atts.get_number("missing_value");
        let observed_scale = atts.get_number("scale_factor");
        let observed_units = atts.get_text("units");

        let expected = &mut self.expected[col];
        if expected.add_offset.is_nan() {
            expected.add_offset = observed_offset;
        }
        if expected.fill_value.is_nan() {
            expected.fill_value = observed_fill;
        }
        if expected.missing_value.is_nan() {
            expected.missing_value = observed_missing;
        }
        if expected.scale_factor.is_nan() {
            expected.scale_factor = observed_scale;
        }
        if expected.units.is_none() {
            expected.units = observed_units.map(|s| s.to_string());
        }

        let mismatch = |attr: &str, observed: f64, expected: f64| {
            FuseError::SchemaMismatch(format!(
                "{} observed!=expected for column {:?}: {} != {}",
                attr, name, observed, expected
            ))
        };

        if !attr_eq(observed_offset, expected.add_offset) {
            return Err(mismatch("add_offset", observed_offset, expected.add_offset));
        }
        // an unspecified fill or missing value on this file conforms
        if !observed_fill.is_nan() && !attr_eq(observed_fill, expected.fill_value) {
            return Err(mismatch("_FillValue", observed_fill, expected.fill_value));
        }
        if !observed_missing.is_nan() && !attr_eq(observed_missing, expected.missing_value) {
            return Err(mismatch("missing_value", observed_missing, expected.missing_value));
        }
        if !attr_eq(observed_scale, expected.scale_factor) {
            return Err(mismatch("scale_factor", observed_scale, expected.scale_factor));
        }
        if !units_equivalent(observed_units, expected.units.as_deref()) {
            return Err(FuseError::SchemaMismatch(format!(
                "units observed!=expected for column {:?}: {:?} != {:?}",
                name, observed_units, expected.units
            )));
        }
        Ok(())
    }

    /// Effective packing for a column, with caller overrides substituted for
    /// the file-reported fill/missing sentinels.
    pub fn packing(&self, col: usize) -> Packing {
        let expected = &self.expected[col];
        Packing {
            scale: expected.scale_factor,
            offset: expected.add_offset,
            fill: if self.override_fill[col].is_nan() {
                expected.fill_value
            } else {
                self.override_fill[col]
            },
            missing: if self.override_missing[col].is_nan() {
                expected.missing_value
            } else {
                self.override_missing[col]
            },
        }
    }

    pub fn units(&self, col: usize) -> Option<&str> {
        self.expected[col].units.as_deref()
    }

    /// Time encoding for a column, if its units describe one.
    pub fn time_encoding(&self, col: usize) -> Option<TimeEncoding> {
        self.units(col).and_then(TimeEncoding::parse_units)
    }
}

/// NaN-tolerant equality: two unspecified values agree.
fn attr_eq(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

static UNIT_SYNONYMS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for synonym in ["degree_north", "degrees_n", "degree_n", "degreesnorth"] {
        map.insert(synonym, "degrees_north");
    }
    for synonym in ["degree_east", "degrees_e", "degree_e", "degreeseast"] {
        map.insert(synonym, "degrees_east");
    }
    for synonym in ["degree_c", "celsius", "deg_c", "degc"] {
        map.insert(synonym, "degree_celsius");
    }
    map.insert("%", "percent");
    map.insert("meter", "m");
    map.insert("meters", "m");
    map.insert("metre", "m");
    map.insert("metres", "m");
    map
});

/// Units equivalence: case-insensitive with a small synonym table, so
/// "degrees_north" and "degree_N" agree without byte equality. Absent units
/// match anything.
pub fn units_equivalent(a: Option<&str>, b: Option<&str>) -> bool {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return true,
    };
    let canon = |u: &str| -> String {
        let lower = u.trim().to_ascii_lowercase();
        UNIT_SYNONYMS.get(lower.as_str()).map(|s| s.to_string()).unwrap_or(lower)
    };
    canon(a) == canon(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AttrValue, ColumnType};

    fn columns() -> Vec<ColumnSpec> {
        vec![ColumnSpec {
            source_name: "TEMP".into(),
            dest_name: "temperature".into(),
            ctype: ColumnType::Int16,
            add_attrs: Attributes::new(),
        }]
    }

    fn atts(scale: f64, fill: f64, units: &str) -> Attributes {
        let mut atts = Attributes::new();
        if !scale.is_nan() {
            atts.set("scale_factor", AttrValue::Number(scale));
        }
        if !fill.is_nan() {
            atts.set("_FillValue", AttrValue::Number(fill));
        }
        if !units.is_empty() {
            atts.set("units", AttrValue::Text(units.into()));
        }
        atts
    }

    #[test]
    fn test_capture_then_verify() {
        let mut sentinel = SchemaSentinel::new(&columns());
        sentinel.observe(0, "TEMP", &atts(0.01, -999.0, "degree_C")).unwrap();
        // identical file passes
        sentinel.observe(0, "TEMP", &atts(0.01, -999.0, "degree_C")).unwrap();
        // conflicting scale fails
        let err = sentinel.observe(0, "TEMP", &atts(0.02, -999.0, "degree_C")).unwrap_err();
        assert!(err.to_string().contains("scale_factor"));
    }

    #[test]
    fn test_unspecified_later_value_conforms() {
        let mut sentinel = SchemaSentinel::new(&columns());
        sentinel.observe(0, "TEMP", &atts(0.01, -999.0, "degree_C")).unwrap();
        // no fill value on this file: not a mismatch
        sentinel.observe(0, "TEMP", &atts(0.01, f64::NAN, "degree_C")).unwrap();
        // fill observed but different: mismatch
        assert!(sentinel.observe(0, "TEMP", &atts(0.01, -888.0, "degree_C")).is_err());
    }

    #[test]
    fn test_units_synonyms_pass() {
        let mut sentinel = SchemaSentinel::new(&columns());
        sentinel.observe(0, "TEMP", &atts(f64::NAN, f64::NAN, "degree_C")).unwrap();
        sentinel.observe(0, "TEMP", &atts(f64::NAN, f64::NAN, "Celsius")).unwrap();
        assert!(sentinel.observe(0, "TEMP", &atts(f64::NAN, f64::NAN, "psu")).is_err());
    }

    #[test]
    fn test_override_substitutes_sentinels() {
        let mut cols = columns();
        cols[0].add_attrs.set("_FillValue", AttrValue::Number(-32767.0));
        let mut sentinel = SchemaSentinel::new(&cols);
        sentinel.observe(0, "TEMP", &atts(0.01, -999.0, "")).unwrap();
        let packing = sentinel.packing(0);
        assert_eq!(packing.fill, -32767.0);
        assert_eq!(packing.scale, 0.01);
    }

    #[test]
    fn test_units_equivalent() {
        assert!(units_equivalent(Some("degrees_north"), Some("degree_N")));
        assert!(units_equivalent(Some("%"), Some("percent")));
        assert!(units_equivalent(None, Some("m")));
        assert!(!units_equivalent(Some("m"), Some("km")));
    }
}
