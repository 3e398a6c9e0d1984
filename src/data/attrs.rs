//! Attribute bags for per-column and dataset-level metadata

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An attribute value: a scalar number, a text string, or a short numeric
/// vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Number(f64),
    Text(String),
    Numbers(Vec<f64>),
}

/// A small string-to-value map. The same shape is used for source metadata
/// read from files and for caller-supplied override layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes {
    entries: BTreeMap<String, AttrValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: AttrValue) {
        self.entries.insert(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.entries.get(name)
    }

    /// Numeric view of an attribute; NaN when absent or non-numeric.
    pub fn get_number(&self, name: &str) -> f64 {
        match self.entries.get(name) {
            Some(AttrValue::Number(v)) => *v,
            Some(AttrValue::Text(s)) => s.trim().parse().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.entries.get(name) {
            Some(AttrValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.entries.iter()
    }

    /// Combine two layers: `add` wins over `source`, and an `add` entry whose
    /// text value is the literal "null" deletes the key entirely.
    pub fn combine(add: &Attributes, source: &Attributes) -> Attributes {
        let mut out = source.clone();
        for (name, value) in add.iter() {
            match value {
                AttrValue::Text(s) if s == "null" => {
                    out.entries.remove(name);
                }
                other => {
                    out.entries.insert(name.clone(), other.clone());
                }
            }
        }
        out
    }
}
