//! Declarative per-dataset configuration

use crate::data::{Attributes, ColumnSpec, ColumnType, DatasetSchema, IdExtract};
use crate::{FuseError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static DATASET_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static regex"));

/// Which file supplies dataset-level metadata, by modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataFrom {
    First,
    Last,
}

impl Default for MetadataFrom {
    fn default() -> Self {
        MetadataFrom::Last
    }
}

/// One data variable (column) of the dataset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVariableConfig {
    pub source_name: String,
    /// Name in query results; defaults to the source name. The names
    /// "time", "latitude", "longitude" and "altitude" mark the
    /// distinguished roles.
    #[serde(default)]
    pub dest_name: Option<String>,
    pub data_type: ColumnType,
    /// Attribute overrides for this column (e.g. a corrected _FillValue).
    #[serde(default)]
    pub add_attributes: Attributes,
}

/// Configuration record for one dataset.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatasetConfig {
    /// Unique identifier; restricted to filename-safe characters.
    pub dataset_id: String,
    pub file_dir: String,
    pub file_name_regex: String,
    pub recursive: bool,
    /// Local files keep quarantine entries across passes and restarts;
    /// remote files get a fresh start every pass.
    pub files_are_local: bool,
    pub metadata_from: MetadataFrom,
    pub pre_extract_regex: String,
    pub post_extract_regex: String,
    pub extract_regex: String,
    pub column_name_for_extract: String,
    pub sorted_column_source_name: String,
    /// Space-separated source column names defining file visitation order.
    pub sort_files_by_source_names: String,
    /// Text-format reader hints, carried through to readers.
    pub column_names_row: usize,
    pub first_data_row: usize,
    /// Expand numeric = predicates to a small interval when pushing them to
    /// the source, to tolerate float drift.
    #[serde(rename = "sourceNeedsExpandedFP_EQ")]
    pub source_needs_expanded_fp_eq: bool,
    pub reload_every_n_minutes: u64,
    /// A timestamp column's file max within this many hours of now is
    /// treated as still growing.
    pub recent_window_hours: f64,
    /// Scan failures only quarantine files at least this old; younger files
    /// may still be mid-transfer.
    pub bad_file_min_age_minutes: f64,
    pub add_global_attributes: Attributes,
    pub data_variables: Vec<DataVariableConfig>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dataset_id: String::new(),
            file_dir: String::new(),
            file_name_regex: ".*".to_string(),
            recursive: false,
            files_are_local: true,
            metadata_from: MetadataFrom::Last,
            pre_extract_regex: String::new(),
            post_extract_regex: String::new(),
            extract_regex: String::new(),
            column_name_for_extract: String::new(),
            sorted_column_source_name: String::new(),
            sort_files_by_source_names: String::new(),
            column_names_row: 1,
            first_data_row: 2,
            source_needs_expanded_fp_eq: false,
            reload_every_n_minutes: 1440,
            recent_window_hours: 4.0,
            bad_file_min_age_minutes: 30.0,
            add_global_attributes: Attributes::new(),
            data_variables: Vec::new(),
        }
    }
}

impl DatasetConfig {
    /// Validate the options and resolve the dataset schema. Any invalid
    /// option is fatal at construction.
    pub fn resolve_schema(&self) -> Result<DatasetSchema> {
        if !DATASET_ID.is_match(&self.dataset_id) {
            return Err(FuseError::Config(format!(
                "datasetId {:?} must match [A-Za-z0-9_.-]+",
                self.dataset_id
            )));
        }
        if self.file_dir.is_empty() {
            return Err(FuseError::Config("fileDir must not be empty".to_string()));
        }
        Regex::new(&self.file_name_regex).map_err(|e| {
            FuseError::Config(format!("invalid fileNameRegex {:?}: {}", self.file_name_regex, e))
        })?;

        let columns: Vec<ColumnSpec> = self
            .data_variables
            .iter()
            .map(|dv| ColumnSpec {
                source_name: dv.source_name.clone(),
                dest_name: dv.dest_name.clone().unwrap_or_else(|| dv.source_name.clone()),
                ctype: dv.data_type,
                add_attrs: dv.add_attributes.clone(),
            })
            .collect();

        let id_extract = if self.extract_regex.is_empty() {
            None
        } else {
            Some(IdExtract::new(
                &self.pre_extract_regex,
                &self.post_extract_regex,
                &self.extract_regex,
            )?)
        };

        DatasetSchema::build(
            columns,
            &self.column_name_for_extract,
            id_extract,
            &self.sorted_column_source_name,
            &self.sort_files_by_source_names,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> DatasetConfig {
        DatasetConfig {
            dataset_id: "buoy_obs".to_string(),
            file_dir: "/data/buoys".to_string(),
            data_variables: vec![
                DataVariableConfig {
                    source_name: "TIME".to_string(),
                    dest_name: Some("time".to_string()),
                    data_type: ColumnType::Float64,
                    add_attributes: Attributes::new(),
                },
                DataVariableConfig {
                    source_name: "station".to_string(),
                    dest_name: None,
                    data_type: ColumnType::Text,
                    add_attributes: Attributes::new(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_schema() {
        let schema = base_config().resolve_schema().unwrap();
        assert_eq!(schema.n_columns(), 2);
        assert_eq!(schema.time_index, Some(0));
        assert_eq!(schema.dest_index("station"), Some(1));
    }

    #[test]
    fn test_bad_dataset_id() {
        let mut config = base_config();
        config.dataset_id = "has spaces".to_string();
        assert!(config.resolve_schema().is_err());
    }

    #[test]
    fn test_bad_file_name_regex() {
        let mut config = base_config();
        config.file_name_regex = "(".to_string();
        assert!(config.resolve_schema().is_err());
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: DatasetConfig = serde_json::from_str(
            r#"{
                "datasetId": "buoy_obs",
                "fileDir": "/data/buoys",
                "fileNameRegex": ".*\\.dat",
                "recursive": true,
                "sortedColumnSourceName": "TIME",
                "sortFilesBySourceNames": "TIME",
                "sourceNeedsExpandedFP_EQ": true,
                "dataVariables": [
                    {"sourceName": "TIME", "destName": "time", "dataType": "float64"},
                    {"sourceName": "station", "dataType": "text"}
                ]
            }"#,
        )
        .unwrap();
        assert!(config.recursive);
        assert!(config.source_needs_expanded_fp_eq);
        assert_eq!(config.metadata_from, MetadataFrom::Last);
        let schema = config.resolve_schema().unwrap();
        assert_eq!(schema.sorted_index, Some(0));
    }
}
