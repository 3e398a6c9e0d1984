//! fusetable - an aggregating tabular dataset engine
//!
//! Presents a collection of on-disk data files, each holding a table with the
//! same logical schema, as a single virtual table and answers filtered
//! projection queries over it. The persistent file catalog records per-file,
//! per-column value ranges so that queries open only the files whose ranges
//! overlap the request.

pub mod catalog;
pub mod config;
pub mod data;
pub mod engine;
pub mod notify;
pub mod query;
pub mod reader;
pub mod scan;
pub mod sink;

// Re-export main types
pub use config::{DataVariableConfig, DatasetConfig, MetadataFrom};
pub use data::{AttrValue, Attributes, CellValue, ColumnType};
pub use engine::{CancelToken, FileSetDataset};
pub use query::{CompareOp, Constraint, ConstraintValue, TableQuery};
pub use reader::{FileReader, ReadRequest, SourceTable};
pub use sink::{BufferSink, ResultSink};

/// Engine error type
#[derive(Debug, thiserror::Error)]
pub enum FuseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No matching data")]
    NoMatchingData,

    #[error("Temporarily unavailable, try again later: {0}")]
    RetryLater(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("File scan error: {0}")]
    Scan(String),

    #[error("Persistence error: {0}")]
    Persist(String),
}

pub type Result<T> = std::result::Result<T, FuseError>;
