//! Cell scalars, attribute bags, column schema and time encodings

pub mod attrs;
pub mod columns;
pub mod schema;
pub mod time;
pub mod value;

pub use attrs::{AttrValue, Attributes};
pub use columns::{numeric_values, text_values};
pub use schema::{ColumnMeta, ColumnSpec, DatasetSchema, IdExtract, Packing};
pub use time::TimeEncoding;
pub use value::{almost_equal, greater_than_ae, less_than_ae, CellValue, ColumnType};
