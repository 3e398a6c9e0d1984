//! Catalog maintenance: range pruning, schema consistency, incremental
//! updates

pub mod pruning;
pub mod sentinel;
pub mod updater;

pub use pruning::{numeric_range_may_match, text_range_may_match};
pub use sentinel::{units_equivalent, SchemaSentinel};
pub use updater::{CatalogUpdater, UpdateOutcome, UpdateStats};
