//! Query planning
//!
//! Turns a parsed query into a file visitation plan: reject the whole
//! dataset from the aggregate ranges when possible, fold sorted-column
//! constraints into a read range, and prune files whose per-column ranges
//! cannot match.

use crate::catalog::CatalogSnapshot;
use crate::config::DatasetConfig;
use crate::data::{ColumnType, DatasetSchema, TimeEncoding};
use crate::query::{CompareOp, TableQuery};
use crate::scan::updater::now_millis;
use crate::scan::{numeric_range_may_match, text_range_may_match};
use crate::{FuseError, Result};
use regex::Regex;

const SECONDS_PER_DAY: f64 = 86400.0;

/// A constraint resolved against the schema, with the value pre-converted
/// for range tests.
#[derive(Debug)]
pub struct CompiledConstraint {
    pub col: usize,
    pub op: CompareOp,
    /// Destination-space value (epoch seconds for timestamp columns).
    pub text: String,
    pub number: f64,
    /// The value mapped into raw source space (inverse packing, or the
    /// source time encoding), which is what the catalog ranges hold.
    pub source_number: f64,
    pub pattern: Option<Regex>,
}

/// A file visitation plan.
#[derive(Debug)]
pub struct QueryPlan {
    /// Requested columns (schema indices) in output order.
    pub result_cols: Vec<usize>,
    /// Columns whose values are needed per row: the result columns plus
    /// any constraint-only columns.
    pub read_cols: Vec<usize>,
    pub constraints: Vec<CompiledConstraint>,
    /// Catalog row indices to visit, in catalog (visitation) order.
    pub file_indices: Vec<usize>,
    /// Sorted-column read range in source encoding; NaN = unbounded.
    pub min_sorted: f64,
    pub max_sorted: f64,
    /// The only requested column is the file-name id column.
    pub id_only: bool,
    pub distinct: bool,
}

pub fn plan_query(
    query: &TableQuery,
    schema: &DatasetSchema,
    config: &DatasetConfig,
    snapshot: &CatalogSnapshot,
) -> Result<QueryPlan> {
    if query.columns.is_empty() {
        return Err(FuseError::BadRequest("no result columns requested".to_string()));
    }
    let mut result_cols = Vec::with_capacity(query.columns.len());
    for name in &query.columns {
        let col = schema
            .dest_index(name)
            .ok_or_else(|| FuseError::BadRequest(format!("unknown column {:?}", name)))?;
        result_cols.push(col);
    }

    let constraints = compile_constraints(query, schema, snapshot)?;

    let mut read_cols = result_cols.clone();
    for c in &constraints {
        if !read_cols.contains(&c.col) {
            read_cols.push(c.col);
        }
    }

    let now_eps = now_millis() / 1000.0;

    // Whole-dataset rejection from the aggregate table. Checking each file
    // below would give the same answer, just slower.
    for c in &constraints {
        let spec = schema.column(c.col);
        let meta = &snapshot.metas[c.col];
        let agg = &snapshot.aggregate[c.col];
        let admit = match (&meta.time, c.op) {
            (Some(_), CompareOp::Regex) | (None, _) => {
                if spec.ctype == ColumnType::Text || c.op == CompareOp::Regex {
                    if spec.ctype != ColumnType::Text {
                        // regex over a numeric column: never exclude
                        true
                    } else {
                        text_range_may_match(
                            agg.min_text(),
                            agg.max_text(),
                            agg.has_missing,
                            c.op,
                            &c.text,
                            c.pattern.as_ref(),
                        )
                    }
                } else {
                    numeric_range_may_match(
                        agg.min_f64(),
                        agg.max_f64(),
                        agg.has_missing,
                        c.op,
                        c.source_number,
                    )
                }
            }
            (Some(encoding), _) => {
                // files may still be growing: ignore near-now time
                // constraints at the dataset level
                if c.number > now_eps - SECONDS_PER_DAY {
                    true
                } else {
                    match encoding {
                        TimeEncoding::Numeric { .. } => numeric_range_may_match(
                            agg.min_f64(),
                            agg.max_f64(),
                            agg.has_missing,
                            c.op,
                            c.source_number,
                        ),
                        TimeEncoding::IsoText => text_range_may_match(
                            agg.min_text(),
                            agg.max_text(),
                            agg.has_missing,
                            c.op,
                            &TimeEncoding::epoch_to_text(c.number),
                            None,
                        ),
                    }
                }
            }
        };
        if !admit {
            log::debug!(
                "dataset rejected: {}{}{} failed against aggregate range",
                spec.dest_name,
                c.op,
                c.text
            );
            return Err(FuseError::NoMatchingData);
        }
    }

    let (min_sorted, max_sorted) = fold_sorted_range(schema, config, &constraints);

    // Per-file pruning.
    let now_plus_window = now_eps + config.recent_window_hours * 3600.0;
    let mut file_indices = Vec::new();
    for (idx, row) in snapshot.files.rows().iter().enumerate() {
        let mut ok = true;
        for c in &constraints {
            let spec = schema.column(c.col);
            let meta = &snapshot.metas[c.col];
            let range = &row.ranges[c.col];
            let admit = match (&meta.time, c.op) {
                (Some(encoding), op) if op != CompareOp::Regex => {
                    // compare in epoch seconds, the constraint's space
                    let (file_min, file_max) = match encoding {
                        TimeEncoding::Numeric { .. } => (
                            encoding.to_epoch_seconds(range.min_f64()),
                            encoding.to_epoch_seconds(range.max_f64()),
                        ),
                        TimeEncoding::IsoText => (
                            TimeEncoding::text_to_epoch(range.min_text()),
                            TimeEncoding::text_to_epoch(range.max_text()),
                        ),
                    };
                    let mut file_max = file_max;
                    // a file whose max is close to now is probably still
                    // receiving rows; pretend it extends a bit past now
                    if !file_max.is_nan()
                        && now_plus_window - file_max > 0.0
                        && now_plus_window - file_max < SECONDS_PER_DAY
                    {
                        file_max = now_plus_window;
                    }
                    numeric_range_may_match(file_min, file_max, range.has_missing, c.op, c.number)
                }
                _ if spec.ctype == ColumnType::Text => text_range_may_match(
                    range.min_text(),
                    range.max_text(),
                    range.has_missing,
                    c.op,
                    &c.text,
                    c.pattern.as_ref(),
                ),
                (_, CompareOp::Regex) => true,
                _ => numeric_range_may_match(
                    range.min_f64(),
                    range.max_f64(),
                    range.has_missing,
                    c.op,
                    c.source_number,
                ),
            };
            if !admit {
                log::debug!(
                    "file {} rejected: failed {}{}{}",
                    row.name,
                    spec.dest_name,
                    c.op,
                    c.text
                );
                ok = false;
                break;
            }
        }
        if ok {
            file_indices.push(idx);
        }
    }

    let id_only = result_cols.len() == 1 && schema.is_id(result_cols[0]);

    Ok(QueryPlan {
        result_cols,
        read_cols,
        constraints,
        file_indices,
        min_sorted,
        max_sorted,
        id_only,
        distinct: query.distinct,
    })
}

fn compile_constraints(
    query: &TableQuery,
    schema: &DatasetSchema,
    snapshot: &CatalogSnapshot,
) -> Result<Vec<CompiledConstraint>> {
    let mut out = Vec::with_capacity(query.constraints.len());
    for c in &query.constraints {
        let col = schema
            .dest_index(&c.column)
            .ok_or_else(|| FuseError::BadRequest(format!("unknown column {:?}", c.column)))?;
        let spec = schema.column(col);
        let meta = &snapshot.metas[col];
        let text = c.value.as_text();
        let number = c.value.as_f64();
        let pattern = if c.op == CompareOp::Regex {
            Some(Regex::new(&format!("^(?:{})$", text)).map_err(|e| {
                FuseError::BadRequest(format!("invalid regex {:?}: {}", text, e))
            })?)
        } else {
            None
        };
        let source_number = match &meta.time {
            Some(encoding) if c.op != CompareOp::Regex => encoding.from_epoch_seconds(number),
            _ if spec.ctype.is_numeric() => meta.packing.unapply(number),
            _ => number,
        };
        out.push(CompiledConstraint { col, op: c.op, text, number, source_number, pattern });
    }
    Ok(out)
}

/// Fold sorted-column constraints into a [min, max] read range in source
/// encoding. `=` pins both ends and trumps the others. With no lower bound
/// the range is dropped entirely.
fn fold_sorted_range(
    schema: &DatasetSchema,
    config: &DatasetConfig,
    constraints: &[CompiledConstraint],
) -> (f64, f64) {
    let sorted_col = match schema.sorted_index {
        Some(col) => col,
        None => return (f64::NAN, f64::NAN),
    };
    let mut min_sorted = f64::NEG_INFINITY;
    let mut max_sorted = f64::INFINITY;
    for c in constraints {
        if c.col != sorted_col || c.op == CompareOp::Regex {
            continue;
        }
        let v = c.source_number;
        if v.is_nan() {
            continue;
        }
        match c.op {
            // the lowest upper bound and highest lower bound win
            CompareOp::Lt | CompareOp::Le => max_sorted = max_sorted.min(v),
            CompareOp::Gt | CompareOp::Ge => min_sorted = min_sorted.max(v),
            CompareOp::Eq => {
                if config.source_needs_expanded_fp_eq {
                    let eps = v.abs() * 1e-7;
                    min_sorted = v - eps;
                    max_sorted = v + eps;
                } else {
                    min_sorted = v;
                    max_sorted = v;
                }
                break;
            }
            _ => {}
        }
    }
    if min_sorted == f64::NEG_INFINITY {
        (f64::NAN, f64::NAN)
    } else {
        (min_sorted, max_sorted)
    }
}
