//! Range-versus-predicate evaluation
//!
//! Given a column's (min, max, hasMissing) summary for one file (or for the
//! whole dataset) and one predicate, decide whether the range *may* contain
//! a matching row. False exclusion is forbidden: a file must never be
//! skipped when it could hold a match. Spurious inclusion only costs time,
//! and is expected because min/max are aggregated from possibly-packed
//! source values.

use crate::data::{greater_than_ae, less_than_ae};
use crate::query::CompareOp;
use regex::Regex;

/// Comparison precision for numeric range tests: not very precise, so it
/// works for both f32 and f64 summaries.
const RANGE_PRECISION: i32 = 5;

/// May a text range contain a row matching `op value`? Also used for the
/// regex operator on numeric columns (via the textual min/max).
///
/// "" is the text missing value: min and max exclude it, `has_missing` says
/// whether any row held it.
pub fn text_range_may_match(
    min: &str,
    max: &str,
    has_missing: bool,
    op: CompareOp,
    value: &str,
    pattern: Option<&Regex>,
) -> bool {
    if has_missing {
        if value.is_empty()
            && matches!(op, CompareOp::Regex | CompareOp::Eq | CompareOp::Ge | CompareOp::Le)
        {
            return true;
        }
        if op == CompareOp::Lt {
            // "" < "a" is true, "" < "" is false
            return !value.is_empty();
        }
    }

    match op {
        CompareOp::Ne => !(min == max && min == value),
        CompareOp::Regex => {
            if min == max {
                pattern.map(|p| p.is_match(min)).unwrap_or(true)
            } else {
                true
            }
        }
        CompareOp::Le => min <= value,
        CompareOp::Ge => max >= value,
        CompareOp::Eq => min <= value && max >= value,
        CompareOp::Lt => min < value,
        CompareOp::Gt => max > value,
    }
}

/// May a numeric range contain a row matching `op value`? Not used for the
/// regex operator. NaN is the numeric missing value: a file with no valid
/// values has min = max = NaN.
pub fn numeric_range_may_match(
    min: f64,
    max: f64,
    has_missing: bool,
    op: CompareOp,
    value: f64,
) -> bool {
    if value.is_nan() {
        return match op {
            // NaN = NaN is true, so these hold iff the file has missing rows
            CompareOp::Eq | CompareOp::Le | CompareOp::Ge => has_missing,
            // 5 != NaN is true, NaN != NaN is false
            CompareOp::Ne => !max.is_nan(),
            _ => false,
        };
    }

    if min.is_nan() && max.is_nan() {
        // file holds only missing values, and the constraint value is real
        return op == CompareOp::Ne;
    }

    match op {
        CompareOp::Ne => !(min == max && min == value),
        CompareOp::Le => less_than_ae(RANGE_PRECISION, min, value),
        CompareOp::Ge => greater_than_ae(RANGE_PRECISION, max, value),
        CompareOp::Eq => {
            less_than_ae(RANGE_PRECISION, min, value) && greater_than_ae(RANGE_PRECISION, max, value)
        }
        CompareOp::Lt => min < value,
        CompareOp::Gt => max > value,
        CompareOp::Regex => true,
    }
}
