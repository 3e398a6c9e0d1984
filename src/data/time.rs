//! Timestamp encodings: numeric "unit since instant" and ISO-8601 text

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static ISO_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("static regex"));

/// How a timestamp column encodes instants in its source values.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeEncoding {
    /// Numeric offset from a base instant, e.g. "seconds since 1970-01-01".
    Numeric { seconds_per_unit: f64, base_epoch_seconds: f64 },
    /// ISO-8601 text. Lexicographic order matches time order.
    IsoText,
}

impl TimeEncoding {
    /// Parse a udunits-style time units string. Returns None for units that
    /// do not describe a time encoding.
    pub fn parse_units(units: &str) -> Option<TimeEncoding> {
        let mut parts = units.splitn(2, " since ");
        let unit = parts.next()?.trim().to_ascii_lowercase();
        let base = parts.next()?.trim();
        let seconds_per_unit = match unit.as_str() {
            "milliseconds" | "millisecond" | "msec" | "ms" => 0.001,
            "seconds" | "second" | "secs" | "sec" | "s" => 1.0,
            "minutes" | "minute" | "mins" | "min" => 60.0,
            "hours" | "hour" | "hrs" | "hr" | "h" => 3600.0,
            "days" | "day" | "d" => 86400.0,
            _ => return None,
        };
        let base_epoch_seconds = parse_iso_instant(base)?;
        Some(TimeEncoding::Numeric { seconds_per_unit, base_epoch_seconds })
    }

    /// Source-encoded numeric value to epoch seconds.
    pub fn to_epoch_seconds(&self, source: f64) -> f64 {
        match self {
            TimeEncoding::Numeric { seconds_per_unit, base_epoch_seconds } => {
                base_epoch_seconds + source * seconds_per_unit
            }
            TimeEncoding::IsoText => source,
        }
    }

    /// Epoch seconds to the source's numeric encoding.
    pub fn from_epoch_seconds(&self, epoch_seconds: f64) -> f64 {
        match self {
            TimeEncoding::Numeric { seconds_per_unit, base_epoch_seconds } => {
                (epoch_seconds - base_epoch_seconds) / seconds_per_unit
            }
            TimeEncoding::IsoText => epoch_seconds,
        }
    }

    /// Epoch seconds rendered as ISO-8601 text, for text-encoded columns.
    pub fn epoch_to_text(epoch_seconds: f64) -> String {
        if epoch_seconds.is_nan() {
            return String::new();
        }
        match DateTime::<Utc>::from_timestamp(epoch_seconds as i64, 0) {
            Some(dt) => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            None => String::new(),
        }
    }

    /// ISO-8601 text to epoch seconds; NaN when unparsable.
    pub fn text_to_epoch(text: &str) -> f64 {
        parse_iso_instant(text).unwrap_or(f64::NAN)
    }
}

/// Parse an ISO-8601-like instant (with or without offset, time of day
/// optional) to epoch seconds.
pub fn parse_iso_instant(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis() as f64 / 1000.0);
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(ndt.and_utc().timestamp() as f64);
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(ndt.and_utc().timestamp() as f64);
    }
    if let Ok(nd) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(nd.and_hms_opt(0, 0, 0)?.and_utc().timestamp() as f64);
    }
    None
}

/// Whether a text value looks like an ISO-8601 instant. Text time columns
/// are only usable when their values start with YYYY-MM-DD, because the
/// catalog compares them lexicographically.
pub fn looks_iso(s: &str) -> bool {
    ISO_PREFIX.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        let enc = TimeEncoding::parse_units("seconds since 1970-01-01T00:00:00Z").unwrap();
        assert_eq!(enc.to_epoch_seconds(42.0), 42.0);

        let enc = TimeEncoding::parse_units("days since 1970-01-02").unwrap();
        assert_eq!(enc.to_epoch_seconds(1.0), 2.0 * 86400.0);
        assert_eq!(enc.from_epoch_seconds(2.0 * 86400.0), 1.0);

        assert!(TimeEncoding::parse_units("degree_C").is_none());
        assert!(TimeEncoding::parse_units("fortnights since 1970-01-01").is_none());
    }

    #[test]
    fn test_text_round_trip() {
        let eps = TimeEncoding::text_to_epoch("2020-03-04T05:06:07Z");
        assert_eq!(TimeEncoding::epoch_to_text(eps), "2020-03-04T05:06:07Z");
    }

    #[test]
    fn test_looks_iso() {
        assert!(looks_iso("2021-01-01T00:00:00Z"));
        assert!(looks_iso("2021-01-01"));
        assert!(!looks_iso("Jan 1, 2021"));
        assert!(!looks_iso(""));
    }
}
