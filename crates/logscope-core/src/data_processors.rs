use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::models::{FieldValue, Fields, Timestamp};

// ── TimestampProcessor ────────────────────────────────────────────────────────

/// Finds and parses the wall-clock timestamps embedded in log lines.
pub struct TimestampProcessor;

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d{1,9})?")
            .expect("regex is valid")
    })
}

impl TimestampProcessor {
    /// Locate the first `YYYY-MM-DD HH:MM:SS[,mmm]` timestamp in `line`.
    ///
    /// The raw text is always returned when a candidate is found; `parsed`
    /// is `None` if the candidate is not a real calendar date/time.
    pub fn find(line: &str) -> Option<Timestamp> {
        let m = timestamp_regex().find(line)?;
        let raw = m.as_str().to_string();
        let parsed = Self::parse_str(&raw);
        Some(Timestamp { raw, parsed })
    }

    /// Parse a timestamp string in one of the formats found in middleware
    /// logs. A `,` millisecond separator is accepted alongside `.`.
    pub fn parse_str(s: &str) -> Option<NaiveDateTime> {
        if s.is_empty() {
            return None;
        }

        let normalised = s.replacen(',', ".", 1);

        const FORMATS: &[&str] = &[
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%d %H:%M:%S",
            "%Y-%m-%dT%H:%M:%S",
        ];

        for fmt in FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(&normalised, fmt) {
                return Some(naive);
            }
        }

        if let Ok(date) = NaiveDate::parse_from_str(&normalised, "%Y-%m-%d") {
            return date.and_hms_opt(0, 0, 0);
        }

        debug!("TimestampProcessor: could not parse timestamp \"{}\"", s);
        None
    }

    /// Milliseconds from `from` to `to`; negative when `to` is earlier.
    pub fn delta_millis(from: &Timestamp, to: &Timestamp) -> Option<f64> {
        let (a, b) = (from.parsed?, to.parsed?);
        Some((b - a).num_microseconds()? as f64 / 1000.0)
    }
}

// ── DataConverter ─────────────────────────────────────────────────────────────

/// Helpers for turning structured payloads into record fields.
pub struct DataConverter;

impl DataConverter {
    /// Flatten a JSON document into dotted field names.
    ///
    /// `{"a": {"b": 1}}` becomes `a.b = 1`. Arrays flatten to indexed names
    /// (`list.0`, `list.1`, …) plus a `list.len` entry. `null` leaves are
    /// dropped.
    pub fn flatten_json(data: &Value, prefix: &str) -> Fields {
        let mut result = Fields::new();
        Self::flatten_inner(data, prefix, &mut result);
        result
    }

    fn flatten_inner(value: &Value, prefix: &str, output: &mut Fields) {
        match value {
            Value::Object(map) => {
                for (key, val) in map {
                    let new_key = Self::join_key(prefix, key);
                    Self::flatten_inner(val, &new_key, output);
                }
            }
            Value::Array(arr) => {
                output.insert(
                    Self::join_key(prefix, "len"),
                    FieldValue::Int(arr.len() as i64),
                );
                for (i, item) in arr.iter().enumerate() {
                    let new_key = Self::join_key(prefix, &i.to_string());
                    Self::flatten_inner(item, &new_key, output);
                }
            }
            other => {
                if let Some(v) = Self::json_scalar(other) {
                    output.insert(prefix.to_string(), v);
                }
            }
        }
    }

    fn join_key(prefix: &str, key: &str) -> String {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    }

    /// Convert a scalar JSON value into a [`FieldValue`].
    pub fn json_scalar(value: &Value) -> Option<FieldValue> {
        match value {
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(FieldValue::Int)
                .or_else(|| n.as_f64().map(FieldValue::Float)),
            Value::String(s) => Some(FieldValue::Str(s.clone())),
            _ => None,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── TimestampProcessor ───────────────────────────────────────────────────

    #[test]
    fn test_find_timestamp_with_comma_millis() {
        let line = "[INFO][Server] 2025-10-16 12:34:56,789 [PhysicsTime] Update, gonet.std:0.19";
        let ts = TimestampProcessor::find(line).unwrap();
        assert_eq!(ts.raw, "2025-10-16 12:34:56,789");
        let parsed = ts.parsed.unwrap();
        assert_eq!(parsed.format("%H:%M:%S%.3f").to_string(), "12:34:56.789");
    }

    #[test]
    fn test_find_timestamp_iso_t_separator() {
        let ts = TimestampProcessor::find("at 2024-01-15T10:00:00 done").unwrap();
        assert_eq!(ts.raw, "2024-01-15T10:00:00");
        assert!(ts.parsed.is_some());
    }

    #[test]
    fn test_find_timestamp_absent() {
        assert!(TimestampProcessor::find("[Client:1] Start() called").is_none());
    }

    #[test]
    fn test_invalid_calendar_date_keeps_raw() {
        let ts = TimestampProcessor::find("2025-13-45 10:00:00 bogus").unwrap();
        assert_eq!(ts.raw, "2025-13-45 10:00:00");
        assert!(ts.parsed.is_none());
    }

    #[test]
    fn test_parse_date_only() {
        let parsed = TimestampProcessor::parse_str("2025-10-11").unwrap();
        assert_eq!(parsed.format("%Y-%m-%d %H:%M").to_string(), "2025-10-11 00:00");
    }

    #[test]
    fn test_parse_empty_is_none() {
        assert!(TimestampProcessor::parse_str("").is_none());
    }

    #[test]
    fn test_delta_millis_signed() {
        let a = TimestampProcessor::find("2025-10-11 10:00:00,000").unwrap();
        let b = TimestampProcessor::find("2025-10-11 10:00:01,250").unwrap();
        assert_eq!(TimestampProcessor::delta_millis(&a, &b), Some(1250.0));
        assert_eq!(TimestampProcessor::delta_millis(&b, &a), Some(-1250.0));
    }

    // ── DataConverter ────────────────────────────────────────────────────────

    #[test]
    fn test_flatten_nested_objects() {
        let data = json!({
            "TestClass": "RpcTests",
            "ValidationCriteria": {"Count": {"Expected": 3, "Actual": 2}},
        });
        let fields = DataConverter::flatten_json(&data, "");
        assert_eq!(fields.get("TestClass"), Some(&FieldValue::from("RpcTests")));
        assert_eq!(
            fields.get("ValidationCriteria.Count.Expected"),
            Some(&FieldValue::Int(3))
        );
        assert_eq!(
            fields.get("ValidationCriteria.Count.Actual"),
            Some(&FieldValue::Int(2))
        );
    }

    #[test]
    fn test_flatten_arrays_with_len() {
        let data = json!({"RpcExecutions": [{"Machine": "Server"}, {"Machine": "Client:1"}]});
        let fields = DataConverter::flatten_json(&data, "");
        assert_eq!(fields.get("RpcExecutions.len"), Some(&FieldValue::Int(2)));
        assert_eq!(
            fields.get("RpcExecutions.1.Machine"),
            Some(&FieldValue::from("Client:1"))
        );
    }

    #[test]
    fn test_flatten_drops_nulls_and_keeps_floats() {
        let data = json!({"ErrorMessage": null, "Ratio": 0.5});
        let fields = DataConverter::flatten_json(&data, "");
        assert!(fields.get("ErrorMessage").is_none());
        assert_eq!(fields.get("Ratio"), Some(&FieldValue::Float(0.5)));
    }

    #[test]
    fn test_flatten_nests_under_payload_name() {
        let fields = DataConverter::flatten_json(&json!({"checks": {"x": true}}), "quant");
        assert_eq!(fields.get("quant.checks.x"), Some(&FieldValue::Bool(true)));
    }
}
