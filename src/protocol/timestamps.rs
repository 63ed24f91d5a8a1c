//! Timestamp policy: every stored or published timestamp is UTC, rendered
//! as RFC 3339 with millisecond precision and a `Z` suffix.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

/// Epoch values above this are treated as milliseconds
const EPOCH_MILLIS_THRESHOLD: u64 = 100_000_000_000;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Interpret a payload timestamp field. Accepts RFC 3339 strings (any
/// offset, normalised to UTC), naive `YYYY-MM-DD HH:MM:SS` strings (read as
/// UTC) and epoch seconds or milliseconds.
pub fn parse_payload_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(number) => {
            let raw = number.as_i64().or_else(|| number.as_f64().map(|f| f as i64))?;
            if raw.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}
