//! Shared timestamp, date-window, and envelope helpers.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;
use ulid::Ulid;

/// Canonical textual form of a run date.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Canonical textual form of a message timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Inclusive window of `days` days ending on `end`. A zero-day window is the end day alone.
pub fn date_window(end: NaiveDate, days: u32) -> (NaiveDate, NaiveDate) {
    let span = i64::from(days.max(1)) - 1;
    (end - Duration::days(span), end)
}

/// Normalize a raw timestamp to `YYYY-MM-DD HH:MM:SS`.
///
/// Offsets are dropped, not applied: the wall-clock time is kept so the date prefix
/// matches the one source rows are filtered on. Unparseable input is returned
/// trimmed but otherwise verbatim so ordering stays stable.
pub fn normalize_timestamp(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return dt.naive_local().format(TIMESTAMP_FORMAT).to_string();
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return dt.format(TIMESTAMP_FORMAT).to_string();
        }
    }
    trimmed.to_string()
}

/// Standard run-result envelope shape shared by every summary surface.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}
