//! Timestamps and identifiers.
//!
//! All persisted timestamps are UTC, ISO-8601 with millisecond precision
//! and a trailing `Z`. The fixed width makes lexicographic comparison in
//! SQL agree with chronological order. Identifiers are random 128-bit
//! UUIDs rendered as 36-character strings.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use uuid::Uuid;

/// Returns the current UTC time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Formats a timestamp as ISO-8601 with millisecond precision.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Formats the current time; shorthand for `to_iso(now())`.
pub fn now_iso() -> String {
    to_iso(now())
}

/// Parses an ISO-8601 timestamp back into UTC.
pub fn from_iso(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Computes an expiration timestamp `ttl_secs` from now.
pub fn expiry(ttl_secs: u64) -> DateTime<Utc> {
    now() + ChronoDuration::seconds(ttl_secs as i64)
}

/// Mints a new random identifier (36-character UUID string).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Mints a short prefixed identifier, e.g. `task-1a2b3c4d`.
pub fn new_short_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_round_trip() {
        let ts = now();
        let formatted = to_iso(ts);
        let parsed = from_iso(&formatted).unwrap();
        assert_eq!(parsed.timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn test_iso_format_shape() {
        let formatted = now_iso();
        assert!(formatted.ends_with('Z'));
        // "2026-08-02T12:34:56.789Z"
        assert_eq!(formatted.len(), 24);
    }

    #[test]
    fn test_iso_lexicographic_order_matches_chronology() {
        let earlier = to_iso(now());
        let later = to_iso(now() + ChronoDuration::seconds(1));
        assert!(earlier < later);
    }

    #[test]
    fn test_new_id_is_36_chars_and_unique() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_id_prefix() {
        let id = new_short_id("task");
        assert!(id.starts_with("task-"));
        assert_eq!(id.len(), 13);
    }

    #[test]
    fn test_expiry_in_future() {
        assert!(expiry(60) > now());
    }
}
