//! Round-trip timestamp format used inside the envelope tag

use chrono::{DateTime, Utc};

/// Format a UTC instant as `YYYY-MM-DDTHH:MM:SS.fffffffZ`.
///
/// Seven fractional digits (100ns ticks) match the round-trip format the
/// console produces, so both sides sign identical strings.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    let ticks = (at.timestamp_subsec_nanos() / 100).min(9_999_999);
    format!("{}.{:07}Z", at.format("%Y-%m-%dT%H:%M:%S"), ticks)
}

/// Parse an RFC 3339 timestamp into UTC
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
