use chrono::{DateTime, Duration, TimeZone, Utc};
use crate::errors::{Result, SentinelError};

/// Parse a retention string like "30s", "10m", "5h", "7d" into a chrono::Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SentinelError::config("Empty duration string"));
    }

    let split_at = s.find(|c: char| !c.is_ascii_digit() && c != '-').unwrap_or(s.len());
    let (number_part, unit_part) = s.split_at(split_at);

    let value: i64 = number_part.parse()
        .map_err(|_| SentinelError::config(format!("Invalid number in duration: '{}'", s)))?;

    if value <= 0 {
        return Err(SentinelError::config("Duration must be positive"));
    }

    let duration = match unit_part {
        "s" => Duration::seconds(value),
        "m" => Duration::minutes(value),
        "h" => Duration::hours(value),
        "d" => Duration::days(value),
        _ => return Err(SentinelError::config(format!(
            "Invalid duration unit '{}'. Use 's', 'm', 'h' or 'd'", unit_part
        ))),
    };

    Ok(duration)
}

/// Milliseconds since the Unix epoch, the key used for stored frame images.
pub fn epoch_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_epoch_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
