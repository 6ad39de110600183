use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Local, TimeZone, Utc};

/// Retrieves the current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since_the_epoch| since_the_epoch.as_secs())
        .unwrap_or_default()
}

/// Renders a number of seconds as `HH:MM:SS`.
pub fn format_duration(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

/// Converts a `u64` Unix timestamp (seconds since epoch) into
/// a human-readable local time string, e.g. "2025-02-07 14:05:00".
pub fn format_unix_timestamp(timestamp: u64) -> String {
    match Utc.timestamp_opt(timestamp as i64, 0).single() {
        Some(dt_utc) => dt_utc
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => "Invalid timestamp".to_string(),
    }
}
