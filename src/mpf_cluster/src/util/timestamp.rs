//! Timestamp formatting

use chrono::{DateTime, Local};

/// Current local time as `YYYY-MM-DD_HH-MM-SS`, safe for directory names
pub fn format_timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Render epoch milliseconds as local RFC 3339; `0` means never.
pub fn format_millis(millis: u64) -> Option<String> {
    if millis == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(i64::try_from(millis).ok()?)
        .map(|t| t.with_timezone(&Local).to_rfc3339())
}
