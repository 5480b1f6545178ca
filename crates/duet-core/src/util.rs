//! Shared utility functions used across multiple modules.

use std::time::Duration;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Unix ms timestamp `window` before `now`, saturating at zero.
pub fn millis_before(now: i64, window: Duration) -> i64 {
    let window = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    now.saturating_sub(window).max(0)
}

/// Render a unix ms timestamp as a UTC label for logs and CLI output.
pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |value| value.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}
