//! Timestamp and session-time formatting utilities

use chrono::{DateTime, Utc};

/// Sessions shorter than this are shown as `M:SS.s`, longer ones as `H:MM:SS`
const MEDIUM_FORMAT_MAX_MS: u64 = 6_000_000;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a session position for logs and the CLI
///
/// # Examples
///
/// ```
/// use tap_common::time::format_session_time;
///
/// assert_eq!(format_session_time(0), "0:00.0");
/// assert_eq!(format_session_time(30_000), "0:30.0");
/// assert_eq!(format_session_time(754_300), "12:34.3");
/// assert_eq!(format_session_time(7_322_000), "2:02:02");
/// ```
pub fn format_session_time(ms: u64) -> String {
    if ms < MEDIUM_FORMAT_MAX_MS {
        let minutes = ms / 60_000;
        let tenths = (ms % 60_000) / 100;
        format!("{}:{:02}.{}", minutes, tenths / 10, tenths % 10)
    } else {
        let secs = ms / 1000;
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Format a progress percentage with one decimal place
pub fn format_percent(pct: f64) -> String {
    format!("{:.1}%", pct)
}
