//! Wall-clock helpers. Core code takes timestamps as plain strings.

use chrono::{SecondsFormat, Utc};

/// Current time as RFC 3339 UTC with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
