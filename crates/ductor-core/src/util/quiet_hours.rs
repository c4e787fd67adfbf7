//! Shared quiet hour checks for heartbeat, cron, and webhooks.

use chrono::Timelike;
use chrono_tz::Tz;

use crate::config::resolve_user_timezone;

/// Check whether `now_hour` falls within the quiet window.
///
/// Handles wrap-around: `quiet_start=21, quiet_end=8` means 21-23 and 0-7
/// are quiet. `quiet_start == quiet_end` disables quiet hours entirely.
pub fn is_quiet_hour(now_hour: u32, quiet_start: u32, quiet_end: u32) -> bool {
    if quiet_start == quiet_end {
        return false;
    }
    if quiet_start <= quiet_end {
        quiet_start <= now_hour && now_hour < quiet_end
    } else {
        now_hour >= quiet_start || now_hour < quiet_end
    }
}

/// Check the current local time against a quiet window with global fallback.
///
/// Per-item overrides (`quiet_start`/`quiet_end` of a cron job or webhook)
/// take precedence; `None` falls back to the global config values.
/// Returns `(is_quiet, current_hour, timezone)`.
pub fn check_quiet_hour(
    quiet_start: Option<u32>,
    quiet_end: Option<u32>,
    user_timezone: &str,
    global_quiet_start: u32,
    global_quiet_end: u32,
) -> (bool, u32, Tz) {
    let start = quiet_start.unwrap_or(global_quiet_start);
    let end = quiet_end.unwrap_or(global_quiet_end);

    let tz = resolve_user_timezone(user_timezone);
    let now_hour = chrono::Utc::now().with_timezone(&tz).hour();

    (is_quiet_hour(now_hour, start, end), now_hour, tz)
}
