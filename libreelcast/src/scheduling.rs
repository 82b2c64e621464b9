//! Parsing of human-entered publish times
//!
//! Accepted forms, tried in order:
//! - RFC 3339 timestamps: `2026-11-20T15:00:00Z`, `2026-11-20T10:00:00-05:00`
//! - Relative durations: `90m`, `2h`, `1d 6h`
//! - Natural language: `tomorrow`, `next friday 10am`, `in 3 hours`

use chrono::{DateTime, Duration, Utc};

use crate::error::{ReelcastError, Result};

/// Timezone recorded with a schedule when the caller gives none
pub const DEFAULT_TIMEZONE: &str = "America/New_York";

/// Resolve `input` to an absolute instant, relative to `now`
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ReelcastError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(duration) = parse_duration(input) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        ReelcastError::InvalidInput(format!("Could not parse schedule '{}': {}", input, e))
    })
}

/// Like [`parse_schedule`] but refuses instants at or before `now`
pub fn parse_future_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let at = parse_schedule(input, now)?;
    if at <= now {
        return Err(ReelcastError::InvalidInput(format!(
            "Scheduled time {} is not in the future",
            at.to_rfc3339()
        )));
    }
    Ok(at)
}

fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    Duration::try_seconds(i64::try_from(std_duration.as_secs()).ok()?)
}
