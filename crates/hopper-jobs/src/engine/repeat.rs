//! Repeat specifications for scheduled jobs.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted `every` interval: ten years.
pub const MAX_INTERVAL: Duration = Duration::from_secs(10 * 366 * 24 * 60 * 60);

/// When a repeatable job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RepeatSpec {
    /// Cron pattern, 5 fields (minute precision) or 6 fields (with seconds).
    Cron {
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
    /// Fixed interval in milliseconds.
    Every { every_ms: u64 },
}

impl RepeatSpec {
    /// Cron repeat without a timezone.
    pub fn cron(pattern: impl Into<String>) -> Self {
        RepeatSpec::Cron {
            pattern: pattern.into(),
            tz: None,
        }
    }

    /// Cron repeat evaluated in `tz`.
    pub fn cron_in(pattern: impl Into<String>, tz: impl Into<String>) -> Self {
        RepeatSpec::Cron {
            pattern: pattern.into(),
            tz: Some(tz.into()),
        }
    }

    /// Interval repeat.
    pub fn every(interval: Duration) -> Self {
        RepeatSpec::Every {
            every_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Checks the pattern parses and the interval is positive and at most
    /// [`MAX_INTERVAL`].
    pub fn validate(&self) -> JobResult<()> {
        match self {
            RepeatSpec::Cron { pattern, .. } => parse_cron(pattern).map(|_| ()),
            RepeatSpec::Every { every_ms: 0 } => Err(JobError::Configuration(
                "repeat interval must be greater than zero".to_string(),
            )),
            RepeatSpec::Every { every_ms } if u128::from(*every_ms) > MAX_INTERVAL.as_millis() => {
                Err(JobError::Configuration(format!(
                    "repeat interval of {}ms exceeds the {}s limit",
                    every_ms,
                    MAX_INTERVAL.as_secs()
                )))
            }
            RepeatSpec::Every { .. } => Ok(()),
        }
    }

    /// Next fire time strictly after `after`.
    ///
    /// Fixed offsets such as `+02:00` are honoured; named zones are left to
    /// the engine and computed here in UTC.
    pub fn next_after(&self, after: DateTime<Utc>) -> JobResult<Option<DateTime<Utc>>> {
        match self {
            RepeatSpec::Cron { pattern, tz } => {
                let schedule = parse_cron(pattern)?;
                let offset = tz.as_deref().and_then(|tz| FixedOffset::from_str(tz).ok());

                let next = match offset {
                    Some(offset) => schedule
                        .after(&after.with_timezone(&offset))
                        .next()
                        .map(|t| t.with_timezone(&Utc)),
                    None => schedule.after(&after).next(),
                };
                Ok(next)
            }
            RepeatSpec::Every { every_ms } => {
                let next = i64::try_from(*every_ms)
                    .ok()
                    .and_then(chrono::Duration::try_milliseconds)
                    .and_then(|step| after.checked_add_signed(step))
                    .ok_or_else(|| {
                        JobError::Configuration(format!(
                            "repeat interval of {}ms overflows the calendar",
                            every_ms
                        ))
                    })?;
                Ok(Some(next))
            }
        }
    }
}

/// Expands a 5-field cron pattern to the 6-field form by pinning seconds to 0.
pub fn normalize_cron(pattern: &str) -> String {
    let trimmed = pattern.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    }
}

fn parse_cron(pattern: &str) -> JobResult<Schedule> {
    Schedule::from_str(&normalize_cron(pattern)).map_err(|e| {
        JobError::Configuration(format!("Invalid cron expression '{}': {}", pattern, e))
    })
}

/// Common cron expressions.
pub mod cron_expressions {
    /// Every minute.
    pub const EVERY_MINUTE: &str = "* * * * *";

    /// Every 5 minutes.
    pub const EVERY_5_MINUTES: &str = "*/5 * * * *";

    /// Every hour.
    pub const EVERY_HOUR: &str = "0 * * * *";

    /// Every day at midnight.
    pub const DAILY_MIDNIGHT: &str = "0 0 * * *";

    /// Every day at 3 AM.
    pub const NIGHTLY: &str = "0 3 * * *";

    /// Every Monday at midnight.
    pub const WEEKLY_MONDAY: &str = "0 0 * * MON";
}
