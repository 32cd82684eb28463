//! Engine-level job options.

use crate::backoff::Backoff;
use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Job priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum Priority {
    /// Low priority (background tasks).
    Low = -10,
    /// Normal priority (default).
    Normal = 0,
    /// High priority (important tasks).
    High = 10,
    /// Critical priority (time-sensitive).
    Critical = 20,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl From<i8> for Priority {
    fn from(value: i8) -> Self {
        match value {
            v if v >= 20 => Priority::Critical,
            v if v >= 10 => Priority::High,
            v if v <= -10 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl From<Priority> for i8 {
    fn from(priority: Priority) -> Self {
        priority as i8
    }
}

/// What the engine keeps once a job reaches a finished state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Keep every finished job.
    Keep,
    /// Remove the job as soon as it finishes.
    Remove,
    /// Keep only the most recent `n` finished jobs of the queue.
    KeepLast(usize),
}

/// Options forwarded to the queue engine with each job.
///
/// Every field is optional so layers can be merged: queue defaults, then
/// job defaults, then per-dispatch overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobOptions {
    /// Total attempts including the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Delay between retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,

    /// Initial delay before the job becomes available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Priority (higher = more urgent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i8>,

    /// Caller-chosen id; the engine ignores duplicates of a live id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Take newest jobs first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifo: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<RemovalPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<RemovalPolicy>,

    /// Fail the parent of a flow node when this node fails terminally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_parent_on_failure: Option<bool>,
}

impl JobOptions {
    /// Builds options from a loosely typed map, as found in config files.
    pub fn from_map(map: &Map<String, Value>) -> JobResult<Self> {
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| JobError::Configuration(format!("invalid job options: {}", e)))
    }

    /// Sets a single option by its serialized key.
    pub fn set(&mut self, key: &str, value: Value) -> JobResult<()> {
        let mut map = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert(key.to_string(), value);

        *self = serde_json::from_value(Value::Object(map))
            .map_err(|e| JobError::Configuration(format!("invalid job option '{}': {}", key, e)))?;
        Ok(())
    }

    /// Returns `self` with every option set in `overrides` replaced.
    pub fn merge(&self, overrides: &JobOptions) -> JobOptions {
        JobOptions {
            attempts: overrides.attempts.or(self.attempts),
            backoff: overrides.backoff.clone().or_else(|| self.backoff.clone()),
            delay_ms: overrides.delay_ms.or(self.delay_ms),
            priority: overrides.priority.or(self.priority),
            job_id: overrides.job_id.clone().or_else(|| self.job_id.clone()),
            lifo: overrides.lifo.or(self.lifo),
            remove_on_complete: overrides.remove_on_complete.or(self.remove_on_complete),
            remove_on_fail: overrides.remove_on_fail.or(self.remove_on_fail),
            fail_parent_on_failure: overrides
                .fail_parent_on_failure
                .or(self.fail_parent_on_failure),
        }
    }

    /// Sets the attempt count.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the retry backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Sets the initial delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority.into());
        self
    }

    /// Attempts allowed, never less than one.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }

    /// Initial delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    /// Priority level, defaulting to normal.
    pub fn priority_level(&self) -> Priority {
        self.priority.map(Priority::from).unwrap_or_default()
    }

    /// Delay before retrying after `attempts_made` failures.
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff
            .as_ref()
            .map(|b| b.delay_for_attempt(attempts_made))
            .unwrap_or(Duration::ZERO)
    }
}
