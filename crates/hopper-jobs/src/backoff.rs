//! Retry backoff strategies.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with every attempt.
    Exponential,
    /// Delay grows by a fixed increment.
    Linear,
}

/// Backoff applied by the queue engine before a failed job is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Backoff {
    /// Strategy.
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay in milliseconds.
    pub delay_ms: u64,

    /// Upper bound for a single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl Backoff {
    /// Creates a fixed backoff.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: delay.as_millis() as u64,
            max_delay_ms: None,
        }
    }

    /// Creates an exponential backoff.
    pub fn exponential(initial: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: initial.as_millis() as u64,
            max_delay_ms: None,
        }
    }

    /// Creates a linear backoff.
    pub fn linear(increment: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            delay_ms: increment.as_millis() as u64,
            max_delay_ms: None,
        }
    }

    /// Caps every delay at `max`.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay_ms = Some(max.as_millis() as u64);
        self
    }

    /// Delay before the retry that follows `attempts_made` failed attempts.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let delay = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let factor = 2u64.saturating_pow(attempts_made - 1);
                self.delay_ms.saturating_mul(factor)
            }
            BackoffKind::Linear => self.delay_ms.saturating_mul(attempts_made as u64),
        };

        let capped = match self.max_delay_ms {
            Some(max) => delay.min(max),
            None => delay,
        };

        Duration::from_millis(capped)
    }
}
