//! Retry policy shared by the queue, the monitor and the frame batcher.
//!
//! Pure data plus pure functions: callers own the loop and the sleeping, the
//! policy only answers "retry again?" and "after how long?".

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `attempt * step_ms`
    Linear { step_ms: u64 },
    /// `initial_ms * multiplier^(attempt - 1)`
    Exponential { initial_ms: u64, multiplier: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// What to do after `attempts` failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    pub const fn linear(max_attempts: u32, step_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear { step_ms },
        }
    }

    pub const fn exponential(max_attempts: u32, initial_ms: u64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial_ms,
                multiplier,
            },
        }
    }

    /// Delay before the attempt that follows failed attempt number `attempt`
    /// (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = match self.backoff {
            Backoff::Linear { step_ms } => step_ms.saturating_mul(attempt as u64),
            Backoff::Exponential {
                initial_ms,
                multiplier,
            } => (initial_ms as f64 * multiplier.powi(attempt as i32 - 1)) as u64,
        };
        Duration::from_millis(ms)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn decide(&self, attempts: u32) -> RetryDecision {
        if self.should_retry(attempts) {
            RetryDecision::RetryAfter(self.delay_after(attempts))
        } else {
            RetryDecision::GiveUp
        }
    }
}
