//! # Retry Policy
//!
//! Pure retry decisions for failed task attempts. The policy never touches
//! the broker; callers act on the returned [`RetryDecision`] by scheduling a
//! delayed retry copy or dead lettering the message.

use std::fmt;
use std::time::Duration;

use crate::config::RetryConfig;

/// How a handler failure is classified for retry purposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely to succeed on a later attempt (network, model backend busy)
    Transient,
    /// Will never succeed with this payload
    Validation,
    /// Unclassified failure, granted a small retry budget
    Unknown,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}

/// Why a message is being dead lettered instead of retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The retry budget is spent
    MaxRetriesExceeded { attempts: u32 },
    /// The failure class does not permit (further) retries
    NonRetryable { class: ErrorClass },
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::MaxRetriesExceeded { attempts } => {
                write!(f, "retry budget exhausted after {attempts} attempts")
            }
            DeadLetterReason::NonRetryable { class } => {
                write!(f, "{class} failures are not retried")
            }
        }
    }
}

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay
    Retry { delay: Duration },
    /// Stop retrying and dead letter the message
    DeadLetter { reason: DeadLetterReason },
}

/// Pure decision function over the retry configuration.
///
/// `attempt` is 1-based and counts handler invocations including the one
/// that just failed, so a task with `max_retries = 3` is invoked at most
/// four times before it is dead lettered.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Decide what happens after attempt `attempt` failed with `class`
    pub fn decide(&self, attempt: u32, class: ErrorClass) -> RetryDecision {
        let retries_so_far = attempt.saturating_sub(1);

        let budget = match class {
            ErrorClass::Validation => {
                return RetryDecision::DeadLetter {
                    reason: DeadLetterReason::NonRetryable { class },
                };
            }
            ErrorClass::Unknown => self
                .config
                .unknown_error_free_retries
                .min(self.config.max_retries),
            ErrorClass::Transient => self.config.max_retries,
        };

        if retries_so_far >= budget {
            let reason = if retries_so_far >= self.config.max_retries {
                DeadLetterReason::MaxRetriesExceeded { attempts: attempt }
            } else {
                DeadLetterReason::NonRetryable { class }
            };
            return RetryDecision::DeadLetter { reason };
        }

        RetryDecision::Retry {
            delay: self.backoff_delay(attempt),
        }
    }

    /// Exponential backoff with additive jitter, capped at the maximum.
    ///
    /// The first retry waits the base delay; each further retry multiplies
    /// it by the configured factor.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base_ms = self.config.base_delay_ms as f64;
        let mut delay_ms = base_ms * self.config.backoff_multiplier.powi(exponent);
        if !delay_ms.is_finite() {
            delay_ms = self.config.max_delay_ms as f64;
        }

        let jitter_ms = delay_ms * self.config.jitter_factor * fastrand::f64();
        let total_ms = (delay_ms + jitter_ms).min(self.config.max_delay_ms as f64);
        Duration::from_millis(total_ms.max(0.0) as u64)
    }
}
