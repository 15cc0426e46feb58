use serde::{Deserialize, Serialize};
use std::fmt;

/// Task lifecycle states as tracked by the status store and reported to
/// result subscribers.
///
/// Transitions: `queued → processing → (retrying → processing)* →
/// {completed | failed | cancelled}`. Cancellation may also land directly
/// from `queued` when the task is cancelled before a worker dequeues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted by the dispatcher and durably published
    Queued,
    /// A worker is executing the handler
    Processing,
    /// Handler failed retryably; a delayed retry copy is queued
    Retrying,
    /// Handler succeeded and the result was delivered
    Completed,
    /// Retries exhausted or failure was non-retryable
    Failed,
    /// Cancelled before the handler ran
    Cancelled,
}

impl TaskStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if this is an active state (a worker owns the task right now
    /// or will shortly)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::Retrying)
    }

    /// Check if this state describes a failure outcome
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Retrying => write!(f, "retrying"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Default state for newly submitted tasks
impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}
