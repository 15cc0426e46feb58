//! # Message Structures for Broker Queues
//!
//! Defines the wire formats exchanged with the Easel web application over
//! the broker. Field names are camelCase on the wire so payloads match the
//! JSON the web client produces and consumes.

use serde::{Deserialize, Serialize};
use serde_json;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::routing;
use crate::state_machine::TaskStatus;

/// Task categories the canvas can enqueue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Generate a new image from a prompt
    Generate,
    /// Optimize or upscale an existing asset
    Optimize,
    /// Fuse multiple source images into one
    Fusion,
    /// Analyze canvas content
    Analyze,
    /// Expand an image beyond its borders
    Expand,
}

impl TaskType {
    /// All task types, in routing declaration order
    pub const ALL: [TaskType; 5] = [
        TaskType::Generate,
        TaskType::Optimize,
        TaskType::Fusion,
        TaskType::Analyze,
        TaskType::Expand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Generate => "generate",
            TaskType::Optimize => "optimize",
            TaskType::Fusion => "fusion",
            TaskType::Analyze => "analyze",
            TaskType::Expand => "expand",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(TaskType::Generate),
            "optimize" => Ok(TaskType::Optimize),
            "fusion" => Ok(TaskType::Fusion),
            "analyze" => Ok(TaskType::Analyze),
            "expand" => Ok(TaskType::Expand),
            _ => Err(format!(
                "Invalid task type: {s} (expected one of: generate, optimize, fusion, analyze, expand)"
            )),
        }
    }
}

/// Named priority levels producers use; each maps to a canonical
/// integer on the 1-10 scale the broker speaks natively.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TaskPriority {
    /// Canonical integer value for this level
    pub fn value(&self) -> u8 {
        match self {
            TaskPriority::Low => 2,
            TaskPriority::Normal => 5,
            TaskPriority::High => 8,
            TaskPriority::Urgent => 10,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> u8 {
        priority.value()
    }
}

/// Routing label bucket for a canonical priority value.
///
/// 1-3 map to `low`, 4-6 to `normal`, 7-9 to `high`, and 10 to `urgent`.
/// Values outside 1-10 are rejected before they reach routing, so anything
/// above 10 here is treated as urgent.
pub fn priority_label(priority: u8) -> &'static str {
    match priority {
        0..=3 => "low",
        4..=6 => "normal",
        7..=9 => "high",
        _ => "urgent",
    }
}

/// Provenance of a task, carried end to end for auditing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    /// Which system submitted the task (e.g. "easel-web")
    pub originator: String,
    /// Project the task belongs to, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Canvas node the task targets, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl TaskContext {
    pub fn new(originator: impl Into<String>) -> Self {
        Self {
            originator: originator.into(),
            project_id: None,
            node_id: None,
        }
    }
}

/// Task envelope published to the task exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    /// Unique task identifier, assigned at submission
    pub task_id: Uuid,
    /// Task category, also carried in the routing key
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Canonical priority on the 1-10 scale
    pub priority: u8,
    /// Opaque task payload, interpreted by handlers
    pub payload: serde_json::Value,
    /// 1-based delivery attempt this copy represents
    pub attempt: u32,
    /// Submission time in epoch milliseconds, stable across retries
    pub original_timestamp: i64,
    /// Provenance of the task
    pub context: TaskContext,
}

impl TaskMessage {
    /// Create a first-attempt task message with a fresh identifier
    pub fn new(
        task_type: TaskType,
        priority: u8,
        payload: serde_json::Value,
        context: TaskContext,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            task_type,
            priority,
            payload,
            attempt: 1,
            original_timestamp: chrono::Utc::now().timestamp_millis(),
            context,
        }
    }

    /// Routing key for this message on the task exchange
    pub fn routing_key(&self) -> String {
        routing::task_key(self.task_type.as_str(), priority_label(self.priority))
    }

    /// Clone this message as the next attempt
    pub fn next_attempt(&self) -> Self {
        let mut copy = self.clone();
        copy.attempt += 1;
        copy
    }

    /// Milliseconds since the task was first submitted
    pub fn age_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.original_timestamp
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Error detail attached to failed results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultError {
    /// Stable machine-readable error code
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Whether the producer may resubmit the task
    pub retryable: bool,
}

/// Terminal outcome published to the results exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultMessage {
    /// Task this result belongs to
    pub task_id: Uuid,
    /// Whether the task completed successfully
    pub success: bool,
    /// Handler output on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error detail on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResultError>,
    /// Wall time spent processing across all attempts
    pub processing_time_ms: u64,
}

impl TaskResultMessage {
    /// Create a successful result
    pub fn success(task_id: Uuid, result: Option<serde_json::Value>, processing_time_ms: u64) -> Self {
        Self {
            task_id,
            success: true,
            result,
            error: None,
            processing_time_ms,
        }
    }

    /// Create a failed result
    pub fn failure(
        task_id: Uuid,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            task_id,
            success: false,
            result: None,
            error: Some(ResultError {
                code: code.into(),
                message: message.into(),
                retryable,
            }),
            processing_time_ms,
        }
    }

    /// Create a cancellation result
    pub fn cancelled(task_id: Uuid, processing_time_ms: u64) -> Self {
        Self::failure(
            task_id,
            crate::constants::error_codes::TASK_CANCELLED,
            "Task was cancelled before completion",
            false,
            processing_time_ms,
        )
    }

    /// Whether this result records a cancellation rather than a failure
    pub fn is_cancellation(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.code == crate::constants::error_codes::TASK_CANCELLED)
    }

    /// Terminal status this result maps to
    pub fn status(&self) -> TaskStatus {
        if self.success {
            TaskStatus::Completed
        } else if self.is_cancellation() {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Failed
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Lifecycle stage a progress update reports
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ProgressStage {
    /// Handler invocation began for an attempt
    Started,
    /// Handler reported intermediate progress
    Running,
    /// A retry was scheduled after a transient failure
    RetryScheduled,
}

/// Non-terminal progress update published to the results exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressMessage {
    /// Task this update belongs to
    pub task_id: Uuid,
    /// Attempt the update was emitted from
    pub attempt: u32,
    /// Completion estimate, 0-100
    pub progress: u8,
    /// Monotonic ordering key within the task
    pub sequence: u64,
    /// Lifecycle stage
    pub stage: ProgressStage,
    /// Optional free-form detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// When the update was emitted
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TaskProgressMessage {
    pub fn new(task_id: Uuid, attempt: u32, progress: u8, sequence: u64, stage: ProgressStage) -> Self {
        Self {
            task_id,
            attempt,
            progress,
            sequence,
            stage,
            detail: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Broadcast sent to every worker over the control exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Ask workers to abandon a task wherever it currently is
    #[serde(rename_all = "camelCase")]
    Cancel {
        task_id: Uuid,
        requested_at: chrono::DateTime<chrono::Utc>,
    },
}

impl ControlMessage {
    pub fn cancel(task_id: Uuid) -> Self {
        ControlMessage::Cancel {
            task_id,
            requested_at: chrono::Utc::now(),
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
