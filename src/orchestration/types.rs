//! # Orchestration Types
//!
//! Shared request and update types passed between the dispatcher, the
//! worker, the correlator, and embedding callers. Wire formats live in
//! [`crate::messaging::message`]; these types never leave the process.

use serde_json::Value;
use uuid::Uuid;

use crate::messaging::{ResultError, TaskContext, TaskPriority, TaskType};
use crate::state_machine::TaskStatus;

/// A task submission accepted by [`crate::orchestration::TaskDispatcher`].
///
/// Built with the fluent constructors; only the task type and payload are
/// required. Omitted fields get their documented defaults: a fresh task id,
/// normal priority, and an `unknown` originator.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    /// Pre-assigned task id; `None` lets the dispatcher assign one
    pub task_id: Option<Uuid>,
    pub task_type: TaskType,
    /// Canonical priority on the 1-10 scale
    pub priority: u8,
    /// Opaque payload handed to the handler unchanged
    pub payload: Value,
    pub context: TaskContext,
}

impl DispatchRequest {
    pub fn new(task_type: TaskType, payload: Value) -> Self {
        Self {
            task_id: None,
            task_type,
            priority: TaskPriority::Normal.value(),
            payload,
            context: TaskContext::new(crate::constants::system::UNKNOWN),
        }
    }

    /// Submit under a caller-chosen id, for idempotent resubmission
    pub fn with_task_id(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Set the canonical integer priority; values are clamped to 1-10
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, crate::constants::system::MAX_PRIORITY_LEVELS);
        self
    }

    /// Set priority through the named four-level scale
    pub fn with_priority_level(self, level: TaskPriority) -> Self {
        self.with_priority(level.value())
    }

    pub fn with_originator(mut self, originator: impl Into<String>) -> Self {
        self.context.originator = originator.into();
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.context.project_id = Some(project_id.into());
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.context.node_id = Some(node_id.into());
        self
    }
}

/// One update delivered to a task subscription.
///
/// Progress updates may repeat (the sequence makes duplicates harmless to
/// display); the terminal update arrives at most once per subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Progress {
        task_id: Uuid,
        attempt: u32,
        /// Completion estimate, 0-100
        progress: u8,
        /// Monotonically increasing within the task
        sequence: u64,
        detail: Option<String>,
    },
    Terminal {
        task_id: Uuid,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<ResultError>,
        processing_time_ms: u64,
    },
}

impl TaskUpdate {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskUpdate::Progress { task_id, .. } | TaskUpdate::Terminal { task_id, .. } => *task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskUpdate::Terminal { .. })
    }

    /// Terminal status, if this is a terminal update
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            TaskUpdate::Terminal { status, .. } => Some(*status),
            TaskUpdate::Progress { .. } => None,
        }
    }
}
