//! # Task Status Store
//!
//! In-process view of task lifecycle, fed by the dispatcher (queued) and
//! the correlator (everything observed on the results queue). Durable task
//! history is a collaborator's responsibility; this store only answers
//! "what is task X doing right now" and forgets terminal records after a
//! retention window.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::messaging::{ProgressStage, ResultError, TaskProgressMessage, TaskResultMessage, TaskType};
use crate::state_machine::TaskStatus;

/// Everything the store knows about one task
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Highest attempt number observed
    pub attempts: u32,
    /// Latest completion estimate, 0-100
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<ResultError>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    fn new(task_id: Uuid, task_type: TaskType, status: TaskStatus) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            task_type,
            status,
            attempts: 0,
            progress: 0,
            result: None,
            last_error: None,
            submitted_at: now,
            updated_at: now,
        }
    }
}

/// Concurrent task id -> record map with terminal-record retention
pub struct StatusStore {
    records: DashMap<Uuid, TaskRecord>,
    retention: Duration,
}

impl StatusStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            retention,
        }
    }

    pub fn get(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.records.get(&task_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record a freshly dispatched task. Keeps an existing record untouched
    /// so an idempotent resubmission cannot reset observed progress.
    pub fn record_queued(&self, task_id: Uuid, task_type: TaskType) {
        self.records
            .entry(task_id)
            .or_insert_with(|| TaskRecord::new(task_id, task_type, TaskStatus::Queued));
    }

    /// Fold a progress message into the record. Terminal records are
    /// immutable; a late progress update for one is dropped.
    pub fn record_progress(&self, task_type: TaskType, message: &TaskProgressMessage) {
        let mut record = self
            .records
            .entry(message.task_id)
            .or_insert_with(|| TaskRecord::new(message.task_id, task_type, TaskStatus::Queued));
        if record.status.is_terminal() {
            return;
        }

        // attempt counts only increase; duplicate deliveries cannot rewind
        record.attempts = record.attempts.max(message.attempt);
        record.progress = record.progress.max(message.progress);
        record.status = match message.stage {
            ProgressStage::Started | ProgressStage::Running => TaskStatus::Processing,
            ProgressStage::RetryScheduled => TaskStatus::Retrying,
        };
        record.updated_at = Utc::now();
    }

    /// Fold a terminal result into the record. The first terminal result
    /// wins; duplicates are dropped.
    pub fn record_terminal(&self, task_type: TaskType, message: &TaskResultMessage) {
        let mut record = self
            .records
            .entry(message.task_id)
            .or_insert_with(|| TaskRecord::new(message.task_id, task_type, TaskStatus::Queued));
        if record.status.is_terminal() {
            debug!(task_id = %message.task_id, "Duplicate terminal result ignored");
            return;
        }

        record.status = message.status();
        record.result = message.result.clone();
        record.last_error = message.error.clone();
        record.updated_at = Utc::now();
    }

    /// Drop terminal records older than the retention window, returning how
    /// many were removed. Active records are never swept.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::zero());
        let before = self.records.len();
        self.records
            .retain(|_, record| !(record.status.is_terminal() && record.updated_at < cutoff));
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(removed = removed, remaining = self.records.len(), "Swept terminal task records");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::TaskProgressMessage;

    fn store() -> StatusStore {
        StatusStore::new(Duration::from_millis(0))
    }

    #[test]
    fn test_queued_then_progress_then_terminal() {
        let store = store();
        let task_id = Uuid::new_v4();

        store.record_queued(task_id, TaskType::Generate);
        assert_eq!(store.get(task_id).unwrap().status, TaskStatus::Queued);

        let started = TaskProgressMessage::new(task_id, 1, 0, 1, ProgressStage::Started);
        store.record_progress(TaskType::Generate, &started);
        let record = store.get(task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.attempts, 1);

        let result = TaskResultMessage::success(task_id, Some(serde_json::json!({"ok": true})), 20);
        store.record_terminal(TaskType::Generate, &result);
        let record = store.get(task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn test_retry_stage_maps_to_retrying() {
        let store = store();
        let task_id = Uuid::new_v4();
        let retry = TaskProgressMessage::new(task_id, 2, 0, 9, ProgressStage::RetryScheduled);
        store.record_progress(TaskType::Optimize, &retry);
        let record = store.get(task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Retrying);
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn test_attempts_never_rewind() {
        let store = store();
        let task_id = Uuid::new_v4();
        store.record_progress(
            TaskType::Generate,
            &TaskProgressMessage::new(task_id, 3, 50, 5, ProgressStage::Running),
        );
        // a redelivered older update arrives out of order
        store.record_progress(
            TaskType::Generate,
            &TaskProgressMessage::new(task_id, 1, 10, 2, ProgressStage::Started),
        );
        let record = store.get(task_id).unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.progress, 50);
    }

    #[test]
    fn test_terminal_records_are_immutable() {
        let store = store();
        let task_id = Uuid::new_v4();
        store.record_terminal(
            TaskType::Expand,
            &TaskResultMessage::failure(task_id, "validation_failed", "bad payload", false, 5),
        );
        store.record_terminal(TaskType::Expand, &TaskResultMessage::success(task_id, None, 8));
        store.record_progress(
            TaskType::Expand,
            &TaskProgressMessage::new(task_id, 4, 99, 40, ProgressStage::Running),
        );

        let record = store.get(task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.last_error.unwrap().code, "validation_failed");
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn test_sweep_removes_only_terminal_records() {
        let store = store();
        let done = Uuid::new_v4();
        let active = Uuid::new_v4();

        store.record_terminal(TaskType::Generate, &TaskResultMessage::success(done, None, 1));
        store.record_queued(active, TaskType::Generate);

        // zero retention: terminal records are immediately sweepable
        assert_eq!(store.sweep(), 1);
        assert!(store.get(done).is_none());
        assert!(store.get(active).is_some());
    }
}
