//! End-to-end lifecycle tests on the in-memory transport: submission,
//! progress fan-out, terminal delivery, replay, and cancellation.

mod common;

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use easel_broker::messaging::TaskType;
use easel_broker::orchestration::{BrokerSystem, DispatchRequest, TaskUpdate};
use easel_broker::state_machine::TaskStatus;

use common::{fast_config, wait_for_status, wait_until, ProgressHandler, RejectingHandler};

#[tokio::test]
async fn test_submit_returns_task_id_and_records_queued() {
    let mut config = fast_config();
    config.worker.enabled = false;

    let system = BrokerSystem::builder(config).start().await.unwrap();

    let task_id = system
        .submit(DispatchRequest::new(
            TaskType::Generate,
            json!({ "prompt": "a lighthouse at dawn" }),
        ))
        .await
        .unwrap();

    let record = system.task_status(task_id).unwrap();
    assert_eq!(record.task_type, TaskType::Generate);
    assert_eq!(record.status, TaskStatus::Queued);

    system.shutdown().await;
}

#[tokio::test]
async fn test_preassigned_task_id_is_honored() {
    let mut config = fast_config();
    config.worker.enabled = false;

    let system = BrokerSystem::builder(config).start().await.unwrap();

    let wanted = Uuid::new_v4();
    let assigned = system
        .submit(DispatchRequest::new(TaskType::Analyze, json!({})).with_task_id(wanted))
        .await
        .unwrap();

    assert_eq!(assigned, wanted);
    system.shutdown().await;
}

#[tokio::test]
async fn test_success_delivers_progress_then_single_terminal() {
    let system = BrokerSystem::builder(fast_config())
        .register_handler(TaskType::Generate, ProgressHandler::new())
        .start()
        .await
        .unwrap();

    let task_id = system
        .submit(DispatchRequest::new(
            TaskType::Generate,
            json!({ "prompt": "dawn" }),
        ))
        .await
        .unwrap();
    let mut subscription = system.subscribe(task_id);

    let mut progress_sequences = Vec::new();
    let mut terminals = Vec::new();
    while let Some(update) = subscription.recv().await {
        match update {
            TaskUpdate::Progress { sequence, .. } => progress_sequences.push(sequence),
            terminal @ TaskUpdate::Terminal { .. } => terminals.push(terminal),
        }
    }

    assert_eq!(terminals.len(), 1, "exactly one terminal update");
    let TaskUpdate::Terminal { status, result, error, .. } = &terminals[0] else {
        unreachable!();
    };
    assert_eq!(*status, TaskStatus::Completed);
    assert_eq!(result.as_ref().unwrap()["asset"], "mem://render");
    assert!(error.is_none());

    // Sequences are strictly increasing within the task.
    assert!(progress_sequences.windows(2).all(|w| w[0] < w[1]));

    system.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_after_completion_replays_terminal() {
    let system = BrokerSystem::builder(fast_config())
        .register_handler(TaskType::Optimize, ProgressHandler::new())
        .start()
        .await
        .unwrap();

    let task_id = system
        .submit(DispatchRequest::new(TaskType::Optimize, json!({})))
        .await
        .unwrap();
    assert!(wait_for_status(&system, task_id, TaskStatus::Completed).await);

    // Late subscription still sees the terminal outcome, then closes.
    let mut subscription = system.subscribe(task_id);
    let first = subscription.recv().await.unwrap();
    assert_eq!(first.status(), Some(TaskStatus::Completed));
    assert!(subscription.recv().await.is_none());

    system.shutdown().await;
}

#[tokio::test]
async fn test_cancel_before_delivery_skips_handler() {
    let handler = RejectingHandler::new();
    let system = BrokerSystem::builder(fast_config())
        .register_handler(TaskType::Fusion, handler.clone())
        .start()
        .await
        .unwrap();

    // Cancel first so the worker's ledger already knows the id when the
    // task arrives.
    let task_id = Uuid::new_v4();
    assert!(system.cancel(task_id).await.unwrap());
    assert!(
        wait_until(Duration::from_secs(2), || {
            cancellation_ledger_contains(&system, task_id)
        })
        .await
    );

    system
        .submit(DispatchRequest::new(TaskType::Fusion, json!({})).with_task_id(task_id))
        .await
        .unwrap();

    assert!(wait_for_status(&system, task_id, TaskStatus::Cancelled).await);
    assert_eq!(handler.invocation_count(), 0, "handler must never run");

    system.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_result_is_dropped_without_destabilizing() {
    let system = BrokerSystem::builder(fast_config())
        .register_handler(TaskType::Expand, ProgressHandler::new())
        .start()
        .await
        .unwrap();

    // No subscription for this one.
    let first = system
        .submit(DispatchRequest::new(TaskType::Expand, json!({})))
        .await
        .unwrap();
    assert!(wait_for_status(&system, first, TaskStatus::Completed).await);
    assert!(system.correlator().unmatched_results() >= 1);

    // The correlator keeps working for subsequent subscribed tasks.
    let second = system
        .submit(DispatchRequest::new(TaskType::Expand, json!({})))
        .await
        .unwrap();
    let mut subscription = system.subscribe(second);
    let mut saw_terminal = false;
    while let Some(update) = subscription.recv().await {
        saw_terminal |= update.is_terminal();
    }
    assert!(saw_terminal);

    system.shutdown().await;
}

fn cancellation_ledger_contains(system: &BrokerSystem, task_id: Uuid) -> bool {
    system
        .worker()
        .is_some_and(|worker| worker.cancellations().contains(task_id))
}
