#![allow(dead_code)]

//! Shared helpers for the integration suite.
//!
//! Everything runs on the in-memory transport with aggressive timings so the
//! full retry and drain machinery can be exercised in milliseconds.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use easel_broker::config::EaselConfig;
use easel_broker::messaging::TaskMessage;
use easel_broker::orchestration::{BrokerSystem, HandlerContext, HandlerError, TaskHandler};
use easel_broker::state_machine::TaskStatus;

/// Configuration tuned for fast tests: in-memory transport, millisecond
/// retry delays, no jitter, short drain windows.
pub fn fast_config() -> EaselConfig {
    let mut config = EaselConfig::default();
    config.broker.confirm_timeout_ms = 2_000;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.retry.jitter_factor = 0.0;
    config.worker.drain_timeout_ms = 3_000;
    config.worker.handler_timeout_ms = 5_000;
    config.worker.resubscribe_delay_ms = 20;
    config.correlator.sweep_interval_ms = 50;
    config
}

/// Poll `predicate` until it returns true or `deadline` elapses.
pub async fn wait_until<F>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = Instant::now();
    while started.elapsed() < deadline {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    predicate()
}

/// Wait for a task to reach the given status in the system's status store.
pub async fn wait_for_status(system: &BrokerSystem, task_id: Uuid, status: TaskStatus) -> bool {
    wait_until(Duration::from_secs(5), || {
        system
            .task_status(task_id)
            .is_some_and(|record| record.status == status)
    })
    .await
}

/// Handler that fails with a transient error `failures` times, then
/// succeeds. Counts every invocation.
pub struct FlakyHandler {
    failures: u32,
    pub invocations: AtomicU32,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            invocations: AtomicU32::new(0),
        })
    }

    pub fn invocation_count(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(
        &self,
        task: &TaskMessage,
        _ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        let seen = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        if seen <= self.failures {
            return Err(HandlerError::transient(format!(
                "simulated outage on attempt {}",
                task.attempt
            )));
        }
        Ok(json!({ "succeededOnAttempt": task.attempt }))
    }
}

/// Handler that always fails with a non-retryable validation error.
pub struct RejectingHandler {
    pub invocations: AtomicU32,
}

impl RejectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicU32::new(0),
        })
    }

    pub fn invocation_count(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for RejectingHandler {
    async fn handle(
        &self,
        _task: &TaskMessage,
        _ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::validation("payload is missing a prompt"))
    }
}

/// Handler that always fails with an unclassified error.
pub struct UnclassifiedHandler {
    pub invocations: AtomicU32,
}

impl UnclassifiedHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            invocations: AtomicU32::new(0),
        })
    }

    pub fn invocation_count(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for UnclassifiedHandler {
    async fn handle(
        &self,
        _task: &TaskMessage,
        _ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::unclassified("something unexpected"))
    }
}

/// Handler that holds the task for a fixed duration and records how many
/// executions overlap, for prefetch and drain assertions.
pub struct SleepyHandler {
    hold: Duration,
    current: AtomicUsize,
    max_observed: AtomicUsize,
    pub started: AtomicU32,
    pub finished: AtomicU32,
}

impl SleepyHandler {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            current: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
            started: AtomicU32::new(0),
            finished: AtomicU32::new(0),
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_observed.load(Ordering::SeqCst)
    }

    pub fn started_count(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished_count(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for SleepyHandler {
    async fn handle(
        &self,
        _task: &TaskMessage,
        _ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);

        sleep(self.hold).await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "heldMs": self.hold.as_millis() as u64 }))
    }
}

/// Handler that records the order payload markers arrive in, holding each
/// task briefly so a backlog builds behind it.
pub struct OrderRecordingHandler {
    hold: Duration,
    order: std::sync::Mutex<Vec<u64>>,
}

impl OrderRecordingHandler {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            order: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn observed(&self) -> Vec<u64> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for OrderRecordingHandler {
    async fn handle(
        &self,
        task: &TaskMessage,
        _ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        let marker = task.payload["index"].as_u64().unwrap_or(0);
        self.order.lock().unwrap().push(marker);
        sleep(self.hold).await;
        Ok(json!({ "index": marker }))
    }
}

/// Handler that reports a few progress updates before succeeding.
pub struct ProgressHandler;

impl ProgressHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl TaskHandler for ProgressHandler {
    async fn handle(
        &self,
        _task: &TaskMessage,
        ctx: &HandlerContext,
    ) -> Result<Value, HandlerError> {
        ctx.report_progress(25, Some("sketching")).await;
        ctx.report_progress(75, Some("rendering")).await;
        Ok(json!({ "asset": "mem://render" }))
    }
}
