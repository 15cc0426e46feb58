//! # Worker Consumer
//!
//! Per-process consumption loop for task queues. Every delivery ends in
//! exactly one of: ack (handler success, or cancelled task), a confirmed
//! delayed retry copy plus ack, or reject into the dead letter wiring.
//! Handlers run as spawned futures bounded by a semaphore sized to the
//! prefetch window, so one suspended handler never blocks the others.
//!
//! Shutdown drains: consumers are cancelled first, in-flight handlers get
//! the drain timeout to finish and settle, then the worker reports done.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{RetryConfig, WorkerConfig};
use crate::constants::{error_codes, events, routing};
use crate::messaging::broker::BrokerFacade;
use crate::messaging::message::{
    ControlMessage, ProgressStage, TaskMessage, TaskProgressMessage, TaskResultMessage, TaskType,
};
use crate::messaging::transport::{ConsumeSpec, MessageProperties, Publication, TransportDelivery};

use super::retry::{ErrorClass, RetryDecision, RetryPolicy};

/// Classified failure returned by a task handler
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Likely to succeed later; retried up to the configured budget
    #[error("Transient handler failure: {message}")]
    Transient { message: String },

    /// Will never succeed with this payload; dead lettered immediately
    #[error("Validation failure: {message}")]
    Validation { message: String },

    /// Handler exceeded the configured execution timeout
    #[error("Handler timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Unclassified failure; granted the configured free retries
    #[error("Unclassified handler failure: {message}")]
    Unclassified { message: String },

    /// No handler registered for the task type; dead lettered immediately
    #[error("No handler registered for task type {task_type}")]
    NoHandler { task_type: TaskType },
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::Unclassified {
            message: message.into(),
        }
    }

    /// Retry classification for [`RetryPolicy::decide`]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => ErrorClass::Transient,
            Self::Validation { .. } | Self::NoHandler { .. } => ErrorClass::Validation,
            Self::Unclassified { .. } => ErrorClass::Unknown,
        }
    }

    /// Stable machine-readable code carried in result messages
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient { .. } => error_codes::TRANSIENT_FAILURE,
            Self::Validation { .. } => error_codes::VALIDATION_FAILED,
            Self::Timeout { .. } => error_codes::HANDLER_TIMEOUT,
            Self::Unclassified { .. } => error_codes::UNCLASSIFIED_FAILURE,
            Self::NoHandler { .. } => error_codes::NO_HANDLER,
        }
    }
}

/// Per-invocation context handed to handlers alongside the task message.
///
/// Lets a handler report progress and check for cooperative cancellation
/// without holding any broker channel itself.
pub struct HandlerContext {
    pub task_id: Uuid,
    pub task_type: TaskType,
    /// 1-based attempt this invocation represents
    pub attempt: u32,
    /// Whether the transport flagged the delivery as redelivered
    pub redelivered: bool,
    facade: Arc<BrokerFacade>,
    cancellations: Arc<CancellationLedger>,
    sequence: AtomicU64,
}

impl HandlerContext {
    fn new(
        message: &TaskMessage,
        redelivered: bool,
        facade: Arc<BrokerFacade>,
        cancellations: Arc<CancellationLedger>,
    ) -> Self {
        // attempts partition the sequence space so retries stay monotonic
        let base = u64::from(message.attempt) << 32;
        Self {
            task_id: message.task_id,
            task_type: message.task_type,
            attempt: message.attempt,
            redelivered,
            facade,
            cancellations,
            sequence: AtomicU64::new(base),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether a cancellation broadcast for this task has been heard.
    /// Handlers doing long work should check this between phases.
    pub fn is_cancelled(&self) -> bool {
        self.cancellations.contains(self.task_id)
    }

    /// Publish a progress update for this attempt. Failures are logged and
    /// swallowed; progress is advisory and never fails the handler.
    pub async fn report_progress(&self, progress: u8, detail: Option<&str>) {
        let mut message = TaskProgressMessage::new(
            self.task_id,
            self.attempt,
            progress.min(100),
            self.next_sequence(),
            ProgressStage::Running,
        );
        if let Some(detail) = detail {
            message = message.with_detail(detail);
        }
        publish_progress(&self.facade, self.task_type, message).await;
    }
}

/// A task handler invoked once per delivery.
///
/// Return `Ok(result)` to complete the task, or a classified
/// [`HandlerError`] to let the retry policy decide what happens next.
/// Panics are caught and treated as unclassified failures.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        task: &TaskMessage,
        ctx: &HandlerContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Task type -> handler lookup shared by every consumer loop in a process
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the type
    pub fn register(&self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).map(|h| Arc::clone(&h))
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.handlers.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Recently cancelled task ids, remembered for a bounded window so a
/// cancellation can beat its task through the queues.
pub struct CancellationLedger {
    entries: DashMap<Uuid, Instant>,
    retention: std::time::Duration,
}

impl CancellationLedger {
    pub fn new(retention: std::time::Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    pub fn insert(&self, task_id: Uuid) {
        self.entries.insert(task_id, Instant::now());
        self.sweep();
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.entries.contains_key(&task_id)
    }

    fn sweep(&self) {
        let retention = self.retention;
        self.entries
            .retain(|_, inserted| inserted.elapsed() < retention);
    }
}

/// Counts spawned handler invocations so shutdown can drain them
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    fn begin(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no handler is in flight, bounded by the deadline.
    /// Returns whether the drain completed in time.
    async fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            if self.current() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.current() == 0;
            }
        }
    }
}

struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Everything a delivery needs, shared across consumption loops
struct WorkerCore {
    facade: Arc<BrokerFacade>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    config: WorkerConfig,
    cancellations: Arc<CancellationLedger>,
    in_flight: Arc<InFlight>,
}

/// One worker process's consumption side: a loop per configured task type
/// plus a control-queue listener for cancellation broadcasts.
pub struct WorkerConsumer {
    core: Arc<WorkerCore>,
    worker_id: String,
    prefetch: u16,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    consumer_tags: Mutex<Vec<String>>,
    stopped: AtomicBool,
}

impl WorkerConsumer {
    pub fn new(
        facade: Arc<BrokerFacade>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
        retry: RetryConfig,
        prefetch: u16,
    ) -> Self {
        let worker_id = format!("worker-{}", Uuid::new_v4().simple());
        let core = Arc::new(WorkerCore {
            facade,
            registry,
            policy: RetryPolicy::new(retry),
            cancellations: Arc::new(CancellationLedger::new(config.cancellation_retention())),
            config,
            in_flight: InFlight::new(),
        });
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            core,
            worker_id,
            prefetch: prefetch.max(1),
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
            consumer_tags: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Number of handler invocations currently in flight
    pub fn in_flight(&self) -> usize {
        self.core.in_flight.current()
    }

    /// Cancellation broadcasts this worker has heard
    pub fn cancellations(&self) -> &CancellationLedger {
        &self.core.cancellations
    }

    /// Start one consumption loop per configured task type plus the control
    /// listener. Requires a ready facade.
    pub async fn start(&self) -> Result<(), crate::messaging::broker::BrokerError> {
        let topology = self.core.facade.topology().config().clone();

        // exclusive control queue hears cancellation broadcasts
        let (control_queue, control_binding) =
            self.core.facade.topology().control_consumer(&self.worker_id);
        self.core.facade.declare_queue(&control_queue).await?;
        self.core.facade.bind_queue(&control_binding).await?;

        let control_tag = format!("{}-control", self.worker_id);
        self.consumer_tags.lock().push(control_tag.clone());
        self.loops.lock().push(tokio::spawn(control_loop(
            Arc::clone(&self.core),
            ConsumeSpec::new(control_queue.name, control_tag, 16),
            self.shutdown_tx.subscribe(),
        )));

        for task_type_name in &self.core.config.task_types {
            let task_type: TaskType = task_type_name
                .parse()
                .map_err(|e: String| crate::messaging::broker::BrokerError::Transport(
                    crate::messaging::errors::TransportError::internal(e),
                ))?;
            let queue = topology.task_queue(task_type.as_str());
            let tag = format!("{}-{}", self.worker_id, task_type.as_str());
            self.consumer_tags.lock().push(tag.clone());

            self.loops.lock().push(tokio::spawn(consume_loop(
                Arc::clone(&self.core),
                ConsumeSpec::new(queue, tag, self.prefetch),
                self.shutdown_tx.subscribe(),
            )));
        }

        info!(
            worker_id = %self.worker_id,
            task_types = ?self.core.config.task_types,
            prefetch = self.prefetch,
            "👷 Worker consumer started"
        );
        Ok(())
    }

    /// Stop accepting deliveries, then drain in-flight handlers bounded by
    /// the drain timeout. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = self.core.in_flight.current();
        self.core.facade.events().publish(
            events::DRAIN_STARTED,
            serde_json::json!({ "worker_id": self.worker_id, "in_flight": pending }),
        );
        info!(worker_id = %self.worker_id, in_flight = pending, "Draining worker consumer");

        let _ = self.shutdown_tx.send(true);
        let tags: Vec<String> = self.consumer_tags.lock().drain(..).collect();
        for tag in tags {
            if let Err(e) = self.core.facade.cancel_consumer(&tag).await {
                debug!(consumer_tag = %tag, error = %e, "Consumer cancel failed during drain");
            }
        }

        let handles: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let drained = self
            .core
            .in_flight
            .wait_idle(self.core.config.drain_timeout())
            .await;
        if !drained {
            warn!(
                worker_id = %self.worker_id,
                still_in_flight = self.core.in_flight.current(),
                "Drain timeout elapsed with handlers still in flight"
            );
        }
        self.core.facade.events().publish(
            events::DRAIN_COMPLETED,
            serde_json::json!({ "worker_id": self.worker_id, "drained": drained }),
        );
        info!(worker_id = %self.worker_id, drained = drained, "✅ Worker consumer stopped");
    }
}

/// Consume one task queue until shutdown, re-subscribing when the stream
/// ends unexpectedly.
async fn consume_loop(
    core: Arc<WorkerCore>,
    spec: ConsumeSpec,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(spec.prefetch as usize));
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let mut stream = match core.facade.consume(spec.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(queue = %spec.queue, error = %e, "Consume attach failed, will retry");
                if sleep_or_shutdown(&mut shutdown_rx, core.config.resubscribe_delay()).await {
                    break;
                }
                continue;
            }
        };

        loop {
            let delivery = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                    continue;
                }
                next = stream.next() => next,
            };
            match delivery {
                Some(Ok(delivery)) => {
                    // the permit makes the prefetch bound explicit in-process
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        return;
                    };
                    let guard = core.in_flight.begin();
                    let core = Arc::clone(&core);
                    tokio::spawn(async move {
                        process_delivery(core, delivery).await;
                        drop(permit);
                        drop(guard);
                    });
                }
                Some(Err(e)) => {
                    warn!(queue = %spec.queue, error = %e, "Delivery stream error");
                }
                None => break,
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }
        debug!(queue = %spec.queue, "Delivery stream ended, re-subscribing");
        if sleep_or_shutdown(&mut shutdown_rx, core.config.resubscribe_delay()).await {
            break;
        }
    }
}

/// Sleep, returning early (true) if shutdown fires first
async fn sleep_or_shutdown(
    shutdown_rx: &mut watch::Receiver<bool>,
    delay: std::time::Duration,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
    }
}

/// Listen for cancellation broadcasts on this worker's control queue
async fn control_loop(
    core: Arc<WorkerCore>,
    spec: ConsumeSpec,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut stream = match core.facade.consume(spec.clone()).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(queue = %spec.queue, error = %e, "Control queue consume failed");
            return;
        }
    };

    loop {
        let delivery = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
            next = stream.next() => next,
        };
        match delivery {
            Some(Ok(delivery)) => match ControlMessage::from_bytes(&delivery.payload) {
                Ok(ControlMessage::Cancel { task_id, .. }) => {
                    debug!(task_id = %task_id, "Cancellation heard");
                    core.cancellations.insert(task_id);
                    if let Err(e) = delivery.ack().await {
                        warn!(error = %e, "Control ack failed");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Malformed control message dropped");
                    let _ = delivery.reject().await;
                }
            },
            Some(Err(e)) => warn!(error = %e, "Control stream error"),
            None => return,
        }
    }
}

/// Drive one delivery through the processing state machine
async fn process_delivery(core: Arc<WorkerCore>, delivery: TransportDelivery) {
    core.facade.note_consumed();
    let message = match TaskMessage::from_bytes(&delivery.payload) {
        Ok(message) => message,
        Err(e) => {
            // malformed messages are dead lettered immediately, never retried
            warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Malformed task message rejected to dead letter"
            );
            match delivery.reject().await {
                Ok(()) => core.facade.note_dead_lettered(),
                Err(e) => error!(error = %e, "Reject of malformed message failed"),
            }
            return;
        }
    };

    let started = Instant::now();
    let task_id = message.task_id;

    if core.cancellations.contains(task_id) {
        let result = TaskResultMessage::cancelled(task_id, 0);
        publish_result(&core.facade, message.task_type, result).await;
        core.facade.events().publish_task(
            events::TASK_CANCELLED,
            task_id,
            serde_json::json!({ "stage": "worker", "attempt": message.attempt }),
        );
        match delivery.ack().await {
            Ok(()) => core.facade.note_acked(),
            Err(e) => error!(task_id = %task_id, error = %e, "Ack of cancelled task failed"),
        }
        return;
    }

    let ctx = HandlerContext::new(
        &message,
        delivery.redelivered,
        Arc::clone(&core.facade),
        Arc::clone(&core.cancellations),
    );
    publish_progress(
        &core.facade,
        message.task_type,
        TaskProgressMessage::new(task_id, message.attempt, 0, ctx.next_sequence(), ProgressStage::Started),
    )
    .await;

    let outcome = invoke_handler(&core, &message, &ctx).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(result) => {
            info!(
                task_id = %task_id,
                task_type = %message.task_type,
                attempt = message.attempt,
                elapsed_ms = elapsed_ms,
                "✅ Task completed"
            );
            let terminal = TaskResultMessage::success(task_id, Some(result), elapsed_ms);
            if publish_result(&core.facade, message.task_type, terminal).await {
                core.facade.events().publish_task(
                    events::TASK_COMPLETED,
                    task_id,
                    serde_json::json!({ "attempt": message.attempt, "elapsed_ms": elapsed_ms }),
                );
                match delivery.ack().await {
                    Ok(()) => core.facade.note_acked(),
                    Err(e) => error!(task_id = %task_id, error = %e, "Ack after success failed"),
                }
            } else {
                // without a delivered result the task must run again
                warn!(task_id = %task_id, "Success result unconfirmed, requeueing task");
                let _ = delivery.nack_requeue().await;
            }
        }
        Err(handler_error) => {
            handle_failure(&core, message, delivery, handler_error, elapsed_ms).await;
        }
    }
}

/// Run the handler under the timeout, catching panics as unclassified
async fn invoke_handler(
    core: &WorkerCore,
    message: &TaskMessage,
    ctx: &HandlerContext,
) -> Result<serde_json::Value, HandlerError> {
    let Some(handler) = core.registry.get(message.task_type) else {
        return Err(HandlerError::NoHandler {
            task_type: message.task_type,
        });
    };

    let timeout = core.config.handler_timeout();
    let invocation = std::panic::AssertUnwindSafe(handler.handle(message, ctx)).catch_unwind();
    match tokio::time::timeout(timeout, invocation).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            error!(task_id = %message.task_id, detail = %detail, "Handler panicked");
            Err(HandlerError::unclassified(detail))
        }
        Err(_) => Err(HandlerError::Timeout {
            elapsed_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Retry-or-dead-letter after a classified failure
async fn handle_failure(
    core: &WorkerCore,
    message: TaskMessage,
    delivery: TransportDelivery,
    handler_error: HandlerError,
    elapsed_ms: u64,
) {
    let task_id = message.task_id;
    let class = handler_error.class();

    match core.policy.decide(message.attempt, class) {
        RetryDecision::Retry { delay } => {
            warn!(
                task_id = %task_id,
                attempt = message.attempt,
                class = %class,
                delay_ms = delay.as_millis() as u64,
                error = %handler_error,
                "🔁 Scheduling retry"
            );
            let retry_copy = message.next_attempt();
            let topology = core.facade.topology().config();
            let publication = Publication::new(
                topology.wait_exchange(),
                routing::wait_key(message.task_type.as_str()),
                match retry_copy.to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "Retry copy serialization failed");
                        let _ = delivery.nack_requeue().await;
                        return;
                    }
                },
                MessageProperties::persistent_json()
                    .with_message_id(task_id.to_string())
                    .with_priority(message.priority)
                    .with_expiration_ms(delay.as_millis() as u64)
                    .with_header("x-attempt", retry_copy.attempt.to_string())
                    .with_header("x-original-task-id", task_id.to_string()),
            );

            // the retry copy must be durably accepted before the original
            // is released, otherwise the task could vanish
            match core.facade.publish(publication).await {
                Ok(()) => {
                    core.facade.note_retried();
                    publish_progress(
                        &core.facade,
                        message.task_type,
                        TaskProgressMessage::new(
                            task_id,
                            message.attempt,
                            0,
                            (u64::from(message.attempt) << 32) | 0xffff_ffff,
                            ProgressStage::RetryScheduled,
                        ),
                    )
                    .await;
                    core.facade.events().publish_task(
                        events::TASK_RETRY_SCHEDULED,
                        task_id,
                        serde_json::json!({
                            "attempt": message.attempt,
                            "next_attempt": retry_copy.attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "class": class.to_string(),
                        }),
                    );
                    match delivery.ack().await {
                        Ok(()) => core.facade.note_acked(),
                        Err(e) => {
                            error!(task_id = %task_id, error = %e, "Ack after retry publish failed")
                        }
                    }
                }
                Err(e) => {
                    // fall back to a blind requeue rather than losing the task
                    warn!(task_id = %task_id, error = %e, "Retry publish unconfirmed, requeueing");
                    let _ = delivery.nack_requeue().await;
                }
            }
        }
        RetryDecision::DeadLetter { reason } => {
            error!(
                task_id = %task_id,
                attempt = message.attempt,
                class = %class,
                reason = %reason,
                error = %handler_error,
                "💀 Task dead lettered"
            );
            let terminal = TaskResultMessage::failure(
                task_id,
                handler_error.code(),
                handler_error.to_string(),
                class == ErrorClass::Transient,
                elapsed_ms,
            );
            publish_result(&core.facade, message.task_type, terminal).await;
            core.facade.events().publish_task(
                events::TASK_DEAD_LETTERED,
                task_id,
                serde_json::json!({
                    "attempt": message.attempt,
                    "reason": reason.to_string(),
                    "code": handler_error.code(),
                }),
            );
            match delivery.reject().await {
                Ok(()) => core.facade.note_dead_lettered(),
                Err(e) => error!(task_id = %task_id, error = %e, "Reject to dead letter failed"),
            }
        }
    }
}

/// Publish a terminal result; returns whether the transport confirmed it
async fn publish_result(
    facade: &Arc<BrokerFacade>,
    task_type: TaskType,
    message: TaskResultMessage,
) -> bool {
    let task_id = message.task_id;
    let bytes = match message.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(task_id = %task_id, error = %e, "Result serialization failed");
            return false;
        }
    };
    let topology = facade.topology().config();
    let publication = Publication::new(
        topology.results_exchange(),
        routing::result_key(task_type.as_str()),
        bytes,
        MessageProperties::persistent_json().with_correlation_id(task_id.to_string()),
    );
    match facade.publish(publication).await {
        Ok(()) => true,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Result publish failed");
            false
        }
    }
}

/// Publish a progress update; advisory, failures only logged
async fn publish_progress(
    facade: &Arc<BrokerFacade>,
    task_type: TaskType,
    message: TaskProgressMessage,
) {
    let task_id = message.task_id;
    let bytes = match message.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Progress serialization failed");
            return;
        }
    };
    let topology = facade.topology().config();
    let publication = Publication::new(
        topology.results_exchange(),
        routing::progress_key(task_type.as_str()),
        bytes,
        MessageProperties::persistent_json().with_correlation_id(task_id.to_string()),
    )
    .without_confirm();
    if let Err(e) = facade.publish(publication).await {
        debug!(task_id = %task_id, error = %e, "Progress publish failed");
    }
}
