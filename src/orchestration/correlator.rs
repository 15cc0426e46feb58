//! # Result Correlator
//!
//! Consumes the results queue and fans result/progress messages out to
//! whoever registered interest in the task id. Subscriptions are explicit
//! handles with `close()` instead of callback registries; dropping the
//! handle unregisters it. A result nobody is waiting for is counted and
//! dropped — the originator may have restarted — and never destabilizes
//! the consumption loop.

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CorrelatorConfig;
use crate::constants::routing;
use crate::messaging::broker::{BrokerError, BrokerFacade};
use crate::messaging::message::{TaskProgressMessage, TaskResultMessage, TaskType};
use crate::messaging::transport::{ConsumeSpec, TransportDelivery};

use super::status_store::StatusStore;
use super::types::TaskUpdate;

struct SubscriptionEntry {
    id: u64,
    tx: mpsc::Sender<TaskUpdate>,
}

/// Task id -> interested subscriptions. Owned exclusively by the
/// correlator; subscription handles reach back through a `Weak`.
#[derive(Default)]
struct SubscriptionRegistry {
    entries: DashMap<Uuid, Vec<SubscriptionEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    fn register(&self, task_id: Uuid, tx: mpsc::Sender<TaskUpdate>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .entry(task_id)
            .or_default()
            .push(SubscriptionEntry { id, tx });
        id
    }

    /// Remove one subscription; idempotent
    fn unregister(&self, task_id: Uuid, id: u64) {
        if let Some(mut entry) = self.entries.get_mut(&task_id) {
            entry.retain(|s| s.id != id);
        }
        self.entries.remove_if(&task_id, |_, subs| subs.is_empty());
    }

    /// Take every subscription for a task, removing them first so a
    /// terminal update is forwarded at most once per subscription
    fn take_all(&self, task_id: Uuid) -> Vec<SubscriptionEntry> {
        self.entries
            .remove(&task_id)
            .map(|(_, subs)| subs)
            .unwrap_or_default()
    }

    fn senders(&self, task_id: Uuid) -> Vec<mpsc::Sender<TaskUpdate>> {
        self.entries
            .get(&task_id)
            .map(|subs| subs.iter().map(|s| s.tx.clone()).collect())
            .unwrap_or_default()
    }

    fn count(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }
}

/// Receiving end of one registered interest in a task's updates.
///
/// Progress updates may arrive more than once; the terminal update arrives
/// at most once, after which `recv` returns `None`. Dropping the handle
/// unregisters it.
pub struct TaskSubscription {
    task_id: Uuid,
    id: u64,
    rx: mpsc::Receiver<TaskUpdate>,
    registry: Weak<SubscriptionRegistry>,
    terminal_seen: bool,
}

impl TaskSubscription {
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Next update for the task. Returns `None` once the terminal update
    /// has been delivered or the subscription was closed.
    pub async fn recv(&mut self) -> Option<TaskUpdate> {
        if self.terminal_seen {
            return None;
        }
        let update = self.rx.recv().await?;
        if update.is_terminal() {
            self.terminal_seen = true;
        }
        Some(update)
    }

    /// Stop receiving updates and unregister. Idempotent.
    pub fn close(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.task_id, self.id);
        }
        self.rx.close();
    }
}

impl Drop for TaskSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Matches asynchronous results back to their originators
pub struct ResultCorrelator {
    facade: Arc<BrokerFacade>,
    config: CorrelatorConfig,
    status: Arc<StatusStore>,
    registry: Arc<SubscriptionRegistry>,
    consumer_tag: String,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    unmatched: Arc<AtomicU64>,
}

impl ResultCorrelator {
    pub fn new(facade: Arc<BrokerFacade>, config: CorrelatorConfig, status: Arc<StatusStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            facade,
            config,
            status,
            registry: Arc::new(SubscriptionRegistry::default()),
            consumer_tag: format!("correlator-{}", Uuid::new_v4().simple()),
            shutdown_tx,
            loop_handle: Mutex::new(None),
            stopped: AtomicBool::new(false),
            unmatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register interest in one task's updates.
    ///
    /// If the task is already terminal in the status store, the terminal
    /// update is delivered immediately instead of registering — a caller
    /// subscribing after the fact still observes the outcome exactly once.
    pub fn subscribe(&self, task_id: Uuid) -> TaskSubscription {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

        if let Some(record) = self.status.get(task_id) {
            if record.status.is_terminal() {
                let _ = tx.try_send(TaskUpdate::Terminal {
                    task_id,
                    status: record.status,
                    result: record.result,
                    error: record.last_error,
                    processing_time_ms: 0,
                });
                return TaskSubscription {
                    task_id,
                    id: u64::MAX,
                    rx,
                    registry: Weak::new(),
                    terminal_seen: false,
                };
            }
        }

        let id = self.registry.register(task_id, tx);
        TaskSubscription {
            task_id,
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
            terminal_seen: false,
        }
    }

    /// Results nobody was subscribed to, dropped after updating the store
    pub fn unmatched_results(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.count()
    }

    /// Attach to the results queue and start correlating. Requires a ready
    /// facade.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let queue = self.facade.topology().config().results_queue();
        let spec = ConsumeSpec::new(queue.clone(), self.consumer_tag.clone(), self.config.prefetch);
        let stream = self.facade.consume(spec).await?;

        let registry = Arc::clone(&self.registry);
        let status = Arc::clone(&self.status);
        let unmatched = Arc::clone(&self.unmatched);
        let facade = Arc::clone(&self.facade);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *self.loop_handle.lock() = Some(tokio::spawn(async move {
            let mut stream = stream;
            loop {
                let delivery = tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    next = stream.next() => next,
                };
                match delivery {
                    Some(Ok(delivery)) => {
                        correlate(&facade, &registry, &status, &unmatched, delivery).await;
                    }
                    Some(Err(e)) => warn!(error = %e, "Results stream error"),
                    None => break,
                }
            }
        }));

        info!(queue = %queue, consumer_tag = %self.consumer_tag, "🔗 Result correlator started");
        Ok(())
    }

    /// Stop consuming results. In-flight forwarding completes; registered
    /// subscriptions stay registered (their tasks may still be running when
    /// the process next starts). Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.facade.cancel_consumer(&self.consumer_tag).await {
            debug!(error = %e, "Correlator consumer cancel failed");
        }
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("✅ Result correlator stopped");
    }
}

/// Process one message from the results queue
async fn correlate(
    facade: &BrokerFacade,
    registry: &SubscriptionRegistry,
    status: &StatusStore,
    unmatched: &AtomicU64,
    delivery: TransportDelivery,
) {
    facade.note_consumed();
    let routing_key = delivery.routing_key.clone();

    if let Some(type_name) = routing::result_task_type(&routing_key) {
        let Ok(task_type) = type_name.parse::<TaskType>() else {
            warn!(routing_key = %routing_key, "Result with unknown task type rejected");
            if delivery.reject().await.is_ok() {
                facade.note_dead_lettered();
            }
            return;
        };
        match TaskResultMessage::from_bytes(&delivery.payload) {
            Ok(message) => {
                status.record_terminal(task_type, &message);
                let subscribers = registry.take_all(message.task_id);
                if subscribers.is_empty() {
                    unmatched.fetch_add(1, Ordering::Relaxed);
                    facade.note_dropped();
                    debug!(task_id = %message.task_id, "Result had no subscribers, dropped");
                } else {
                    let update = TaskUpdate::Terminal {
                        task_id: message.task_id,
                        status: message.status(),
                        result: message.result.clone(),
                        error: message.error.clone(),
                        processing_time_ms: message.processing_time_ms,
                    };
                    for entry in subscribers {
                        if entry.tx.try_send(update.clone()).is_err() {
                            debug!(task_id = %message.task_id, "Subscriber gone or full, terminal dropped for it");
                        }
                    }
                }
                match delivery.ack().await {
                    Ok(()) => facade.note_acked(),
                    Err(e) => warn!(error = %e, "Result ack failed"),
                }
            }
            Err(e) => {
                warn!(routing_key = %routing_key, error = %e, "Malformed result rejected");
                if delivery.reject().await.is_ok() {
                    facade.note_dead_lettered();
                }
            }
        }
        return;
    }

    if let Some(type_name) = routing::progress_task_type(&routing_key) {
        let Ok(task_type) = type_name.parse::<TaskType>() else {
            warn!(routing_key = %routing_key, "Progress with unknown task type rejected");
            if delivery.reject().await.is_ok() {
                facade.note_dead_lettered();
            }
            return;
        };
        match TaskProgressMessage::from_bytes(&delivery.payload) {
            Ok(message) => {
                status.record_progress(task_type, &message);
                let update = TaskUpdate::Progress {
                    task_id: message.task_id,
                    attempt: message.attempt,
                    progress: message.progress,
                    sequence: message.sequence,
                    detail: message.detail.clone(),
                };
                for tx in registry.senders(message.task_id) {
                    // progress is lossy by design; a full channel drops it
                    let _ = tx.try_send(update.clone());
                }
                match delivery.ack().await {
                    Ok(()) => facade.note_acked(),
                    Err(e) => warn!(error = %e, "Progress ack failed"),
                }
            }
            Err(e) => {
                warn!(routing_key = %routing_key, error = %e, "Malformed progress rejected");
                if delivery.reject().await.is_ok() {
                    facade.note_dead_lettered();
                }
            }
        }
        return;
    }

    warn!(routing_key = %routing_key, "Unroutable message on results queue rejected");
    if delivery.reject().await.is_ok() {
        facade.note_dead_lettered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, TopologyConfig};
    use crate::events::EventPublisher;
    use crate::messaging::in_memory::InMemoryTransport;
    use crate::messaging::topology::Topology;
    use crate::messaging::transport::{MessageProperties, Publication};
    use crate::state_machine::TaskStatus;

    async fn correlator() -> (Arc<BrokerFacade>, ResultCorrelator, Arc<StatusStore>) {
        let facade = Arc::new(BrokerFacade::new(
            Arc::new(InMemoryTransport::new()),
            Topology::new(TopologyConfig::default()),
            BrokerConfig::default(),
            EventPublisher::default(),
        ));
        facade.start().await.unwrap();
        let status = Arc::new(StatusStore::new(std::time::Duration::from_secs(60)));
        let correlator = ResultCorrelator::new(
            Arc::clone(&facade),
            CorrelatorConfig::default(),
            Arc::clone(&status),
        );
        (facade, correlator, status)
    }

    async fn publish_result_message(facade: &BrokerFacade, task_type: &str, message: &TaskResultMessage) {
        facade
            .publish(Publication::new(
                "easel.results",
                routing::result_key(task_type),
                message.to_bytes().unwrap(),
                MessageProperties::persistent_json(),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminal_forwarded_once_then_recv_ends() {
        let (facade, correlator, _status) = correlator().await;
        correlator.start().await.unwrap();

        let task_id = Uuid::new_v4();
        let mut subscription = correlator.subscribe(task_id);
        assert_eq!(correlator.subscription_count(), 1);

        let result = TaskResultMessage::success(task_id, Some(serde_json::json!({"u": 1})), 40);
        publish_result_message(&facade, "generate", &result).await;

        let update = subscription.recv().await.unwrap();
        assert_eq!(update.status(), Some(TaskStatus::Completed));
        assert!(subscription.recv().await.is_none());
        assert_eq!(correlator.subscription_count(), 0);

        correlator.stop().await;
        facade.stop().await;
    }

    #[tokio::test]
    async fn test_unmatched_result_is_counted_and_loop_survives() {
        let (facade, correlator, status) = correlator().await;
        correlator.start().await.unwrap();

        let orphan = Uuid::new_v4();
        publish_result_message(&facade, "optimize", &TaskResultMessage::success(orphan, None, 5)).await;

        // the loop keeps serving later, matched results
        let task_id = Uuid::new_v4();
        let mut subscription = correlator.subscribe(task_id);
        publish_result_message(&facade, "optimize", &TaskResultMessage::success(task_id, None, 5)).await;

        let update = subscription.recv().await.unwrap();
        assert_eq!(update.task_id(), task_id);
        assert_eq!(correlator.unmatched_results(), 1);
        // the orphan still updated the status store
        assert_eq!(status.get(orphan).unwrap().status, TaskStatus::Completed);

        correlator.stop().await;
        facade.stop().await;
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_replays_outcome() {
        let (facade, correlator, _status) = correlator().await;
        correlator.start().await.unwrap();

        let task_id = Uuid::new_v4();
        publish_result_message(
            &facade,
            "fusion",
            &TaskResultMessage::failure(task_id, "validation_failed", "bad", false, 9),
        )
        .await;

        // wait for the store to observe the terminal status
        for _ in 0..100 {
            if correlator.status.get(task_id).is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let mut late = correlator.subscribe(task_id);
        let update = late.recv().await.unwrap();
        assert_eq!(update.status(), Some(TaskStatus::Failed));
        assert_eq!(correlator.subscription_count(), 0);

        correlator.stop().await;
        facade.stop().await;
    }

    #[tokio::test]
    async fn test_closed_subscription_stops_updates() {
        let (facade, correlator, _status) = correlator().await;
        correlator.start().await.unwrap();

        let task_id = Uuid::new_v4();
        let mut subscription = correlator.subscribe(task_id);
        subscription.close();
        assert_eq!(correlator.subscription_count(), 0);

        publish_result_message(&facade, "expand", &TaskResultMessage::success(task_id, None, 2)).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(correlator.unmatched_results(), 1);

        correlator.stop().await;
        facade.stop().await;
    }

    #[tokio::test]
    async fn test_progress_fans_out_without_unregistering() {
        let (facade, correlator, status) = correlator().await;
        correlator.start().await.unwrap();

        let task_id = Uuid::new_v4();
        let mut first = correlator.subscribe(task_id);
        let mut second = correlator.subscribe(task_id);

        let progress = TaskProgressMessage::new(
            task_id,
            2,
            60,
            (2u64 << 32) + 3,
            crate::messaging::ProgressStage::Running,
        );
        facade
            .publish(Publication::new(
                "easel.results",
                routing::progress_key("generate"),
                progress.to_bytes().unwrap(),
                MessageProperties::persistent_json(),
            ))
            .await
            .unwrap();

        for subscription in [&mut first, &mut second] {
            match subscription.recv().await.unwrap() {
                TaskUpdate::Progress { attempt, progress, .. } => {
                    assert_eq!(attempt, 2);
                    assert_eq!(progress, 60);
                }
                other => panic!("expected progress, got {other:?}"),
            }
        }
        assert_eq!(correlator.subscription_count(), 2);
        let record = status.get(task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(record.attempts, 2);

        correlator.stop().await;
        facade.stop().await;
    }
}
