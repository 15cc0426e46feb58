//! # Broker Facade
//!
//! Front door to the messaging layer. Owns the transport lifecycle
//! (bounded connection attempts, supervised reconnects, clean shutdown),
//! applies the topology, and funnels every publish through one ordered
//! send path, waiting for confirms outside that path.
//!
//! Components hold an `Arc<BrokerFacade>` and use `publish`/`consume`
//! rather than touching the transport directly.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::constants::events;
use crate::events::EventPublisher;

use super::errors::TransportError;
use super::topology::{Topology, TopologyError, TopologyReport};
use super::transport::{
    BindingSpec, ConsumeSpec, ConsumerStream, Publication, QueueInfo, QueueSpec, Transport,
};

/// Errors surfaced by facade operations
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker is not ready (state: {state})")]
    NotReady { state: String },

    #[error("Connection attempts exhausted after {attempts} tries: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Facade lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BrokerState::Created => "created",
            BrokerState::Starting => "starting",
            BrokerState::Ready => "ready",
            BrokerState::Stopping => "stopping",
            BrokerState::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Point-in-time snapshot of facade counters; taking one never fails
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BrokerStats {
    pub state: String,
    pub transport: String,
    pub connected: bool,
    /// Exchanges declared by the topology
    pub exchanges: Vec<String>,
    /// Durable queues declared by the topology
    pub queues: Vec<String>,
    pub prefetch: u16,
    pub messages_published: u64,
    pub messages_confirmed: u64,
    pub publish_failures: u64,
    pub messages_consumed: u64,
    pub messages_acked: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    /// Deliveries discarded without effect, such as results nobody awaits
    pub messages_dropped: u64,
    pub consumers_started: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct BrokerCounters {
    published: AtomicU64,
    confirmed: AtomicU64,
    publish_failures: AtomicU64,
    consumed: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    consumers_started: AtomicU64,
    reconnects: AtomicU64,
}

/// Lifecycle owner for one transport connection and its topology
pub struct BrokerFacade {
    transport: Arc<dyn Transport>,
    topology: Topology,
    config: BrokerConfig,
    events: EventPublisher,
    state: RwLock<BrokerState>,
    counters: Arc<BrokerCounters>,
    /// Serializes the send phase of publishes; confirm waits happen
    /// outside this lock so a slow confirm never stalls other publishers
    publish_lock: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl BrokerFacade {
    pub fn new(
        transport: Arc<dyn Transport>,
        topology: Topology,
        config: BrokerConfig,
        events: EventPublisher,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            topology,
            config,
            events,
            state: RwLock::new(BrokerState::Created),
            counters: Arc::new(BrokerCounters::default()),
            publish_lock: tokio::sync::Mutex::new(()),
            supervisor: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn state(&self) -> BrokerState {
        *self.state.read()
    }

    /// Ready to publish and consume: started, not stopping, and connected
    pub fn is_ready(&self) -> bool {
        self.state() == BrokerState::Ready && self.transport.is_connected()
    }

    fn ensure_ready(&self) -> Result<(), BrokerError> {
        let state = self.state();
        if state != BrokerState::Ready {
            return Err(BrokerError::NotReady {
                state: state.to_string(),
            });
        }
        if !self.transport.is_connected() {
            return Err(BrokerError::NotReady {
                state: "disconnected".to_string(),
            });
        }
        Ok(())
    }

    /// Connect with bounded attempts, apply the topology, and start the
    /// supervision loop. Idempotent: calling on a ready facade just
    /// re-applies the topology.
    pub async fn start(self: &Arc<Self>) -> Result<TopologyReport, BrokerError> {
        if self.state() == BrokerState::Ready {
            return Ok(self.topology.apply(self.transport.as_ref()).await?);
        }
        *self.state.write() = BrokerState::Starting;
        info!(transport = %self.transport.name(), "🚀 Starting broker facade");

        let mut last_error = String::from("no attempts made");
        let mut connected = false;
        for attempt in 1..=self.config.connection_attempts.max(1) {
            match self.transport.connect().await {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = self.config.connection_attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    last_error = e.to_string();
                    self.events.publish(
                        events::RECONNECT_ATTEMPT,
                        serde_json::json!({ "attempt": attempt, "error": last_error }),
                    );
                    if attempt < self.config.connection_attempts {
                        tokio::time::sleep(self.config.connection_retry_delay()).await;
                    }
                }
            }
        }
        if !connected {
            *self.state.write() = BrokerState::Stopped;
            return Err(BrokerError::ConnectionExhausted {
                attempts: self.config.connection_attempts,
                last_error,
            });
        }

        let report = match self.topology.apply(self.transport.as_ref()).await {
            Ok(report) => report,
            Err(e) => {
                *self.state.write() = BrokerState::Stopped;
                let _ = self.transport.close().await;
                return Err(e.into());
            }
        };

        *self.state.write() = BrokerState::Ready;
        self.events.publish(
            events::CONNECTION_ESTABLISHED,
            serde_json::json!({ "transport": self.transport.name() }),
        );
        self.events.publish(
            events::TOPOLOGY_APPLIED,
            serde_json::json!({
                "exchanges": report.exchanges,
                "queues": report.queues,
                "bindings": report.bindings,
            }),
        );

        self.spawn_supervisor();
        info!(transport = %self.transport.name(), "✅ Broker facade ready");
        Ok(report)
    }

    /// Stop the supervisor, drain the in-flight publish, and close the
    /// transport. Safe to call repeatedly and before `start`.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, BrokerState::Stopping | BrokerState::Stopped) {
                return;
            }
            *state = BrokerState::Stopping;
        }
        info!("Stopping broker facade");

        let _ = self.shutdown_tx.send(true);
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        // wait for an in-flight send to clear the lock, bounded
        match tokio::time::timeout(self.config.confirm_timeout(), self.publish_lock.lock()).await {
            Ok(guard) => drop(guard),
            Err(_) => warn!("A publish was still sending at shutdown"),
        }

        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Transport close failed during shutdown");
        }
        *self.state.write() = BrokerState::Stopped;
        info!("✅ Broker facade stopped");
    }

    /// Publish one message.
    ///
    /// The send phase is serialized so publishes leave in order, but the
    /// confirm wait happens after the lock is released. With
    /// `require_confirm` set (the default) the call returns once the broker
    /// confirms; without it the call returns once the message is buffered
    /// locally and the confirm is settled in the background.
    pub async fn publish(&self, publication: Publication) -> Result<(), BrokerError> {
        self.ensure_ready()?;
        let require_confirm = publication.require_confirm;
        let send_result = {
            let _guard = self.publish_lock.lock().await;
            self.transport.publish(publication).await
        };
        let confirm = match send_result {
            Ok(confirm) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                confirm
            }
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        if require_confirm {
            match confirm.await {
                Ok(()) => {
                    self.counters.confirmed.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => {
                    self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                    Err(e.into())
                }
            }
        } else {
            let counters = Arc::clone(&self.counters);
            tokio::spawn(async move {
                match confirm.await {
                    Ok(()) => {
                        counters.confirmed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(error = %e, "Unconfirmed publish failed after send");
                    }
                }
            });
            Ok(())
        }
    }

    /// Attach a consumer through the facade
    pub async fn consume(&self, spec: ConsumeSpec) -> Result<ConsumerStream, BrokerError> {
        self.ensure_ready()?;
        let queue = spec.queue.clone();
        let consumer_tag = spec.consumer_tag.clone();
        let stream = self.transport.consume(spec).await?;
        self.counters.consumers_started.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            events::CONSUMER_STARTED,
            serde_json::json!({ "queue": queue, "consumer_tag": consumer_tag }),
        );
        Ok(stream)
    }

    /// Cancel a consumer. Permitted while stopping so drains can finish.
    pub async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.transport.cancel_consumer(consumer_tag).await?;
        self.events.publish(
            events::CONSUMER_CANCELLED,
            serde_json::json!({ "consumer_tag": consumer_tag }),
        );
        Ok(())
    }

    /// Declare an extra queue outside the shared topology, such as a
    /// worker's exclusive control queue.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo, BrokerError> {
        self.ensure_ready()?;
        Ok(self.transport.declare_queue(spec).await?)
    }

    pub async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.ensure_ready()?;
        Ok(self.transport.bind_queue(binding).await?)
    }

    pub async fn purge_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        self.ensure_ready()?;
        Ok(self.transport.purge_queue(queue).await?)
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<u32, BrokerError> {
        self.ensure_ready()?;
        Ok(self.transport.delete_queue(queue).await?)
    }

    pub async fn queue_info(&self, queue: &str) -> Result<QueueInfo, BrokerError> {
        self.ensure_ready()?;
        Ok(self.transport.queue_info(queue).await?)
    }

    /// Counter snapshot for observability; never fails and never blocks
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            state: self.state().to_string(),
            transport: self.transport.name().to_string(),
            connected: self.transport.is_connected(),
            exchanges: self.topology.exchanges().into_iter().map(|e| e.name).collect(),
            queues: self.topology.queues().into_iter().map(|q| q.name).collect(),
            prefetch: self.config.prefetch,
            messages_published: self.counters.published.load(Ordering::Relaxed),
            messages_confirmed: self.counters.confirmed.load(Ordering::Relaxed),
            publish_failures: self.counters.publish_failures.load(Ordering::Relaxed),
            messages_consumed: self.counters.consumed.load(Ordering::Relaxed),
            messages_acked: self.counters.acked.load(Ordering::Relaxed),
            messages_retried: self.counters.retried.load(Ordering::Relaxed),
            messages_dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            consumers_started: self.counters.consumers_started.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Delivery-side counter hooks, fed by the worker and correlator which
    /// settle messages on their own channels.
    pub(crate) fn note_consumed(&self) {
        self.counters.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_acked(&self) {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_retried(&self) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_dead_lettered(&self) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_dropped(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Health loop: watches the connection and brings it back with
    /// exponential backoff, re-applying the topology after each reconnect.
    fn spawn_supervisor(self: &Arc<Self>) {
        let mut guard = self.supervisor.lock();
        if guard.is_some() {
            return;
        }
        let _ = self.shutdown_tx.send(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let weak: Weak<BrokerFacade> = Arc::downgrade(self);
        let interval = self.config.supervision_interval();

        *guard = Some(tokio::spawn(async move {
            let mut failed_attempts: u32 = 0;
            let mut connection_was_up = true;
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(facade) = weak.upgrade() else {
                    break;
                };
                if facade.state() != BrokerState::Ready {
                    continue;
                }
                if facade.transport.is_connected() {
                    failed_attempts = 0;
                    connection_was_up = true;
                    continue;
                }

                if connection_was_up {
                    connection_was_up = false;
                    error!("❌ Broker connection lost, supervisor attempting recovery");
                    facade.events.publish(
                        events::CONNECTION_LOST,
                        serde_json::json!({ "transport": facade.transport.name() }),
                    );
                }

                failed_attempts += 1;
                let backoff = facade.config.reconnect_backoff(failed_attempts);
                facade.events.publish(
                    events::RECONNECT_ATTEMPT,
                    serde_json::json!({ "attempt": failed_attempts, "backoff_ms": backoff.as_millis() as u64 }),
                );
                tokio::time::sleep(backoff).await;

                match facade.transport.connect().await {
                    Ok(()) => match facade.topology.apply(facade.transport.as_ref()).await {
                        Ok(_) => {
                            failed_attempts = 0;
                            connection_was_up = true;
                            facade.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                            facade.events.publish(
                                events::CONNECTION_ESTABLISHED,
                                serde_json::json!({
                                    "transport": facade.transport.name(),
                                    "recovered": true,
                                }),
                            );
                            info!("✅ Broker connection recovered");
                        }
                        Err(e) => {
                            error!(error = %e, "Topology re-apply failed after reconnect");
                        }
                    },
                    Err(e) => {
                        debug!(attempt = failed_attempts, error = %e, "Reconnect attempt failed");
                    }
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopologyConfig;
    use crate::messaging::in_memory::InMemoryTransport;
    use crate::messaging::transport::MessageProperties;
    use futures::StreamExt;
    use std::time::Duration;

    fn facade_with_config(config: BrokerConfig) -> Arc<BrokerFacade> {
        Arc::new(BrokerFacade::new(
            Arc::new(InMemoryTransport::new()),
            Topology::new(TopologyConfig::default()),
            config,
            EventPublisher::default(),
        ))
    }

    fn facade() -> Arc<BrokerFacade> {
        facade_with_config(BrokerConfig::default())
    }

    #[tokio::test]
    async fn test_start_makes_ready_and_is_idempotent() {
        let facade = facade();
        assert!(!facade.is_ready());
        assert_eq!(facade.state(), BrokerState::Created);

        let report = facade.start().await.unwrap();
        assert!(facade.is_ready());
        assert_eq!(report.exchanges, 5);

        // second start is a topology re-apply, not a restart
        let again = facade.start().await.unwrap();
        assert_eq!(report, again);
        assert!(facade.is_ready());
    }

    #[tokio::test]
    async fn test_publish_requires_ready() {
        let facade = facade();
        let publication = Publication::new(
            "easel.tasks",
            "task.generate.normal",
            b"{}".to_vec(),
            MessageProperties::persistent_json(),
        );
        let err = facade.publish(publication).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let facade = facade();
        facade.stop().await;
        assert_eq!(facade.state(), BrokerState::Stopped);

        facade.start().await.unwrap();
        facade.stop().await;
        facade.stop().await;
        assert_eq!(facade.state(), BrokerState::Stopped);
        assert!(!facade.is_ready());

        let publication = Publication::new(
            "easel.tasks",
            "task.generate.normal",
            b"{}".to_vec(),
            MessageProperties::persistent_json(),
        );
        assert!(facade.publish(publication).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_and_consume_round_trip() {
        let facade = facade();
        facade.start().await.unwrap();

        facade
            .publish(Publication::new(
                "easel.tasks",
                "task.generate.high",
                b"job".to_vec(),
                MessageProperties::persistent_json().with_priority(8),
            ))
            .await
            .unwrap();

        let mut stream = facade
            .consume(ConsumeSpec::new("easel.tasks.generate", "facade-test", 4))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"job");
        delivery.ack().await.unwrap();

        let stats = facade.stats();
        assert_eq!(stats.messages_published, 1);
        assert_eq!(stats.messages_confirmed, 1);
        assert_eq!(stats.publish_failures, 0);
        assert_eq!(stats.consumers_started, 1);
        assert_eq!(stats.state, "ready");
        assert!(stats.connected);
        assert_eq!(stats.prefetch, BrokerConfig::default().prefetch);
        assert!(stats.exchanges.contains(&"easel.tasks".to_string()));
        assert!(stats.queues.contains(&"easel.dead_letter".to_string()));

        facade.stop().await;
    }

    #[tokio::test]
    async fn test_unconfirmed_publish_still_delivers() {
        let facade = facade();
        facade.start().await.unwrap();

        facade
            .publish(
                Publication::new(
                    "easel.results",
                    "progress.generate",
                    b"update".to_vec(),
                    MessageProperties::persistent_json(),
                )
                .without_confirm(),
            )
            .await
            .unwrap();

        let mut stream = facade
            .consume(ConsumeSpec::new("easel.results", "facade-unconfirmed", 4))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"update");
        delivery.ack().await.unwrap();

        assert_eq!(facade.stats().messages_published, 1);

        facade.stop().await;
    }

    #[tokio::test]
    async fn test_start_emits_lifecycle_events() {
        let facade = facade();
        let mut events = facade.events().subscribe();

        facade.start().await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.name, events::CONNECTION_ESTABLISHED);
        let second = events.recv().await.unwrap();
        assert_eq!(second.name, events::TOPOLOGY_APPLIED);
        assert_eq!(second.context["exchanges"], 5);

        facade.stop().await;
    }

    #[tokio::test]
    async fn test_supervisor_recovers_lost_connection() {
        let transport = Arc::new(InMemoryTransport::new());
        let mut config = BrokerConfig::default();
        config.supervision_interval_ms = 10;
        config.reconnect_backoff_base_ms = 1;
        let facade = Arc::new(BrokerFacade::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            Topology::new(TopologyConfig::default()),
            config,
            EventPublisher::default(),
        ));
        facade.start().await.unwrap();

        // drop the connection out from under the facade
        transport.close().await.unwrap();
        assert!(!facade.is_ready());

        let mut recovered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if facade.is_ready() {
                recovered = true;
                break;
            }
        }
        assert!(recovered, "supervisor did not recover the connection");
        assert!(facade.stats().reconnects >= 1);

        facade.stop().await;
    }
}
