//! # In-Memory Transport
//!
//! A process-local [`Transport`] implementation with the same observable
//! semantics as the AMQP backend: topic routing with `*`/`#` wildcards,
//! priority ordering, per-message TTL, dead letter re-routing, and
//! per-consumer prefetch windows. Backs the test suite and single-process
//! development where no RabbitMQ is available.
//!
//! Topology and queue contents survive `close()`/`connect()` cycles the way
//! durable entities survive an AMQP reconnect.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use super::errors::{TransportError, TransportResult};
use super::transport::{
    BindingSpec, ConfirmFuture, ConsumeSpec, ConsumerStream, DeliveryAcker, ExchangeSpec,
    ExchangeType, MessageProperties, Publication, QueueInfo, QueueSpec, Transport,
    TransportDelivery,
};

const DEATH_REASON_HEADER: &str = "x-death-reason";
const DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

/// Routing-key match for topic exchanges: `*` is one segment, `#` is any run
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn segments_match(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                segments_match(&pattern[1..], key)
                    || (!key.is_empty() && segments_match(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => segments_match(&pattern[1..], &key[1..]),
            (Some(&segment), Some(&key_segment)) if segment == key_segment => {
                segments_match(&pattern[1..], &key[1..])
            }
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    segments_match(&pattern, &key)
}

struct MemMessage {
    id: u64,
    payload: Vec<u8>,
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    redelivered: bool,
    expires_at: Option<tokio::time::Instant>,
}

impl MemMessage {
    fn effective_priority(&self, max_priority: Option<u8>) -> u8 {
        match max_priority {
            Some(max) => self.properties.priority.unwrap_or(0).min(max),
            None => 0,
        }
    }
}

struct QueueState {
    messages: VecDeque<MemMessage>,
    next_delivery_tag: u64,
}

struct MemQueue {
    spec: QueueSpec,
    state: Mutex<QueueState>,
    notify: Notify,
    consumer_count: AtomicUsize,
    deleted: AtomicBool,
}

impl MemQueue {
    fn new(spec: QueueSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                next_delivery_tag: 0,
            }),
            notify: Notify::new(),
            consumer_count: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
        })
    }

    /// Insert respecting priority order, returning messages dropped to honor
    /// the queue length bound. Higher priorities sit closer to the head;
    /// equal priorities keep FIFO order.
    fn enqueue(&self, message: MemMessage) -> Vec<MemMessage> {
        let max_priority = self.spec.max_priority;
        let mut state = self.state.lock();

        let priority = message.effective_priority(max_priority);
        let position = if max_priority.is_some() {
            state
                .messages
                .iter()
                .position(|existing| existing.effective_priority(max_priority) < priority)
                .unwrap_or(state.messages.len())
        } else {
            state.messages.len()
        };
        state.messages.insert(position, message);

        let mut dropped = Vec::new();
        if let Some(max_length) = self.spec.max_length {
            while state.messages.len() > max_length as usize {
                if let Some(head) = state.messages.pop_front() {
                    dropped.push(head);
                }
            }
        }
        drop(state);

        self.notify.notify_one();
        dropped
    }

    /// Pop the next live message, collecting any expired ones found on the way
    fn pop_ready(&self) -> (Option<(MemMessage, u64)>, Vec<MemMessage>) {
        let now = tokio::time::Instant::now();
        let mut expired = Vec::new();
        let mut state = self.state.lock();

        while let Some(message) = state.messages.pop_front() {
            if message.expires_at.is_some_and(|at| at <= now) {
                expired.push(message);
                continue;
            }
            let tag = state.next_delivery_tag;
            state.next_delivery_tag += 1;
            return (Some((message, tag)), expired);
        }
        (None, expired)
    }

    /// Return a delivery to the queue for another attempt
    fn requeue(&self, mut message: MemMessage) {
        message.redelivered = true;
        // requeue never drops for length; the message was already counted
        let max_priority = self.spec.max_priority;
        let mut state = self.state.lock();
        let priority = message.effective_priority(max_priority);
        let position = if max_priority.is_some() {
            state
                .messages
                .iter()
                .position(|existing| existing.effective_priority(max_priority) < priority)
                .unwrap_or(state.messages.len())
        } else {
            0
        };
        state.messages.insert(position, message);
        drop(state);
        self.notify.notify_one();
    }

    /// Remove a specific message if it is still waiting, for TTL timers
    fn remove_by_id(&self, message_id: u64) -> Option<MemMessage> {
        let mut state = self.state.lock();
        let index = state.messages.iter().position(|m| m.id == message_id)?;
        state.messages.remove(index)
    }

    fn purge(&self) -> u32 {
        let mut state = self.state.lock();
        let count = state.messages.len() as u32;
        state.messages.clear();
        count
    }

    fn message_count(&self) -> u32 {
        self.state.lock().messages.len() as u32
    }
}

struct MemExchange {
    spec: ExchangeSpec,
    bindings: Vec<BindingSpec>,
}

struct TopologyState {
    exchanges: HashMap<String, MemExchange>,
    queues: HashMap<String, Arc<MemQueue>>,
}

struct InnerCore {
    state: Mutex<TopologyState>,
    next_message_id: AtomicU64,
}

impl InnerCore {
    fn queue(&self, name: &str) -> Option<Arc<MemQueue>> {
        self.state.lock().queues.get(name).cloned()
    }

    /// Resolve which queues a publish reaches
    fn resolve_routes(
        &self,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<Vec<Arc<MemQueue>>> {
        let state = self.state.lock();
        let mem_exchange = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::exchange_not_found(exchange))?;

        let mut targets = Vec::new();
        for binding in &mem_exchange.bindings {
            let matched = match mem_exchange.spec.kind {
                ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeType::Direct => binding.routing_key == routing_key,
                ExchangeType::Fanout => true,
            };
            if matched {
                if let Some(queue) = state.queues.get(&binding.queue) {
                    if !targets.iter().any(|t: &Arc<MemQueue>| Arc::ptr_eq(t, queue)) {
                        targets.push(Arc::clone(queue));
                    }
                }
            }
        }
        Ok(targets)
    }
}

/// Deliver one message into a queue, arming its TTL timer and dead lettering
/// anything dropped for queue length.
fn push_message(
    core: &Arc<InnerCore>,
    queue: &Arc<MemQueue>,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    exchange: String,
    routing_key: String,
) {
    let ttl_ms = match (properties.expiration_ms, queue.spec.message_ttl_ms) {
        (Some(per_message), Some(queue_wide)) => Some(per_message.min(queue_wide)),
        (Some(per_message), None) => Some(per_message),
        (None, Some(queue_wide)) => Some(queue_wide),
        (None, None) => None,
    };
    let expires_at =
        ttl_ms.map(|ms| tokio::time::Instant::now() + std::time::Duration::from_millis(ms));

    let message = MemMessage {
        id: core.next_message_id.fetch_add(1, Ordering::Relaxed),
        payload,
        exchange,
        routing_key,
        properties,
        redelivered,
        expires_at,
    };
    let message_id = message.id;
    let queue_name = queue.spec.name.clone();

    let dropped = queue.enqueue(message);
    for head in dropped {
        dead_letter(core, &queue.spec, head, "maxlen");
    }

    if let Some(expires_at) = expires_at {
        let weak_core: Weak<InnerCore> = Arc::downgrade(core);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let Some(core) = weak_core.upgrade() else {
                return;
            };
            let Some(queue) = core.queue(&queue_name) else {
                return;
            };
            if let Some(expired) = queue.remove_by_id(message_id) {
                dead_letter(&core, &queue.spec, expired, "expired");
            }
        });
    }
}

/// Re-route a dead message through the queue's dead letter wiring, or drop
/// it when none is configured. The expiration is removed so the copy cannot
/// expire again in the target queue.
fn dead_letter(core: &Arc<InnerCore>, source: &QueueSpec, mut message: MemMessage, reason: &str) {
    let Some(dlx) = source.dead_letter_exchange.clone() else {
        debug!(queue = %source.name, reason = %reason, "Dropped message without dead letter wiring");
        return;
    };
    let routing_key = source
        .dead_letter_routing_key
        .clone()
        .unwrap_or_else(|| message.routing_key.clone());

    message.properties.expiration_ms = None;
    message
        .properties
        .headers
        .retain(|(key, _)| key != DEATH_REASON_HEADER && key != DEATH_QUEUE_HEADER);
    message
        .properties
        .headers
        .push((DEATH_REASON_HEADER.to_string(), reason.to_string()));
    message
        .properties
        .headers
        .push((DEATH_QUEUE_HEADER.to_string(), source.name.clone()));

    match core.resolve_routes(&dlx, &routing_key) {
        Ok(targets) => {
            debug!(
                queue = %source.name,
                dlx = %dlx,
                routing_key = %routing_key,
                reason = %reason,
                targets = targets.len(),
                "Dead lettered message"
            );
            for target in targets {
                push_message(
                    core,
                    &target,
                    message.payload.clone(),
                    message.properties.clone(),
                    false,
                    dlx.clone(),
                    routing_key.clone(),
                );
            }
        }
        Err(_) => {
            debug!(queue = %source.name, dlx = %dlx, "Dead letter exchange missing, message dropped");
        }
    }
}

/// Per-consumer unacknowledged window mirroring `basic.qos`
struct ConsumerWindow {
    in_flight: AtomicUsize,
    notify: Notify,
}

struct ConsumerControl {
    cancelled: AtomicBool,
}

struct ConsumerEntry {
    queue: Arc<MemQueue>,
    control: Arc<ConsumerControl>,
    window: Arc<ConsumerWindow>,
}

/// Settles one in-memory delivery
struct MemAcker {
    core: Arc<InnerCore>,
    queue: Arc<MemQueue>,
    window: Option<Arc<ConsumerWindow>>,
    message: Option<MemMessage>,
}

impl MemAcker {
    fn release_window(&self) {
        if let Some(window) = &self.window {
            window.in_flight.fetch_sub(1, Ordering::SeqCst);
            window.notify.notify_one();
        }
    }
}

#[async_trait]
impl DeliveryAcker for MemAcker {
    async fn ack(mut self: Box<Self>) -> TransportResult<()> {
        self.message.take();
        self.release_window();
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> TransportResult<()> {
        if let Some(message) = self.message.take() {
            if requeue && !self.queue.deleted.load(Ordering::SeqCst) {
                self.queue.requeue(message);
            } else {
                dead_letter(&self.core, &self.queue.spec, message, "rejected");
            }
        }
        self.release_window();
        Ok(())
    }

    async fn reject(mut self: Box<Self>) -> TransportResult<()> {
        if let Some(message) = self.message.take() {
            dead_letter(&self.core, &self.queue.spec, message, "rejected");
        }
        self.release_window();
        Ok(())
    }
}

/// Process-local transport for tests and single-process development
pub struct InMemoryTransport {
    core: Arc<InnerCore>,
    connected: AtomicBool,
    consumers: Arc<DashMap<String, ConsumerEntry>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            core: Arc::new(InnerCore {
                state: Mutex::new(TopologyState {
                    exchanges: HashMap::new(),
                    queues: HashMap::new(),
                }),
                next_message_id: AtomicU64::new(1),
            }),
            connected: AtomicBool::new(false),
            consumers: Arc::new(DashMap::new()),
        }
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// First queue attribute differing between declarations, for conflict errors
fn queue_spec_conflict(existing: &QueueSpec, requested: &QueueSpec) -> Option<&'static str> {
    if existing.durable != requested.durable {
        Some("durable")
    } else if existing.exclusive != requested.exclusive {
        Some("exclusive")
    } else if existing.auto_delete != requested.auto_delete {
        Some("auto_delete")
    } else if existing.max_length != requested.max_length {
        Some("x-max-length")
    } else if existing.max_priority != requested.max_priority {
        Some("x-max-priority")
    } else if existing.message_ttl_ms != requested.message_ttl_ms {
        Some("x-message-ttl")
    } else if existing.dead_letter_exchange != requested.dead_letter_exchange {
        Some("x-dead-letter-exchange")
    } else if existing.dead_letter_routing_key != requested.dead_letter_routing_key {
        Some("x-dead-letter-routing-key")
    } else {
        None
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> TransportResult<()> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!("✅ In-memory transport connected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            for entry in self.consumers.iter() {
                entry.value().control.cancelled.store(true, Ordering::SeqCst);
                entry.value().queue.notify.notify_waiters();
                entry.value().window.notify.notify_waiters();
            }
            self.consumers.clear();
            info!("✅ In-memory transport closed");
        }
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> TransportResult<()> {
        self.ensure_connected()?;
        let mut state = self.core.state.lock();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing.spec == *spec => Ok(()),
            Some(existing) => {
                let detail = if existing.spec.kind != spec.kind {
                    "type"
                } else {
                    "durable"
                };
                Err(TransportError::exchange_operation(
                    &spec.name,
                    "declare",
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg '{detail}' for exchange '{}'",
                        spec.name
                    ),
                ))
            }
            None => {
                state.exchanges.insert(
                    spec.name.clone(),
                    MemExchange {
                        spec: spec.clone(),
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<QueueInfo> {
        self.ensure_connected()?;
        let mut state = self.core.state.lock();
        match state.queues.get(&spec.name) {
            Some(existing) => match queue_spec_conflict(&existing.spec, spec) {
                Some(attribute) => Err(TransportError::queue_operation(
                    &spec.name,
                    "declare",
                    format!(
                        "PRECONDITION_FAILED - inequivalent arg '{attribute}' for queue '{}'",
                        spec.name
                    ),
                )),
                None => Ok(QueueInfo {
                    message_count: existing.message_count(),
                    consumer_count: existing.consumer_count.load(Ordering::SeqCst) as u32,
                }),
            },
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), MemQueue::new(spec.clone()));
                Ok(QueueInfo::default())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> TransportResult<()> {
        self.ensure_connected()?;
        let mut state = self.core.state.lock();
        if !state.queues.contains_key(&binding.queue) {
            return Err(TransportError::queue_not_found(&binding.queue));
        }
        let mem_exchange = state
            .exchanges
            .get_mut(&binding.exchange)
            .ok_or_else(|| TransportError::exchange_not_found(&binding.exchange))?;
        if !mem_exchange.bindings.contains(binding) {
            mem_exchange.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> TransportResult<ConfirmFuture> {
        self.ensure_connected()?;
        let targets = self
            .core
            .resolve_routes(&publication.exchange, &publication.routing_key)?;
        for target in targets {
            push_message(
                &self.core,
                &target,
                publication.payload.clone(),
                publication.properties.clone(),
                false,
                publication.exchange.clone(),
                publication.routing_key.clone(),
            );
        }
        // Routing is synchronous, so the confirm is already settled.
        Ok(Box::pin(futures::future::ready(Ok(()))))
    }

    async fn consume(&self, spec: ConsumeSpec) -> TransportResult<ConsumerStream> {
        self.ensure_connected()?;
        let queue = self
            .core
            .queue(&spec.queue)
            .ok_or_else(|| TransportError::queue_not_found(&spec.queue))?;
        if self.consumers.contains_key(&spec.consumer_tag) {
            return Err(TransportError::consume(
                &spec.queue,
                format!("consumer tag '{}' already in use", spec.consumer_tag),
            ));
        }

        let control = Arc::new(ConsumerControl {
            cancelled: AtomicBool::new(false),
        });
        let window = Arc::new(ConsumerWindow {
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
        });
        self.consumers.insert(
            spec.consumer_tag.clone(),
            ConsumerEntry {
                queue: Arc::clone(&queue),
                control: Arc::clone(&control),
                window: Arc::clone(&window),
            },
        );
        queue.consumer_count.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(spec.prefetch.max(1) as usize);
        let core = Arc::clone(&self.core);
        let consumers = Arc::clone(&self.consumers);
        let consumer_tag = spec.consumer_tag.clone();
        let prefetch = spec.prefetch as usize;
        let no_ack = spec.no_ack;

        tokio::spawn(async move {
            'deliver: loop {
                if control.cancelled.load(Ordering::SeqCst) || queue.deleted.load(Ordering::SeqCst)
                {
                    break;
                }

                // claim window capacity before taking a message off the queue
                if !no_ack && prefetch > 0 {
                    loop {
                        let window_notified = window.notify.notified();
                        if control.cancelled.load(Ordering::SeqCst) {
                            break 'deliver;
                        }
                        if window.in_flight.load(Ordering::SeqCst) < prefetch {
                            break;
                        }
                        window_notified.await;
                    }
                }

                let (message, tag) = loop {
                    let queue_notified = queue.notify.notified();
                    if control.cancelled.load(Ordering::SeqCst)
                        || queue.deleted.load(Ordering::SeqCst)
                    {
                        break 'deliver;
                    }
                    let (popped, expired) = queue.pop_ready();
                    for dead in expired {
                        dead_letter(&core, &queue.spec, dead, "expired");
                    }
                    match popped {
                        Some(found) => break found,
                        None => queue_notified.await,
                    }
                };

                if !no_ack {
                    window.in_flight.fetch_add(1, Ordering::SeqCst);
                }

                let acker = Box::new(MemAcker {
                    core: Arc::clone(&core),
                    queue: Arc::clone(&queue),
                    window: (!no_ack).then(|| Arc::clone(&window)),
                    message: Some(MemMessage {
                        id: message.id,
                        payload: message.payload.clone(),
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        properties: message.properties.clone(),
                        redelivered: message.redelivered,
                        expires_at: message.expires_at,
                    }),
                });
                let delivery = TransportDelivery::new(
                    message.payload.clone(),
                    message.exchange.clone(),
                    message.routing_key.clone(),
                    tag,
                    message.redelivered,
                    message.properties.priority,
                    message.properties.headers.clone(),
                    acker,
                );

                if tx.send(Ok(delivery)).await.is_err() {
                    // receiver dropped without cancelling; put the message back
                    if !no_ack {
                        window.in_flight.fetch_sub(1, Ordering::SeqCst);
                        queue.requeue(message);
                    }
                    break;
                }
            }

            consumers.remove(&consumer_tag);
            let remaining = queue.consumer_count.fetch_sub(1, Ordering::SeqCst) - 1;
            if queue.spec.auto_delete && remaining == 0 {
                core.state.lock().queues.remove(&queue.spec.name);
            }
        });

        info!(
            queue = %spec.queue,
            consumer_tag = %spec.consumer_tag,
            prefetch = spec.prefetch,
            "📥 Consumer attached"
        );

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(ConsumerStream::new(spec.consumer_tag, Box::pin(stream)))
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> TransportResult<()> {
        let (_, entry) = self
            .consumers
            .remove(consumer_tag)
            .ok_or_else(|| TransportError::consumer_not_found(consumer_tag))?;
        entry.control.cancelled.store(true, Ordering::SeqCst);
        entry.queue.notify.notify_waiters();
        entry.window.notify.notify_waiters();
        info!(consumer_tag = %consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> TransportResult<u32> {
        self.ensure_connected()?;
        let queue = self
            .core
            .queue(queue)
            .ok_or_else(|| TransportError::queue_not_found(queue))?;
        Ok(queue.purge())
    }

    async fn delete_queue(&self, queue_name: &str) -> TransportResult<u32> {
        self.ensure_connected()?;
        let queue = {
            let mut state = self.core.state.lock();
            state
                .queues
                .remove(queue_name)
                .ok_or_else(|| TransportError::queue_not_found(queue_name))?
        };
        queue.deleted.store(true, Ordering::SeqCst);
        queue.notify.notify_waiters();
        Ok(queue.purge())
    }

    async fn queue_info(&self, queue: &str) -> TransportResult<QueueInfo> {
        self.ensure_connected()?;
        let queue = self
            .core
            .queue(queue)
            .ok_or_else(|| TransportError::queue_not_found(queue))?;
        Ok(QueueInfo {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count.load(Ordering::SeqCst) as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("task.*.*", "task.generate.high"));
        assert!(topic_matches("task.generate.*", "task.generate.urgent"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("task.#", "task.a.b.c"));
        assert!(topic_matches("task.#", "task"));
        assert!(topic_matches("*.generate.*", "task.generate.low"));

        assert!(!topic_matches("task.*", "task.a.b"));
        assert!(!topic_matches("task.generate.*", "task.optimize.high"));
        assert!(!topic_matches("result.#", "progress.generate"));
    }

    async fn connected() -> InMemoryTransport {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        transport
    }

    async fn declare_task_queue(transport: &InMemoryTransport) {
        transport
            .declare_exchange(&ExchangeSpec::topic("tasks"))
            .await
            .unwrap();
        transport
            .declare_queue(&QueueSpec::new("tasks.generate").with_max_priority(10))
            .await
            .unwrap();
        transport
            .bind_queue(&BindingSpec::new("tasks.generate", "tasks", "task.generate.*"))
            .await
            .unwrap();
    }

    fn publication(routing_key: &str, body: &str, priority: u8) -> Publication {
        Publication::new(
            "tasks",
            routing_key,
            body.as_bytes().to_vec(),
            MessageProperties::persistent_json().with_priority(priority),
        )
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let transport = connected().await;
        declare_task_queue(&transport).await;

        transport
            .publish(publication("task.generate.low", "low", 2))
            .await
            .unwrap()
            .await
            .unwrap();
        transport
            .publish(publication("task.generate.urgent", "urgent", 10))
            .await
            .unwrap()
            .await
            .unwrap();
        transport
            .publish(publication("task.generate.normal", "normal", 5))
            .await
            .unwrap()
            .await
            .unwrap();

        let mut stream = transport
            .consume(ConsumeSpec::new("tasks.generate", "ctag-prio", 8))
            .await
            .unwrap();

        for expected in ["urgent", "normal", "low"] {
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(delivery.payload, expected.as_bytes());
            delivery.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_prefetch_window_blocks_delivery() {
        let transport = connected().await;
        declare_task_queue(&transport).await;

        for body in ["one", "two", "three"] {
            transport
                .publish(publication("task.generate.normal", body, 5))
                .await
                .unwrap()
                .await
                .unwrap();
        }

        let mut stream = transport
            .consume(ConsumeSpec::new("tasks.generate", "ctag-window", 1))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        // window of one: the second delivery must wait for the ack
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = transport.queue_info("tasks.generate").await.unwrap();
        assert_eq!(info.message_count, 2);

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"two");
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_message_dead_letters() {
        let transport = connected().await;
        transport
            .declare_exchange(&ExchangeSpec::direct("dlx"))
            .await
            .unwrap();
        transport
            .declare_queue(&QueueSpec::new("dead"))
            .await
            .unwrap();
        transport
            .bind_queue(&BindingSpec::new("dead", "dlx", "expired.key"))
            .await
            .unwrap();
        transport
            .declare_exchange(&ExchangeSpec::direct("wait"))
            .await
            .unwrap();
        transport
            .declare_queue(&QueueSpec::new("wait.q").with_dead_letter("dlx", "expired.key"))
            .await
            .unwrap();
        transport
            .bind_queue(&BindingSpec::new("wait.q", "wait", "wait.q"))
            .await
            .unwrap();

        transport
            .publish(Publication::new(
                "wait",
                "wait.q",
                b"delayed".to_vec(),
                MessageProperties::persistent_json().with_expiration_ms(30),
            ))
            .await
            .unwrap()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let info = transport.queue_info("wait.q").await.unwrap();
        assert_eq!(info.message_count, 0);

        let mut stream = transport
            .consume(ConsumeSpec::new("dead", "ctag-dead", 1))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"delayed");
        assert_eq!(delivery.header("x-death-reason"), Some("expired"));
        assert_eq!(delivery.header("x-first-death-queue"), Some("wait.q"));
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_delivery_dead_letters() {
        let transport = connected().await;
        transport
            .declare_exchange(&ExchangeSpec::topic("tasks"))
            .await
            .unwrap();
        transport
            .declare_exchange(&ExchangeSpec::direct("dlx"))
            .await
            .unwrap();
        transport
            .declare_queue(&QueueSpec::new("dead"))
            .await
            .unwrap();
        transport
            .bind_queue(&BindingSpec::new("dead", "dlx", "dead.generate"))
            .await
            .unwrap();
        transport
            .declare_queue(&QueueSpec::new("tasks.generate").with_dead_letter("dlx", "dead.generate"))
            .await
            .unwrap();
        transport
            .bind_queue(&BindingSpec::new("tasks.generate", "tasks", "task.generate.*"))
            .await
            .unwrap();

        transport
            .publish(publication("task.generate.high", "poison", 8))
            .await
            .unwrap()
            .await
            .unwrap();

        let mut stream = transport
            .consume(ConsumeSpec::new("tasks.generate", "ctag-rej", 1))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.reject().await.unwrap();

        let mut dead_stream = transport
            .consume(ConsumeSpec::new("dead", "ctag-dead-2", 1))
            .await
            .unwrap();
        let dead = dead_stream.next().await.unwrap().unwrap();
        assert_eq!(dead.payload, b"poison");
        assert_eq!(dead.header("x-death-reason"), Some("rejected"));
        dead.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_requeues_as_redelivered() {
        let transport = connected().await;
        declare_task_queue(&transport).await;

        transport
            .publish(publication("task.generate.normal", "again", 5))
            .await
            .unwrap()
            .await
            .unwrap();

        let mut stream = transport
            .consume(ConsumeSpec::new("tasks.generate", "ctag-redeliver", 1))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack_requeue().await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.payload, b"again");
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_declare_conflict_detected() {
        let transport = connected().await;
        transport
            .declare_queue(&QueueSpec::new("q").with_max_priority(10))
            .await
            .unwrap();

        let err = transport
            .declare_queue(&QueueSpec::new("q").with_max_priority(5))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("PRECONDITION_FAILED"));
        assert!(text.contains("x-max-priority"));

        // identical re-declare stays idempotent
        transport
            .declare_queue(&QueueSpec::new("q").with_max_priority(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let transport = connected().await;
        declare_task_queue(&transport).await;

        let mut stream = transport
            .consume(ConsumeSpec::new("tasks.generate", "ctag-cancel", 1))
            .await
            .unwrap();
        transport.cancel_consumer("ctag-cancel").await.unwrap();

        assert!(stream.next().await.is_none());
        assert!(matches!(
            transport.cancel_consumer("ctag-cancel").await,
            Err(TransportError::ConsumerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_purge_and_delete() {
        let transport = connected().await;
        declare_task_queue(&transport).await;

        for body in ["a", "b"] {
            transport
                .publish(publication("task.generate.low", body, 2))
                .await
                .unwrap()
                .await
                .unwrap();
        }

        assert_eq!(transport.purge_queue("tasks.generate").await.unwrap(), 2);
        assert_eq!(transport.purge_queue("tasks.generate").await.unwrap(), 0);

        transport
            .publish(publication("task.generate.low", "c", 2))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(transport.delete_queue("tasks.generate").await.unwrap(), 1);
        assert!(matches!(
            transport.queue_info("tasks.generate").await,
            Err(TransportError::QueueNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let transport = connected().await;
        let err = transport
            .publish(Publication::new(
                "nope",
                "key",
                Vec::new(),
                MessageProperties::default(),
            ))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ExchangeNotFound { .. }));
    }

    #[tokio::test]
    async fn test_state_survives_reconnect() {
        let transport = connected().await;
        declare_task_queue(&transport).await;
        transport
            .publish(publication("task.generate.normal", "kept", 5))
            .await
            .unwrap()
            .await
            .unwrap();

        transport.close().await.unwrap();
        assert!(transport.publish(publication("task.generate.normal", "x", 5)).await.is_err());

        transport.connect().await.unwrap();
        let info = transport.queue_info("tasks.generate").await.unwrap();
        assert_eq!(info.message_count, 1);
    }
}
