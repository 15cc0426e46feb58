//! # Transport Abstraction
//!
//! Broker-facing trait the rest of the crate is written against. The AMQP
//! implementation talks to RabbitMQ; the in-memory implementation backs
//! tests and single-process development with the same semantics.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::errors::TransportResult;

/// Exchange routing behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeType {
    /// Pattern matching on dot-separated routing keys
    Topic,
    /// Exact routing key match
    Direct,
    /// Delivered to every bound queue regardless of key
    Fanout,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Topic => "topic",
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
        }
    }
}

/// Declarative description of an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeType::Topic,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeType::Direct,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeType::Fanout,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Declarative description of a queue and its dead letter wiring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Bound on queue depth, oldest messages dropped beyond it
    pub max_length: Option<u32>,
    /// Enables priority ordering up to this level
    pub max_priority: Option<u8>,
    /// Queue-wide TTL applied to every message
    pub message_ttl_ms: Option<u64>,
    /// Exchange expired or rejected messages are re-routed to
    pub dead_letter_exchange: Option<String>,
    /// Routing key used for dead letter re-routing
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_length: None,
            max_priority: None,
            message_ttl_ms: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// Per-process queue the broker removes once the consumer departs
    pub fn exclusive(mut self) -> Self {
        self.durable = false;
        self.exclusive = true;
        self.auto_delete = true;
        self
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = Some(max_priority);
        self
    }

    pub fn with_message_ttl(mut self, ttl_ms: u64) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }
}

/// Queue-to-exchange binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Per-message metadata carried alongside the payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    /// Per-message TTL, takes precedence over the queue-wide TTL
    pub expiration_ms: Option<u64>,
    /// Producer timestamp in epoch seconds
    pub timestamp: Option<u64>,
    pub headers: Vec<(String, String)>,
    pub persistent: bool,
}

impl MessageProperties {
    pub fn persistent_json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            persistent: true,
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_expiration_ms(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = Some(expiration_ms);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// A single publish, confirmed by default
#[derive(Debug, Clone)]
pub struct Publication {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    /// Wait for the broker confirm before reporting success. Advisory
    /// traffic such as progress updates opts out and returns once the
    /// message is buffered locally.
    pub require_confirm: bool,
}

impl Publication {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            properties,
            require_confirm: true,
        }
    }

    /// Skip the confirm wait; the publish succeeds once buffered locally
    pub fn without_confirm(mut self) -> Self {
        self.require_confirm = false;
        self
    }
}

/// How a consumer attaches to a queue
#[derive(Debug, Clone)]
pub struct ConsumeSpec {
    pub queue: String,
    pub consumer_tag: String,
    /// Unacknowledged delivery window enforced by the broker
    pub prefetch: u16,
    /// Skip acknowledgements entirely; deliveries are settled on send
    pub no_ack: bool,
}

impl ConsumeSpec {
    pub fn new(queue: impl Into<String>, consumer_tag: impl Into<String>, prefetch: u16) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            prefetch,
            no_ack: false,
        }
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Settles one delivery exactly once
#[async_trait]
pub trait DeliveryAcker: Send {
    /// Acknowledge the delivery as handled
    async fn ack(self: Box<Self>) -> TransportResult<()>;

    /// Return the delivery to the broker, optionally back onto its queue
    async fn nack(self: Box<Self>, requeue: bool) -> TransportResult<()>;

    /// Reject without requeue, sending the delivery to dead letter wiring
    async fn reject(self: Box<Self>) -> TransportResult<()>;
}

/// One message handed to a consumer, payload plus settlement handle
pub struct TransportDelivery {
    pub payload: Vec<u8>,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub priority: Option<u8>,
    pub headers: Vec<(String, String)>,
    acker: Box<dyn DeliveryAcker>,
}

impl TransportDelivery {
    pub fn new(
        payload: Vec<u8>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        priority: Option<u8>,
        headers: Vec<(String, String)>,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            payload,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            delivery_tag,
            redelivered,
            priority,
            headers,
            acker,
        }
    }

    /// Acknowledge, consuming the delivery so it can only settle once
    pub async fn ack(self) -> TransportResult<()> {
        self.acker.ack().await
    }

    /// Return to the broker for redelivery
    pub async fn nack_requeue(self) -> TransportResult<()> {
        self.acker.nack(true).await
    }

    /// Discard without requeue, engaging dead letter wiring if configured
    pub async fn reject(self) -> TransportResult<()> {
        self.acker.reject().await
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Debug for TransportDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportDelivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("priority", &self.priority)
            .field("payload_bytes", &self.payload.len())
            .finish()
    }
}

/// Stream of deliveries for one consumer
pub type DeliveryStream = Pin<Box<dyn Stream<Item = TransportResult<TransportDelivery>> + Send>>;

/// Resolves when the broker confirms a publish that already left the local
/// buffer. Callers that skip the confirm wait drop or detach it.
pub type ConfirmFuture = futures::future::BoxFuture<'static, TransportResult<()>>;

/// Consumer handle pairing the broker-side tag with its delivery stream.
///
/// Dropping the stream does not cancel the consumer; callers cancel through
/// [`Transport::cancel_consumer`] so in-flight deliveries can be settled
/// deliberately during drain.
pub struct ConsumerStream {
    consumer_tag: String,
    stream: DeliveryStream,
}

impl ConsumerStream {
    pub fn new(consumer_tag: impl Into<String>, stream: DeliveryStream) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            stream,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

impl Stream for ConsumerStream {
    type Item = TransportResult<TransportDelivery>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// Broker operations the topology, facade, and consumers are built on.
///
/// Implementations use interior mutability so a shared `Arc<dyn Transport>`
/// can reconnect without exclusive access.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short implementation name for logs ("amqp", "memory")
    fn name(&self) -> &str;

    /// Establish the underlying connection; idempotent when already connected
    async fn connect(&self) -> TransportResult<()>;

    /// Whether the transport currently holds a usable connection
    fn is_connected(&self) -> bool;

    /// Close the connection and release broker resources
    async fn close(&self) -> TransportResult<()>;

    /// Declare an exchange, verifying attributes if it already exists
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> TransportResult<()>;

    /// Declare a queue, verifying attributes if it already exists
    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<QueueInfo>;

    /// Bind a queue to an exchange under a routing key
    async fn bind_queue(&self, binding: &BindingSpec) -> TransportResult<()>;

    /// Hand one message to the broker. Success means the message left the
    /// local buffer; the returned future resolves once the broker confirms
    /// it, and the caller decides whether to wait.
    async fn publish(&self, publication: Publication) -> TransportResult<ConfirmFuture>;

    /// Attach a consumer to a queue with its own prefetch window
    async fn consume(&self, spec: ConsumeSpec) -> TransportResult<ConsumerStream>;

    /// Stop a consumer; already-buffered deliveries remain settleable
    async fn cancel_consumer(&self, consumer_tag: &str) -> TransportResult<()>;

    /// Drop all ready messages from a queue, returning how many were removed
    async fn purge_queue(&self, queue: &str) -> TransportResult<u32>;

    /// Delete a queue outright, returning the number of messages discarded
    async fn delete_queue(&self, queue: &str) -> TransportResult<u32>;

    /// Current counters for a queue
    async fn queue_info(&self, queue: &str) -> TransportResult<QueueInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_spec_constructors() {
        let topic = ExchangeSpec::topic("easel.tasks");
        assert_eq!(topic.kind, ExchangeType::Topic);
        assert!(topic.durable);
        assert!(!topic.auto_delete);

        assert_eq!(ExchangeSpec::direct("easel.wait").kind, ExchangeType::Direct);
        assert_eq!(ExchangeSpec::fanout("easel.control").kind, ExchangeType::Fanout);
    }

    #[test]
    fn test_queue_spec_builder() {
        let spec = QueueSpec::new("easel.tasks.generate")
            .with_max_priority(10)
            .with_dead_letter("easel.dlx", "dead.generate");

        assert!(spec.durable);
        assert!(!spec.exclusive);
        assert_eq!(spec.max_priority, Some(10));
        assert_eq!(spec.dead_letter_exchange.as_deref(), Some("easel.dlx"));
        assert_eq!(spec.dead_letter_routing_key.as_deref(), Some("dead.generate"));
        assert_eq!(spec.message_ttl_ms, None);

        let exclusive = QueueSpec::new("easel.control.abc123").exclusive();
        assert!(!exclusive.durable);
        assert!(exclusive.exclusive);
        assert!(exclusive.auto_delete);
    }

    #[test]
    fn test_message_properties_builder() {
        let props = MessageProperties::persistent_json()
            .with_message_id("m-1")
            .with_priority(8)
            .with_expiration_ms(2000)
            .with_header("x-death-reason", "expired");

        assert!(props.persistent);
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.priority, Some(8));
        assert_eq!(props.expiration_ms, Some(2000));
        assert_eq!(props.headers.len(), 1);
    }

    #[test]
    fn test_publication_confirms_by_default() {
        let publication = Publication::new(
            "easel.results",
            "progress.generate",
            Vec::new(),
            MessageProperties::default(),
        );
        assert!(publication.require_confirm);
        assert!(!publication.without_confirm().require_confirm);
    }
}
