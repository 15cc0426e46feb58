//! # AMQP Transport
//!
//! RabbitMQ-backed [`Transport`] implementation built on lapin. One
//! connection carries three kinds of channels: a publish channel with
//! confirms enabled, an admin channel for declarations, and a dedicated
//! channel per consumer so each gets its own prefetch window.
//!
//! The connection handle lives behind a lock so the supervision loop can
//! reconnect through a shared `Arc<AmqpTransport>` while consumers and
//! publishers keep their clones of the old channels until they observe
//! the failure themselves.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{mask_credentials, BrokerConfig};

use super::errors::{TransportError, TransportResult};
use super::transport::{
    BindingSpec, ConfirmFuture, ConsumeSpec, ConsumerStream, DeliveryAcker, ExchangeSpec,
    ExchangeType, MessageProperties, Publication, QueueInfo, QueueSpec, Transport,
    TransportDelivery,
};

/// Live connection state, replaced wholesale on reconnect
struct AmqpHandle {
    connection: Arc<Connection>,
    admin_channel: Channel,
    publish_channel: Channel,
}

/// RabbitMQ transport with confirmed publishes
pub struct AmqpTransport {
    url: String,
    masked_url: String,
    confirm_timeout: Duration,
    handle: RwLock<Option<AmqpHandle>>,
    consumer_channels: DashMap<String, Channel>,
}

impl AmqpTransport {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            url: config.url.clone(),
            masked_url: mask_credentials(&config.url),
            confirm_timeout: config.confirm_timeout(),
            handle: RwLock::new(None),
            consumer_channels: DashMap::new(),
        }
    }

    fn connection(&self) -> TransportResult<Arc<Connection>> {
        self.handle
            .read()
            .as_ref()
            .filter(|h| h.connection.status().connected())
            .map(|h| Arc::clone(&h.connection))
            .ok_or(TransportError::NotConnected)
    }

    fn publish_channel(&self) -> TransportResult<Channel> {
        self.handle
            .read()
            .as_ref()
            .filter(|h| h.connection.status().connected())
            .map(|h| h.publish_channel.clone())
            .ok_or(TransportError::NotConnected)
    }

    /// Admin channel for declarations. A failed declare closes the channel
    /// broker-side, so a dead one is replaced transparently.
    async fn admin_channel(&self) -> TransportResult<Channel> {
        {
            let guard = self.handle.read();
            match guard.as_ref() {
                Some(handle) if handle.admin_channel.status().connected() => {
                    return Ok(handle.admin_channel.clone());
                }
                Some(_) => {}
                None => return Err(TransportError::NotConnected),
            }
        }

        let connection = self.connection()?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::channel_closed(e.to_string()))?;
        if let Some(handle) = self.handle.write().as_mut() {
            handle.admin_channel = channel.clone();
        }
        debug!("Replaced closed AMQP admin channel");
        Ok(channel)
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(max_length) = spec.max_length {
        args.insert("x-max-length".into(), AMQPValue::LongUInt(max_length));
    }
    if let Some(max_priority) = spec.max_priority {
        args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max_priority));
    }
    if let Some(ttl_ms) = spec.message_ttl_ms {
        args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl_ms as u32));
    }
    if let Some(dlx) = &spec.dead_letter_exchange {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx.clone().into()),
        );
    }
    if let Some(routing_key) = &spec.dead_letter_routing_key {
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.clone().into()),
        );
    }
    args
}

fn build_properties(props: &MessageProperties) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if props.persistent {
        properties = properties.with_delivery_mode(2);
    }
    if let Some(message_id) = &props.message_id {
        properties = properties.with_message_id(message_id.clone().into());
    }
    if let Some(correlation_id) = &props.correlation_id {
        properties = properties.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }
    if let Some(priority) = props.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(expiration_ms) = props.expiration_ms {
        properties = properties.with_expiration(expiration_ms.to_string().into());
    }
    if let Some(timestamp) = props.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if !props.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &props.headers {
            table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
        }
        properties = properties.with_headers(table);
    }
    properties
}

fn map_delivery(
    delivery: lapin::message::Delivery,
    channel: &Channel,
    no_ack: bool,
) -> TransportDelivery {
    let props = &delivery.properties;

    let mut headers = Vec::new();
    if let Some(amqp_headers) = props.headers() {
        for (key, value) in amqp_headers.inner() {
            if let AMQPValue::LongString(s) = value {
                headers.push((key.to_string(), s.to_string()));
            }
        }
    }

    let priority = *props.priority();
    let acker = Box::new(AmqpAcker {
        channel: channel.clone(),
        delivery_tag: delivery.delivery_tag,
        no_ack,
    });

    TransportDelivery::new(
        delivery.data,
        delivery.exchange.to_string(),
        delivery.routing_key.to_string(),
        delivery.delivery_tag,
        delivery.redelivered,
        priority,
        headers,
        acker,
    )
}

/// Settles a delivery through the channel it arrived on
struct AmqpAcker {
    channel: Channel,
    delivery_tag: u64,
    no_ack: bool,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(self: Box<Self>) -> TransportResult<()> {
        if self.no_ack {
            return Ok(());
        }
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::acknowledgement(self.delivery_tag, e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> TransportResult<()> {
        if self.no_ack {
            return Ok(());
        }
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::acknowledgement(self.delivery_tag, e.to_string()))
    }

    async fn reject(self: Box<Self>) -> TransportResult<()> {
        if self.no_ack {
            return Ok(());
        }
        self.channel
            .basic_reject(self.delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| TransportError::acknowledgement(self.delivery_tag, e.to_string()))
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &str {
        "amqp"
    }

    async fn connect(&self) -> TransportResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::connection(e.to_string()))?;
        let admin_channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::channel_closed(e.to_string()))?;
        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::channel_closed(e.to_string()))?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::channel_closed(e.to_string()))?;

        // channels from a previous connection are unusable now
        self.consumer_channels.clear();
        *self.handle.write() = Some(AmqpHandle {
            connection: Arc::new(connection),
            admin_channel,
            publish_channel,
        });

        info!(url = %self.masked_url, "✅ AMQP transport connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handle
            .read()
            .as_ref()
            .map(|h| h.connection.status().connected())
            .unwrap_or(false)
    }

    async fn close(&self) -> TransportResult<()> {
        let handle = self.handle.write().take();
        self.consumer_channels.clear();

        if let Some(handle) = handle {
            if let Err(e) = handle.publish_channel.close(200, "Normal shutdown").await {
                debug!(error = %e, "Publish channel close failed during shutdown");
            }
            if let Err(e) = handle.connection.close(200, "Normal shutdown").await {
                warn!(error = %e, "AMQP connection close failed");
            }
            info!(url = %self.masked_url, "✅ AMQP transport closed");
        }
        Ok(())
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> TransportResult<()> {
        let channel = self.admin_channel().await?;
        channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::exchange_operation(&spec.name, "declare", e.to_string()))?;
        debug!(exchange = %spec.name, kind = %spec.kind.as_str(), "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> TransportResult<QueueInfo> {
        let channel = self.admin_channel().await?;
        let queue = channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(|e| TransportError::queue_operation(&spec.name, "declare", e.to_string()))?;
        debug!(queue = %spec.name, messages = queue.message_count(), "Queue declared");
        Ok(QueueInfo {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> TransportResult<()> {
        let channel = self.admin_channel().await?;
        channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::queue_operation(&binding.queue, "bind", e.to_string()))?;
        debug!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Queue bound"
        );
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> TransportResult<ConfirmFuture> {
        let channel = self.publish_channel()?;
        let properties = build_properties(&publication.properties);

        let confirm = channel
            .basic_publish(
                &publication.exchange,
                &publication.routing_key,
                BasicPublishOptions::default(),
                &publication.payload,
                properties,
            )
            .await
            .map_err(TransportError::from)?;

        // The send already happened; the returned future only waits for the
        // broker's ack so callers can settle it outside any publish lock.
        let confirm_timeout = self.confirm_timeout;
        let bytes = publication.payload.len();
        let Publication {
            exchange,
            routing_key,
            ..
        } = publication;

        Ok(Box::pin(async move {
            let confirmation = tokio::time::timeout(confirm_timeout, confirm)
                .await
                .map_err(|_| TransportError::PublishConfirmTimeout {
                    timeout_ms: confirm_timeout.as_millis() as u64,
                })?
                .map_err(TransportError::from)?;

            match confirmation {
                Confirmation::Nack(_) => Err(TransportError::PublishNacked {
                    exchange,
                    routing_key,
                }),
                _ => {
                    debug!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        bytes,
                        "📤 Publish confirmed"
                    );
                    Ok(())
                }
            }
        }))
    }

    async fn consume(&self, spec: ConsumeSpec) -> TransportResult<ConsumerStream> {
        let connection = self.connection()?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::channel_closed(e.to_string()))?;
        channel
            .basic_qos(spec.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::consume(&spec.queue, e.to_string()))?;

        let consumer = channel
            .basic_consume(
                &spec.queue,
                &spec.consumer_tag,
                BasicConsumeOptions {
                    no_ack: spec.no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::consume(&spec.queue, e.to_string()))?;

        self.consumer_channels
            .insert(spec.consumer_tag.clone(), channel.clone());

        info!(
            queue = %spec.queue,
            consumer_tag = %spec.consumer_tag,
            prefetch = spec.prefetch,
            "📥 Consumer attached"
        );

        let no_ack = spec.no_ack;
        let stream = consumer.map(move |result| {
            result
                .map(|delivery| map_delivery(delivery, &channel, no_ack))
                .map_err(TransportError::from)
        });

        Ok(ConsumerStream::new(spec.consumer_tag, Box::pin(stream)))
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> TransportResult<()> {
        let (_, channel) = self
            .consumer_channels
            .remove(consumer_tag)
            .ok_or_else(|| TransportError::consumer_not_found(consumer_tag))?;
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::consume(consumer_tag, e.to_string()))?;
        info!(consumer_tag = %consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> TransportResult<u32> {
        let channel = self.admin_channel().await?;
        let count = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| TransportError::queue_operation(queue, "purge", e.to_string()))?;
        info!(queue = %queue, purged = count, "Queue purged");
        Ok(count)
    }

    async fn delete_queue(&self, queue: &str) -> TransportResult<u32> {
        let channel = self.admin_channel().await?;
        let count = channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| TransportError::queue_operation(queue, "delete", e.to_string()))?;
        info!(queue = %queue, discarded = count, "Queue deleted");
        Ok(count)
    }

    async fn queue_info(&self, queue: &str) -> TransportResult<QueueInfo> {
        let channel = self.admin_channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                let text = e.to_string();
                if text.contains("NOT_FOUND") {
                    TransportError::queue_not_found(queue)
                } else {
                    TransportError::queue_operation(queue, "inspect", text)
                }
            })?;
        Ok(QueueInfo {
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert_eq!(exchange_kind(ExchangeType::Topic), ExchangeKind::Topic);
        assert_eq!(exchange_kind(ExchangeType::Direct), ExchangeKind::Direct);
        assert_eq!(exchange_kind(ExchangeType::Fanout), ExchangeKind::Fanout);
    }

    fn arg_key(name: &str) -> lapin::types::ShortString {
        name.into()
    }

    #[test]
    fn test_queue_arguments() {
        let spec = QueueSpec::new("easel.tasks.generate")
            .with_max_priority(10)
            .with_message_ttl(60_000)
            .with_dead_letter("easel.dlx", "dead.generate");
        let args = queue_arguments(&spec);
        let inner = args.inner();

        assert_eq!(
            inner.get(&arg_key("x-max-priority")),
            Some(&AMQPValue::ShortShortUInt(10))
        );
        assert_eq!(
            inner.get(&arg_key("x-message-ttl")),
            Some(&AMQPValue::LongUInt(60_000))
        );
        assert!(inner.contains_key(&arg_key("x-dead-letter-exchange")));
        assert!(inner.contains_key(&arg_key("x-dead-letter-routing-key")));
        assert!(!inner.contains_key(&arg_key("x-max-length")));
    }

    #[test]
    fn test_build_properties() {
        let props = MessageProperties::persistent_json()
            .with_message_id("m-1")
            .with_priority(8)
            .with_expiration_ms(2_000)
            .with_header("x-death-reason", "expired");
        let built = build_properties(&props);

        assert_eq!(*built.delivery_mode(), Some(2));
        assert_eq!(*built.priority(), Some(8));
        assert_eq!(
            built.expiration().as_ref().map(|s| s.to_string()),
            Some("2000".to_string())
        );
        assert_eq!(
            built.content_type().as_ref().map(|s| s.to_string()),
            Some("application/json".to_string())
        );
        assert!(built.headers().is_some());
    }

    #[test]
    fn test_transient_properties_skip_delivery_mode() {
        let props = MessageProperties::default();
        let built = build_properties(&props);
        assert_eq!(*built.delivery_mode(), None);
        assert_eq!(*built.priority(), None);
    }
}
