//! # Task Dispatcher
//!
//! Turns a [`DispatchRequest`] into a confirmed publish on the task
//! exchange. Submission is fire-and-forget at this layer: `submit` returns
//! the task id as soon as the transport confirms durable acceptance, never
//! waiting for processing. A confirm timeout is surfaced as
//! [`DispatchError::Submission`] — delivery unknown, not task lost.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::constants::{events, system};
use crate::messaging::broker::{BrokerError, BrokerFacade};
use crate::messaging::errors::TransportError;
use crate::messaging::message::{ControlMessage, TaskMessage};
use crate::messaging::transport::{MessageProperties, Publication};

use super::status_store::StatusStore;
use super::types::DispatchRequest;

/// Errors surfaced by task submission
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The transport did not confirm the publish in time. The outcome is
    /// ambiguous: the task may or may not have been accepted. Callers must
    /// poll or resubmit idempotently under the same task id.
    #[error("Submission of task {task_id} is unconfirmed: {reason}")]
    Submission { task_id: Uuid, reason: String },

    #[error("Task payload is {bytes} bytes, limit is {limit}")]
    PayloadTooLarge { bytes: usize, limit: usize },

    #[error("Failed to serialize task message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Submission entry point held by request-issuing collaborators
pub struct TaskDispatcher {
    facade: Arc<BrokerFacade>,
    status: Arc<StatusStore>,
}

impl TaskDispatcher {
    pub fn new(facade: Arc<BrokerFacade>, status: Arc<StatusStore>) -> Self {
        Self { facade, status }
    }

    /// Submit a task for asynchronous processing.
    ///
    /// Returns the task id once the transport has durably accepted the
    /// message. Does not block on processing; subscribe through the
    /// correlator to observe the outcome.
    pub async fn submit(&self, request: DispatchRequest) -> Result<Uuid, DispatchError> {
        let mut message = TaskMessage::new(
            request.task_type,
            request.priority.clamp(1, system::MAX_PRIORITY_LEVELS),
            request.payload,
            request.context,
        );
        if let Some(task_id) = request.task_id {
            message.task_id = task_id;
        }
        let task_id = message.task_id;

        let payload = message.to_bytes()?;
        if payload.len() > system::MAX_PAYLOAD_BYTES {
            return Err(DispatchError::PayloadTooLarge {
                bytes: payload.len(),
                limit: system::MAX_PAYLOAD_BYTES,
            });
        }

        let topology = self.facade.topology().config();
        let routing_key = message.routing_key();
        let publication = Publication::new(
            topology.task_exchange(),
            routing_key.clone(),
            payload,
            MessageProperties::persistent_json()
                .with_message_id(task_id.to_string())
                .with_priority(message.priority)
                .with_timestamp(message.original_timestamp as u64 / 1000),
        );

        self.facade
            .publish(publication)
            .await
            .map_err(|e| classify_publish_failure(task_id, e))?;

        self.status.record_queued(task_id, message.task_type);
        self.facade.events().publish_task(
            events::TASK_DISPATCHED,
            task_id,
            serde_json::json!({
                "type": message.task_type.as_str(),
                "priority": message.priority,
                "routing_key": routing_key,
            }),
        );
        info!(
            task_id = %task_id,
            task_type = %message.task_type,
            priority = message.priority,
            routing_key = %routing_key,
            "📤 Task dispatched"
        );
        Ok(task_id)
    }

    /// Broadcast a cancellation for a task over the control exchange.
    ///
    /// Returns whether the broadcast was accepted by the transport. `false`
    /// means no worker will hear about it (broker not ready); it never means
    /// the task was or was not cancelled.
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool, DispatchError> {
        let control = ControlMessage::cancel(task_id);
        let topology = self.facade.topology().config();
        let publication = Publication::new(
            topology.control_exchange(),
            // fanout: the routing key is ignored
            "",
            control.to_bytes()?,
            MessageProperties::persistent_json().with_correlation_id(task_id.to_string()),
        );

        match self.facade.publish(publication).await {
            Ok(()) => {
                self.facade.events().publish_task(
                    events::TASK_CANCELLED,
                    task_id,
                    serde_json::json!({ "stage": "broadcast" }),
                );
                info!(task_id = %task_id, "🛑 Cancellation broadcast");
                Ok(true)
            }
            Err(BrokerError::NotReady { state }) => {
                warn!(task_id = %task_id, state = %state, "Cancellation dropped, broker not ready");
                Ok(false)
            }
            Err(e) => Err(classify_publish_failure(task_id, e)),
        }
    }
}

/// Confirm timeouts and nacks are ambiguous submissions; everything else
/// keeps its broker-level shape.
fn classify_publish_failure(task_id: Uuid, error: BrokerError) -> DispatchError {
    match error {
        BrokerError::Transport(
            e @ (TransportError::PublishConfirmTimeout { .. } | TransportError::PublishNacked { .. }),
        ) => DispatchError::Submission {
            task_id,
            reason: e.to_string(),
        },
        other => DispatchError::Broker(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, CorrelatorConfig, TopologyConfig};
    use crate::events::EventPublisher;
    use crate::messaging::in_memory::InMemoryTransport;
    use crate::messaging::topology::Topology;
    use crate::messaging::transport::ConsumeSpec;
    use crate::messaging::{TaskPriority, TaskType};
    use crate::state_machine::TaskStatus;
    use futures::StreamExt;

    async fn started_facade() -> Arc<BrokerFacade> {
        let facade = Arc::new(BrokerFacade::new(
            Arc::new(InMemoryTransport::new()),
            Topology::new(TopologyConfig::default()),
            BrokerConfig::default(),
            EventPublisher::default(),
        ));
        facade.start().await.unwrap();
        facade
    }

    fn status() -> Arc<StatusStore> {
        Arc::new(StatusStore::new(CorrelatorConfig::default().retention()))
    }

    #[tokio::test]
    async fn test_submit_routes_to_task_queue() {
        let facade = started_facade().await;
        let dispatcher = TaskDispatcher::new(Arc::clone(&facade), status());

        let task_id = dispatcher
            .submit(
                DispatchRequest::new(TaskType::Generate, serde_json::json!({"prompt": "hills"}))
                    .with_priority_level(TaskPriority::High)
                    .with_originator("easel-web"),
            )
            .await
            .unwrap();

        let mut stream = facade
            .consume(ConsumeSpec::new("easel.tasks.generate", "dispatch-test", 1))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        let message = TaskMessage::from_bytes(&delivery.payload).unwrap();
        assert_eq!(message.task_id, task_id);
        assert_eq!(message.task_type, TaskType::Generate);
        assert_eq!(message.attempt, 1);
        assert_eq!(delivery.routing_key, "task.generate.high");
        assert_eq!(delivery.priority, Some(8));
        delivery.ack().await.unwrap();

        facade.stop().await;
    }

    #[tokio::test]
    async fn test_submit_records_queued_status() {
        let facade = started_facade().await;
        let status = status();
        let dispatcher = TaskDispatcher::new(Arc::clone(&facade), Arc::clone(&status));

        let task_id = dispatcher
            .submit(DispatchRequest::new(TaskType::Analyze, serde_json::json!({})))
            .await
            .unwrap();

        let record = status.get(task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.task_type, TaskType::Analyze);

        facade.stop().await;
    }

    #[tokio::test]
    async fn test_submit_honors_preassigned_id() {
        let facade = started_facade().await;
        let dispatcher = TaskDispatcher::new(Arc::clone(&facade), status());

        let chosen = Uuid::new_v4();
        let returned = dispatcher
            .submit(
                DispatchRequest::new(TaskType::Expand, serde_json::json!({})).with_task_id(chosen),
            )
            .await
            .unwrap();
        assert_eq!(returned, chosen);

        facade.stop().await;
    }

    #[tokio::test]
    async fn test_submit_requires_ready_broker() {
        let facade = Arc::new(BrokerFacade::new(
            Arc::new(InMemoryTransport::new()),
            Topology::new(TopologyConfig::default()),
            BrokerConfig::default(),
            EventPublisher::default(),
        ));
        let dispatcher = TaskDispatcher::new(facade, status());

        let err = dispatcher
            .submit(DispatchRequest::new(TaskType::Generate, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Broker(BrokerError::NotReady { .. })));
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let facade = started_facade().await;
        let dispatcher = TaskDispatcher::new(Arc::clone(&facade), status());

        let huge = serde_json::json!({"blob": "x".repeat(system::MAX_PAYLOAD_BYTES)});
        let err = dispatcher
            .submit(DispatchRequest::new(TaskType::Generate, huge))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::PayloadTooLarge { .. }));

        facade.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_reaches_control_queue() {
        let facade = started_facade().await;
        let dispatcher = TaskDispatcher::new(Arc::clone(&facade), status());

        // a worker's exclusive control queue, bound to the fanout
        let (queue, binding) = facade.topology().control_consumer("w1");
        facade.declare_queue(&queue).await.unwrap();
        facade.bind_queue(&binding).await.unwrap();

        let task_id = Uuid::new_v4();
        assert!(dispatcher.cancel(task_id).await.unwrap());

        let mut stream = facade
            .consume(ConsumeSpec::new(queue.name.clone(), "cancel-test", 1))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        let ControlMessage::Cancel { task_id: heard, .. } =
            ControlMessage::from_bytes(&delivery.payload).unwrap();
        assert_eq!(heard, task_id);
        delivery.ack().await.unwrap();

        facade.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_on_stopped_broker_is_not_accepted() {
        let facade = started_facade().await;
        let dispatcher = TaskDispatcher::new(Arc::clone(&facade), status());
        facade.stop().await;

        assert!(!dispatcher.cancel(Uuid::new_v4()).await.unwrap());
    }
}
