use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Broadcast publisher for broker lifecycle events.
///
/// Every component that changes broker-visible state (connection
/// supervision, dispatcher, worker, correlator) publishes here so that
/// operational tooling and tests can observe the subsystem without
/// polling. Event names come from [`crate::constants::events`].
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<BrokerEvent>,
}

/// A published broker lifecycle event
#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub name: String,
    pub context: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl BrokerEvent {
    /// Fetch a string field out of the event context, if present
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event with the given name and context.
    ///
    /// Publishing with zero subscribers succeeds; events are advisory and
    /// must never gate broker progress.
    pub fn publish(&self, event_name: impl Into<String>, context: Value) {
        let event = BrokerEvent {
            name: event_name.into(),
            context,
            published_at: chrono::Utc::now(),
        };

        // send() errors only when there are no subscribers, which is fine here
        let _ = self.sender.send(event);
    }

    /// Publish a task-scoped event, attaching the task id to the context
    pub fn publish_task(&self, event_name: &str, task_id: uuid::Uuid, mut context: Value) {
        if let Some(map) = context.as_object_mut() {
            map.insert("task_id".to_string(), json!(task_id.to_string()));
        }
        self.publish(event_name, context);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}
