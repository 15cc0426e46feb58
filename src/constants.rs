//! # System Constants
//!
//! Core constants and naming conventions that define the operational
//! boundaries of the Easel broker core.
//!
//! Queue and routing-key layouts are derived from these builders so that
//! every process (dispatchers, workers, correlators) agrees on the same
//! names without sharing mutable state.

// Re-export the task status type for convenience
pub use crate::state_machine::TaskStatus;

/// Broker lifecycle events published through the [`crate::events::EventPublisher`]
pub mod events {
    // Connection lifecycle
    pub const CONNECTION_ESTABLISHED: &str = "broker.connection_established";
    pub const CONNECTION_LOST: &str = "broker.connection_lost";
    pub const RECONNECT_ATTEMPT: &str = "broker.reconnect_attempt";
    pub const TOPOLOGY_APPLIED: &str = "broker.topology_applied";

    // Task lifecycle
    pub const TASK_DISPATCHED: &str = "task.dispatched";
    pub const TASK_RETRY_SCHEDULED: &str = "task.retry_scheduled";
    pub const TASK_DEAD_LETTERED: &str = "task.dead_lettered";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";

    // Consumer lifecycle
    pub const CONSUMER_STARTED: &str = "consumer.started";
    pub const CONSUMER_CANCELLED: &str = "consumer.cancelled";
    pub const DRAIN_STARTED: &str = "consumer.drain_started";
    pub const DRAIN_COMPLETED: &str = "consumer.drain_completed";
}

/// Well-known error codes carried in result messages
pub mod error_codes {
    /// Task was cancelled before its handler ran
    pub const TASK_CANCELLED: &str = "task_cancelled";
    /// Handler exceeded the configured execution timeout
    pub const HANDLER_TIMEOUT: &str = "handler_timeout";
    /// Handler failed against a transient external dependency
    pub const TRANSIENT_FAILURE: &str = "transient_failure";
    /// Retry budget exhausted
    pub const MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";
    /// No handler registered for the task type
    pub const NO_HANDLER: &str = "no_handler_registered";
    /// Payload failed validation inside the handler
    pub const VALIDATION_FAILED: &str = "validation_failed";
    /// Handler failed without a classification
    pub const UNCLASSIFIED_FAILURE: &str = "unclassified_failure";
}

/// System-wide constants
pub mod system {
    /// Unknown value placeholder
    pub const UNKNOWN: &str = "unknown";

    /// Version compatibility marker
    pub const EASEL_BROKER_VERSION: &str = "0.1.0";

    /// Highest transport priority level declared on task queues
    pub const MAX_PRIORITY_LEVELS: u8 = 10;

    /// Hard ceiling on serialized task payload size (1 MB)
    pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

    /// Routing-key segment used when a retry copy re-enters the task exchange
    pub const RETRY_ROUTING_SEGMENT: &str = "retry";
}

/// Routing-key builders shared by every process on the broker
pub mod routing {
    /// Routing key for a fresh task publication: `task.{type}.{priority_label}`
    pub fn task_key(task_type: &str, priority_label: &str) -> String {
        format!("task.{task_type}.{priority_label}")
    }

    /// Binding pattern matching every priority label for one task type
    pub fn task_binding(task_type: &str) -> String {
        format!("task.{task_type}.*")
    }

    /// Routing key a retry copy is dead-lettered back onto the task exchange with
    pub fn task_retry_key(task_type: &str) -> String {
        format!("task.{}.{}", task_type, super::system::RETRY_ROUTING_SEGMENT)
    }

    /// Routing key addressing a wait queue on the wait exchange
    pub fn wait_key(task_type: &str) -> String {
        format!("wait.{task_type}")
    }

    /// Routing key a task queue dead-letters rejected messages with
    pub fn dead_letter_key(task_type: &str) -> String {
        format!("dead.{task_type}")
    }

    /// Routing key for a terminal result message
    pub fn result_key(task_type: &str) -> String {
        format!("result.{task_type}")
    }

    /// Routing key for a progress message
    pub fn progress_key(task_type: &str) -> String {
        format!("progress.{task_type}")
    }

    /// Task type carried by a terminal result routing key, if it is one
    pub fn result_task_type(key: &str) -> Option<&str> {
        key.strip_prefix("result.")
    }

    /// Task type carried by a progress routing key, if it is one
    pub fn progress_task_type(key: &str) -> Option<&str> {
        key.strip_prefix("progress.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_routing_keys() {
        assert_eq!(routing::task_key("generate", "normal"), "task.generate.normal");
        assert_eq!(routing::task_binding("fusion"), "task.fusion.*");
        assert_eq!(routing::task_retry_key("expand"), "task.expand.retry");
        assert_eq!(routing::wait_key("analyze"), "wait.analyze");
    }

    #[test]
    fn test_result_routing_keys() {
        assert_eq!(
            routing::result_task_type(&routing::result_key("generate")),
            Some("generate")
        );
        assert_eq!(
            routing::progress_task_type(&routing::progress_key("enhance")),
            Some("enhance")
        );
        assert_eq!(routing::result_task_type("progress.generate"), None);
    }
}
