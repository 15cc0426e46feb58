//! # Messaging Error Types
//!
//! Comprehensive error handling for the messaging layer using thiserror
//! for structured error types instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Comprehensive transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    #[error("Exchange operation failed: {exchange}: {operation}: {message}")]
    ExchangeOperation {
        exchange: String,
        operation: String,
        message: String,
    },

    #[error("Queue operation failed: {queue}: {operation}: {message}")]
    QueueOperation {
        queue: String,
        operation: String,
        message: String,
    },

    #[error("Queue not found: {queue}")]
    QueueNotFound { queue: String },

    #[error("Exchange not found: {exchange}")]
    ExchangeNotFound { exchange: String },

    #[error("Publish to {exchange} with routing key {routing_key} was nacked by the broker")]
    PublishNacked {
        exchange: String,
        routing_key: String,
    },

    #[error("Publish confirm timed out after {timeout_ms}ms")]
    PublishConfirmTimeout { timeout_ms: u64 },

    #[error("Consume failed on queue {queue}: {message}")]
    Consume { queue: String, message: String },

    #[error("Consumer not found: {consumer_tag}")]
    ConsumerNotFound { consumer_tag: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Acknowledgement failed for delivery {delivery_tag}: {message}")]
    Acknowledgement { delivery_tag: u64, message: String },

    #[error("Internal transport error: {message}")]
    Internal { message: String },
}

impl TransportError {
    /// Create a broker connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Create an exchange operation error
    pub fn exchange_operation(
        exchange: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ExchangeOperation {
            exchange: exchange.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation(
        queue: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::QueueOperation {
            queue: queue.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue: queue.into(),
        }
    }

    /// Create an exchange not found error
    pub fn exchange_not_found(exchange: impl Into<String>) -> Self {
        Self::ExchangeNotFound {
            exchange: exchange.into(),
        }
    }

    /// Create a consume error
    pub fn consume(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue: queue.into(),
            message: message.into(),
        }
    }

    /// Create a consumer not found error
    pub fn consumer_not_found(consumer_tag: impl Into<String>) -> Self {
        Self::ConsumerNotFound {
            consumer_tag: consumer_tag.into(),
        }
    }

    /// Create an acknowledgement error
    pub fn acknowledgement(delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            delivery_tag,
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error indicates the underlying connection is unusable
    /// and a reconnect is the only way forward.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::NotConnected | Self::ChannelClosed { .. }
        )
    }
}

/// Conversion from lapin::Error to TransportError
impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidConnectionState(state) => {
                TransportError::connection(format!("invalid connection state: {state:?}"))
            }
            lapin::Error::InvalidChannelState(state) => {
                TransportError::channel_closed(format!("invalid channel state: {state:?}"))
            }
            lapin::Error::IOError(io_err) => TransportError::connection(io_err.to_string()),
            other => TransportError::internal(other.to_string()),
        }
    }
}

/// Conversion from serde_json::Error to TransportError
impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            TransportError::MessageDeserialization {
                message: err.to_string(),
            }
        } else {
            TransportError::MessageSerialization {
                message: err.to_string(),
            }
        }
    }
}

/// Conversion from String to TransportError
impl From<String> for TransportError {
    fn from(message: String) -> Self {
        TransportError::internal(message)
    }
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
