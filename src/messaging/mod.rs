//! # Messaging Module
//!
//! Transport-backed messaging for the Easel broker core. Wire formats,
//! the transport abstraction with its AMQP and in-memory backends, the
//! declarative topology, and the broker facade the rest of the crate
//! publishes and consumes through.

pub mod amqp;
pub mod broker;
pub mod errors;
pub mod in_memory;
pub mod message;
pub mod topology;
pub mod transport;

pub use amqp::AmqpTransport;
pub use broker::{BrokerError, BrokerFacade, BrokerState, BrokerStats};
pub use errors::{TransportError, TransportResult};
pub use in_memory::InMemoryTransport;
pub use message::{
    priority_label, ControlMessage, ProgressStage, ResultError, TaskContext, TaskMessage,
    TaskPriority, TaskProgressMessage, TaskResultMessage, TaskType,
};
pub use topology::{Topology, TopologyError, TopologyReport};
pub use transport::{
    BindingSpec, ConfirmFuture, ConsumeSpec, ConsumerStream, DeliveryAcker, ExchangeSpec,
    ExchangeType, MessageProperties, Publication, QueueInfo, QueueSpec, Transport,
    TransportDelivery,
};
