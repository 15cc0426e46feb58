//! # Orchestration Layer
//!
//! Task lifecycle on top of the messaging layer: the dispatcher that turns
//! submissions into confirmed publishes, the worker consumer that drives
//! deliveries through ack/retry/dead-letter, the correlator that routes
//! results back to their originators, the retry policy that decides between
//! the two, and the system bootstrap that wires it all from configuration.

pub mod correlator;
pub mod dispatcher;
pub mod retry;
pub mod status_store;
pub mod system;
pub mod types;
pub mod worker;

pub use correlator::{ResultCorrelator, TaskSubscription};
pub use dispatcher::{DispatchError, TaskDispatcher};
pub use retry::{DeadLetterReason, ErrorClass, RetryDecision, RetryPolicy};
pub use status_store::{StatusStore, TaskRecord};
pub use system::{BrokerSystem, BrokerSystemBuilder};
pub use types::{DispatchRequest, TaskUpdate};
pub use worker::{
    CancellationLedger, HandlerContext, HandlerError, HandlerRegistry, TaskHandler, WorkerConsumer,
};
