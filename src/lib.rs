#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, AMQP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Easel Broker
//!
//! Asynchronous task broker and queue-orchestration core for the Easel AI
//! canvas. The web application submits AI-processing tasks (generate,
//! optimize, fusion, analyze, expand); this crate routes them through a
//! topology of exchanges and queues to worker processes, enforces priority
//! and prefetch backpressure, retries or dead-letters failed deliveries, and
//! correlates asynchronous results back to the task's originator.
//!
//! ## Architecture
//!
//! The messaging layer owns the transport: a [`messaging::Transport`] trait
//! with a RabbitMQ implementation ([`messaging::AmqpTransport`], lapin) and
//! a behaviorally identical in-memory implementation for development and
//! tests. The [`messaging::BrokerFacade`] is the sole entry/exit point —
//! confirmed publishes, supervised reconnects, idempotent topology
//! application.
//!
//! The orchestration layer drives the task lifecycle on top of it:
//!
//! - [`orchestration::TaskDispatcher`] — submission to confirmed publish,
//!   routing key `task.{type}.{priority_label}`
//! - [`orchestration::WorkerConsumer`] — prefetch-bounded consumption,
//!   ack / delayed-retry / dead-letter per handler outcome
//! - [`orchestration::ResultCorrelator`] — result and progress fan-out to
//!   per-task subscriptions
//! - [`orchestration::RetryPolicy`] — pure backoff and dead-letter decisions
//! - [`orchestration::BrokerSystem`] — bootstrap wiring it all together from
//!   [`config::EaselConfig`]
//!
//! ## Guarantees
//!
//! At-least-once delivery end to end: a successful submit means the
//! transport durably accepted the task; every consumed delivery ends in
//! exactly one of ack, confirmed delayed retry, or dead-letter; a task that
//! exhausts its retry budget lands on the dead-letter queue with a terminal
//! `failed` result, never in limbo.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use easel_broker::config::EaselConfig;
//! use easel_broker::messaging::{TaskMessage, TaskType};
//! use easel_broker::orchestration::{
//!     BrokerSystem, DispatchRequest, HandlerContext, HandlerError, TaskHandler,
//! };
//!
//! struct GenerateHandler;
//!
//! #[async_trait]
//! impl TaskHandler for GenerateHandler {
//!     async fn handle(
//!         &self,
//!         _task: &TaskMessage,
//!         ctx: &HandlerContext,
//!     ) -> Result<serde_json::Value, HandlerError> {
//!         ctx.report_progress(50, Some("rendering")).await;
//!         Ok(serde_json::json!({ "asset": "s3://renders/out.png" }))
//!     }
//! }
//!
//! # async fn example() -> easel_broker::Result<()> {
//! let system = BrokerSystem::builder(EaselConfig::default())
//!     .register_handler(TaskType::Generate, Arc::new(GenerateHandler))
//!     .start()
//!     .await?;
//!
//! let task_id = system
//!     .submit(DispatchRequest::new(
//!         TaskType::Generate,
//!         serde_json::json!({ "prompt": "a lighthouse at dawn" }),
//!     ))
//!     .await?;
//!
//! let mut subscription = system.subscribe(task_id);
//! while let Some(update) = subscription.recv().await {
//!     println!("{update:?}");
//! }
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod state_machine;

pub use config::{ConfigManager, EaselConfig};
pub use error::{EaselBrokerError, Result};
pub use events::{BrokerEvent, EventPublisher};
pub use messaging::{
    BrokerFacade, BrokerStats, TaskMessage, TaskPriority, TaskResultMessage, TaskType, Topology,
};
pub use orchestration::{
    BrokerSystem, DispatchRequest, HandlerContext, HandlerError, TaskHandler, TaskSubscription,
    TaskUpdate,
};
pub use state_machine::TaskStatus;
