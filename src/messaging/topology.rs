//! # Broker Topology
//!
//! Declarative description of every exchange, queue, and binding the broker
//! relies on, derived from [`TopologyConfig`]. `apply` declares the whole
//! layout idempotently: re-declaring an existing entity with identical
//! attributes is a no-op, while drift against a live broker surfaces as
//! [`TopologyError::Conflict`] instead of being papered over.
//!
//! ## Layout
//!
//! ```text
//! {ns}.tasks    (topic)   -> {ns}.tasks.{type}       key task.{type}.*
//! {ns}.wait     (direct)  -> {ns}.tasks.{type}.wait  key wait.{type}
//! {ns}.dlx      (topic)   -> {ns}.dead_letter        key #
//! {ns}.results  (topic)   -> {ns}.results            key #
//! {ns}.control  (fanout)  -> per-process exclusive queues
//! ```
//!
//! Wait queues have no consumers; their dead letter wiring points back at
//! the task exchange with key `task.{type}.retry`, so expired retry copies
//! re-enter the matching task queue after their delay.

use thiserror::Error;
use tracing::info;

use crate::config::TopologyConfig;
use crate::constants::routing;

use super::errors::TransportError;
use super::message::TaskType;
use super::transport::{BindingSpec, ExchangeSpec, QueueSpec, Transport};

/// Errors surfaced while applying the topology
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Topology conflict on {entity}: {detail}")]
    Conflict { entity: String, detail: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Counts of entities touched by one `apply` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyReport {
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
}

/// The full broker layout for one namespace
#[derive(Debug, Clone)]
pub struct Topology {
    config: TopologyConfig,
}

impl Topology {
    pub fn new(config: TopologyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Every exchange the broker declares
    pub fn exchanges(&self) -> Vec<ExchangeSpec> {
        vec![
            ExchangeSpec::topic(self.config.task_exchange()),
            ExchangeSpec::direct(self.config.wait_exchange()),
            ExchangeSpec::topic(self.config.dead_letter_exchange()),
            ExchangeSpec::topic(self.config.results_exchange()),
            ExchangeSpec::fanout(self.config.control_exchange()),
        ]
    }

    /// Every durable queue the broker declares
    pub fn queues(&self) -> Vec<QueueSpec> {
        let mut queues = Vec::new();

        for task_type in TaskType::ALL {
            let mut task_queue = QueueSpec::new(self.config.task_queue(task_type.as_str()))
                .with_max_priority(self.config.max_priority)
                .with_dead_letter(
                    self.config.dead_letter_exchange(),
                    routing::dead_letter_key(task_type.as_str()),
                );
            task_queue.durable = self.config.durable;
            if let Some(max_length) = self.config.max_length {
                task_queue = task_queue.with_max_length(max_length);
            }
            if let Some(ttl_ms) = self.config.message_ttl_ms {
                task_queue = task_queue.with_message_ttl(ttl_ms);
            }
            queues.push(task_queue);

            // retry copies wait out their per-message TTL here, then the
            // dead letter wiring feeds them back into the task exchange
            let mut wait_queue = QueueSpec::new(self.config.wait_queue(task_type.as_str()))
                .with_dead_letter(
                    self.config.task_exchange(),
                    routing::task_retry_key(task_type.as_str()),
                );
            wait_queue.durable = self.config.durable;
            queues.push(wait_queue);
        }

        let mut dead_letter = QueueSpec::new(self.config.dead_letter_queue());
        dead_letter.durable = self.config.durable;
        queues.push(dead_letter);

        let mut results = QueueSpec::new(self.config.results_queue());
        results.durable = self.config.durable;
        queues.push(results);

        queues
    }

    /// Every binding between the durable queues and their exchanges
    pub fn bindings(&self) -> Vec<BindingSpec> {
        let mut bindings = Vec::new();

        for task_type in TaskType::ALL {
            bindings.push(BindingSpec::new(
                self.config.task_queue(task_type.as_str()),
                self.config.task_exchange(),
                routing::task_binding(task_type.as_str()),
            ));
            bindings.push(BindingSpec::new(
                self.config.wait_queue(task_type.as_str()),
                self.config.wait_exchange(),
                routing::wait_key(task_type.as_str()),
            ));
        }

        bindings.push(BindingSpec::new(
            self.config.dead_letter_queue(),
            self.config.dead_letter_exchange(),
            "#",
        ));
        bindings.push(BindingSpec::new(
            self.config.results_queue(),
            self.config.results_exchange(),
            "#",
        ));

        bindings
    }

    /// Exclusive control queue for one worker process, plus its binding to
    /// the cancellation fanout. Declared by the worker itself at startup.
    pub fn control_consumer(&self, process_id: &str) -> (QueueSpec, BindingSpec) {
        let queue = QueueSpec::new(self.config.control_queue(process_id)).exclusive();
        let binding = BindingSpec::new(queue.name.clone(), self.config.control_exchange(), "");
        (queue, binding)
    }

    /// Declare the entire layout on a transport.
    ///
    /// Safe to call repeatedly and after reconnects. A declaration rejected
    /// by a broker that is still connected means an entity already exists
    /// with different attributes, which is reported as a conflict rather
    /// than retried.
    pub async fn apply(&self, transport: &dyn Transport) -> Result<TopologyReport, TopologyError> {
        let mut report = TopologyReport::default();

        for spec in self.exchanges() {
            transport
                .declare_exchange(&spec)
                .await
                .map_err(|e| classify(format!("exchange {}", spec.name), e, transport))?;
            report.exchanges += 1;
        }

        for spec in self.queues() {
            transport
                .declare_queue(&spec)
                .await
                .map_err(|e| classify(format!("queue {}", spec.name), e, transport))?;
            report.queues += 1;
        }

        for binding in self.bindings() {
            transport
                .bind_queue(&binding)
                .await
                .map_err(|e| {
                    classify(
                        format!("binding {} -> {}", binding.exchange, binding.queue),
                        e,
                        transport,
                    )
                })?;
            report.bindings += 1;
        }

        info!(
            exchanges = report.exchanges,
            queues = report.queues,
            bindings = report.bindings,
            namespace = %self.config.namespace,
            "✅ Topology applied"
        );
        Ok(report)
    }
}

/// A declaration failure on a live connection is drift, not a transport fault
fn classify(entity: String, error: TransportError, transport: &dyn Transport) -> TopologyError {
    if !error.is_connection_failure() && transport.is_connected() {
        TopologyError::Conflict {
            entity,
            detail: error.to_string(),
        }
    } else {
        TopologyError::Transport(error)
    }
}
