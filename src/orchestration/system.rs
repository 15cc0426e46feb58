//! # Broker System Bootstrap
//!
//! Wires the whole subsystem from one [`EaselConfig`]: transport selection,
//! facade start and topology apply, dispatcher, correlator, status store,
//! and (when enabled) the worker consumer. Shutdown runs in reverse
//! dependency order so results emitted during the worker drain still reach
//! the broker before the connection closes.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{EaselConfig, TransportKind};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::messaging::amqp::AmqpTransport;
use crate::messaging::broker::{BrokerFacade, BrokerStats};
use crate::messaging::in_memory::InMemoryTransport;
use crate::messaging::topology::Topology;
use crate::messaging::transport::Transport;
use crate::messaging::TaskType;

use super::correlator::{ResultCorrelator, TaskSubscription};
use super::dispatcher::TaskDispatcher;
use super::status_store::{StatusStore, TaskRecord};
use super::types::DispatchRequest;
use super::worker::{HandlerRegistry, TaskHandler, WorkerConsumer};

/// Staged construction for [`BrokerSystem`].
///
/// Tests and multi-"process" setups can inject a shared transport instance;
/// production builds pick the transport from configuration.
pub struct BrokerSystemBuilder {
    config: EaselConfig,
    transport: Option<Arc<dyn Transport>>,
    registry: Arc<HandlerRegistry>,
}

impl BrokerSystemBuilder {
    pub fn new(config: EaselConfig) -> Self {
        Self {
            config,
            transport: None,
            registry: Arc::new(HandlerRegistry::new()),
        }
    }

    /// Use a pre-built transport instead of the configured one. Lets several
    /// systems share one in-memory broker the way several processes share
    /// one AMQP server.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn register_handler(self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.registry.register(task_type, handler);
        self
    }

    /// Validate, connect, apply topology, and start every component
    pub async fn start(self) -> Result<Arc<BrokerSystem>> {
        self.config.validate()?;
        let events = EventPublisher::default();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => match self.config.broker.transport {
                TransportKind::Amqp => Arc::new(AmqpTransport::new(&self.config.broker)),
                TransportKind::Memory => Arc::new(InMemoryTransport::new()),
            },
        };

        let facade = Arc::new(BrokerFacade::new(
            transport,
            Topology::new(self.config.topology.clone()),
            self.config.broker.clone(),
            events.clone(),
        ));
        facade.start().await?;

        let status = Arc::new(StatusStore::new(self.config.correlator.retention()));
        let dispatcher = Arc::new(TaskDispatcher::new(Arc::clone(&facade), Arc::clone(&status)));

        let correlator = Arc::new(ResultCorrelator::new(
            Arc::clone(&facade),
            self.config.correlator.clone(),
            Arc::clone(&status),
        ));
        correlator.start().await?;

        let worker = if self.config.worker.enabled {
            let worker = Arc::new(WorkerConsumer::new(
                Arc::clone(&facade),
                Arc::clone(&self.registry),
                self.config.worker.clone(),
                self.config.retry.clone(),
                self.config.broker.prefetch,
            ));
            worker.start().await?;
            Some(worker)
        } else {
            debug!("Worker consumption disabled by configuration");
            None
        };

        let (shutdown_tx, _) = watch::channel(false);
        let system = Arc::new(BrokerSystem {
            config: self.config,
            facade,
            status: Arc::clone(&status),
            dispatcher,
            correlator,
            worker,
            registry: self.registry,
            shutdown_tx,
            sweeper: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        system.spawn_sweeper(status);

        info!(
            transport = %system.facade.stats().transport,
            worker_enabled = system.worker.is_some(),
            "🚀 Broker system started"
        );
        Ok(system)
    }
}

/// Running broker subsystem: one facade, one dispatcher, one correlator,
/// and optionally one worker, all sharing a configuration.
pub struct BrokerSystem {
    config: EaselConfig,
    facade: Arc<BrokerFacade>,
    status: Arc<StatusStore>,
    dispatcher: Arc<TaskDispatcher>,
    correlator: Arc<ResultCorrelator>,
    worker: Option<Arc<WorkerConsumer>>,
    registry: Arc<HandlerRegistry>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl BrokerSystem {
    pub fn builder(config: EaselConfig) -> BrokerSystemBuilder {
        BrokerSystemBuilder::new(config)
    }

    pub fn config(&self) -> &EaselConfig {
        &self.config
    }

    pub fn facade(&self) -> &Arc<BrokerFacade> {
        &self.facade
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn correlator(&self) -> &Arc<ResultCorrelator> {
        &self.correlator
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn worker(&self) -> Option<&Arc<WorkerConsumer>> {
        self.worker.as_ref()
    }

    /// Submit a task; see [`TaskDispatcher::submit`]
    pub async fn submit(&self, request: DispatchRequest) -> Result<Uuid> {
        Ok(self.dispatcher.submit(request).await?)
    }

    /// Broadcast a cancellation; see [`TaskDispatcher::cancel`]
    pub async fn cancel(&self, task_id: Uuid) -> Result<bool> {
        Ok(self.dispatcher.cancel(task_id).await?)
    }

    /// Register interest in a task's updates
    pub fn subscribe(&self, task_id: Uuid) -> TaskSubscription {
        self.correlator.subscribe(task_id)
    }

    /// Current status record for a task, if tracked
    pub fn task_status(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.status.get(task_id)
    }

    /// Broker counter snapshot; never fails
    pub fn stats(&self) -> BrokerStats {
        self.facade.stats()
    }

    pub fn is_ready(&self) -> bool {
        self.facade.is_ready()
    }

    /// Graceful shutdown: drain the worker, stop the correlator, stop the
    /// sweeper, close the broker connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down broker system");

        if let Some(worker) = &self.worker {
            worker.stop().await;
        }
        self.correlator.stop().await;

        let _ = self.shutdown_tx.send(true);
        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        self.facade.stop().await;
        info!("✅ Broker system shut down");
    }

    /// Periodically drop terminal status records past their retention
    fn spawn_sweeper(&self, status: Arc<StatusStore>) {
        let interval = self.config.correlator.sweep_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *self.sweeper.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        status.sweep();
                    }
                }
            }
        }));
    }
}

impl Drop for BrokerSystem {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            debug!("BrokerSystem dropped without shutdown(); background tasks will stop on their own");
        }
    }
}
