//! Crate-level error umbrella.
//!
//! Each module defines its own `thiserror` enum close to where the failures
//! originate; this type exists so callers that drive the whole subsystem
//! (binaries, bootstrap code) can hold one error type without flattening the
//! per-module detail.

use thiserror::Error;

use crate::config::loader::ConfigurationError;
use crate::messaging::broker::BrokerError;
use crate::messaging::errors::TransportError;
use crate::messaging::topology::TopologyError;
use crate::orchestration::dispatcher::DispatchError;
use crate::orchestration::worker::HandlerError;

#[derive(Debug, Error)]
pub enum EaselBrokerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EaselBrokerError>;
