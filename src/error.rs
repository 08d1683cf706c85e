//! Crate-wide error type
//!
//! Component errors stay local to their module and fold into [`Error`]
//! at the server boundary.

use std::net::SocketAddr;

use crate::pipeline::DecodeError;
use crate::registry::RegistryError;
use crate::server::target::TargetError;
use crate::signaling::{EngineError, SignalingError};

/// Top-level error for relay operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listening socket could not be bound (fatal at startup)
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure outside of a single connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry rejected a mutation
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Malformed connection target
    #[error(transparent)]
    Target(#[from] TargetError),

    /// External decoder rejected a payload
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Media engine failure
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Signaling protocol failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
