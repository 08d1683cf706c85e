//! Connection gateway and process surface
//!
//! [`RelayServer`] binds the listener and owns the shared state. The
//! [`gateway`] module maps HTTP routes and WebSocket targets onto registry
//! links; each upgraded socket is driven by a task in `connection`.

pub mod auth;
pub mod config;
mod connection;
pub mod gateway;
pub mod listener;
pub mod target;

pub use auth::{AllowAll, AuthPolicy, AuthRequest, AuthResult, SharedSecret};
pub use config::ServerConfig;
pub use gateway::RelayContext;
pub use listener::RelayServer;
pub use target::{ConnectTarget, TargetError, TargetRole};
