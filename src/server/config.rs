//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::pipeline::{DistributionMode, DEFAULT_MIN_FRAME_BYTES};
use crate::registry::{RegistryConfig, Resolution};

/// Default listening port
pub const DEFAULT_PORT: u16 = 10000;

/// Channel used by the single-camera `/upload` and `/signal` routes
pub const DEFAULT_CHANNEL: &str = "default";

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// How accepted frames reach viewers
    pub mode: DistributionMode,

    /// Payloads shorter than this are rejected as keep-alive noise
    pub min_frame_bytes: usize,

    /// Force one resolution for every channel instead of pinning per channel
    pub frame_size: Option<Resolution>,

    /// Shared secret required from producers (`None` = no check)
    pub camera_key: Option<String>,

    /// ICE servers handed to peer connections
    pub stun_servers: Vec<String>,

    /// Channel served by `/upload` and `/signal`
    pub default_channel: String,

    /// Registry options (queue capacity, liveness period, notices)
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 0, // Unlimited
            mode: DistributionMode::Raw,
            min_frame_bytes: DEFAULT_MIN_FRAME_BYTES,
            frame_size: None,
            camera_key: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            default_channel: DEFAULT_CHANNEL.to_string(),
            registry: RegistryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the distribution mode
    pub fn mode(mut self, mode: DistributionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the minimum frame size in bytes
    pub fn min_frame_bytes(mut self, min: usize) -> Self {
        self.min_frame_bytes = min;
        self
    }

    /// Force a fixed frame resolution
    pub fn frame_size(mut self, resolution: Resolution) -> Self {
        self.frame_size = Some(resolution);
        self
    }

    /// Require a shared secret from producers
    pub fn camera_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.camera_key = if key.is_empty() { None } else { Some(key) };
        self
    }

    /// Replace the ICE server list
    pub fn stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    /// Set the channel used by the single-camera routes
    pub fn default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = channel.into();
        self
    }

    /// Set the liveness probe period
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.registry = self.registry.liveness_interval(interval);
        self
    }

    /// Replace the registry configuration
    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }
}
