//! Registry configuration

use std::time::Duration;

/// Channel registry configuration options
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each link's outbound queue (frames + notices)
    pub outbound_capacity: usize,

    /// Liveness probe period; a link is evicted after two missed periods at most
    pub liveness_interval: Duration,

    /// Send the cached latest frame to consumers as they join
    pub catchup_enabled: bool,

    /// Send status notices (`VIEWER_ON` / `VIEWER_OFF` / `PRODUCER_OFFLINE`)
    pub notices_enabled: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 8,
            liveness_interval: Duration::from_secs(15),
            catchup_enabled: true,
            notices_enabled: true,
        }
    }
}

impl RegistryConfig {
    /// Set the outbound queue capacity per link
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Set the liveness probe period
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Disable eager catch-up for joining consumers
    pub fn disable_catchup(mut self) -> Self {
        self.catchup_enabled = false;
        self
    }

    /// Disable status notices
    pub fn disable_notices(mut self) -> Self {
        self.notices_enabled = false;
        self
    }
}
