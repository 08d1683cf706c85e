//! Liveness monitor
//!
//! One recurring tick over every registered link. A probed link whose flag is
//! still clear from the previous tick never answered that probe and is
//! evicted; otherwise the flag is cleared and a new probe is requested. A
//! half-open connection therefore holds its slot for at most two periods.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::registry::{ChannelRegistry, CloseReason, Liveness, RemovalCause};
use crate::stats::RelayStats;

/// Outcome of one monitor tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Links asked to send a probe
    pub probed: usize,
    /// Links evicted for missing the previous probe
    pub timed_out: usize,
    /// Passive links evicted because their queue closed
    pub dropped: usize,
}

/// Periodic dead-peer detector
pub struct LivenessMonitor {
    registry: Arc<ChannelRegistry>,
    stats: Arc<RelayStats>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<ChannelRegistry>, stats: Arc<RelayStats>) -> Self {
        let interval = registry.config().liveness_interval;
        Self {
            registry,
            stats,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run a single check over all links
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for link in self.registry.links().await {
            match link.liveness() {
                Liveness::Probed => {
                    if link.take_alive() {
                        link.request_probe();
                        report.probed += 1;
                        continue;
                    }

                    link.close(CloseReason::LivenessTimeout);
                    if self
                        .registry
                        .remove(&link, RemovalCause::LivenessTimeout)
                        .await
                        .is_some()
                    {
                        report.timed_out += 1;
                    }
                }
                Liveness::Passive => {
                    if link.is_outbound_closed()
                        && self
                            .registry
                            .remove(&link, RemovalCause::Transport)
                            .await
                            .is_some()
                    {
                        report.dropped += 1;
                    }
                }
            }
        }

        if report.timed_out > 0 {
            self.stats.liveness_evicted(report.timed_out);
        }
        if report.dropped > 0 {
            self.stats.transport_evicted(report.dropped);
        }

        tracing::debug!(
            probed = report.probed,
            timed_out = report.timed_out,
            dropped = report.dropped,
            "Liveness tick"
        );

        report
    }

    /// Spawn the recurring tick task
    ///
    /// The first tick fires one full period after spawning, so fresh links
    /// are never judged before they had a chance to answer.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if self.registry.is_closing() {
                    break;
                }
                self.tick().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChannelId, Delivery, Link, Role};

    fn channel() -> ChannelId {
        ChannelId::new("cam-1").unwrap()
    }

    fn monitor(registry: &Arc<ChannelRegistry>) -> (LivenessMonitor, Arc<RelayStats>) {
        let stats = Arc::new(RelayStats::default());
        (
            LivenessMonitor::new(Arc::clone(registry), Arc::clone(&stats)),
            stats,
        )
    }

    #[tokio::test]
    async fn test_silent_link_evicted_on_second_tick() {
        let registry = Arc::new(ChannelRegistry::new());
        let (monitor, stats) = monitor(&registry);
        let (cam, mut cam_rx) = Link::new(registry.next_link_id(), channel(), Role::Producer, 4);
        registry.register_producer(Arc::clone(&cam)).await.unwrap();

        // First tick: fresh link counts as alive, gets probed
        let first = monitor.tick().await;
        assert_eq!(first.probed, 1);
        assert_eq!(first.timed_out, 0);

        // No pong arrives before the second tick
        let second = monitor.tick().await;
        assert_eq!(second.timed_out, 1);
        assert_eq!(cam_rx.closed().await, CloseReason::LivenessTimeout);
        assert!(!registry.has_producer(&channel()).await);
        assert_eq!(stats.snapshot().liveness_evictions, 1);
    }

    #[tokio::test]
    async fn test_responsive_link_survives() {
        let registry = Arc::new(ChannelRegistry::new());
        let (monitor, _stats) = monitor(&registry);
        let (viewer, _rx) = Link::new(
            registry.next_link_id(),
            channel(),
            Role::Consumer(Delivery::Frames),
            4,
        );
        registry.register_consumer(Arc::clone(&viewer)).await.unwrap();

        for _ in 0..3 {
            let report = monitor.tick().await;
            assert_eq!(report.timed_out, 0);
            // Pong received
            viewer.mark_alive();
        }
        assert!(registry.has_consumers(&channel()).await);
    }

    #[tokio::test]
    async fn test_tick_requests_probe() {
        let registry = Arc::new(ChannelRegistry::new());
        let (monitor, _stats) = monitor(&registry);
        let (cam, _rx) = Link::new(registry.next_link_id(), channel(), Role::Producer, 4);
        registry.register_producer(Arc::clone(&cam)).await.unwrap();

        monitor.tick().await;
        tokio::time::timeout(Duration::from_millis(100), cam.probe_requested())
            .await
            .expect("probe should be requested");
    }

    #[tokio::test]
    async fn test_passive_link_dropped_when_queue_closes() {
        let registry = Arc::new(ChannelRegistry::new());
        let (monitor, stats) = monitor(&registry);
        let (mjpeg, rx) = Link::passive(
            registry.next_link_id(),
            channel(),
            Role::Consumer(Delivery::Frames),
            4,
        );
        registry.register_consumer(Arc::clone(&mjpeg)).await.unwrap();

        // Passive links are never probed
        assert_eq!(monitor.tick().await, TickReport::default());
        assert_eq!(monitor.tick().await.timed_out, 0);

        drop(rx);
        assert_eq!(monitor.tick().await.dropped, 1);
        assert!(!registry.has_consumers(&channel()).await);
        assert_eq!(stats.snapshot().transport_evictions, 1);
    }

    #[tokio::test]
    async fn test_spawned_task_ticks_on_interval() {
        let registry = Arc::new(ChannelRegistry::with_config(
            crate::registry::RegistryConfig::default().liveness_interval(Duration::from_millis(40)),
        ));
        let (monitor, _stats) = monitor(&registry);
        let (cam, mut cam_rx) = Link::new(registry.next_link_id(), channel(), Role::Producer, 4);
        registry.register_producer(cam).await.unwrap();

        let handle = Arc::new(monitor).spawn();

        // Evicted after two unanswered periods
        let reason = tokio::time::timeout(Duration::from_secs(2), cam_rx.closed())
            .await
            .expect("link should be evicted");
        assert_eq!(reason, CloseReason::LivenessTimeout);

        handle.abort();
    }
}
