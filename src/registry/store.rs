//! Channel registry implementation
//!
//! The central registry that binds one producer per channel to its consumers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::config::RegistryConfig;
use super::entry::{ChannelEntry, ChannelSnapshot};
use super::error::RegistryError;
use super::frame::ChannelId;
use super::link::{CloseReason, Link, LinkId, Notice, Outbound, Role};

/// Result of registering a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRegistration {
    /// Producer that was replaced and closed, if any
    pub replaced: Option<LinkId>,
    /// Consumers present at registration time
    pub consumers: usize,
}

/// Result of registering a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    /// Whether the channel currently has a producer
    pub has_producer: bool,
    /// Consumer count including the new one
    pub consumers: usize,
    /// Whether the cached latest frame was queued for the new consumer
    pub caught_up: bool,
}

/// Why a link is being removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// The transport closed cleanly
    Closed,
    /// A read or write on the transport failed
    Transport,
    /// The link missed a liveness probe
    LivenessTimeout,
    /// Server shutdown
    Shutdown,
}

/// Outcome of removing a link that was registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub channel: ChannelId,
    pub link: LinkId,
    pub role: Role,
    /// Whether the removed link was the channel's producer
    pub was_producer: bool,
    /// Consumers left on the channel after removal
    pub remaining_consumers: usize,
    pub cause: RemovalCause,
}

/// Central registry for all channels
///
/// Thread-safe via `RwLock`: the map lock is held only to find or create an
/// entry, and every mutation of a channel happens under that channel's own
/// write lock, which linearizes register/remove/publish per channel.
pub struct ChannelRegistry {
    /// Map of channel id to channel entry
    channels: RwLock<HashMap<ChannelId, Arc<RwLock<ChannelEntry>>>>,

    /// Configuration
    config: RegistryConfig,

    /// Set once shutdown starts; registrations fail afterwards
    closing: AtomicBool,

    /// Source of link ids
    next_link_id: AtomicU64,
}

impl ChannelRegistry {
    /// Create a new registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
            closing: AtomicBool::new(false),
            next_link_id: AtomicU64::new(1),
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Allocate a fresh link id
    pub fn next_link_id(&self) -> LinkId {
        LinkId(self.next_link_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether shutdown has started
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Look up a channel entry
    pub(crate) async fn entry(&self, id: &ChannelId) -> Option<Arc<RwLock<ChannelEntry>>> {
        self.channels.read().await.get(id).cloned()
    }

    async fn entry_or_create(&self, id: &ChannelId) -> Arc<RwLock<ChannelEntry>> {
        if let Some(entry) = self.entry(id).await {
            return entry;
        }

        let mut channels = self.channels.write().await;
        Arc::clone(channels.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(channel = %id, "Channel created");
            Arc::new(RwLock::new(ChannelEntry::new()))
        }))
    }

    /// Register a producer for its channel
    ///
    /// Any existing producer is closed with [`CloseReason::Replaced`] and
    /// replaced. The channel is created if it does not exist.
    pub async fn register_producer(
        &self,
        link: Arc<Link>,
    ) -> Result<ProducerRegistration, RegistryError> {
        if !link.role().is_producer() {
            return Err(RegistryError::RoleMismatch {
                link: link.id(),
                expected: "producer",
                actual: link.role(),
            });
        }

        loop {
            if self.is_closing() {
                return Err(RegistryError::ShuttingDown);
            }

            let entry_arc = self.entry_or_create(link.channel()).await;
            let mut entry = entry_arc.write().await;

            if entry.retired {
                // Removed from the map between lookup and lock; look again
                continue;
            }
            if self.is_closing() {
                return Err(RegistryError::ShuttingDown);
            }
            if entry.producer().map(|p| p.id()) == Some(link.id()) {
                return Err(RegistryError::AlreadyRegistered {
                    link: link.id(),
                    channel: link.channel().clone(),
                });
            }

            let replaced = entry.set_producer(Arc::clone(&link)).map(|old| {
                old.close(CloseReason::Replaced);
                tracing::info!(
                    channel = %link.channel(),
                    old = %old.id(),
                    new = %link.id(),
                    "Producer replaced"
                );
                old.id()
            });

            let consumers = entry.consumer_count();
            if consumers > 0 && self.config.notices_enabled {
                link.notify(Notice::ViewerOn);
            }

            tracing::info!(
                channel = %link.channel(),
                link = %link.id(),
                consumers = consumers,
                "Producer registered"
            );

            return Ok(ProducerRegistration {
                replaced,
                consumers,
            });
        }
    }

    /// Register a consumer for its channel
    ///
    /// The channel is created if it does not exist. When the channel has a
    /// producer and a cached frame, that frame is queued for the consumer
    /// before any later publish can reach it.
    pub async fn register_consumer(
        &self,
        link: Arc<Link>,
    ) -> Result<ConsumerRegistration, RegistryError> {
        if link.role().is_producer() {
            return Err(RegistryError::RoleMismatch {
                link: link.id(),
                expected: "consumer",
                actual: link.role(),
            });
        }

        loop {
            if self.is_closing() {
                return Err(RegistryError::ShuttingDown);
            }

            let entry_arc = self.entry_or_create(link.channel()).await;
            let mut entry = entry_arc.write().await;

            if entry.retired {
                continue;
            }
            if self.is_closing() {
                return Err(RegistryError::ShuttingDown);
            }
            if !entry.add_consumer(Arc::clone(&link)) {
                return Err(RegistryError::AlreadyRegistered {
                    link: link.id(),
                    channel: link.channel().clone(),
                });
            }

            let consumers = entry.consumer_count();
            let has_producer = entry.has_producer();

            if self.config.notices_enabled {
                if consumers == 1 {
                    entry.notify_producer(Notice::ViewerOn);
                }
                if !has_producer {
                    link.notify(Notice::ProducerOffline);
                }
            }

            let mut caught_up = false;
            if has_producer && self.config.catchup_enabled && link.role().wants_frames() {
                if let Some(frame) = entry.latest_frame() {
                    if link.try_send(Outbound::Frame(frame.data.clone())).is_ok() {
                        link.stats().record_sent(frame.len());
                        caught_up = true;
                    }
                }
            }

            tracing::info!(
                channel = %link.channel(),
                link = %link.id(),
                role = %link.role(),
                consumers = consumers,
                caught_up = caught_up,
                "Consumer registered"
            );

            return Ok(ConsumerRegistration {
                has_producer,
                consumers,
                caught_up,
            });
        }
    }

    /// Remove a link from whichever role it holds
    ///
    /// Idempotent: returns `None` if the link is not (or no longer) registered,
    /// and only the call that actually removes it emits notices.
    pub async fn remove(&self, link: &Link, cause: RemovalCause) -> Option<Removal> {
        let entry_arc = self.entry(link.channel()).await?;

        let (removal, vacant) = {
            let mut entry = entry_arc.write().await;
            let role = entry.remove_link(link)?;
            let remaining_consumers = entry.consumer_count();

            if self.config.notices_enabled {
                match role {
                    Role::Producer => entry.notify_consumers(Notice::ProducerOffline),
                    Role::Consumer(_) if remaining_consumers == 0 => {
                        entry.notify_producer(Notice::ViewerOff)
                    }
                    Role::Consumer(_) => {}
                }
            }

            let removal = Removal {
                channel: link.channel().clone(),
                link: link.id(),
                role,
                was_producer: role.is_producer(),
                remaining_consumers,
                cause,
            };
            (removal, entry.is_vacant())
        };

        match cause {
            RemovalCause::LivenessTimeout => tracing::warn!(
                channel = %removal.channel,
                link = %removal.link,
                role = %removal.role,
                "Link evicted: liveness timeout"
            ),
            _ => tracing::info!(
                channel = %removal.channel,
                link = %removal.link,
                role = %removal.role,
                cause = ?cause,
                remaining_consumers = removal.remaining_consumers,
                "Link removed"
            ),
        }

        if vacant {
            self.retire_if_vacant(link.channel(), &entry_arc).await;
        }

        Some(removal)
    }

    /// Drop a vacant channel from the map
    async fn retire_if_vacant(&self, id: &ChannelId, entry_arc: &Arc<RwLock<ChannelEntry>>) {
        let mut channels = self.channels.write().await;

        let same = channels
            .get(id)
            .map(|current| Arc::ptr_eq(current, entry_arc))
            .unwrap_or(false);
        if !same {
            return;
        }

        let mut entry = entry_arc.write().await;
        if entry.is_vacant() {
            entry.retired = true;
            channels.remove(id);
            tracing::debug!(channel = %id, "Channel removed");
        }
    }

    /// Get a channel snapshot (absent channels report no producer, no consumers)
    pub async fn snapshot(&self, id: &ChannelId) -> ChannelSnapshot {
        match self.entry(id).await {
            Some(entry_arc) => entry_arc.read().await.snapshot(id),
            None => ChannelSnapshot::absent(id),
        }
    }

    /// Check whether any consumer is present on a channel
    pub async fn has_consumers(&self, id: &ChannelId) -> bool {
        self.snapshot(id).await.has_consumers()
    }

    /// Check whether a channel has a producer
    pub async fn has_producer(&self, id: &ChannelId) -> bool {
        self.snapshot(id).await.has_producer
    }

    /// Every registered link, producers and consumers
    pub async fn links(&self) -> Vec<Arc<Link>> {
        let entries: Vec<_> = self.channels.read().await.values().cloned().collect();

        let mut links = Vec::new();
        for entry_arc in entries {
            let entry = entry_arc.read().await;
            links.extend(entry.producer().cloned());
            links.extend(entry.consumers().cloned());
        }
        links
    }

    /// Get total number of channels
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Close every link and refuse further registrations
    ///
    /// Returns the number of links closed.
    pub async fn close_all(&self) -> usize {
        self.closing.store(true, Ordering::SeqCst);

        let mut channels = self.channels.write().await;
        let mut closed = 0;

        for (id, entry_arc) in channels.drain() {
            let mut entry = entry_arc.write().await;
            entry.retired = true;

            for link in entry.drain() {
                link.close(CloseReason::Shutdown);
                closed += 1;
            }
            tracing::debug!(channel = %id, "Channel closed for shutdown");
        }

        tracing::info!(links = closed, "Registry closed");
        closed
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::registry::frame::{Frame, Resolution};
    use crate::registry::link::{Delivery, LinkReceiver};

    fn channel(id: &str) -> ChannelId {
        ChannelId::new(id).unwrap()
    }

    fn producer(registry: &ChannelRegistry, id: &str) -> (Arc<Link>, LinkReceiver) {
        Link::new(registry.next_link_id(), channel(id), Role::Producer, 8)
    }

    fn viewer(registry: &ChannelRegistry, id: &str) -> (Arc<Link>, LinkReceiver) {
        Link::new(
            registry.next_link_id(),
            channel(id),
            Role::Consumer(Delivery::Frames),
            8,
        )
    }

    async fn next_notice(rx: &mut LinkReceiver) -> Option<Notice> {
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(Outbound::Notice(notice))) => Some(notice),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_register_producer() {
        let registry = ChannelRegistry::new();
        let (cam, _rx) = producer(&registry, "cam-1");

        let reg = registry.register_producer(cam).await.unwrap();
        assert_eq!(reg.replaced, None);
        assert_eq!(reg.consumers, 0);
        assert!(registry.has_producer(&channel("cam-1")).await);
    }

    #[tokio::test]
    async fn test_second_producer_replaces_and_closes_first() {
        let registry = ChannelRegistry::new();
        let (first, mut first_rx) = producer(&registry, "cam-1");
        let (second, _second_rx) = producer(&registry, "cam-1");

        registry.register_producer(first.clone()).await.unwrap();
        let reg = registry.register_producer(second.clone()).await.unwrap();

        assert_eq!(reg.replaced, Some(first.id()));
        assert_eq!(first_rx.closed().await, CloseReason::Replaced);
        assert_eq!(second.close_reason(), None);

        // Exactly one producer remains, and it is the new one
        let entry = registry.entry(&channel("cam-1")).await.unwrap();
        assert_eq!(entry.read().await.producer().unwrap().id(), second.id());

        // The stale producer's own close does not disturb the channel
        assert!(registry.remove(&first, RemovalCause::Closed).await.is_none());
        assert!(registry.has_producer(&channel("cam-1")).await);
    }

    #[tokio::test]
    async fn test_consumer_catchup_requires_producer() {
        let registry = ChannelRegistry::new();
        let (cam, _cam_rx) = producer(&registry, "cam-1");
        registry.register_producer(cam).await.unwrap();

        {
            let entry = registry.entry(&channel("cam-1")).await.unwrap();
            entry.write().await.store_latest(Frame::encoded(
                Bytes::from_static(b"jpeg-bytes"),
                Resolution::new(2, 2),
            ));
        }

        let (v, mut v_rx) = viewer(&registry, "cam-1");
        let reg = registry.register_consumer(v).await.unwrap();
        assert!(reg.caught_up);
        assert!(reg.has_producer);

        match v_rx.recv().await {
            Some(Outbound::Frame(data)) => assert_eq!(&data[..], b"jpeg-bytes"),
            other => panic!("expected catch-up frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_consumer_without_producer_gets_offline_notice() {
        let registry = ChannelRegistry::new();
        let (v, mut v_rx) = viewer(&registry, "cam-9");

        let reg = registry.register_consumer(v).await.unwrap();
        assert!(!reg.has_producer);
        assert!(!reg.caught_up);
        assert_eq!(next_notice(&mut v_rx).await, Some(Notice::ProducerOffline));
    }

    #[tokio::test]
    async fn test_viewer_on_off_notices() {
        let registry = ChannelRegistry::new();
        let (cam, mut cam_rx) = producer(&registry, "cam-1");
        registry.register_producer(cam).await.unwrap();

        let (v1, _v1_rx) = viewer(&registry, "cam-1");
        let (v2, _v2_rx) = viewer(&registry, "cam-1");
        registry.register_consumer(v1.clone()).await.unwrap();
        registry.register_consumer(v2.clone()).await.unwrap();

        // Only the first join is announced
        assert_eq!(next_notice(&mut cam_rx).await, Some(Notice::ViewerOn));
        assert_eq!(next_notice(&mut cam_rx).await, None);

        registry.remove(&v1, RemovalCause::Closed).await.unwrap();
        assert_eq!(next_notice(&mut cam_rx).await, None);

        let removal = registry.remove(&v2, RemovalCause::Closed).await.unwrap();
        assert_eq!(removal.remaining_consumers, 0);
        assert_eq!(next_notice(&mut cam_rx).await, Some(Notice::ViewerOff));
    }

    #[tokio::test]
    async fn test_producer_registration_with_waiting_viewers() {
        let registry = ChannelRegistry::new();
        let (v, _v_rx) = viewer(&registry, "cam-1");
        registry.register_consumer(v).await.unwrap();

        let (cam, mut cam_rx) = producer(&registry, "cam-1");
        let reg = registry.register_producer(cam).await.unwrap();

        assert_eq!(reg.consumers, 1);
        assert_eq!(next_notice(&mut cam_rx).await, Some(Notice::ViewerOn));
    }

    #[tokio::test]
    async fn test_producer_removal_notifies_each_consumer_once() {
        let registry = ChannelRegistry::new();
        let (cam, _cam_rx) = producer(&registry, "cam-1");
        registry.register_producer(cam.clone()).await.unwrap();

        let (v1, mut v1_rx) = viewer(&registry, "cam-1");
        let (v2, mut v2_rx) = viewer(&registry, "cam-1");
        registry.register_consumer(v1).await.unwrap();
        registry.register_consumer(v2).await.unwrap();

        let removal = registry.remove(&cam, RemovalCause::Closed).await.unwrap();
        assert!(removal.was_producer);
        assert_eq!(removal.remaining_consumers, 2);

        // Second removal is a no-op
        assert!(registry.remove(&cam, RemovalCause::LivenessTimeout).await.is_none());

        for rx in [&mut v1_rx, &mut v2_rx] {
            assert_eq!(next_notice(rx).await, Some(Notice::ProducerOffline));
            assert_eq!(next_notice(rx).await, None);
        }

        let snap = registry.snapshot(&channel("cam-1")).await;
        assert!(!snap.has_producer);
        assert_eq!(snap.consumer_count, 2);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ChannelRegistry::new();
        let (v, _rx) = viewer(&registry, "cam-1");
        registry.register_consumer(v.clone()).await.unwrap();

        assert!(registry.remove(&v, RemovalCause::Closed).await.is_some());
        assert!(registry.remove(&v, RemovalCause::Closed).await.is_none());

        let snap = registry.snapshot(&channel("cam-1")).await;
        assert_eq!(snap.consumer_count, 0);
    }

    #[tokio::test]
    async fn test_vacant_channel_is_retired() {
        let registry = ChannelRegistry::new();
        let (cam, _rx) = producer(&registry, "cam-1");
        registry.register_producer(cam.clone()).await.unwrap();
        assert_eq!(registry.channel_count().await, 1);

        registry.remove(&cam, RemovalCause::Closed).await.unwrap();
        assert_eq!(registry.channel_count().await, 0);

        // A later registration recreates the channel
        let (again, _rx2) = producer(&registry, "cam-1");
        registry.register_producer(again).await.unwrap();
        assert_eq!(registry.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_role_mismatch() {
        let registry = ChannelRegistry::new();
        let (v, _rx) = viewer(&registry, "cam-1");

        let result = registry.register_producer(v).await;
        assert!(matches!(result, Err(RegistryError::RoleMismatch { .. })));
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_all_blocks_registration() {
        let registry = ChannelRegistry::new();
        let (cam, mut cam_rx) = producer(&registry, "cam-1");
        let (v, mut v_rx) = viewer(&registry, "cam-2");
        registry.register_producer(cam).await.unwrap();
        registry.register_consumer(v).await.unwrap();

        assert_eq!(registry.close_all().await, 2);
        assert_eq!(cam_rx.closed().await, CloseReason::Shutdown);
        assert_eq!(v_rx.closed().await, CloseReason::Shutdown);
        assert_eq!(registry.links().await.len(), 0);

        let (late, _late_rx) = producer(&registry, "cam-3");
        assert_eq!(
            registry.register_producer(late).await,
            Err(RegistryError::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn test_concurrent_joins_and_leaves() {
        let registry = Arc::new(ChannelRegistry::new());
        let (cam, _cam_rx) = producer(&registry, "cam-1");
        registry.register_producer(cam).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (v, _rx) = viewer(&registry, "cam-1");
                registry.register_consumer(v.clone()).await.unwrap();
                tokio::task::yield_now().await;
                registry.remove(&v, RemovalCause::Closed).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let snap = registry.snapshot(&channel("cam-1")).await;
        assert!(snap.has_producer);
        assert_eq!(snap.consumer_count, 0);
    }
}
