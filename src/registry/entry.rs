//! Channel entry and snapshot types
//!
//! This module defines the per-channel state stored in the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::frame::{ChannelId, Frame, Resolution};
use super::link::{Link, LinkId, Notice, Role};

/// State for a single channel: one producer slot and a consumer set
#[derive(Debug)]
pub struct ChannelEntry {
    /// Current producer (at most one)
    producer: Option<Arc<Link>>,

    /// Consumers keyed by link identity
    consumers: HashMap<LinkId, Arc<Link>>,

    /// Most recent accepted frame, for eager catch-up of joining consumers
    latest: Option<Frame>,

    /// Arrival time of the most recent accepted frame
    last_frame_at: Option<Instant>,

    /// Number of frames published on this channel
    frames_published: u64,

    /// When the entry was created
    created_at: Instant,

    /// Set once the entry has been dropped from the registry map
    pub(super) retired: bool,
}

impl ChannelEntry {
    pub(super) fn new() -> Self {
        Self {
            producer: None,
            consumers: HashMap::new(),
            latest: None,
            last_frame_at: None,
            frames_published: 0,
            created_at: Instant::now(),
            retired: false,
        }
    }

    pub fn producer(&self) -> Option<&Arc<Link>> {
        self.producer.as_ref()
    }

    pub fn has_producer(&self) -> bool {
        self.producer.is_some()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Iterate over the current consumers
    pub fn consumers(&self) -> impl Iterator<Item = &Arc<Link>> {
        self.consumers.values()
    }

    /// The cached latest frame, if any
    pub fn latest_frame(&self) -> Option<&Frame> {
        self.latest.as_ref()
    }

    /// Whether the entry has neither producer nor consumers
    pub fn is_vacant(&self) -> bool {
        self.producer.is_none() && self.consumers.is_empty()
    }

    /// Replace the cached latest frame
    ///
    /// Callers hold the entry's write lock, so readers see either the old or
    /// the new frame, never a mix.
    pub(crate) fn store_latest(&mut self, frame: Frame) {
        self.last_frame_at = Some(frame.received_at);
        self.latest = Some(frame);
        self.frames_published += 1;
    }

    /// Install a producer, returning the one it replaces
    pub(super) fn set_producer(&mut self, link: Arc<Link>) -> Option<Arc<Link>> {
        self.producer.replace(link)
    }

    /// Add a consumer; returns `false` if it was already present
    pub(super) fn add_consumer(&mut self, link: Arc<Link>) -> bool {
        if self.consumers.contains_key(&link.id()) {
            return false;
        }
        self.consumers.insert(link.id(), link);
        true
    }

    /// Remove a link by identity; returns its role if it was present
    pub(super) fn remove_link(&mut self, link: &Link) -> Option<Role> {
        match link.role() {
            Role::Producer => {
                let current = self.producer.as_ref().map(|p| p.id());
                if current == Some(link.id()) {
                    self.producer = None;
                    Some(Role::Producer)
                } else {
                    None
                }
            }
            role @ Role::Consumer(_) => self.consumers.remove(&link.id()).map(|_| role),
        }
    }

    /// Drop every link, returning them for closing
    pub(super) fn drain(&mut self) -> Vec<Arc<Link>> {
        let mut links: Vec<Arc<Link>> = self.producer.take().into_iter().collect();
        links.extend(self.consumers.drain().map(|(_, link)| link));
        links
    }

    /// Send a notice to the producer, if one is present
    pub(super) fn notify_producer(&self, notice: Notice) {
        if let Some(ref producer) = self.producer {
            producer.notify(notice);
        }
    }

    /// Send a notice to every consumer
    pub(super) fn notify_consumers(&self, notice: Notice) {
        for consumer in self.consumers.values() {
            consumer.notify(notice);
        }
    }

    /// Build a status snapshot
    pub fn snapshot(&self, channel: &ChannelId) -> ChannelSnapshot {
        ChannelSnapshot {
            channel: channel.clone(),
            has_producer: self.has_producer(),
            consumer_count: self.consumer_count(),
            frames_published: self.frames_published,
            last_frame_age_ms: self
                .last_frame_at
                .map(|at| at.elapsed().as_millis() as u64),
            resolution: self.latest.as_ref().map(|f| f.resolution),
            age_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

/// Point-in-time view of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub channel: ChannelId,
    /// Whether a producer is registered
    pub has_producer: bool,
    /// Number of registered consumers
    pub consumer_count: usize,
    /// Frames published since the channel was created
    pub frames_published: u64,
    /// Milliseconds since the last accepted frame
    pub last_frame_age_ms: Option<u64>,
    /// Resolution of the last accepted frame
    pub resolution: Option<Resolution>,
    /// Seconds since the channel was created
    pub age_secs: u64,
}

impl ChannelSnapshot {
    /// Snapshot for a channel the registry does not know
    pub fn absent(channel: &ChannelId) -> Self {
        Self {
            channel: channel.clone(),
            has_producer: false,
            consumer_count: 0,
            frames_published: 0,
            last_frame_age_ms: None,
            resolution: None,
            age_secs: 0,
        }
    }

    /// Whether any consumer is present
    pub fn has_consumers(&self) -> bool {
        self.consumer_count > 0
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::registry::link::Delivery;

    fn channel() -> ChannelId {
        ChannelId::new("cam-1").unwrap()
    }

    #[test]
    fn test_remove_checks_identity() {
        let mut entry = ChannelEntry::new();
        let (old, _old_rx) = Link::new(LinkId(1), channel(), Role::Producer, 1);
        let (new, _new_rx) = Link::new(LinkId(2), channel(), Role::Producer, 1);

        entry.set_producer(old.clone());
        entry.set_producer(new.clone());

        // The replaced producer is no longer the one in the slot
        assert_eq!(entry.remove_link(&old), None);
        assert!(entry.has_producer());
        assert_eq!(entry.remove_link(&new), Some(Role::Producer));
        assert!(!entry.has_producer());
    }

    #[test]
    fn test_consumer_set_unique() {
        let mut entry = ChannelEntry::new();
        let (viewer, _rx) = Link::new(LinkId(5), channel(), Role::Consumer(Delivery::Frames), 1);

        assert!(entry.add_consumer(viewer.clone()));
        assert!(!entry.add_consumer(viewer.clone()));
        assert_eq!(entry.consumer_count(), 1);

        assert!(entry.remove_link(&viewer).is_some());
        assert!(entry.remove_link(&viewer).is_none());
        assert!(entry.is_vacant());
    }

    #[test]
    fn test_latest_frame_snapshot() {
        let mut entry = ChannelEntry::new();
        let frame = Frame::encoded(Bytes::from_static(&[0xFF, 0xD8]), Resolution::new(320, 240));

        entry.store_latest(frame);

        let snap = entry.snapshot(&channel());
        assert_eq!(snap.frames_published, 1);
        assert_eq!(snap.resolution, Some(Resolution::new(320, 240)));
        assert!(snap.last_frame_age_ms.is_some());
        assert!(!snap.has_consumers());
    }
}
