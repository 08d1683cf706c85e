//! Broadcast relay
//!
//! Fans an accepted frame out to every frame-consuming link of a channel.
//! Delivery never blocks: each consumer has a bounded queue, a full queue
//! means that consumer misses the frame, and a closed queue gets the consumer
//! removed. Neither outcome affects the other consumers.

use std::sync::Arc;

use crate::registry::{ChannelId, ChannelRegistry, Frame, Link, Outbound, RemovalCause, SendFailure};

/// Outcome of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Consumers the frame was queued for
    pub delivered: usize,
    /// Consumers whose queue was full
    pub missed: usize,
    /// Consumers removed because their transport is gone
    pub evicted: usize,
}

/// Raw-mode distributor over the channel registry
pub struct BroadcastRelay {
    registry: Arc<ChannelRegistry>,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    /// Store `frame` as the channel's latest and queue it for each consumer
    ///
    /// The latest-frame swap and the fan-out happen under the same channel
    /// lock, so a consumer registering concurrently gets the frame either via
    /// catch-up or via this publish, never both and never neither. Since one
    /// producer task calls this sequentially, consumers see frames in order.
    pub async fn publish(&self, channel: &ChannelId, frame: Frame) -> PublishReport {
        let mut report = PublishReport::default();

        let entry_arc = match self.registry.entry(channel).await {
            Some(entry) => entry,
            None => return report,
        };

        let dead: Vec<Arc<Link>> = {
            let mut entry = entry_arc.write().await;
            let data = frame.data.clone();
            let len = frame.len();
            entry.store_latest(frame);

            let mut dead = Vec::new();
            for consumer in entry.consumers().filter(|c| c.role().wants_frames()) {
                match consumer.try_send(Outbound::Frame(data.clone())) {
                    Ok(()) => {
                        consumer.stats().record_sent(len);
                        report.delivered += 1;
                    }
                    Err(SendFailure::Full) => {
                        consumer.stats().record_missed();
                        report.missed += 1;
                    }
                    Err(SendFailure::Closed) => dead.push(Arc::clone(consumer)),
                }
            }
            dead
        };

        for consumer in dead {
            if self
                .registry
                .remove(&consumer, RemovalCause::Transport)
                .await
                .is_some()
            {
                report.evicted += 1;
            }
        }

        if report.missed > 0 || report.evicted > 0 {
            tracing::debug!(
                channel = %channel,
                delivered = report.delivered,
                missed = report.missed,
                evicted = report.evicted,
                "Frame partially delivered"
            );
        }

        report
    }
}
