//! Counters for links, the frame pipeline, and the relay as a whole
//!
//! Counters are plain atomics updated on the hot path; `snapshot()` methods
//! produce serializable copies for the status endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-link delivery counters
#[derive(Debug, Default)]
pub struct LinkStats {
    frames_sent: AtomicU64,
    frames_missed: AtomicU64,
    bytes_sent: AtomicU64,
}

impl LinkStats {
    /// Record a frame queued for this link
    pub fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a frame this link missed because its queue was full
    pub fn record_missed(&self) {
        self.frames_missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_missed(&self) -> u64 {
        self.frames_missed.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

/// Frame pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    accepted: AtomicU64,
    bytes_accepted: AtomicU64,
    rejected_too_small: AtomicU64,
    rejected_decode: AtomicU64,
    rejected_malformed: AtomicU64,
}

/// Serializable copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub accepted: u64,
    pub bytes_accepted: u64,
    pub rejected_too_small: u64,
    pub rejected_decode: u64,
    pub rejected_malformed: u64,
}

impl PipelineSnapshot {
    /// Total rejected frames across all reasons
    pub fn rejected(&self) -> u64 {
        self.rejected_too_small + self.rejected_decode + self.rejected_malformed
    }
}

impl PipelineStats {
    pub fn record_accepted(&self, bytes: usize) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.bytes_accepted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_too_small(&self) {
        self.rejected_too_small.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failed(&self) {
        self.rejected_decode.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.rejected_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            bytes_accepted: self.bytes_accepted.load(Ordering::Relaxed),
            rejected_too_small: self.rejected_too_small.load(Ordering::Relaxed),
            rejected_decode: self.rejected_decode.load(Ordering::Relaxed),
            rejected_malformed: self.rejected_malformed.load(Ordering::Relaxed),
        }
    }
}

/// Server-wide connection counters
#[derive(Debug, Default)]
pub struct RelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    auth_failures: AtomicU64,
    rejected_targets: AtomicU64,
    liveness_evictions: AtomicU64,
    transport_evictions: AtomicU64,
}

/// Serializable copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelaySnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub auth_failures: u64,
    pub rejected_targets: u64,
    pub liveness_evictions: u64,
    pub transport_evictions: u64,
}

impl RelayStats {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: never wraps below zero
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn auth_failed(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_rejected(&self) {
        self.rejected_targets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn liveness_evicted(&self, count: usize) {
        self.liveness_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn transport_evicted(&self, count: usize) {
        self.transport_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            rejected_targets: self.rejected_targets.load(Ordering::Relaxed),
            liveness_evictions: self.liveness_evictions.load(Ordering::Relaxed),
            transport_evictions: self.transport_evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_stats() {
        let stats = LinkStats::default();
        stats.record_sent(1000);
        stats.record_sent(500);
        stats.record_missed();

        assert_eq!(stats.frames_sent(), 2);
        assert_eq!(stats.bytes_sent(), 1500);
        assert_eq!(stats.frames_missed(), 1);
    }

    #[test]
    fn test_pipeline_snapshot() {
        let stats = PipelineStats::default();
        stats.record_accepted(4096);
        stats.record_too_small();
        stats.record_too_small();
        stats.record_decode_failed();
        stats.record_malformed();

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.bytes_accepted, 4096);
        assert_eq!(snap.rejected_too_small, 2);
        assert_eq!(snap.rejected(), 4);
    }

    #[test]
    fn test_active_connections_never_negative() {
        let stats = RelayStats::default();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 1);
        assert_eq!(snap.active_connections, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = RelayStats::default();
        stats.liveness_evicted(2);

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["liveness_evictions"], 2);
    }
}
