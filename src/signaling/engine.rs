//! Media engine seam
//!
//! The coordinator drives WebRTC only through these traits. The production
//! implementation lives in `crate::rtc`; tests plug in a fake.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::message::{IceCandidate, SessionDescription};
use crate::registry::{ChannelId, DecodedFrame, Resolution};

/// Error reported by the media engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("failed to create video source: {0}")]
    Source(String),

    #[error("failed to create peer connection: {0}")]
    Peer(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("invalid ICE candidate: {0}")]
    Candidate(String),

    #[error("video source closed")]
    SourceClosed,
}

/// Connectivity state reported by a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notification from a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally gathered candidate to push to the viewer
    LocalCandidate(IceCandidate),
    /// The connection's connectivity state changed
    StateChanged(PeerState),
}

/// Shared per-channel video source fed with decoded frames
pub trait VideoSource: Any + Send + Sync {
    /// Resolution the source was created with
    fn resolution(&self) -> Resolution;

    /// Hand a decoded frame to the source without blocking
    ///
    /// [`EngineError::SourceClosed`] means the source is dead and should be
    /// replaced.
    fn push_frame(&self, frame: &DecodedFrame) -> Result<(), EngineError>;

    /// Recover the concrete source, so an engine can use the sources it made
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// One viewer's peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Apply a remote offer and produce the local answer
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, EngineError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Stop the media track and tear the connection down
    async fn close(&self) -> Result<(), EngineError>;
}

/// Factory for video sources and peer connections
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Create the shared source for a channel
    async fn create_source(
        &self,
        channel: &ChannelId,
        resolution: Resolution,
    ) -> Result<Arc<dyn VideoSource>, EngineError>;

    /// Create a peer connection carrying one track from `source`
    ///
    /// `source` is always one this engine created. Local candidates and state
    /// changes are reported on `events`.
    async fn create_peer(
        &self,
        channel: &ChannelId,
        source: Arc<dyn VideoSource>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, EngineError>;
}
