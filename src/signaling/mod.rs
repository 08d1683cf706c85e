//! Signaling coordinator for WebRTC distribution
//!
//! Every accepted frame of a channel feeds one shared [`VideoSource`],
//! created from the channel's first frame regardless of how many viewers
//! exist. Each signaling consumer gets its own [`PeerSession`] and peer
//! connection carrying a track from that source.
//!
//! ```text
//!  producer ──► FramePipeline ──► coordinator.on_frame() ──► VideoSource
//!                                                               │
//!                                 ┌─────────────────────────────┼──────┐
//!                                 ▼                             ▼      ▼
//!                           PeerSession (viewer 1)      PeerSession  ...
//!                           offer → answer, ICE
//! ```

pub mod engine;
pub mod message;
pub mod session;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use crate::registry::{ChannelId, Frame, LinkId};

pub use engine::{EngineError, MediaEngine, PeerConnection, PeerEvent, PeerState, VideoSource};
pub use message::{IceCandidate, SessionDescription, SignalMessage};
pub use session::{PeerSession, SessionPhase};
pub use source::{SourceTable, SourceWatch};

/// Error type for signaling operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    /// The viewer sent something that is not a signaling message
    #[error("invalid signaling message: {0}")]
    InvalidMessage(String),

    /// The session was already torn down
    #[error("session closed")]
    SessionClosed,

    /// A frame without decoded pixels reached the video source
    #[error("frame has no decoded picture")]
    NotDecoded,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Binds channels to their shared source and creates viewer sessions
pub struct SignalingCoordinator {
    engine: Arc<dyn MediaEngine>,
    sources: SourceTable,
}

impl SignalingCoordinator {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            sources: SourceTable::new(),
        }
    }

    pub fn sources(&self) -> &SourceTable {
        &self.sources
    }

    /// Feed an accepted frame into the channel's shared source
    ///
    /// The first frame of a channel creates the source, which wakes every
    /// session holding a pending offer.
    pub async fn on_frame(&self, channel: &ChannelId, frame: &Frame) -> Result<(), SignalingError> {
        let decoded = frame.decoded.as_ref().ok_or(SignalingError::NotDecoded)?;

        let engine = Arc::clone(&self.engine);
        let resolution = decoded.resolution;
        let (source, created) = self
            .sources
            .get_or_try_init(channel, || async move {
                engine.create_source(channel, resolution).await
            })
            .await?;

        if created {
            tracing::info!(
                channel = %channel,
                resolution = %resolution,
                "Video source created"
            );
        }

        match source.push_frame(decoded) {
            Err(EngineError::SourceClosed) => {
                // Replaced by the next frame
                if self.sources.discard(channel, &source).await {
                    tracing::warn!(channel = %channel, "Video source died; discarded");
                }
                Err(EngineError::SourceClosed.into())
            }
            result => result.map_err(SignalingError::from),
        }
    }

    /// Release a channel's source once the channel is gone
    pub async fn retire(&self, channel: &ChannelId) {
        if self.sources.retire(channel).await {
            tracing::info!(channel = %channel, "Video source retired");
        }
    }

    /// Close a session and drop its interest in the channel's source
    pub async fn end_session(&self, session: &mut PeerSession) {
        session.close().await;
        self.sources.prune(session.channel()).await;
    }

    /// Start a session for a new signaling consumer
    pub fn session(
        &self,
        channel: &ChannelId,
        link: LinkId,
    ) -> (PeerSession, tokio::sync::mpsc::UnboundedReceiver<PeerEvent>) {
        PeerSession::new(channel.clone(), link, Arc::clone(&self.engine))
    }
}
