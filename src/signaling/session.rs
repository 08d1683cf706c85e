//! Per-viewer peer session
//!
//! A [`PeerSession`] belongs to exactly one signaling consumer and is dropped
//! with it. It owns that viewer's peer connection (created lazily once both
//! an offer and the channel's video source exist) and buffers whatever
//! arrives before then.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use super::engine::{MediaEngine, PeerConnection, PeerEvent, PeerState, VideoSource};
use super::message::{IceCandidate, SessionDescription, SignalMessage};
use super::source::{self, SourceTable, SourceWatch};
use super::SignalingError;
use crate::registry::{ChannelId, LinkId};

/// Negotiation phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No offer received yet
    Idle,
    /// Offer held until the channel's video source exists
    Pending,
    /// Answer sent; connectivity not yet established
    Negotiating,
    /// The peer connection reported connected
    Connected,
    /// Torn down
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Pending => "pending",
            SessionPhase::Negotiating => "negotiating",
            SessionPhase::Connected => "connected",
            SessionPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// WebRTC negotiation state for one viewer
pub struct PeerSession {
    channel: ChannelId,
    link: LinkId,
    engine: Arc<dyn MediaEngine>,
    events: mpsc::UnboundedSender<PeerEvent>,
    phase: SessionPhase,
    peer: Option<Box<dyn PeerConnection>>,
    pending_offer: Option<SessionDescription>,
    pending_candidates: Vec<IceCandidate>,
    source_watch: Option<SourceWatch>,
}

impl PeerSession {
    /// Create a session and the receiver for its peer events
    pub fn new(
        channel: ChannelId,
        link: LinkId,
        engine: Arc<dyn MediaEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                channel,
                link,
                engine,
                events,
                phase: SessionPhase::Idle,
                peer: None,
                pending_offer: None,
                pending_candidates: Vec::new(),
                source_watch: None,
            },
            events_rx,
        )
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether an offer is waiting for the channel's video source
    pub fn is_pending(&self) -> bool {
        self.phase == SessionPhase::Pending
    }

    /// Candidates received before the peer connection existed
    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Handle one message from the viewer
    ///
    /// Returns the reply to send, if any.
    pub async fn handle(
        &mut self,
        message: SignalMessage,
        sources: &SourceTable,
    ) -> Result<Option<SignalMessage>, SignalingError> {
        if self.phase == SessionPhase::Closed {
            return Err(SignalingError::SessionClosed);
        }

        let mut reply = None;

        if let Some(offer) = message.offer {
            reply = self.on_offer(offer, sources).await?;
        }

        if let Some(candidate) = message.candidate {
            self.on_candidate(candidate).await?;
        }

        if message.answer.is_some() {
            // The relay only answers; it never sends offers
            tracing::debug!(
                channel = %self.channel,
                link = %self.link,
                "Ignoring answer from viewer"
            );
        }

        Ok(reply)
    }

    async fn on_offer(
        &mut self,
        offer: SessionDescription,
        sources: &SourceTable,
    ) -> Result<Option<SignalMessage>, SignalingError> {
        // Renegotiation on an existing connection
        if let Some(ref peer) = self.peer {
            let answer = peer.accept_offer(offer).await?;
            return Ok(Some(SignalMessage::answer(answer)));
        }

        match sources.get(&self.channel).await {
            Some(source) => self.negotiate(source, offer).await.map(Some),
            None => {
                self.pending_offer = Some(offer);
                self.source_watch = Some(sources.watch(&self.channel).await);
                self.phase = SessionPhase::Pending;
                tracing::info!(
                    channel = %self.channel,
                    link = %self.link,
                    "Offer pending: no video source yet"
                );
                Ok(None)
            }
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) -> Result<(), SignalingError> {
        match self.peer {
            Some(ref peer) => peer.add_ice_candidate(candidate).await?,
            None => self.pending_candidates.push(candidate),
        }
        Ok(())
    }

    /// Wait for the channel's source while an offer is pending
    ///
    /// Pends forever when nothing is pending, so it can sit in a `select!`.
    pub async fn source_ready(&mut self) -> Arc<dyn VideoSource> {
        match (self.phase, self.source_watch.as_mut()) {
            (SessionPhase::Pending, Some(watch)) => source::ready(watch).await,
            _ => std::future::pending().await,
        }
    }

    /// Complete a pending offer now that the source exists
    pub async fn resume(
        &mut self,
        source: Arc<dyn VideoSource>,
    ) -> Result<Option<SignalMessage>, SignalingError> {
        self.source_watch = None;

        let offer = match self.pending_offer.take() {
            Some(offer) if self.phase == SessionPhase::Pending => offer,
            _ => return Ok(None),
        };

        tracing::info!(channel = %self.channel, link = %self.link, "Resuming pending offer");
        self.negotiate(source, offer).await.map(Some)
    }

    async fn negotiate(
        &mut self,
        source: Arc<dyn VideoSource>,
        offer: SessionDescription,
    ) -> Result<SignalMessage, SignalingError> {
        let peer = self
            .engine
            .create_peer(&self.channel, source, self.events.clone())
            .await?;

        let answer = match peer.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if let Err(close_err) = peer.close().await {
                    tracing::debug!(error = %close_err, "Peer close after failed negotiation");
                }
                self.phase = SessionPhase::Idle;
                return Err(e.into());
            }
        };

        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::debug!(
                    channel = %self.channel,
                    link = %self.link,
                    error = %e,
                    "Queued candidate rejected"
                );
            }
        }

        self.peer = Some(peer);
        self.phase = SessionPhase::Negotiating;

        tracing::info!(channel = %self.channel, link = %self.link, "Answer created");
        Ok(SignalMessage::answer(answer))
    }

    /// Record a connectivity change reported by the peer connection
    pub fn observe(&mut self, state: PeerState) {
        match state {
            PeerState::Connected if self.phase == SessionPhase::Negotiating => {
                self.phase = SessionPhase::Connected;
                tracing::info!(channel = %self.channel, link = %self.link, "Peer connected");
            }
            PeerState::Failed | PeerState::Disconnected => {
                tracing::warn!(
                    channel = %self.channel,
                    link = %self.link,
                    state = ?state,
                    phase = %self.phase,
                    "Peer connectivity lost"
                );
            }
            _ => {
                tracing::debug!(channel = %self.channel, link = %self.link, state = ?state, "Peer state");
            }
        }
    }

    /// Tear down the session
    ///
    /// Safe in any phase and idempotent; engine errors are logged, not
    /// returned.
    pub async fn close(&mut self) {
        if self.phase == SessionPhase::Closed {
            return;
        }

        let previous = self.phase;
        self.phase = SessionPhase::Closed;
        self.pending_offer = None;
        self.pending_candidates.clear();
        self.source_watch = None;

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::debug!(
                    channel = %self.channel,
                    link = %self.link,
                    error = %e,
                    "Peer close failed"
                );
            }
        }

        tracing::debug!(
            channel = %self.channel,
            link = %self.link,
            previous = %previous,
            "Session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::FakeEngine;
    use super::*;
    use crate::registry::Resolution;

    fn channel() -> ChannelId {
        ChannelId::new("cam-1").unwrap()
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn with_source(engine: &Arc<FakeEngine>, sources: &SourceTable) {
        let engine = Arc::clone(engine);
        sources
            .get_or_try_init(&channel(), || async move {
                engine.create_source(&channel(), Resolution::new(64, 48)).await
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_offer_with_source_answers_immediately() {
        let engine = Arc::new(FakeEngine::default());
        let sources = SourceTable::new();
        with_source(&engine, &sources).await;

        let (mut session, _events) = PeerSession::new(channel(), LinkId(1), engine.clone());
        let reply = session
            .handle(SignalMessage::offer(SessionDescription::offer("remote")), &sources)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.answer.unwrap().sdp, "answer:remote");
        assert_eq!(session.phase(), SessionPhase::Negotiating);
        assert_eq!(engine.peers_created(), 1);
    }

    #[tokio::test]
    async fn test_offer_before_source_stays_pending() {
        let engine = Arc::new(FakeEngine::default());
        let sources = SourceTable::new();

        let (mut session, _events) = PeerSession::new(channel(), LinkId(1), engine.clone());
        let reply = session
            .handle(SignalMessage::offer(SessionDescription::offer("early")), &sources)
            .await
            .unwrap();
        assert!(reply.is_none());
        assert!(session.is_pending());

        // Candidates arriving meanwhile are queued
        session
            .handle(SignalMessage::candidate(candidate(1)), &sources)
            .await
            .unwrap();
        assert_eq!(session.queued_candidates(), 1);
        assert_eq!(engine.peers_created(), 0);

        // First frame creates the source
        with_source(&engine, &sources).await;

        let source = tokio::time::timeout(Duration::from_secs(1), session.source_ready())
            .await
            .unwrap();
        let reply = session.resume(source).await.unwrap().unwrap();

        assert_eq!(reply.answer.unwrap().sdp, "answer:early");
        assert_eq!(session.phase(), SessionPhase::Negotiating);
        assert_eq!(session.queued_candidates(), 0);
        assert_eq!(engine.candidates_applied(), 1);
    }

    #[tokio::test]
    async fn test_candidate_applied_immediately_once_connected() {
        let engine = Arc::new(FakeEngine::default());
        let sources = SourceTable::new();
        with_source(&engine, &sources).await;

        let (mut session, _events) = PeerSession::new(channel(), LinkId(1), engine.clone());
        session
            .handle(SignalMessage::offer(SessionDescription::offer("o")), &sources)
            .await
            .unwrap();
        session
            .handle(SignalMessage::candidate(candidate(2)), &sources)
            .await
            .unwrap();

        assert_eq!(engine.candidates_applied(), 1);
        assert_eq!(session.queued_candidates(), 0);
    }

    #[tokio::test]
    async fn test_local_candidates_are_reported() {
        let engine = Arc::new(FakeEngine::default());
        let sources = SourceTable::new();
        with_source(&engine, &sources).await;

        let (mut session, mut events) = PeerSession::new(channel(), LinkId(1), engine.clone());
        session
            .handle(SignalMessage::offer(SessionDescription::offer("o")), &sources)
            .await
            .unwrap();

        match events.recv().await {
            Some(PeerEvent::LocalCandidate(c)) => assert!(c.candidate.starts_with("candidate:")),
            other => panic!("expected local candidate, got {:?}", other),
        }
        assert_eq!(
            events.recv().await,
            Some(PeerEvent::StateChanged(PeerState::Connected))
        );

        session.observe(PeerState::Connected);
        assert_eq!(session.phase(), SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let engine = Arc::new(FakeEngine::failing_close());
        let sources = SourceTable::new();
        with_source(&engine, &sources).await;

        let (mut session, _events) = PeerSession::new(channel(), LinkId(1), engine.clone());
        session
            .handle(SignalMessage::offer(SessionDescription::offer("o")), &sources)
            .await
            .unwrap();

        session.close().await;
        session.close().await;

        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(engine.peers_closed(), 1);
        assert!(matches!(
            session
                .handle(SignalMessage::candidate(candidate(3)), &sources)
                .await,
            Err(SignalingError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_while_pending() {
        let engine = Arc::new(FakeEngine::default());
        let sources = SourceTable::new();

        let (mut session, _events) = PeerSession::new(channel(), LinkId(1), engine.clone());
        session
            .handle(SignalMessage::offer(SessionDescription::offer("o")), &sources)
            .await
            .unwrap();
        session.close().await;

        // A source appearing later does not revive the session
        with_source(&engine, &sources).await;
        let waited = tokio::time::timeout(Duration::from_millis(50), session.source_ready()).await;
        assert!(waited.is_err());
        assert_eq!(engine.peers_created(), 0);
    }

    #[tokio::test]
    async fn test_failed_negotiation_returns_to_idle() {
        let engine = Arc::new(FakeEngine::rejecting_offers());
        let sources = SourceTable::new();
        with_source(&engine, &sources).await;

        let (mut session, _events) = PeerSession::new(channel(), LinkId(1), engine.clone());
        let result = session
            .handle(SignalMessage::offer(SessionDescription::offer("bad")), &sources)
            .await;

        assert!(matches!(result, Err(SignalingError::Engine(_))));
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(engine.peers_closed(), 1);
    }
}
