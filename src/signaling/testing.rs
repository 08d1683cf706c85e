//! In-memory media engine for unit tests

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::engine::{EngineError, MediaEngine, PeerConnection, PeerEvent, PeerState, VideoSource};
use super::message::{IceCandidate, SessionDescription};
use crate::registry::{ChannelId, DecodedFrame, Resolution};

pub(crate) struct FakeSource {
    resolution: Resolution,
    frames: AtomicUsize,
    closed: AtomicBool,
}

impl VideoSource for FakeSource {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn push_frame(&self, _frame: &DecodedFrame) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngineError::SourceClosed);
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl FakeSource {
    /// Make every later push fail as if the encoder died
    pub(crate) fn kill(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Counters {
    peers_created: AtomicUsize,
    peers_closed: AtomicUsize,
    candidates: AtomicUsize,
}

#[derive(Default)]
pub(crate) struct FakeEngine {
    reject_offers: bool,
    fail_close: bool,
    sources: Mutex<Vec<Arc<FakeSource>>>,
    counters: Arc<Counters>,
}

impl FakeEngine {
    pub(crate) fn rejecting_offers() -> Self {
        Self {
            reject_offers: true,
            ..Default::default()
        }
    }

    pub(crate) fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Default::default()
        }
    }

    pub(crate) fn sources_created(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    pub(crate) fn source(&self, n: usize) -> Option<Arc<FakeSource>> {
        self.sources.lock().unwrap().get(n).cloned()
    }

    pub(crate) fn frames_pushed(&self) -> usize {
        self.sources
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.frames.load(Ordering::Relaxed))
            .sum()
    }

    pub(crate) fn peers_created(&self) -> usize {
        self.counters.peers_created.load(Ordering::Relaxed)
    }

    pub(crate) fn peers_closed(&self) -> usize {
        self.counters.peers_closed.load(Ordering::Relaxed)
    }

    pub(crate) fn candidates_applied(&self) -> usize {
        self.counters.candidates.load(Ordering::Relaxed)
    }
}

struct FakePeer {
    reject_offers: bool,
    fail_close: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
    counters: Arc<Counters>,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        if self.reject_offers {
            return Err(EngineError::Negotiation("offer rejected".into()));
        }

        let _ = self.events.send(PeerEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        let _ = self
            .events
            .send(PeerEvent::StateChanged(PeerState::Connected));

        Ok(SessionDescription::answer(format!("answer:{}", offer.sdp)))
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), EngineError> {
        self.counters.candidates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.counters.peers_closed.fetch_add(1, Ordering::Relaxed);
        if self.fail_close {
            return Err(EngineError::Peer("already gone".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_source(
        &self,
        _channel: &ChannelId,
        resolution: Resolution,
    ) -> Result<Arc<dyn VideoSource>, EngineError> {
        let source = Arc::new(FakeSource {
            resolution,
            frames: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        self.sources.lock().unwrap().push(Arc::clone(&source));
        Ok(source)
    }

    async fn create_peer(
        &self,
        _channel: &ChannelId,
        source: Arc<dyn VideoSource>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, EngineError> {
        source
            .into_any()
            .downcast::<FakeSource>()
            .map_err(|_| EngineError::Peer("source from another engine".into()))?;
        self.counters.peers_created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FakePeer {
            reject_offers: self.reject_offers,
            fail_close: self.fail_close,
            events,
            counters: Arc::clone(&self.counters),
        }))
    }
}
