//! Producer and consumer links
//!
//! A [`Link`] is the registry's view of one transport connection. The
//! connection task keeps the matching [`LinkReceiver`] and drains it onto the
//! socket; everything else talks to the connection only through the link.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify};

use super::frame::ChannelId;
use crate::stats::LinkStats;

/// Unique identifier of a link (one per accepted connection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a consumer receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Encoded frames, forwarded unmodified
    Frames,
    /// JSON signaling only; media flows over a negotiated track
    Signaling,
}

/// Role of a link within its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer(Delivery),
}

impl Role {
    pub fn is_producer(&self) -> bool {
        matches!(self, Role::Producer)
    }

    /// Whether published frames should be written to this link
    pub fn wants_frames(&self) -> bool {
        matches!(self, Role::Consumer(Delivery::Frames))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer(Delivery::Frames) => f.write_str("consumer"),
            Role::Consumer(Delivery::Signaling) => f.write_str("consumer/webrtc"),
        }
    }
}

/// How the liveness monitor checks a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Ping/pong probes; a missed pong evicts the link
    Probed,
    /// No probe channel; the link is evicted once its outbound queue closes
    Passive,
}

/// Status notices exchanged as text messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Sent to the producer when the first consumer joins
    ViewerOn,
    /// Sent to the producer when the last consumer leaves
    ViewerOff,
    /// Sent to consumers when the producer goes away
    ProducerOffline,
}

impl Notice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Notice::ViewerOn => "VIEWER_ON",
            Notice::ViewerOff => "VIEWER_OFF",
            Notice::ProducerOffline => "PRODUCER_OFFLINE",
        }
    }
}

/// Message queued for a connection's writer
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Encoded frame bytes
    Frame(Bytes),
    /// Status notice
    Notice(Notice),
}

/// Why a link was actively closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer producer registered for the same channel
    Replaced,
    /// The previous liveness probe was never answered
    LivenessTimeout,
    /// Producer credential rejected
    Unauthorized,
    /// WebRTC distribution requested but no media engine is configured
    SignalingUnavailable,
    /// The server is shutting down
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Replaced => 1000,
            CloseReason::LivenessTimeout | CloseReason::Shutdown => 1001,
            CloseReason::Unauthorized => 1008,
            CloseReason::SignalingUnavailable => 1011,
        }
    }

    /// WebSocket close reason text
    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::Replaced => "replaced",
            CloseReason::LivenessTimeout => "liveness timeout",
            CloseReason::Unauthorized => "unauthorized",
            CloseReason::SignalingUnavailable => "signaling unavailable",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

/// Why an outbound message could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Queue full; the consumer misses this message
    Full,
    /// Receiver gone; the connection is unusable
    Closed,
}

/// One registered transport connection
#[derive(Debug)]
pub struct Link {
    id: LinkId,
    channel: ChannelId,
    role: Role,
    liveness: Liveness,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Outbound>,
    close_tx: watch::Sender<Option<CloseReason>>,
    probe: Notify,
    alive: AtomicBool,
    stats: LinkStats,
    connected_at: Instant,
}

/// What a connection task should do next
#[derive(Debug)]
pub enum LinkEvent {
    /// Write a queued message to the transport
    Send(Outbound),
    /// Close the transport with this reason
    Close(CloseReason),
    /// Every sender is gone; the link is no longer registered anywhere
    Detached,
}

/// Connection-side half of a link
#[derive(Debug)]
pub struct LinkReceiver {
    outbound: mpsc::Receiver<Outbound>,
    close_rx: watch::Receiver<Option<CloseReason>>,
}

impl Link {
    /// Create a link and the receiver its connection task drains
    pub fn new(
        id: LinkId,
        channel: ChannelId,
        role: Role,
        capacity: usize,
    ) -> (Arc<Self>, LinkReceiver) {
        Self::build(id, channel, role, capacity, Liveness::Probed, None)
    }

    /// Create a link whose liveness is judged by its queue instead of probes
    pub fn passive(
        id: LinkId,
        channel: ChannelId,
        role: Role,
        capacity: usize,
    ) -> (Arc<Self>, LinkReceiver) {
        Self::build(id, channel, role, capacity, Liveness::Passive, None)
    }

    /// Create a link with an explicit liveness mode and peer address
    pub fn build(
        id: LinkId,
        channel: ChannelId,
        role: Role,
        capacity: usize,
        liveness: Liveness,
        peer_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, LinkReceiver) {
        let (outbound, outbound_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);

        let link = Arc::new(Self {
            id,
            channel,
            role,
            liveness,
            peer_addr,
            outbound,
            close_tx,
            probe: Notify::new(),
            alive: AtomicBool::new(true),
            stats: LinkStats::default(),
            connected_at: Instant::now(),
        });

        (
            link,
            LinkReceiver {
                outbound: outbound_rx,
                close_rx,
            },
        )
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Time since the link was created
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue a message without waiting
    pub fn try_send(&self, message: Outbound) -> Result<(), SendFailure> {
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendFailure::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendFailure::Closed),
        }
    }

    /// Queue a status notice, ignoring delivery failure
    pub fn notify(&self, notice: Notice) {
        if let Err(failure) = self.try_send(Outbound::Notice(notice)) {
            tracing::debug!(
                link = %self.id,
                channel = %self.channel,
                notice = notice.as_str(),
                ?failure,
                "Notice not delivered"
            );
        }
    }

    /// Whether the connection side has dropped its receiver
    pub fn is_outbound_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Ask the connection task to close the transport
    ///
    /// Returns `true` only for the first call; later calls keep the first reason.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Reason passed to the first [`Link::close`] call, if any
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    /// Record a probe response
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Read and clear the liveness flag
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Ask the connection task to send a probe
    pub fn request_probe(&self) {
        self.probe.notify_one();
    }

    /// Wait until the monitor requests a probe
    pub async fn probe_requested(&self) {
        self.probe.notified().await;
    }
}

impl LinkReceiver {
    /// Next queued outbound message, `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Wait until the link is closed and return the reason
    pub async fn closed(&mut self) -> CloseReason {
        match self.close_rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.unwrap_or(CloseReason::Shutdown),
            Err(_) => CloseReason::Shutdown,
        }
    }

    /// Wait for the next outbound message or a close request
    ///
    /// A close request wins over queued messages.
    pub async fn next_event(&mut self) -> LinkEvent {
        tokio::select! {
            biased;
            reason = self.close_rx.wait_for(Option::is_some) => match reason {
                Ok(reason) => LinkEvent::Close(reason.unwrap_or(CloseReason::Shutdown)),
                Err(_) => LinkEvent::Detached,
            },
            message = self.outbound.recv() => match message {
                Some(message) => LinkEvent::Send(message),
                None => LinkEvent::Detached,
            },
        }
    }

    /// Stop accepting new outbound messages
    pub fn shut(&mut self) {
        self.outbound.close();
    }
}
