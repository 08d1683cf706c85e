//! Per-connection tasks
//!
//! Each upgraded WebSocket runs one task that owns both halves of the socket.
//! The task waits on three things at once: its link's outbound queue (frames,
//! notices, close requests), probe requests from the liveness monitor, and
//! inbound messages. Whatever ends the loop, the link is removed from the
//! registry exactly once before the socket is closed.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};

use crate::pipeline::Payload;
use crate::registry::{
    CloseReason, Link, LinkEvent, LinkReceiver, Outbound, RegistryError, RemovalCause,
    Resolution,
};
use crate::server::gateway::RelayContext;
use crate::signaling::{PeerEvent, SignalMessage};

type Sink = SplitSink<WebSocket, Message>;

/// Why a connection loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The registry or monitor asked for a close
    Closed(CloseReason),
    /// The peer closed the socket
    Hangup,
    /// A read or write failed
    Transport,
    /// The link was dropped by the registry without a close reason
    Detached,
}

impl Exit {
    fn removal_cause(self) -> RemovalCause {
        match self {
            Exit::Closed(CloseReason::LivenessTimeout) => RemovalCause::LivenessTimeout,
            Exit::Closed(CloseReason::Shutdown) => RemovalCause::Shutdown,
            Exit::Transport => RemovalCause::Transport,
            Exit::Closed(_) | Exit::Hangup | Exit::Detached => RemovalCause::Closed,
        }
    }
}

/// Close a socket that never joined the registry
pub(crate) async fn refuse(mut socket: WebSocket, reason: CloseReason) {
    let frame = close_frame(reason);
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
}

/// Producer connection: inbound frames go through the pipeline
pub(crate) async fn run_producer(
    ctx: Arc<RelayContext>,
    socket: WebSocket,
    link: Arc<Link>,
    rx: LinkReceiver,
    declared: Option<Resolution>,
) {
    match ctx.registry.register_producer(Arc::clone(&link)).await {
        Ok(registration) => {
            if let Some(old) = registration.replaced {
                tracing::debug!(channel = %link.channel(), old = %old, "Taking over from previous producer");
            }
        }
        Err(e) => return reject_registration(socket, &link, e).await,
    }

    // A new camera starts over, whatever size the replaced camera or HTTP
    // ingest pinned
    let channel = link.channel().clone();
    ctx.pipeline.repin(&channel, declared).await;
    let (sink, mut stream) = socket.split();
    let mut conn = Connection::new(Arc::clone(&ctx), link, rx, sink);

    let exit = loop {
        tokio::select! {
            event = conn.rx.next_event() => {
                if let Some(exit) = conn.on_event(event).await {
                    break exit;
                }
            }
            _ = conn.link.probe_requested() => {
                if let Some(exit) = conn.probe().await {
                    break exit;
                }
            }
            incoming = stream.next() => {
                let message = match inbound(&conn.link, incoming) {
                    Ok(message) => message,
                    Err(exit) => break exit,
                };
                if conn.link.close_reason().is_some() {
                    // Replaced or evicted; frames still in flight must not pin or publish
                    continue;
                }
                let payload = match message {
                    Message::Binary(data) => Payload::Binary(Bytes::from(data)),
                    Message::Text(text) => Payload::Text(text),
                    _ => continue,
                };
                if let Ok(frame) = ctx.pipeline.accept(&channel, payload).await {
                    ctx.distribute(&channel, frame).await;
                }
            }
        }
    };

    conn.finish(exit).await;
}

/// Raw consumer connection: receives binary frames and text notices
pub(crate) async fn run_consumer(
    ctx: Arc<RelayContext>,
    socket: WebSocket,
    link: Arc<Link>,
    rx: LinkReceiver,
) {
    match ctx.registry.register_consumer(Arc::clone(&link)).await {
        Ok(_) => {}
        Err(e) => return reject_registration(socket, &link, e).await,
    }

    let (sink, mut stream) = socket.split();
    let mut conn = Connection::new(ctx, link, rx, sink);

    let exit = loop {
        tokio::select! {
            event = conn.rx.next_event() => {
                if let Some(exit) = conn.on_event(event).await {
                    break exit;
                }
            }
            _ = conn.link.probe_requested() => {
                if let Some(exit) = conn.probe().await {
                    break exit;
                }
            }
            incoming = stream.next() => {
                if let Err(exit) = inbound(&conn.link, incoming) {
                    break exit;
                }
            }
        }
    };

    conn.finish(exit).await;
}

/// Signaling consumer connection: JSON offer/answer/candidate exchange
pub(crate) async fn run_signaling(
    ctx: Arc<RelayContext>,
    socket: WebSocket,
    link: Arc<Link>,
    rx: LinkReceiver,
) {
    let Some(coordinator) = ctx.coordinator.clone() else {
        tracing::error!(channel = %link.channel(), "WebRTC viewer refused: no media engine");
        return refuse(socket, CloseReason::SignalingUnavailable).await;
    };

    match ctx.registry.register_consumer(Arc::clone(&link)).await {
        Ok(_) => {}
        Err(e) => return reject_registration(socket, &link, e).await,
    }

    let (mut session, mut events) = coordinator.session(link.channel(), link.id());
    let (sink, mut stream) = socket.split();
    let mut conn = Connection::new(Arc::clone(&ctx), link, rx, sink);

    let exit = loop {
        tokio::select! {
            event = conn.rx.next_event() => {
                if let Some(exit) = conn.on_event(event).await {
                    break exit;
                }
            }
            _ = conn.link.probe_requested() => {
                if let Some(exit) = conn.probe().await {
                    break exit;
                }
            }
            source = session.source_ready() => {
                match session.resume(source).await {
                    Ok(Some(reply)) => {
                        if let Some(exit) = conn.signal(&reply).await {
                            break exit;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(
                        channel = %conn.link.channel(),
                        link = %conn.link.id(),
                        error = %e,
                        "Pending offer failed"
                    ),
                }
            }
            Some(event) = events.recv() => {
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        if let Some(exit) = conn.signal(&SignalMessage::candidate(candidate)).await {
                            break exit;
                        }
                    }
                    PeerEvent::StateChanged(state) => session.observe(state),
                }
            }
            incoming = stream.next() => {
                let message = match inbound(&conn.link, incoming) {
                    Ok(message) => message,
                    Err(exit) => break exit,
                };
                let Message::Text(text) = message else {
                    continue;
                };
                let message = match SignalMessage::parse(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(link = %conn.link.id(), error = %e, "Ignoring signaling message");
                        continue;
                    }
                };
                match session.handle(message, coordinator.sources()).await {
                    Ok(Some(reply)) => {
                        if let Some(exit) = conn.signal(&reply).await {
                            break exit;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(
                        channel = %conn.link.channel(),
                        link = %conn.link.id(),
                        error = %e,
                        "Signaling failed"
                    ),
                }
            }
        }
    };

    coordinator.end_session(&mut session).await;
    conn.finish(exit).await;
}

async fn reject_registration(socket: WebSocket, link: &Link, error: RegistryError) {
    tracing::debug!(
        link = %link.id(),
        channel = %link.channel(),
        error = %error,
        "Registration refused"
    );
    refuse(socket, CloseReason::Shutdown).await;
}

/// Check one inbound read; any message counts as a liveness response
fn inbound(link: &Link, incoming: Option<Result<Message, axum::Error>>) -> Result<Message, Exit> {
    match incoming {
        None | Some(Ok(Message::Close(_))) => Err(Exit::Hangup),
        Some(Err(e)) => {
            tracing::debug!(link = %link.id(), error = %e, "Read failed");
            Err(Exit::Transport)
        }
        Some(Ok(message)) => {
            link.mark_alive();
            Ok(message)
        }
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame<'static> {
    CloseFrame {
        code: reason.code(),
        reason: reason.reason().into(),
    }
}

/// Write half of a registered connection
struct Connection {
    ctx: Arc<RelayContext>,
    link: Arc<Link>,
    rx: LinkReceiver,
    sink: Sink,
}

impl Connection {
    fn new(ctx: Arc<RelayContext>, link: Arc<Link>, rx: LinkReceiver, sink: Sink) -> Self {
        Self {
            ctx,
            link,
            rx,
            sink,
        }
    }

    async fn on_event(&mut self, event: LinkEvent) -> Option<Exit> {
        let message = match event {
            LinkEvent::Send(Outbound::Frame(data)) => Message::Binary(data.to_vec()),
            LinkEvent::Send(Outbound::Notice(notice)) => Message::Text(notice.as_str().to_string()),
            LinkEvent::Close(reason) => return Some(Exit::Closed(reason)),
            LinkEvent::Detached => return Some(Exit::Detached),
        };
        self.write(message).await
    }

    async fn probe(&mut self) -> Option<Exit> {
        self.write(Message::Ping(Vec::new())).await
    }

    async fn signal(&mut self, message: &SignalMessage) -> Option<Exit> {
        match message.to_json() {
            Ok(json) => self.write(Message::Text(json)).await,
            Err(e) => {
                tracing::error!(link = %self.link.id(), error = %e, "Failed to encode signaling message");
                None
            }
        }
    }

    async fn write(&mut self, message: Message) -> Option<Exit> {
        match self.sink.send(message).await {
            Ok(()) => None,
            Err(e) => {
                tracing::debug!(link = %self.link.id(), error = %e, "Write failed");
                Some(Exit::Transport)
            }
        }
    }

    /// Leave the registry and close the socket
    async fn finish(mut self, exit: Exit) {
        // Stop queueing before leaving so nothing lands after removal
        self.rx.shut();
        let cause = exit.removal_cause();
        let removal = self.ctx.registry.remove(&self.link, cause).await;

        if let Some(ref removal) = removal {
            if cause == RemovalCause::Transport {
                self.ctx.stats.transport_evicted(1);
            }
            if removal.was_producer {
                self.ctx.pipeline.release(&removal.channel).await;
            }
        } else if self.link.role().is_producer()
            && !self.ctx.registry.has_producer(self.link.channel()).await
        {
            // Removed by the monitor; the channel still needs its pin cleared
            self.ctx.pipeline.release(self.link.channel()).await;
        }
        self.ctx.channel_left(self.link.channel()).await;

        if let Exit::Closed(reason) = exit {
            let _ = self.sink.send(Message::Close(Some(close_frame(reason)))).await;
        }
        if let Err(e) = self.sink.close().await {
            tracing::debug!(link = %self.link.id(), error = %e, "Socket close failed");
        }

        tracing::debug!(
            link = %self.link.id(),
            channel = %self.link.channel(),
            peer = ?self.link.peer_addr(),
            age_ms = self.link.age().as_millis() as u64,
            exit = ?exit,
            frames_sent = self.link.stats().frames_sent(),
            frames_missed = self.link.stats().frames_missed(),
            "Connection finished"
        );
    }
}
