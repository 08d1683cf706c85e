//! HTTP and WebSocket surface
//!
//! Every request is validated before it touches the registry: a malformed
//! target gets HTTP 400 without an upgrade, an over-limit upgrade gets 503.
//! Credential failures and a missing media engine are reported after the
//! upgrade with a WebSocket close code, so browser clients can see them.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::pipeline::{DistributionMode, FramePipeline, Payload};
use crate::registry::{
    ChannelId, ChannelRegistry, CloseReason, Delivery, Frame, Link, LinkEvent, Liveness,
    Outbound, RemovalCause, Role,
};
use crate::relay::BroadcastRelay;
use crate::server::auth::{AuthPolicy, AuthRequest, AuthResult};
use crate::server::config::ServerConfig;
use crate::server::connection;
use crate::server::target::{ConnectTarget, TargetError, TargetRole};
use crate::signaling::SignalingCoordinator;
use crate::stats::{PipelineSnapshot, RelaySnapshot, RelayStats};

/// Multipart boundary used by `/stream/{channel}`
pub const MJPEG_BOUNDARY: &str = "frame";

/// Form field carrying the JPEG in `POST /ingest/{channel}`
pub const INGEST_FIELD: &str = "frame";

/// Shared state handed to every request and connection task
pub struct RelayContext {
    pub(crate) registry: Arc<ChannelRegistry>,
    pub(crate) pipeline: Arc<FramePipeline>,
    pub(crate) relay: BroadcastRelay,
    pub(crate) coordinator: Option<Arc<SignalingCoordinator>>,
    pub(crate) auth: Arc<dyn AuthPolicy>,
    pub(crate) stats: Arc<RelayStats>,
    pub(crate) config: ServerConfig,
    limiter: Option<Arc<Semaphore>>,
}

impl RelayContext {
    pub(crate) fn new(
        config: ServerConfig,
        registry: Arc<ChannelRegistry>,
        pipeline: Arc<FramePipeline>,
        coordinator: Option<Arc<SignalingCoordinator>>,
        auth: Arc<dyn AuthPolicy>,
        stats: Arc<RelayStats>,
    ) -> Self {
        let limiter = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            relay: BroadcastRelay::new(Arc::clone(&registry)),
            registry,
            pipeline,
            coordinator,
            auth,
            stats,
            config,
            limiter,
        }
    }

    /// Hand an accepted frame to every distributor
    ///
    /// The video source (WebRTC mode) is fed first; the relay then stores the
    /// frame as the channel's latest and fans the original bytes out to
    /// frame consumers.
    pub(crate) async fn distribute(&self, channel: &ChannelId, frame: Frame) {
        if let Some(ref coordinator) = self.coordinator {
            if frame.decoded.is_some() {
                if let Err(e) = coordinator.on_frame(channel, &frame).await {
                    tracing::error!(channel = %channel, error = %e, "Video source rejected frame");
                }
            }
        }

        let report = self.relay.publish(channel, frame).await;
        if report.evicted > 0 {
            self.stats.transport_evicted(report.evicted);
        }
        tracing::trace!(
            channel = %channel,
            delivered = report.delivered,
            missed = report.missed,
            "Frame published"
        );
    }

    /// Release per-channel state once nobody is left on the channel
    pub(crate) async fn channel_left(&self, channel: &ChannelId) {
        let snapshot = self.registry.snapshot(channel).await;
        if snapshot.has_producer || snapshot.consumer_count > 0 {
            return;
        }
        if let Some(ref coordinator) = self.coordinator {
            coordinator.retire(channel).await;
        }
    }

    /// Reserve a connection slot, `Err` when the limit is reached
    fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, ()> {
        match self.limiter {
            Some(ref sem) => sem.clone().try_acquire_owned().map(Some).map_err(|_| ()),
            None => Ok(None),
        }
    }
}

/// Build the router for a relay context
pub fn router(ctx: Arc<RelayContext>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/ws/:role/:channel", get(ws_target))
        .route("/upload", get(upload))
        .route("/signal", get(signal))
        .route("/ingest", post(ingest_default))
        .route("/ingest/:channel", post(ingest))
        .route("/status/:channel", get(status))
        .route("/channels/:channel", get(channel_snapshot))
        .route("/stats", get(stats))
        .route("/stream/:channel", get(mjpeg_stream))
        .with_state(ctx)
}

async fn health() -> &'static str {
    "camrelay ok"
}

async fn ws_target(
    State(ctx): State<Arc<RelayContext>>,
    Path((role, channel)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let target = ConnectTarget::parse(&role, &channel, &query);
    upgrade(ctx, target, &query, &headers, peer.map(|ConnectInfo(addr)| addr), ws)
}

/// Single-camera producer route on the default channel
async fn upload(
    State(ctx): State<Arc<RelayContext>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let target = ConnectTarget::parse("camera", &ctx.config.default_channel, &query);
    upgrade(ctx, target, &query, &headers, peer.map(|ConnectInfo(addr)| addr), ws)
}

/// Single-camera viewer route on the default channel
async fn signal(
    State(ctx): State<Arc<RelayContext>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let target = ConnectTarget::parse("view", &ctx.config.default_channel, &query);
    upgrade(ctx, target, &query, &headers, peer.map(|ConnectInfo(addr)| addr), ws)
}

fn upgrade(
    ctx: Arc<RelayContext>,
    target: Result<ConnectTarget, TargetError>,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    peer_addr: Option<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let target = match target {
        Ok(target) => target,
        Err(e) => {
            ctx.stats.target_rejected();
            tracing::debug!(peer = ?peer_addr, error = %e, "Target rejected");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let permit = match ctx.acquire() {
        Ok(permit) => permit,
        Err(()) => {
            tracing::warn!(peer = ?peer_addr, "Connection rejected: limit reached");
            return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
        }
    };

    let authorized = match target.role {
        TargetRole::Consumer => true,
        TargetRole::Producer => {
            let request = AuthRequest {
                channel: &target.channel,
                peer_addr,
                query,
                headers,
            };
            match ctx.auth.authorize(&request) {
                AuthResult::Accept => true,
                AuthResult::Reject(reason) => {
                    ctx.stats.auth_failed();
                    tracing::warn!(
                        channel = %target.channel,
                        peer = ?peer_addr,
                        reason = %reason,
                        "Producer rejected"
                    );
                    false
                }
            }
        }
    };

    ws.on_upgrade(move |socket| async move {
        let _permit = permit;
        ctx.stats.connection_opened();
        serve_socket(Arc::clone(&ctx), socket, target, authorized, peer_addr).await;
        ctx.stats.connection_closed();
    })
}

async fn serve_socket(
    ctx: Arc<RelayContext>,
    socket: WebSocket,
    target: ConnectTarget,
    authorized: bool,
    peer_addr: Option<SocketAddr>,
) {
    if !authorized {
        return connection::refuse(socket, CloseReason::Unauthorized).await;
    }

    let id = ctx.registry.next_link_id();
    let capacity = ctx.registry.config().outbound_capacity;
    let role = match (target.role, ctx.config.mode) {
        (TargetRole::Producer, _) => Role::Producer,
        (TargetRole::Consumer, DistributionMode::Raw) => Role::Consumer(Delivery::Frames),
        (TargetRole::Consumer, DistributionMode::WebRtc) => Role::Consumer(Delivery::Signaling),
    };

    tracing::debug!(
        link = %id,
        channel = %target.channel,
        role = %role,
        peer = ?peer_addr,
        "WebSocket connected"
    );

    let (link, rx) = Link::build(id, target.channel, role, capacity, Liveness::Probed, peer_addr);
    match role {
        Role::Producer => connection::run_producer(ctx, socket, link, rx, target.declared).await,
        Role::Consumer(Delivery::Frames) => connection::run_consumer(ctx, socket, link, rx).await,
        Role::Consumer(Delivery::Signaling) => {
            connection::run_signaling(ctx, socket, link, rx).await
        }
    }
}

/// HTTP producer on the default channel
async fn ingest_default(
    State(ctx): State<Arc<RelayContext>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    multipart: Multipart,
) -> Response {
    let channel = ctx.config.default_channel.clone();
    ingest_frame(ctx, channel, query, headers, peer, multipart).await
}

/// HTTP producer: one JPEG per request in the `frame` form field
async fn ingest(
    State(ctx): State<Arc<RelayContext>>,
    Path(channel): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    multipart: Multipart,
) -> Response {
    ingest_frame(ctx, channel, query, headers, peer, multipart).await
}

async fn ingest_frame(
    ctx: Arc<RelayContext>,
    channel: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    mut multipart: Multipart,
) -> Response {
    let channel = match parse_channel(&ctx, channel) {
        Ok(channel) => channel,
        Err(response) => return response,
    };
    let peer_addr = peer.map(|ConnectInfo(addr)| addr);

    let request = AuthRequest {
        channel: &channel,
        peer_addr,
        query: &query,
        headers: &headers,
    };
    if let AuthResult::Reject(reason) = ctx.auth.authorize(&request) {
        ctx.stats.auth_failed();
        tracing::warn!(channel = %channel, peer = ?peer_addr, reason = %reason, "Ingest rejected");
        drain(&mut multipart).await;
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    if ctx.registry.is_closing() {
        drain(&mut multipart).await;
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    // Read to the end so the client always gets the response; only the
    // first `frame` field counts
    let mut data = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if data.is_none() && field.name() == Some(INGEST_FIELD) {
                    match field.bytes().await {
                        Ok(bytes) => data = Some(bytes),
                        Err(e) => return (e.status(), e.body_text()).into_response(),
                    }
                }
            }
            Ok(None) => break,
            Err(e) => return (e.status(), e.body_text()).into_response(),
        }
    }
    let Some(data) = data else {
        return (StatusCode::BAD_REQUEST, "no frame").into_response();
    };

    match ctx.pipeline.accept(&channel, Payload::Binary(data)).await {
        Ok(frame) => {
            ctx.distribute(&channel, frame).await;
            (StatusCode::OK, "ok").into_response()
        }
        Err(reason) => (StatusCode::BAD_REQUEST, reason.to_string()).into_response(),
    }
}

async fn drain(multipart: &mut Multipart) {
    while let Ok(Some(_)) = multipart.next_field().await {}
}

fn parse_channel(ctx: &RelayContext, channel: String) -> Result<ChannelId, Response> {
    ChannelId::new(channel.as_str()).ok_or_else(|| {
        ctx.stats.target_rejected();
        let e = TargetError::InvalidChannel(channel);
        (StatusCode::BAD_REQUEST, e.to_string()).into_response()
    })
}

/// `true` when the channel has at least one consumer
async fn status(State(ctx): State<Arc<RelayContext>>, Path(channel): Path<String>) -> Response {
    match parse_channel(&ctx, channel) {
        Ok(id) => ctx.registry.has_consumers(&id).await.to_string().into_response(),
        Err(response) => response,
    }
}

async fn channel_snapshot(
    State(ctx): State<Arc<RelayContext>>,
    Path(channel): Path<String>,
) -> Response {
    match parse_channel(&ctx, channel) {
        Ok(id) => Json(ctx.registry.snapshot(&id).await).into_response(),
        Err(response) => response,
    }
}

/// Body of `/stats`
#[derive(Debug, Serialize)]
struct StatsReport {
    mode: String,
    channels: usize,
    relay: RelaySnapshot,
    pipeline: PipelineSnapshot,
    video_sources: usize,
}

async fn stats(State(ctx): State<Arc<RelayContext>>) -> Json<StatsReport> {
    let video_sources = match ctx.coordinator {
        Some(ref coordinator) => coordinator.sources().len().await,
        None => 0,
    };

    Json(StatsReport {
        mode: ctx.config.mode.to_string(),
        channels: ctx.registry.channel_count().await,
        relay: ctx.stats.snapshot(),
        pipeline: ctx.pipeline.stats(),
        video_sources,
    })
}

/// Removes an MJPEG link once its response body is dropped
struct StreamGuard {
    ctx: Arc<RelayContext>,
    link: Arc<Link>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let ctx = Arc::clone(&self.ctx);
        let link = Arc::clone(&self.link);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                ctx.registry.remove(&link, RemovalCause::Closed).await;
                ctx.channel_left(link.channel()).await;
                ctx.stats.connection_closed();
            });
        }
    }
}

/// MJPEG consumer over `multipart/x-mixed-replace`
async fn mjpeg_stream(
    State(ctx): State<Arc<RelayContext>>,
    Path(channel): Path<String>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let channel = match parse_channel(&ctx, channel) {
        Ok(channel) => channel,
        Err(response) => return response,
    };

    let (link, rx) = Link::build(
        ctx.registry.next_link_id(),
        channel,
        Role::Consumer(Delivery::Frames),
        ctx.registry.config().outbound_capacity,
        Liveness::Passive,
        peer.map(|ConnectInfo(addr)| addr),
    );

    if let Err(e) = ctx.registry.register_consumer(Arc::clone(&link)).await {
        return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
    }
    ctx.stats.connection_opened();

    let guard = StreamGuard {
        ctx: Arc::clone(&ctx),
        link,
    };

    let parts = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        loop {
            match rx.next_event().await {
                LinkEvent::Send(Outbound::Frame(data)) => {
                    return Some((Ok::<_, Infallible>(mjpeg_part(&data)), (rx, guard)));
                }
                LinkEvent::Send(Outbound::Notice(_)) => continue,
                LinkEvent::Close(_) | LinkEvent::Detached => return None,
            }
        }
    });

    let content_type = format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY);
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

/// One multipart section carrying a JPEG
fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let head = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(head.len() + jpeg.len() + 2);
    part.put_slice(head.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}
