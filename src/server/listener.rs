//! Relay server listener
//!
//! Binds the HTTP listener, starts the liveness monitor and serves the
//! gateway router until shut down.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::liveness::LivenessMonitor;
use crate::pipeline::{DistributionMode, FrameDecoder, FramePipeline, JpegDecoder};
use crate::registry::{ChannelId, ChannelRegistry};
use crate::server::auth::{AllowAll, AuthPolicy, SharedSecret};
use crate::server::config::ServerConfig;
use crate::server::gateway::{self, RelayContext};
use crate::signaling::{MediaEngine, SignalingCoordinator};
use crate::stats::RelayStats;

/// Camera relay server
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<ChannelRegistry>,
    stats: Arc<RelayStats>,
    auth: Arc<dyn AuthPolicy>,
    decoder: Arc<dyn FrameDecoder>,
    engine: Option<Arc<dyn MediaEngine>>,
}

impl RelayServer {
    /// Create a new server with the given configuration
    ///
    /// A configured `camera_key` installs [`SharedSecret`]; otherwise every
    /// producer is admitted.
    pub fn new(config: ServerConfig) -> Self {
        let auth: Arc<dyn AuthPolicy> = match config.camera_key {
            Some(ref key) => Arc::new(SharedSecret::new(key.clone())),
            None => Arc::new(AllowAll),
        };

        Self {
            registry: Arc::new(ChannelRegistry::with_config(config.registry.clone())),
            stats: Arc::new(RelayStats::default()),
            auth,
            decoder: Arc::new(JpegDecoder::new()),
            engine: None,
            config,
        }
    }

    /// Replace the producer admission policy
    pub fn with_auth<A: AuthPolicy>(mut self, auth: A) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    /// Replace the frame decoder
    pub fn with_decoder<D: FrameDecoder>(mut self, decoder: D) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Use a specific media engine for WebRTC distribution
    pub fn with_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Get a reference to the channel registry
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Get a reference to the connection counters
    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Build the gateway router
    ///
    /// Fails with [`Error::Config`] if the default channel is not a valid
    /// channel id. In WebRTC mode without an engine, viewers are refused with
    /// close code 1011 while producers and MJPEG viewers keep working.
    pub fn router(&self) -> Result<Router> {
        if ChannelId::new(self.config.default_channel.as_str()).is_none() {
            return Err(Error::Config(format!(
                "default channel {:?} is not a valid channel id",
                self.config.default_channel
            )));
        }

        let pipeline = FramePipeline::with_decoder(self.config.mode, Arc::clone(&self.decoder))
            .min_frame_bytes(self.config.min_frame_bytes)
            .fixed_resolution(self.config.frame_size);

        let coordinator = match self.config.mode {
            DistributionMode::Raw => None,
            DistributionMode::WebRtc => self
                .media_engine()?
                .map(|engine| Arc::new(SignalingCoordinator::new(engine))),
        };

        let ctx = RelayContext::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::new(pipeline),
            coordinator,
            Arc::clone(&self.auth),
            Arc::clone(&self.stats),
        );

        Ok(gateway::router(Arc::new(ctx)))
    }

    #[cfg(feature = "webrtc")]
    fn media_engine(&self) -> Result<Option<Arc<dyn MediaEngine>>> {
        match self.engine {
            Some(ref engine) => Ok(Some(Arc::clone(engine))),
            None => {
                let engine = crate::rtc::WebRtcEngine::new(self.config.stun_servers.clone())?;
                Ok(Some(Arc::new(engine)))
            }
        }
    }

    #[cfg(not(feature = "webrtc"))]
    fn media_engine(&self) -> Result<Option<Arc<dyn MediaEngine>>> {
        if self.engine.is_none() {
            tracing::warn!("Built without WebRTC support; viewers will be refused");
        }
        Ok(self.engine.clone())
    }

    /// Run the server
    ///
    /// This method blocks until the server fails.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.config.bind_addr,
                source,
            })?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router()?;
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, mode = %self.config.mode, "Camera relay listening");

        // Spawn liveness task for the channel registry
        let monitor = Arc::new(LivenessMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
        ));
        let liveness_handle = monitor.spawn();

        let registry = Arc::clone(&self.registry);
        let abort = liveness_handle.abort_handle();
        let graceful = async move {
            shutdown.await;
            tracing::info!("Shutdown signal received");

            // Close every link first so connection tasks can finish
            let closed = registry.close_all().await;
            tracing::info!(links = closed, "Links closed for shutdown");
            abort.abort();
        };

        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(graceful)
        .await;

        // Stop liveness task on shutdown
        liveness_handle.abort();

        result.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_bind_error_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        let server = RelayServer::new(ServerConfig::with_addr(addr));
        let result = server.run_until(async {}).await;

        assert!(matches!(result, Err(Error::Bind { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_closes_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = RelayServer::new(ServerConfig::default());
        let registry = Arc::clone(server.registry());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let serve = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = rx.await;
                })
                .await
        });

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), serve)
            .await
            .expect("server should stop")
            .unwrap();

        assert!(result.is_ok());
        assert!(registry.is_closing());
    }

    #[test]
    fn test_raw_mode_needs_no_engine() {
        let server = RelayServer::new(ServerConfig::default().camera_key("supersecret123"));

        assert_eq!(server.bind_addr().port(), 10000);
        assert!(server.router().is_ok());
    }

    #[test]
    fn test_invalid_default_channel_is_config_error() {
        let server = RelayServer::new(ServerConfig::default().default_channel("two words"));

        assert!(matches!(server.router(), Err(Error::Config(_))));
    }
}
