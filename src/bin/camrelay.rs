//! Camera relay server binary
//!
//! # Usage
//!
//! ```bash
//! # Raw relay on the default port
//! camrelay
//!
//! # WebRTC distribution, producers must present a key
//! CAMERA_KEY=supersecret123 camrelay --mode webrtc --port 8080
//!
//! # Fixed 320x240 input, probe every 30 seconds
//! camrelay --frame-size 320x240 --liveness-secs 30
//! ```

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use camrelay::{DistributionMode, RelayServer, Resolution, ServerConfig};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Relay JPEG camera frames to WebSocket, MJPEG and WebRTC viewers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 10000, env = "PORT")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "0.0.0.0", env = "BIND_ADDR")]
    bind: IpAddr,

    /// Shared secret producers must present (empty disables the check)
    #[arg(long, env = "CAMERA_KEY", hide_env_values = true)]
    camera_key: Option<String>,

    /// Distribution mode: raw or webrtc
    #[arg(short, long, default_value = "raw", env = "RELAY_MODE")]
    mode: DistributionMode,

    /// Liveness probe period in seconds
    #[arg(long, default_value_t = 15, env = "LIVENESS_SECS")]
    liveness_secs: u64,

    /// Payloads shorter than this are ignored
    #[arg(long, default_value_t = 200, env = "MIN_FRAME_BYTES")]
    min_frame_bytes: usize,

    /// Force one input resolution, e.g. 320x240
    #[arg(long, value_parser = parse_resolution, env = "FRAME_SIZE")]
    frame_size: Option<Resolution>,

    /// STUN servers (comma-separated)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// Maximum concurrent WebSocket connections (0 = unlimited)
    #[arg(long, default_value_t = 0, env = "MAX_CONNECTIONS")]
    max_connections: usize,

    /// Channel served by /upload and /signal
    #[arg(long, default_value = "default", env = "DEFAULT_CHANNEL")]
    default_channel: String,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::default()
            .bind(SocketAddr::new(self.bind, self.port))
            .mode(self.mode)
            .min_frame_bytes(self.min_frame_bytes)
            .stun_servers(self.stun_servers)
            .max_connections(self.max_connections)
            .default_channel(self.default_channel)
            .liveness_interval(Duration::from_secs(self.liveness_secs.max(1)));

        if let Some(key) = self.camera_key {
            config = config.camera_key(key);
        }
        if let Some(resolution) = self.frame_size {
            config = config.frame_size(resolution);
        }
        config
    }
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {:?}", s))?;
    let width: u32 = w.trim().parse().map_err(|_| format!("invalid width {:?}", w))?;
    let height: u32 = h.trim().parse().map_err(|_| format!("invalid height {:?}", h))?;

    let resolution = Resolution::new(width, height);
    if resolution.is_empty() {
        return Err("width and height must be non-zero".into());
    }
    Ok(resolution)
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camrelay=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    let config = args.into_config();
    tracing::info!(
        addr = %config.bind_addr,
        mode = %config.mode,
        auth = config.camera_key.is_some(),
        liveness_secs = config.registry.liveness_interval.as_secs(),
        "Starting camera relay"
    );

    let server = RelayServer::new(config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    match server.run_until(shutdown).await {
        Ok(()) => {
            tracing::info!("Camera relay stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Camera relay failed");
            ExitCode::FAILURE
        }
    }
}
