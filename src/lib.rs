//! Camera relay
//!
//! Accepts JPEG frames from low-power cameras over WebSocket and hands them to
//! any number of viewers on the same channel, either as the original bytes
//! (raw mode) or as an H.264 WebRTC track (WebRTC mode).
//!
//! # Example
//!
//! ```no_run
//! use camrelay::{RelayServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> camrelay::Result<()> {
//!     let config = ServerConfig::default().camera_key("supersecret123");
//!     RelayServer::new(config)
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! Cameras connect to `/ws/camera/{channel}`, viewers to `/ws/view/{channel}`
//! or `/stream/{channel}` for MJPEG.

pub mod error;
pub mod liveness;
pub mod pipeline;
pub mod registry;
pub mod relay;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod server;
pub mod signaling;
pub mod stats;

pub use error::{Error, Result};
pub use pipeline::{DistributionMode, FramePipeline, JpegDecoder};
pub use registry::{ChannelId, ChannelRegistry, RegistryConfig, Resolution};
pub use server::{RelayServer, ServerConfig};
pub use signaling::MediaEngine;
