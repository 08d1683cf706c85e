//! Frame pipeline
//!
//! Validates every producer payload before distribution. Checks run cheapest
//! first: payload kind, then size, then a header probe, then (only when the
//! distribution mode needs pixels) a full decode on the blocking pool.

pub mod decoder;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::registry::{ChannelId, Frame, Resolution};
use crate::stats::{PipelineSnapshot, PipelineStats};

pub use decoder::{rgb_to_i420, DecodeError, FrameDecoder, JpegDecoder};

/// Smallest payload treated as a frame; anything shorter is keep-alive noise
pub const DEFAULT_MIN_FRAME_BYTES: usize = 200;

/// How accepted frames reach viewers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionMode {
    /// Viewers receive the producer's encoded bytes unmodified
    #[default]
    Raw,
    /// Viewers negotiate a WebRTC track fed from decoded frames
    WebRtc,
}

impl DistributionMode {
    /// Whether frames must be decoded to pixels
    pub fn needs_pixels(&self) -> bool {
        matches!(self, DistributionMode::WebRtc)
    }
}

impl fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistributionMode::Raw => f.write_str("raw"),
            DistributionMode::WebRtc => f.write_str("webrtc"),
        }
    }
}

impl FromStr for DistributionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "ws" | "broadcast" => Ok(DistributionMode::Raw),
            "webrtc" | "rtc" => Ok(DistributionMode::WebRtc),
            other => Err(format!("unknown distribution mode: {}", other)),
        }
    }
}

/// One inbound producer message
#[derive(Debug, Clone)]
pub enum Payload {
    Binary(Bytes),
    Text(String),
}

/// Why a payload was not accepted as a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    /// Payload shorter than the minimum frame size
    #[error("payload of {len} bytes is below the {min} byte minimum")]
    TooSmall { len: usize, min: usize },

    /// The decoder rejected the payload
    #[error("decode failed: {0}")]
    DecodeFailed(#[from] DecodeError),

    /// Text payload where binary was required
    #[error("non-binary payload")]
    Malformed,
}

/// Validates and normalizes producer payloads
pub struct FramePipeline {
    mode: DistributionMode,
    min_frame_bytes: usize,
    decoder: Arc<dyn FrameDecoder>,

    /// Fixed resolution applied to every channel, if configured
    fixed_resolution: Option<Resolution>,

    /// Per-channel resolution, set on the first producer connection or frame
    pinned: RwLock<HashMap<ChannelId, Resolution>>,

    stats: PipelineStats,
}

impl FramePipeline {
    /// Create a pipeline with the JPEG decoder
    pub fn new(mode: DistributionMode) -> Self {
        Self::with_decoder(mode, Arc::new(JpegDecoder::new()))
    }

    /// Create a pipeline with a custom decoder
    pub fn with_decoder(mode: DistributionMode, decoder: Arc<dyn FrameDecoder>) -> Self {
        Self {
            mode,
            min_frame_bytes: DEFAULT_MIN_FRAME_BYTES,
            decoder,
            fixed_resolution: None,
            pinned: RwLock::new(HashMap::new()),
            stats: PipelineStats::default(),
        }
    }

    /// Set the minimum accepted payload size
    pub fn min_frame_bytes(mut self, min: usize) -> Self {
        self.min_frame_bytes = min;
        self
    }

    /// Force one resolution for every channel
    pub fn fixed_resolution(mut self, resolution: Option<Resolution>) -> Self {
        self.fixed_resolution = resolution.filter(|r| !r.is_empty());
        self
    }

    pub fn mode(&self) -> DistributionMode {
        self.mode
    }

    pub fn stats(&self) -> PipelineSnapshot {
        self.stats.snapshot()
    }

    /// Pin a channel's resolution if it has none yet
    ///
    /// Returns `true` if this call set it.
    pub async fn pin_resolution(&self, channel: &ChannelId, resolution: Resolution) -> bool {
        if resolution.is_empty() || self.fixed_resolution.is_some() {
            return false;
        }

        let mut pinned = self.pinned.write().await;
        if pinned.contains_key(channel) {
            return false;
        }
        pinned.insert(channel.clone(), resolution);
        tracing::debug!(channel = %channel, resolution = %resolution, "Resolution pinned");
        true
    }

    /// Reset a channel's resolution for a newly registered producer
    ///
    /// Any previous pin is dropped, then `declared` is pinned, both under one
    /// lock so no frame sees the channel unpinned in between.
    pub async fn repin(&self, channel: &ChannelId, declared: Option<Resolution>) {
        let mut pinned = self.pinned.write().await;
        if let Some(old) = pinned.remove(channel) {
            tracing::debug!(channel = %channel, resolution = %old, "Resolution released for new producer");
        }

        let declared = declared.filter(|r| !r.is_empty() && self.fixed_resolution.is_none());
        if let Some(resolution) = declared {
            pinned.insert(channel.clone(), resolution);
            tracing::debug!(channel = %channel, resolution = %resolution, "Resolution pinned");
        }
    }

    /// Resolution a channel's frames must match
    pub async fn resolution(&self, channel: &ChannelId) -> Option<Resolution> {
        match self.fixed_resolution {
            Some(fixed) => Some(fixed),
            None => self.pinned.read().await.get(channel).copied(),
        }
    }

    /// Forget a channel's pinned resolution (its producer left)
    pub async fn release(&self, channel: &ChannelId) {
        if self.pinned.write().await.remove(channel).is_some() {
            tracing::debug!(channel = %channel, "Resolution released");
        }
    }

    /// Validate one producer payload
    ///
    /// Every outcome is counted. Rejections are logged at debug and never
    /// affect the connection.
    pub async fn accept(&self, channel: &ChannelId, payload: Payload) -> Result<Frame, Rejected> {
        let result = self.validate(channel, payload).await;

        match &result {
            Ok(frame) => self.stats.record_accepted(frame.len()),
            Err(Rejected::TooSmall { .. }) => self.stats.record_too_small(),
            Err(Rejected::DecodeFailed(_)) => self.stats.record_decode_failed(),
            Err(Rejected::Malformed) => self.stats.record_malformed(),
        }

        if let Err(ref reason) = result {
            tracing::debug!(channel = %channel, reason = %reason, "Frame rejected");
        }

        result
    }

    async fn validate(&self, channel: &ChannelId, payload: Payload) -> Result<Frame, Rejected> {
        let data = match payload {
            Payload::Binary(data) => data,
            Payload::Text(_) => return Err(Rejected::Malformed),
        };

        if data.len() < self.min_frame_bytes {
            return Err(Rejected::TooSmall {
                len: data.len(),
                min: self.min_frame_bytes,
            });
        }

        let resolution = self.decoder.probe(&data)?;
        if resolution.is_empty() {
            return Err(DecodeError::ZeroDimensions.into());
        }

        match self.resolution(channel).await {
            Some(expected) if expected != resolution => {
                return Err(DecodeError::ResolutionChanged {
                    expected,
                    actual: resolution,
                }
                .into());
            }
            Some(_) => {}
            None => {
                // First frame on an unpinned channel fixes its resolution
                if !self.pin_resolution(channel, resolution).await {
                    if let Some(expected) = self.resolution(channel).await {
                        if expected != resolution {
                            return Err(DecodeError::ResolutionChanged {
                                expected,
                                actual: resolution,
                            }
                            .into());
                        }
                    }
                }
            }
        }

        let frame = Frame::encoded(data, resolution);
        if !self.mode.needs_pixels() {
            return Ok(frame);
        }

        let decoder = Arc::clone(&self.decoder);
        let encoded = frame.data.clone();
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&encoded))
            .await
            .map_err(|e| DecodeError::Task(e.to_string()))??;

        Ok(frame.with_decoded(decoded))
    }
}
