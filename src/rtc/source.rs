//! H.264 video source shared by every viewer of a channel
//!
//! Decoded I420 frames go to a dedicated encoder thread over a small bounded
//! queue; encoded access units are written by an async task to every
//! attached track. A full queue drops the frame instead of blocking the
//! producer.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use openh264::encoder::Encoder;
use openh264::formats::YUVBuffer;
use tokio::sync::{mpsc, RwLock};
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::registry::{ChannelId, DecodedFrame, PixelFormat, Resolution};
use crate::signaling::{EngineError, VideoSource};

/// Frames buffered ahead of the encoder
const ENCODER_QUEUE: usize = 2;

/// Sample duration used when frame timing is unknown
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(100);

enum EncoderCommand {
    Frame(DecodedFrame),
    ForceKeyframe,
}

struct AccessUnit {
    data: Bytes,
    captured_at: Instant,
}

type Tracks = Arc<RwLock<Vec<Arc<TrackLocalStaticSample>>>>;

/// Per-channel encoder feeding any number of tracks
pub struct H264Source {
    channel: ChannelId,
    resolution: Resolution,
    commands: SyncSender<EncoderCommand>,
    tracks: Tracks,
}

impl H264Source {
    /// Start the encoder thread and sample writer for a channel
    pub fn spawn(channel: ChannelId, resolution: Resolution) -> Result<Arc<Self>, EngineError> {
        let (commands, commands_rx) = sync_channel(ENCODER_QUEUE);
        let (units_tx, units_rx) = mpsc::channel(ENCODER_QUEUE);
        let tracks: Tracks = Arc::new(RwLock::new(Vec::new()));

        let thread_channel = channel.clone();
        std::thread::Builder::new()
            .name(format!("h264-{}", channel))
            .spawn(move || encode_loop(thread_channel, commands_rx, units_tx))
            .map_err(|e| EngineError::Source(e.to_string()))?;

        tokio::spawn(write_loop(channel.clone(), units_rx, Arc::clone(&tracks)));

        Ok(Arc::new(Self {
            channel,
            resolution,
            commands,
            tracks,
        }))
    }

    /// Create a new track fed by this source
    pub async fn attach(&self) -> Arc<TrackLocalStaticSample> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                rtcp_feedback: vec![],
            },
            "video".to_owned(),
            format!("camrelay-{}", self.channel),
        ));

        let count = {
            let mut tracks = self.tracks.write().await;
            tracks.push(Arc::clone(&track));
            tracks.len()
        };

        // New viewers need an IDR before they can decode anything
        self.request_keyframe();
        tracing::debug!(channel = %self.channel, tracks = count, "Track attached");
        track
    }

    /// Stop feeding a track
    pub async fn detach(&self, track: &Arc<TrackLocalStaticSample>) {
        let mut tracks = self.tracks.write().await;
        tracks.retain(|t| !Arc::ptr_eq(t, track));
        tracing::debug!(channel = %self.channel, tracks = tracks.len(), "Track detached");
    }

    /// Ask the encoder to make the next frame an IDR
    pub fn request_keyframe(&self) {
        let _ = self.commands.try_send(EncoderCommand::ForceKeyframe);
    }
}

impl VideoSource for H264Source {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn push_frame(&self, frame: &DecodedFrame) -> Result<(), EngineError> {
        if frame.format != PixelFormat::I420 {
            return Err(EngineError::Source(format!(
                "expected I420 input, got {:?}",
                frame.format
            )));
        }

        match self.commands.try_send(EncoderCommand::Frame(frame.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::debug!(channel = %self.channel, "Encoder busy, frame dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(EngineError::SourceClosed),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

fn encode_loop(
    channel: ChannelId,
    commands: Receiver<EncoderCommand>,
    units: mpsc::Sender<AccessUnit>,
) {
    let mut encoder: Option<(Encoder, Resolution)> = None;
    let mut force_keyframe = false;

    while let Ok(command) = commands.recv() {
        let frame = match command {
            EncoderCommand::ForceKeyframe => {
                force_keyframe = true;
                continue;
            }
            EncoderCommand::Frame(frame) => frame,
        };

        // Rebuild the encoder when the picture size changes
        if encoder.as_ref().map(|(_, res)| *res) != Some(frame.resolution) {
            match Encoder::new() {
                Ok(fresh) => encoder = Some((fresh, frame.resolution)),
                Err(e) => {
                    tracing::error!(channel = %channel, error = %e, "Failed to create H.264 encoder");
                    return;
                }
            }
        }

        let Some((enc, _)) = encoder.as_mut() else {
            continue;
        };

        if force_keyframe {
            enc.force_intra_frame();
            force_keyframe = false;
        }

        let yuv = YUVBuffer::from_vec(
            frame.data.to_vec(),
            frame.width() as usize,
            frame.height() as usize,
        );

        let data = match enc.encode(&yuv) {
            Ok(bitstream) => bitstream.to_vec(),
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "H.264 encode failed");
                continue;
            }
        };

        if data.is_empty() {
            continue;
        }

        let unit = AccessUnit {
            data: Bytes::from(data),
            captured_at: Instant::now(),
        };
        if units.blocking_send(unit).is_err() {
            break;
        }
    }

    tracing::debug!(channel = %channel, "Encoder thread exiting");
}

async fn write_loop(channel: ChannelId, mut units: mpsc::Receiver<AccessUnit>, tracks: Tracks) {
    let mut last: Option<Instant> = None;

    while let Some(unit) = units.recv().await {
        let duration = last
            .map(|prev| unit.captured_at.saturating_duration_since(prev))
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_FRAME_DURATION);
        last = Some(unit.captured_at);

        let sample = Sample {
            data: unit.data,
            duration,
            ..Default::default()
        };

        let tracks = tracks.read().await.clone();
        for track in tracks {
            if let Err(e) = track.write_sample(&sample).await {
                tracing::debug!(channel = %channel, error = %e, "Sample write failed");
            }
        }
    }
}
