//! Channel identifiers and frame types
//!
//! A [`Frame`] is one accepted unit of producer data. It always carries the
//! original encoded bytes and, when the distribution mode needs raw pixels,
//! the decoded picture as well.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;

/// Maximum length of a channel identifier
pub const MAX_CHANNEL_ID_LEN: usize = 128;

/// Opaque identifier of a channel (one camera and its viewers)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel id, validating its characters and length
    ///
    /// Accepts 1 to [`MAX_CHANNEL_ID_LEN`] characters from `[A-Za-z0-9_.-]`.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if Self::is_valid(&id) {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Check whether a string is a usable channel id
    pub fn is_valid(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_CHANNEL_ID_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Picture dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel layout of a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 (Y plane, then U, then V)
    I420,
    /// Packed 8-bit RGB
    Rgb24,
}

/// Decoded picture handed to the media sink
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Pixel buffer (zero-copy via reference counting)
    pub data: Bytes,
}

impl DecodedFrame {
    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}

/// A frame accepted from a producer
///
/// Cheap to clone: both buffers are reference counted.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Original encoded bytes, relayed unmodified
    pub data: Bytes,
    /// Arrival time at the relay
    pub received_at: Instant,
    /// Picture dimensions read from the encoded header
    pub resolution: Resolution,
    /// Decoded picture, present only when the pipeline decoded it
    pub decoded: Option<DecodedFrame>,
}

impl Frame {
    /// Create a frame that only carries encoded bytes
    pub fn encoded(data: Bytes, resolution: Resolution) -> Self {
        Self {
            data,
            received_at: Instant::now(),
            resolution,
            decoded: None,
        }
    }

    /// Attach the decoded picture
    pub fn with_decoded(mut self, decoded: DecodedFrame) -> Self {
        self.decoded = Some(decoded);
        self
    }

    /// Size of the encoded payload in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_validation() {
        assert!(ChannelId::new("cam-1").is_some());
        assert!(ChannelId::new("DEMO_001.front").is_some());
        assert!(ChannelId::new("").is_none());
        assert!(ChannelId::new("has space").is_none());
        assert!(ChannelId::new("a/b").is_none());
        assert!(ChannelId::new("x".repeat(MAX_CHANNEL_ID_LEN + 1)).is_none());
        assert!(ChannelId::new("x".repeat(MAX_CHANNEL_ID_LEN)).is_some());
    }

    #[test]
    fn test_channel_id_display() {
        let id = ChannelId::new("cam-1").unwrap();
        assert_eq!(id.to_string(), "cam-1");
        assert_eq!(id.as_str(), "cam-1");
    }

    #[test]
    fn test_resolution_empty() {
        assert!(Resolution::new(0, 480).is_empty());
        assert!(Resolution::new(640, 0).is_empty());
        assert!(!Resolution::new(640, 480).is_empty());
        assert_eq!(Resolution::new(640, 480).to_string(), "640x480");
    }

    #[test]
    fn test_frame_clone_shares_buffer() {
        let frame = Frame::encoded(Bytes::from(vec![0xFF; 64]), Resolution::new(8, 8));
        let copy = frame.clone();

        assert_eq!(frame.len(), 64);
        assert_eq!(frame.data.as_ptr(), copy.data.as_ptr());
        assert!(copy.decoded.is_none());
    }
}
