//! Frame decoding
//!
//! The pipeline never parses JPEG itself. It goes through [`FrameDecoder`],
//! which has a cheap header probe and a full decode into the pixel layout the
//! media sink expects.

use std::io::Cursor;

use bytes::Bytes;
use image::{ImageFormat, ImageReader};

use crate::registry::{DecodedFrame, PixelFormat, Resolution};

/// Error raised when a payload cannot be turned into a picture
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The decoder could not parse the payload
    #[error("invalid image data: {0}")]
    Invalid(String),

    /// The payload parsed but reports a zero width or height
    #[error("image has zero width or height")]
    ZeroDimensions,

    /// The frame does not match the channel's configured resolution
    #[error("resolution changed from {expected} to {actual}")]
    ResolutionChanged {
        expected: Resolution,
        actual: Resolution,
    },

    /// The blocking decode task did not complete
    #[error("decode task failed: {0}")]
    Task(String),
}

/// Decoder collaborator: bytes in, dimensions and pixels out
pub trait FrameDecoder: Send + Sync + 'static {
    /// Read picture dimensions from the header without decoding pixels
    fn probe(&self, data: &[u8]) -> Result<Resolution, DecodeError>;

    /// Fully decode into the configured pixel format
    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, DecodeError>;
}

/// JPEG decoder backed by the `image` crate
#[derive(Debug, Clone, Copy)]
pub struct JpegDecoder {
    output: PixelFormat,
}

impl JpegDecoder {
    /// Decoder producing I420, the layout the H.264 encoder consumes
    pub fn new() -> Self {
        Self {
            output: PixelFormat::I420,
        }
    }

    /// Decoder producing a specific pixel format
    pub fn with_output(output: PixelFormat) -> Self {
        Self { output }
    }
}

impl Default for JpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for JpegDecoder {
    fn probe(&self, data: &[u8]) -> Result<Resolution, DecodeError> {
        let (width, height) = ImageReader::with_format(Cursor::new(data), ImageFormat::Jpeg)
            .into_dimensions()
            .map_err(|e| DecodeError::Invalid(e.to_string()))?;

        Ok(Resolution::new(width, height))
    }

    fn decode(&self, data: &[u8]) -> Result<DecodedFrame, DecodeError> {
        let rgb = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .map_err(|e| DecodeError::Invalid(e.to_string()))?
            .to_rgb8();

        let resolution = Resolution::new(rgb.width(), rgb.height());
        if resolution.is_empty() {
            return Err(DecodeError::ZeroDimensions);
        }

        match self.output {
            PixelFormat::Rgb24 => Ok(DecodedFrame {
                resolution,
                format: PixelFormat::Rgb24,
                data: Bytes::from(rgb.into_raw()),
            }),
            PixelFormat::I420 => {
                let (yuv, even) = rgb_to_i420(rgb.as_raw(), resolution)?;
                Ok(DecodedFrame {
                    resolution: even,
                    format: PixelFormat::I420,
                    data: Bytes::from(yuv),
                })
            }
        }
    }
}

/// Convert packed RGB24 to planar I420 (BT.601)
///
/// Chroma is subsampled 2x2, so an odd trailing row or column is cropped.
/// Returns the buffer and the resolution it actually covers.
pub fn rgb_to_i420(
    rgb: &[u8],
    resolution: Resolution,
) -> Result<(Vec<u8>, Resolution), DecodeError> {
    let src_w = resolution.width as usize;
    let w = src_w & !1;
    let h = (resolution.height as usize) & !1;

    if w == 0 || h == 0 {
        return Err(DecodeError::ZeroDimensions);
    }
    if rgb.len() < src_w * resolution.height as usize * 3 {
        return Err(DecodeError::Invalid(format!(
            "pixel buffer too short for {}",
            resolution
        )));
    }

    let y_size = w * h;
    let uv_size = (w / 2) * (h / 2);
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let idx = (y * src_w + x) * 3;
            let r = rgb[idx] as i32;
            let g = rgb[idx + 1] as i32;
            let b = rgb[idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * (w / 2) + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    Ok((yuv, Resolution::new(w as u32, h as u32)))
}

/// Encode a gradient test picture as JPEG
#[cfg(test)]
pub(crate) fn test_jpeg(width: u32, height: u32) -> Bytes {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
    });

    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    Bytes::from(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reads_header() {
        let jpeg = test_jpeg(64, 48);
        let decoder = JpegDecoder::new();

        assert_eq!(decoder.probe(&jpeg).unwrap(), Resolution::new(64, 48));
    }

    #[test]
    fn test_probe_rejects_garbage() {
        let decoder = JpegDecoder::new();
        let garbage = vec![0x42u8; 512];

        assert!(matches!(decoder.probe(&garbage), Err(DecodeError::Invalid(_))));
    }

    #[test]
    fn test_decode_i420_size() {
        let jpeg = test_jpeg(64, 48);
        let frame = JpegDecoder::new().decode(&jpeg).unwrap();

        assert_eq!(frame.format, PixelFormat::I420);
        assert_eq!(frame.resolution, Resolution::new(64, 48));
        assert_eq!(frame.data.len(), 64 * 48 * 3 / 2);
    }

    #[test]
    fn test_decode_rgb() {
        let jpeg = test_jpeg(20, 10);
        let frame = JpegDecoder::with_output(PixelFormat::Rgb24)
            .decode(&jpeg)
            .unwrap();

        assert_eq!(frame.format, PixelFormat::Rgb24);
        assert_eq!(frame.data.len(), 20 * 10 * 3);
    }

    #[test]
    fn test_i420_crops_odd_dimensions() {
        let rgb = vec![255u8; 5 * 3 * 3];
        let (yuv, res) = rgb_to_i420(&rgb, Resolution::new(5, 3)).unwrap();

        assert_eq!(res, Resolution::new(4, 2));
        assert_eq!(yuv.len(), 4 * 2 + 2 * 2);
        // White maps to full-range-limited luma
        assert_eq!(yuv[0], 235);
    }

    #[test]
    fn test_i420_rejects_degenerate() {
        let rgb = vec![0u8; 3];
        assert_eq!(
            rgb_to_i420(&rgb, Resolution::new(1, 1)),
            Err(DecodeError::ZeroDimensions)
        );
    }
}
