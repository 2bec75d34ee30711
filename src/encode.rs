//! Frame encoding.
//!
//! Frames leave the core as complete JPEG images. MJPG frames are passed
//! through untouched after a completeness check; raw formats are converted to
//! RGB and compressed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::ExtendedColorType;

use crate::error::{CameraError, Result};
use crate::traits::{FourCC, Frame, Resolution};
use crate::validation::validate_jpeg;

/// A fully encoded frame, ready to hand to viewers or write to disk.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG bytes.
    pub jpeg: Vec<u8>,
    /// Format the source frame was captured in.
    pub resolution: Resolution,
    /// Device sequence number of the source frame.
    pub sequence: u32,
    /// Device timestamp of the source frame.
    pub timestamp: Duration,
    /// Wall clock time the frame was encoded.
    pub captured_at: DateTime<Utc>,
}

/// Turns raw frames into JPEG images.
pub trait FrameEncoder: Send + Sync {
    /// Encode one frame.
    fn encode(&self, frame: &Frame) -> Result<EncodedFrame>;
}

/// JPEG encoder backed by the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct JpegEncoder {
    quality: u8,
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(70)
    }
}

impl JpegEncoder {
    /// Create an encoder with the given quality (1-100).
    #[must_use]
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    fn to_jpeg(&self, frame: &Frame) -> Result<Vec<u8>> {
        let Resolution {
            fourcc,
            width,
            height,
        } = frame.resolution;
        let pixels = (width as usize) * (height as usize);

        if fourcc.is_compressed() {
            validate_jpeg(&frame.data)?;
            return Ok(frame.data.clone());
        }

        if fourcc == FourCC::YUYV {
            let needed = pixels * 2;
            let data = frame.data.get(..needed).ok_or_else(|| short_frame(frame, needed))?;
            return encode_rgb(&yuyv_to_rgb(data), width, height, self.quality);
        }

        if fourcc == FourCC::RGB3 {
            let needed = pixels * 3;
            let data = frame.data.get(..needed).ok_or_else(|| short_frame(frame, needed))?;
            return encode_rgb(data, width, height, self.quality);
        }

        Err(CameraError::Encode(format!(
            "no encoder for pixel format {fourcc}"
        )))
    }
}

impl FrameEncoder for JpegEncoder {
    fn encode(&self, frame: &Frame) -> Result<EncodedFrame> {
        Ok(EncodedFrame {
            jpeg: self.to_jpeg(frame)?,
            resolution: frame.resolution,
            sequence: frame.metadata.sequence,
            timestamp: frame.metadata.timestamp,
            captured_at: Utc::now(),
        })
    }
}

fn short_frame(frame: &Frame, needed: usize) -> CameraError {
    CameraError::Encode(format!(
        "short {} frame: {} of {needed} bytes",
        frame.resolution,
        frame.data.len()
    ))
}

/// Compress packed 24-bit RGB into a JPEG.
pub fn encode_rgb(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ImageJpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|err| CameraError::Encode(err.to_string()))?;
    Ok(out)
}

/// Convert packed YUYV (4:2:2) to packed RGB.
///
/// Each `[Y0 U Y1 V]` group yields two pixels sharing the chroma pair.
pub fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for group in data.chunks_exact(4) {
        if let [y0, u, y1, v] = *group {
            let (r, g, b) = yuv_to_rgb(y0, u, v);
            rgb.extend_from_slice(&[r, g, b]);
            let (r, g, b) = yuv_to_rgb(y1, u, v);
            rgb.extend_from_slice(&[r, g, b]);
        }
    }
    rgb
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula. Values are clamped to 0-255.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}
