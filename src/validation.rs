//! Frame validation utilities.
//!
//! The pipeline only ever publishes complete JPEG images; these checks are
//! what it uses to reject truncated MJPG buffers, and what the tests use to
//! assert that viewers never see a torn frame.

use crate::error::{CameraError, Result};
use crate::traits::Frame;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Whether `data` holds one complete JPEG image.
///
/// Checks for the start-of-image marker at the front and the end-of-image
/// marker at the back. Zero padding after EOI is tolerated; several UVC
/// cameras pad MJPG buffers to a fixed size.
pub fn is_complete_jpeg(data: &[u8]) -> bool {
    let end = data
        .iter()
        .rposition(|&byte| byte != 0)
        .map_or(0, |idx| idx + 1);
    let Some(trimmed) = data.get(..end) else {
        return false;
    };
    trimmed.len() >= 4 && trimmed.starts_with(&SOI) && trimmed.ends_with(&EOI)
}

/// Validates that `data` is a complete JPEG image.
pub fn validate_jpeg(data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(CameraError::Encode("empty JPEG buffer".to_owned()));
    }
    if !is_complete_jpeg(data) {
        return Err(CameraError::Encode(format!(
            "incomplete JPEG ({} bytes)",
            data.len()
        )));
    }
    Ok(())
}

/// Validates that a sequence of frames has incrementing sequence numbers.
///
/// Checks that frame sequence numbers increment by 1 with no gaps.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::CaptureError(
            "Cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (idx, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else { continue };
        let expected = prev.metadata.sequence.wrapping_add(1);
        if curr.metadata.sequence != expected {
            return Err(CameraError::CaptureError(format!(
                "Frame sequence gap at index {}: expected {expected}, got {}",
                idx + 1,
                curr.metadata.sequence
            )));
        }
    }

    Ok(())
}
