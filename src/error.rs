//! Error type shared by every camera component.
//!
//! Each variant maps to one failure kind a command can report back to its
//! caller. None of them are fatal to the process: a failed command leaves the
//! device in its previous state unless the variant says otherwise.

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionKind;
use crate::traits::Resolution;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The requested device is missing, busy, or could not be opened.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device handle was closed while the caller was using it.
    #[error("device closed")]
    DeviceClosed,

    /// A single frame read failed. Usually transient.
    #[error("capture error: {0}")]
    CaptureError(String),

    /// The device rejected a property, or reported bounds that cannot be used.
    #[error("unsupported property: {0}")]
    UnsupportedProperty(String),

    /// The value lies outside the control's bounds or menu options.
    #[error("value {value} out of range for {name} [{min}, {max}]")]
    OutOfRange {
        /// Control name.
        name: String,
        /// Rejected value.
        value: i64,
        /// Lower bound.
        min: i64,
        /// Upper bound.
        max: i64,
    },

    /// No control with this name was discovered on the open device.
    #[error("unknown control: {0}")]
    UnknownControl(String),

    /// The resolution is not in the device's catalog.
    #[error("unsupported resolution: {0}")]
    UnsupportedResolution(Resolution),

    /// A session of this kind is already running.
    #[error("{0} session already running")]
    AlreadyRunning(SessionKind),

    /// Readers could not be paused before the reconfiguration timeout.
    #[error("device busy: readers not paused within {0:?}")]
    DeviceBusy(Duration),

    /// Frame encoding failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Whether a reader may retry after this error with the same configuration.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::CaptureError(_) | Self::Encode(_))
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FourCC;

    #[test]
    fn test_error_display() {
        let err = CameraError::OutOfRange {
            name: "brightness".to_owned(),
            value: 300,
            min: 0,
            max: 255,
        };
        assert_eq!(
            err.to_string(),
            "value 300 out of range for brightness [0, 255]"
        );

        let err = CameraError::UnsupportedResolution(Resolution::new(FourCC::MJPG, 800, 600));
        assert_eq!(err.to_string(), "unsupported resolution: MJPG 800x600");

        let err = CameraError::AlreadyRunning(SessionKind::Timelapse);
        assert_eq!(err.to_string(), "timelapse session already running");
    }

    #[test]
    fn test_transient_classification() {
        assert!(CameraError::CaptureError("timeout".to_owned()).is_transient());
        assert!(!CameraError::DeviceClosed.is_transient());
        assert!(!CameraError::DeviceUnavailable("gone".to_owned()).is_transient());
    }
}
