//! Core traits and types for the camera backend abstraction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CameraError, Result};

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");

    /// Whether frames in this format are already JPEG encoded.
    pub fn is_compressed(self) -> bool {
        self == Self::MJPG || self == Self::new(b"JPEG")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl FromStr for FourCC {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| CameraError::UnsupportedProperty(format!("invalid pixel format {s:?}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for FourCC {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FourCC {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// One (pixel format, width, height) tuple a device advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    /// Pixel format.
    #[serde(rename = "format")]
    pub fourcc: FourCC,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution.
    #[must_use]
    pub const fn new(fourcc: FourCC, width: u32, height: u32) -> Self {
        Self {
            fourcc,
            width,
            height,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}x{}", self.fourcc, self.width, self.height)
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// A camera found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Identifier passed to [`DeviceOpener::open`].
    pub id: String,
    /// Human readable name.
    pub name: String,
}

/// Control type as reported by the device, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawControlType {
    /// Integer with min/max/step.
    Integer,
    /// On/off switch.
    Boolean,
    /// Enumerated options.
    Menu,
    /// Anything else (buttons, strings, classes). Never registered.
    Other(String),
}

/// One menu option of a menu control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuEntry {
    /// Value written to the device to select this option.
    pub value: i64,
    /// Option label.
    pub label: String,
}

impl MenuEntry {
    /// Create a new menu entry.
    pub fn new(value: i64, label: &str) -> Self {
        Self {
            value,
            label: label.to_owned(),
        }
    }
}

/// Self-reported description of one adjustable device parameter.
#[derive(Debug, Clone)]
pub struct ControlDescriptor {
    /// Device-specific control id.
    pub id: u32,
    /// Normalized name (`auto_exposure`, `white_balance_temperature`).
    pub name: String,
    /// Reported type.
    pub kind: RawControlType,
    /// Reported minimum.
    pub minimum: i64,
    /// Reported maximum.
    pub maximum: i64,
    /// Reported step.
    pub step: i64,
    /// Device-supplied default, if any.
    pub default: Option<i64>,
    /// Value at discovery time.
    pub current: i64,
    /// Options, for menu controls.
    pub menu: Vec<MenuEntry>,
}

/// Normalize a driver control name the way `v4l2-ctl` prints it:
/// lowercase, runs of non-alphanumerics collapsed to a single `_`.
pub fn normalize_control_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Format the frame was captured in.
    pub resolution: Resolution,
    /// Frame metadata.
    pub metadata: FrameMetadata,
    /// Device handle generation the frame was read under.
    pub generation: u64,
}

/// Abstraction over one open camera.
///
/// Streaming starts lazily on the first [`next_frame`](Self::next_frame)
/// and stops whenever the format changes.
pub trait CameraDevice: Send {
    /// Identifier the device was opened with.
    fn id(&self) -> &str;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Every (format, width, height) the device advertises, in device order.
    fn resolutions(&self) -> Result<Vec<Resolution>>;

    /// Get the current capture format.
    fn resolution(&self) -> Result<Resolution>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_resolution(&mut self, resolution: &Resolution) -> Result<Resolution>;

    /// Every adjustable parameter with its reported constraints.
    fn controls(&self) -> Result<Vec<ControlDescriptor>>;

    /// Write one control value.
    fn set_control(&mut self, id: u32, value: i64) -> Result<()>;

    /// Capture the next frame.
    fn next_frame(&mut self) -> Result<Frame>;
}

/// Opens devices by id. One opener serves the whole process lifetime.
pub trait DeviceOpener: Send + Sync {
    /// Open a device exclusively.
    fn open(&self, device_id: &str) -> Result<Box<dyn CameraDevice>>;

    /// List the cameras currently attached.
    fn discover(&self) -> Vec<DeviceInfo>;
}
