//! V4L2 device implementation using the v4l crate.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{self, Control, MenuItem, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CameraError, Result};
use crate::mock::MockOpener;
use crate::traits::{
    normalize_control_name, CameraDevice, ControlDescriptor, DeviceCapabilities, DeviceInfo,
    DeviceOpener, FourCC, Frame, FrameMetadata, MenuEntry, RawControlType, Resolution,
};

/// Prefix routing device ids to the in-process mock backend.
pub const MOCK_PREFIX: &str = "mock://";

const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";

/// V4L2 device implementation wrapping the v4l crate.
///
/// The mmap stream is created on the first frame read and dropped before
/// every format change, since drivers refuse `S_FMT` while streaming.
pub struct V4l2Device {
    id: String,
    device: Device,
    capabilities: DeviceCapabilities,
    buffer_count: u32,
    stream: Option<Stream<'static>>,
    control_types: HashMap<u32, RawControlType>,
}

impl V4l2Device {
    /// Open a V4L2 device by path (e.g. `/dev/video0`).
    pub fn open(path: &str, buffer_count: u32) -> Result<Self> {
        let unavailable = |err: std::io::Error| CameraError::DeviceUnavailable(format!("{path}: {err}"));
        let device = Device::with_path(path).map_err(unavailable)?;
        let caps = device.query_caps().map_err(unavailable)?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        if !capabilities.can_capture {
            return Err(CameraError::DeviceUnavailable(format!(
                "{path}: not a video capture device"
            )));
        }

        Ok(Self {
            id: path.to_owned(),
            device,
            capabilities,
            buffer_count: buffer_count.max(1),
            stream: None,
            control_types: HashMap::new(),
        })
    }

    fn stream(&mut self) -> Result<&mut Stream<'static>> {
        if self.stream.is_none() {
            let stream = Stream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
                .map_err(|err| CameraError::CaptureError(format!("stream setup failed: {err}")))?;
            debug!(device = %self.id, buffers = self.buffer_count, "capture stream started");
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| CameraError::CaptureError("stream unavailable".to_owned()))
    }
}

fn describe(desc: &control::Description) -> Option<ControlDescriptor> {
    if desc.flags.contains(control::Flags::DISABLED) || desc.flags.contains(control::Flags::READ_ONLY) {
        return None;
    }
    let kind = match desc.typ {
        control::Type::Integer | control::Type::Integer64 => RawControlType::Integer,
        control::Type::Boolean => RawControlType::Boolean,
        control::Type::Menu | control::Type::IntegerMenu => RawControlType::Menu,
        control::Type::CtrlClass => return None,
        other => RawControlType::Other(format!("{other:?}").to_lowercase()),
    };
    let menu = desc
        .items
        .as_ref()
        .map(|items| {
            items
                .iter()
                .map(|(index, item)| match item {
                    MenuItem::Name(label) => MenuEntry::new(i64::from(*index), label),
                    MenuItem::Value(value) => MenuEntry::new(i64::from(*index), &value.to_string()),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ControlDescriptor {
        id: desc.id,
        name: normalize_control_name(&desc.name),
        kind,
        minimum: desc.minimum,
        maximum: desc.maximum,
        step: i64::try_from(desc.step).unwrap_or(1),
        default: Some(desc.default),
        current: desc.default,
        menu,
    })
}

fn control_value(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(value) => Some(*value),
        Value::Boolean(value) => Some(i64::from(*value)),
        _ => None,
    }
}

impl CameraDevice for V4l2Device {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn resolutions(&self) -> Result<Vec<Resolution>> {
        let formats = self
            .device
            .enum_formats()
            .map_err(|err| CameraError::DeviceUnavailable(format!("{}: {err}", self.id)))?;

        let mut resolutions = Vec::new();
        for format in formats {
            let fourcc = FourCC::from(format.fourcc);
            let sizes = match self.device.enum_framesizes(format.fourcc) {
                Ok(sizes) => sizes,
                Err(err) => {
                    warn!(device = %self.id, format = %fourcc, error = %err, "frame sizes not enumerable");
                    continue;
                }
            };
            for size in sizes {
                match size.size {
                    FrameSizeEnum::Discrete(discrete) => {
                        resolutions.push(Resolution::new(fourcc, discrete.width, discrete.height));
                    }
                    FrameSizeEnum::Stepwise(stepwise) => {
                        resolutions.push(Resolution::new(fourcc, stepwise.max_width, stepwise.max_height));
                        resolutions.push(Resolution::new(fourcc, stepwise.min_width, stepwise.min_height));
                    }
                }
            }
        }
        Ok(resolutions)
    }

    fn resolution(&self) -> Result<Resolution> {
        let fmt = self
            .device
            .format()
            .map_err(|err| CameraError::CaptureError(err.to_string()))?;
        Ok(Resolution::new(FourCC::from(fmt.fourcc), fmt.width, fmt.height))
    }

    fn set_resolution(&mut self, resolution: &Resolution) -> Result<Resolution> {
        self.stream = None;

        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::CaptureError(err.to_string()))?;
        fmt.width = resolution.width;
        fmt.height = resolution.height;
        fmt.fourcc = resolution.fourcc.into();

        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|_| CameraError::UnsupportedResolution(*resolution))?;
        let actual = Resolution::new(FourCC::from(fmt.fourcc), fmt.width, fmt.height);
        if actual != *resolution {
            warn!(device = %self.id, requested = %resolution, actual = %actual, "driver adjusted format");
            return Err(CameraError::UnsupportedResolution(*resolution));
        }
        Ok(actual)
    }

    fn controls(&self) -> Result<Vec<ControlDescriptor>> {
        let descriptions = self
            .device
            .query_controls()
            .map_err(|err| CameraError::DeviceUnavailable(format!("{}: {err}", self.id)))?;

        let mut controls = Vec::with_capacity(descriptions.len());
        for desc in &descriptions {
            let Some(mut control) = describe(desc) else {
                continue;
            };
            if let Some(current) = self
                .device
                .control(desc.id)
                .ok()
                .and_then(|ctrl| control_value(&ctrl.value))
            {
                control.current = current;
            }
            controls.push(control);
        }
        Ok(controls)
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        if self.control_types.is_empty() {
            for control in self.controls()? {
                self.control_types.insert(control.id, control.kind);
            }
        }
        let value = match self.control_types.get(&id) {
            Some(RawControlType::Boolean) => Value::Boolean(value != 0),
            Some(_) => Value::Integer(value),
            None => {
                return Err(CameraError::UnsupportedProperty(format!(
                    "control id {id:#x} not present on {}",
                    self.id
                )))
            }
        };
        self.device
            .set_control(Control { id, value })
            .map_err(|err| CameraError::UnsupportedProperty(format!("control id {id:#x}: {err}")))
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let resolution = self.resolution()?;
        let stream = self.stream()?;
        let (buf, meta) = stream
            .next()
            .map_err(|err| CameraError::CaptureError(err.to_string()))?;

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let used = usize::try_from(meta.bytesused).unwrap_or(usize::MAX);
        let data = buf.get(..used).unwrap_or(buf).to_vec();

        Ok(Frame {
            data,
            resolution,
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
            generation: 0,
        })
    }
}

/// Opens `/dev/video*` nodes.
#[derive(Debug, Clone, Copy)]
pub struct V4l2Opener {
    buffer_count: u32,
}

impl V4l2Opener {
    /// Opener allocating `buffer_count` mmap buffers per stream.
    pub const fn new(buffer_count: u32) -> Self {
        Self { buffer_count }
    }
}

impl Default for V4l2Opener {
    fn default() -> Self {
        Self::new(4)
    }
}

impl DeviceOpener for V4l2Opener {
    fn open(&self, device_id: &str) -> Result<Box<dyn CameraDevice>> {
        Ok(Box::new(V4l2Device::open(device_id, self.buffer_count)?))
    }

    fn discover(&self) -> Vec<DeviceInfo> {
        discover_devices(Path::new(SYSFS_VIDEO4LINUX))
            .into_iter()
            .filter(|info| {
                let usable = V4l2Device::open(&info.id, self.buffer_count).is_ok();
                if !usable {
                    debug!(device = %info.id, "skipping node without capture support");
                }
                usable
            })
            .collect()
    }
}

/// List `videoN` nodes under a sysfs `video4linux` directory, sorted by
/// index. Only reads sysfs; nodes are not opened.
pub fn discover_devices(sysfs: &Path) -> Vec<DeviceInfo> {
    let Ok(entries) = fs::read_dir(sysfs) else {
        return Vec::new();
    };
    let mut found: Vec<(u32, DeviceInfo)> = entries
        .flatten()
        .filter_map(|entry| {
            let node = entry.file_name().to_string_lossy().into_owned();
            let index: u32 = node.strip_prefix("video")?.parse().ok()?;
            let name = fs::read_to_string(entry.path().join("name"))
                .map(|name| name.trim().to_owned())
                .unwrap_or_else(|_| node.clone());
            Some((
                index,
                DeviceInfo {
                    id: format!("/dev/{node}"),
                    name,
                },
            ))
        })
        .collect();
    found.sort_by_key(|(index, _)| *index);
    found.into_iter().map(|(_, info)| info).collect()
}

/// Routes `mock://` ids to a [`MockOpener`] and everything else to V4L2.
#[derive(Clone)]
pub struct SystemOpener {
    v4l2: V4l2Opener,
    mock: MockOpener,
}

impl SystemOpener {
    /// Opener with no mock cameras registered.
    pub fn new(buffer_count: u32) -> Self {
        Self::with_mock(buffer_count, MockOpener::new())
    }

    /// Opener serving `mock://` ids from `mock`.
    pub const fn with_mock(buffer_count: u32, mock: MockOpener) -> Self {
        Self {
            v4l2: V4l2Opener::new(buffer_count),
            mock,
        }
    }
}

impl DeviceOpener for SystemOpener {
    fn open(&self, device_id: &str) -> Result<Box<dyn CameraDevice>> {
        if device_id.starts_with(MOCK_PREFIX) {
            self.mock.open(device_id)
        } else {
            self.v4l2.open(device_id)
        }
    }

    fn discover(&self) -> Vec<DeviceInfo> {
        let mut devices = self.v4l2.discover();
        devices.extend(self.mock.discover());
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCamera;

    #[test]
    fn test_discover_devices_sorted_by_index() {
        let sysfs = tempfile::tempdir().expect("tempdir");
        for (node, name) in [("video10", "Cam B\n"), ("video2", "Cam A\n"), ("vbi0", "teletext\n")] {
            let dir = sysfs.path().join(node);
            fs::create_dir(&dir).expect("node dir");
            fs::write(dir.join("name"), name).expect("name");
        }
        fs::create_dir(sysfs.path().join("video3")).expect("nameless node");

        let devices = discover_devices(sysfs.path());
        let ids: Vec<&str> = devices.iter().map(|info| info.id.as_str()).collect();
        assert_eq!(ids, ["/dev/video2", "/dev/video3", "/dev/video10"]);
        assert_eq!(devices.first().map(|info| info.name.as_str()), Some("Cam A"));
        assert_eq!(devices.get(1).map(|info| info.name.as_str()), Some("video3"));
    }

    #[test]
    fn test_discover_devices_missing_sysfs() {
        assert!(discover_devices(Path::new("/nonexistent/video4linux")).is_empty());
    }

    #[test]
    fn test_system_opener_routes_mock_ids() {
        let camera = MockCamera::new("mock://bench");
        let opener = SystemOpener::with_mock(4, MockOpener::new().with_camera(camera.clone()));

        let device = opener.open("mock://bench").expect("mock opens");
        assert_eq!(device.id(), "mock://bench");
        assert!(camera.is_open());
        assert!(opener.discover().iter().any(|info| info.id == "mock://bench"));

        assert!(matches!(
            opener.open("mock://other"),
            Err(CameraError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_v4l2_open_missing_node() {
        assert!(matches!(
            V4l2Device::open("/dev/video-does-not-exist", 4),
            Err(CameraError::DeviceUnavailable(_))
        ));
    }
}
