//! Mock device implementation for testing without hardware.
//!
//! A [`MockCamera`] is the simulated hardware: it keeps control values,
//! the active format and fault injection switches behind a shared lock, so a
//! test can inspect or disturb the "hardware" while a [`MockDevice`] opened
//! from it is owned by the device handle. Ids starting with `mock://` are
//! routed here by the system opener.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::encode::{encode_rgb, yuyv_to_rgb};
use crate::error::{CameraError, Result};
use crate::traits::{
    CameraDevice, ControlDescriptor, DeviceCapabilities, DeviceInfo, DeviceOpener, FourCC, Frame,
    FrameMetadata, MenuEntry, RawControlType, Resolution,
};

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// Build an integer control descriptor.
pub fn integer_control(id: u32, name: &str, min: i64, max: i64, step: i64) -> ControlDescriptor {
    ControlDescriptor {
        id,
        name: name.to_owned(),
        kind: RawControlType::Integer,
        minimum: min,
        maximum: max,
        step,
        default: None,
        current: min,
        menu: Vec::new(),
    }
}

/// Build a boolean control descriptor.
pub fn boolean_control(id: u32, name: &str) -> ControlDescriptor {
    ControlDescriptor {
        id,
        name: name.to_owned(),
        kind: RawControlType::Boolean,
        minimum: 0,
        maximum: 1,
        step: 1,
        default: None,
        current: 1,
        menu: Vec::new(),
    }
}

/// Build a menu control descriptor from `(value, label)` pairs.
pub fn menu_control(id: u32, name: &str, options: &[(i64, &str)]) -> ControlDescriptor {
    let menu: Vec<MenuEntry> = options
        .iter()
        .map(|&(value, label)| MenuEntry::new(value, label))
        .collect();
    let minimum = menu.iter().map(|entry| entry.value).min().unwrap_or(0);
    let maximum = menu.iter().map(|entry| entry.value).max().unwrap_or(0);
    ControlDescriptor {
        id,
        name: name.to_owned(),
        kind: RawControlType::Menu,
        minimum,
        maximum,
        step: 1,
        default: None,
        current: maximum,
        menu,
    }
}

struct MockState {
    id: String,
    name: String,
    resolutions: Vec<Resolution>,
    active: Resolution,
    controls: Vec<ControlDescriptor>,
    rejected: HashSet<String>,
    pattern: TestPattern,
    frame_interval: Duration,
    frame_count: u32,
    pending_read_failures: u32,
    fail_all_reads: bool,
    fail_open: bool,
    present: bool,
    open: bool,
    open_count: u32,
    jpeg: Option<Vec<u8>>,
}

/// Simulated camera hardware.
#[derive(Clone)]
pub struct MockCamera {
    state: Arc<Mutex<MockState>>,
}

impl MockCamera {
    /// Create a mock camera with a typical UVC webcam profile.
    #[must_use]
    pub fn new(id: &str) -> Self {
        let resolutions = vec![
            Resolution::new(FourCC::MJPG, 1920, 1080),
            Resolution::new(FourCC::MJPG, 1280, 720),
            Resolution::new(FourCC::YUYV, 640, 480),
        ];
        let mut brightness = integer_control(1, "brightness", 0, 255, 1);
        brightness.default = Some(128);
        brightness.current = 200;
        let controls = vec![
            brightness,
            integer_control(2, "contrast", 0, 95, 1),
            boolean_control(3, "white_balance_automatic"),
            menu_control(
                4,
                "power_line_frequency",
                &[(0, "Disabled"), (1, "50 Hz"), (2, "60 Hz")],
            ),
            menu_control(
                5,
                "auto_exposure",
                &[(1, "Manual Mode"), (3, "Aperture Priority Mode")],
            ),
            integer_control(6, "exposure_time_absolute", 3, 2047, 1),
        ];

        Self {
            state: Arc::new(Mutex::new(MockState {
                id: id.to_owned(),
                name: "Mock Camera".to_owned(),
                active: resolutions
                    .first()
                    .copied()
                    .unwrap_or(Resolution::new(FourCC::YUYV, 640, 480)),
                resolutions,
                controls,
                rejected: HashSet::new(),
                pattern: TestPattern::ColorBars,
                frame_interval: Duration::from_millis(10),
                frame_count: 0,
                pending_read_failures: 0,
                fail_all_reads: false,
                fail_open: false,
                present: true,
                open: false,
                open_count: 0,
                jpeg: None,
            })),
        }
    }

    /// Replace the advertised resolutions. The first becomes active.
    #[must_use]
    pub fn with_resolutions(self, resolutions: Vec<Resolution>) -> Self {
        {
            let mut state = self.state.lock();
            if let Some(first) = resolutions.first() {
                state.active = *first;
            }
            state.resolutions = resolutions;
        }
        self
    }

    /// Replace the advertised controls.
    #[must_use]
    pub fn with_controls(self, controls: Vec<ControlDescriptor>) -> Self {
        self.state.lock().controls = controls;
        self
    }

    /// Set the simulated time between frames.
    #[must_use]
    pub fn with_frame_interval(self, interval: Duration) -> Self {
        self.state.lock().frame_interval = interval;
        self
    }

    /// Set the test pattern for raw frame generation.
    #[must_use]
    pub fn with_pattern(self, pattern: TestPattern) -> Self {
        self.state.lock().pattern = pattern;
        self
    }

    /// Set the human readable name reported by discovery.
    #[must_use]
    pub fn with_name(self, name: &str) -> Self {
        name.clone_into(&mut self.state.lock().name);
        self
    }

    /// Device id.
    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    /// An opener that knows only this camera.
    pub fn opener(&self) -> MockOpener {
        MockOpener::new().with_camera(self.clone())
    }

    /// Make the next `count` frame reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().pending_read_failures = count;
    }

    /// Make every frame read fail until switched off.
    pub fn fail_all_reads(&self, fail: bool) {
        self.state.lock().fail_all_reads = fail;
    }

    /// Make subsequent opens fail.
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Simulate unplugging (`false`) or plugging in (`true`) the camera.
    pub fn set_present(&self, present: bool) {
        self.state.lock().present = present;
    }

    /// Make the device reject writes to this control.
    pub fn reject_control(&self, name: &str) {
        self.state.lock().rejected.insert(name.to_owned());
    }

    /// Current hardware value of a control.
    pub fn control_value(&self, name: &str) -> Option<i64> {
        self.state
            .lock()
            .controls
            .iter()
            .find(|ctrl| ctrl.name == name)
            .map(|ctrl| ctrl.current)
    }

    /// Format the hardware is currently set to.
    pub fn active_resolution(&self) -> Resolution {
        self.state.lock().active
    }

    /// How many times the camera has been opened.
    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    /// Whether a [`MockDevice`] for this camera is currently alive.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

/// Opener over a set of mock cameras.
#[derive(Clone, Default)]
pub struct MockOpener {
    cameras: Arc<Mutex<Vec<MockCamera>>>,
}

impl MockOpener {
    /// Create an opener with no cameras.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a camera.
    #[must_use]
    pub fn with_camera(self, camera: MockCamera) -> Self {
        self.add(camera);
        self
    }

    /// Register a camera.
    pub fn add(&self, camera: MockCamera) {
        self.cameras.lock().push(camera);
    }

    fn find(&self, device_id: &str) -> Option<MockCamera> {
        self.cameras
            .lock()
            .iter()
            .find(|camera| camera.state.lock().id == device_id)
            .cloned()
    }
}

impl DeviceOpener for MockOpener {
    fn open(&self, device_id: &str) -> Result<Box<dyn CameraDevice>> {
        let camera = self
            .find(device_id)
            .ok_or_else(|| CameraError::DeviceUnavailable(format!("{device_id}: no such device")))?;

        let capabilities = {
            let mut state = camera.state.lock();
            if !state.present || state.fail_open {
                return Err(CameraError::DeviceUnavailable(format!(
                    "{device_id}: cannot open"
                )));
            }
            if state.open {
                return Err(CameraError::DeviceUnavailable(format!("{device_id}: busy")));
            }
            state.open = true;
            state.open_count += 1;
            DeviceCapabilities {
                driver: "mock".to_owned(),
                card: state.name.clone(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            }
        };

        Ok(Box::new(MockDevice {
            id: device_id.to_owned(),
            capabilities,
            camera,
        }))
    }

    fn discover(&self) -> Vec<DeviceInfo> {
        self.cameras
            .lock()
            .iter()
            .filter_map(|camera| {
                let state = camera.state.lock();
                state.present.then(|| DeviceInfo {
                    id: state.id.clone(),
                    name: state.name.clone(),
                })
            })
            .collect()
    }
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    id: String,
    capabilities: DeviceCapabilities,
    camera: MockCamera,
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.camera.state.lock().open = false;
    }
}

impl CameraDevice for MockDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn resolutions(&self) -> Result<Vec<Resolution>> {
        Ok(self.camera.state.lock().resolutions.clone())
    }

    fn resolution(&self) -> Result<Resolution> {
        Ok(self.camera.state.lock().active)
    }

    fn set_resolution(&mut self, resolution: &Resolution) -> Result<Resolution> {
        let mut state = self.camera.state.lock();
        if !state.resolutions.contains(resolution) {
            return Err(CameraError::UnsupportedResolution(*resolution));
        }
        state.active = *resolution;
        Ok(state.active)
    }

    fn controls(&self) -> Result<Vec<ControlDescriptor>> {
        Ok(self.camera.state.lock().controls.clone())
    }

    fn set_control(&mut self, id: u32, value: i64) -> Result<()> {
        let mut state = self.camera.state.lock();
        let MockState {
            controls, rejected, ..
        } = &mut *state;
        let ctrl = controls
            .iter_mut()
            .find(|ctrl| ctrl.id == id)
            .ok_or_else(|| CameraError::UnsupportedProperty(format!("control id {id}")))?;

        if rejected.contains(&ctrl.name) {
            return Err(CameraError::UnsupportedProperty(format!(
                "{} rejected by device",
                ctrl.name
            )));
        }
        let valid = match ctrl.kind {
            RawControlType::Menu => ctrl.menu.iter().any(|entry| entry.value == value),
            _ => (ctrl.minimum..=ctrl.maximum).contains(&value),
        };
        if !valid {
            return Err(CameraError::OutOfRange {
                name: ctrl.name.clone(),
                value,
                min: ctrl.minimum,
                max: ctrl.maximum,
            });
        }
        ctrl.current = value;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let interval = self.camera.state.lock().frame_interval;
        if !interval.is_zero() {
            thread::sleep(interval);
        }

        let mut state = self.camera.state.lock();
        if state.fail_all_reads {
            return Err(CameraError::CaptureError("simulated read failure".to_owned()));
        }
        if state.pending_read_failures > 0 {
            state.pending_read_failures -= 1;
            return Err(CameraError::CaptureError("simulated read failure".to_owned()));
        }

        let resolution = state.active;
        let data = if resolution.fourcc.is_compressed() {
            if state.jpeg.is_none() {
                state.jpeg = Some(small_jpeg(state.pattern)?);
            }
            state.jpeg.clone().unwrap_or_default()
        } else if resolution.fourcc == FourCC::RGB3 {
            yuyv_to_rgb(&generate_test_frame(
                resolution.width,
                resolution.height,
                state.pattern,
            ))
        } else {
            generate_test_frame(resolution.width, resolution.height, state.pattern)
        };

        let seq = state.frame_count;
        state.frame_count = state.frame_count.wrapping_add(1);

        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = data.len() as u32;
        Ok(Frame {
            data,
            resolution,
            metadata: FrameMetadata {
                sequence: seq,
                timestamp: Duration::from_millis(u64::from(seq) * 33), // ~30fps
                bytes_used,
            },
            generation: 0,
        })
    }
}

/// Stand-in payload for MJPG formats: a small but complete JPEG.
fn small_jpeg(pattern: TestPattern) -> Result<Vec<u8>> {
    let (width, height) = (64, 32);
    let rgb = yuyv_to_rgb(&generate_test_frame(width, height, pattern));
    encode_rgb(&rgb, width, height, 80)
}

/// Generate YUYV test frame data based on pattern.
pub fn generate_test_frame(width: u32, height: u32, pattern: TestPattern) -> Vec<u8> {
    let size = (width * height * 2) as usize; // YUYV = 2 bytes/pixel
    let mut data = vec![0u8; size];

    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut data, width),
        TestPattern::Gradient => generate_gradient(&mut data, width),
        TestPattern::Solid(y, u, v) => fill_groups(&mut data, |_| (y, u, v)),
    }

    data
}

/// Fill every `[Y0 U Y1 V]` group; the closure gets the group's x coordinate.
fn fill_groups<F: FnMut(usize) -> (u8, u8, u8)>(data: &mut [u8], mut color: F) {
    for (idx, group) in data.chunks_exact_mut(4).enumerate() {
        let (y, u, v) = color(idx * 2);
        group.copy_from_slice(&[y, u, y, v]);
    }
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    const BARS: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];

    let width = width.max(1) as usize;
    let bar_width = (width / 8).max(1);
    fill_groups(data, |x| {
        let bar = ((x % width) / bar_width).min(7);
        BARS.get(bar).copied().unwrap_or((16, 128, 128))
    });
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32) {
    let width = width.max(1) as usize;
    fill_groups(data, |x| {
        #[allow(clippy::cast_possible_truncation)]
        let y = (((x % width) * 255) / width) as u8;
        (y, 128, 128)
    });
}
