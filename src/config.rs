//! Configuration file.
//!
//! TOML, every key optional. Lookup order: an explicit path, then the file
//! named by `PI_CAM_CONFIG`, then built-in defaults. `PI_CAM_DEVICE`
//! overrides the device from any source.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CameraError, Result};
use crate::pipeline::PipelineConfig;
use crate::session::SessionConfig;
use crate::traits::Resolution;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "PI_CAM_CONFIG";
/// Environment variable overriding the device id.
pub const DEVICE_ENV: &str = "PI_CAM_DEVICE";

const DEFAULT_TIMELAPSE_DIR: &str = "timelapse";
const DEFAULT_RECORDING_DIR: &str = "videos";
const DEFAULT_JPEG_QUALITY: u8 = 70;
const DEFAULT_BUFFER_COUNT: u32 = 4;
const DEFAULT_RECONFIGURE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_MAX_CAPTURE_RETRIES: u32 = 10;
const DEFAULT_RETRY_DELAY_MS: u64 = 33;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device to open: `/dev/videoN` or `mock://name`. `None` picks the
    /// first discovered camera.
    pub device: Option<String>,
    /// Timelapse snapshot directory.
    pub timelapse_dir: PathBuf,
    /// Recording directory.
    pub recording_dir: PathBuf,
    /// JPEG quality for frames the device does not deliver as MJPG.
    pub jpeg_quality: u8,
    /// V4L2 mmap buffer count.
    pub buffer_count: u32,
    /// How long a reconfiguration waits for readers.
    pub reconfigure_timeout_ms: u64,
    /// Consecutive capture failures tolerated before giving up.
    pub max_capture_retries: u32,
    /// Delay between capture retries.
    pub retry_delay_ms: u64,
    /// Write computed control defaults every time a device is opened.
    pub apply_defaults_on_open: bool,
    /// Capture settings used while a timelapse runs.
    pub timelapse: TimelapseProfile,
}

/// Resolution and control values a timelapse switches to when it starts.
/// The previous settings come back when it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelapseProfile {
    /// Resolution to capture at. `None` keeps the preview resolution.
    pub resolution: Option<Resolution>,
    /// Control values by name.
    pub controls: BTreeMap<String, i64>,
}

impl TimelapseProfile {
    /// Whether the profile changes nothing.
    pub fn is_empty(&self) -> bool {
        self.resolution.is_none() && self.controls.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            timelapse_dir: PathBuf::from(DEFAULT_TIMELAPSE_DIR),
            recording_dir: PathBuf::from(DEFAULT_RECORDING_DIR),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            buffer_count: DEFAULT_BUFFER_COUNT,
            reconfigure_timeout_ms: DEFAULT_RECONFIGURE_TIMEOUT_MS,
            max_capture_retries: DEFAULT_MAX_CAPTURE_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            apply_defaults_on_open: true,
            timelapse: TimelapseProfile::default(),
        }
    }
}

impl Config {
    /// Load from `path`, or from `PI_CAM_CONFIG`, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse one TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            CameraError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|err| CameraError::Config(format!("invalid {}: {err}", path.display())))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(device) = std::env::var(DEVICE_ENV) {
            if !device.trim().is_empty() {
                self.device = Some(device.trim().to_owned());
            }
        }
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(CameraError::Config(format!(
                "jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.reconfigure_timeout_ms == 0 {
            return Err(CameraError::Config(
                "reconfigure_timeout_ms must be greater than zero".to_owned(),
            ));
        }
        if self.buffer_count == 0 {
            return Err(CameraError::Config(
                "buffer_count must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Write this configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|err| CameraError::Config(format!("cannot serialize config: {err}")))?;
        fs::write(path, raw)?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Create both output directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.timelapse_dir)?;
        fs::create_dir_all(&self.recording_dir)?;
        Ok(())
    }

    /// Reconfiguration bound.
    pub const fn reconfigure_timeout(&self) -> Duration {
        Duration::from_millis(self.reconfigure_timeout_ms)
    }

    /// Retry and pause settings for the streaming pipeline.
    pub const fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            max_retries: self.max_capture_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            pause_timeout: self.reconfigure_timeout(),
        }
    }

    /// Output and retry settings for sessions.
    pub fn sessions(&self) -> SessionConfig {
        SessionConfig {
            timelapse_dir: self.timelapse_dir.clone(),
            recording_dir: self.recording_dir.clone(),
            max_retries: self.max_capture_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}
