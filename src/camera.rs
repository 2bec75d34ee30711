//! The command interface.
//!
//! [`Camera`] owns the device handle, the streaming pipeline and the session
//! scheduler, and keeps the discovered controls and resolutions in one state
//! record. Commands that change the device run one at a time. Switches
//! (resolution, camera, control reset) pause the pipeline and the sessions,
//! reopen the device under the handle's exclusive lock, and resume them.
//!
//! [`Camera::status`] reads the state record under a shared lock that every
//! switch holds exclusively, so a status snapshot is never torn across a
//! reconfiguration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Config, TimelapseProfile};
use crate::controls::{Control, ControlRegistry, ResetReport, SkippedControl};
use crate::encode::{EncodedFrame, FrameEncoder, JpegEncoder};
use crate::error::{CameraError, Result};
use crate::handle::{DeviceHandle, Reconfigure};
use crate::pipeline::{FrameSubscriber, PipelineStats, StreamingPipeline};
use crate::resolution::ResolutionCatalog;
use crate::session::{SessionKind, SessionScheduler, SessionsStatus};
use crate::traits::{DeviceInfo, DeviceOpener, Resolution};

/// Stale frames tolerated by a photo capture before giving up.
const PHOTO_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct CoreState {
    device_id: Option<String>,
    catalog: Option<ResolutionCatalog>,
    registry: ControlRegistry,
    last_reset: Option<ResetReport>,
}

impl CoreState {
    fn active_resolution(&self) -> Option<Resolution> {
        self.catalog.as_ref().map(ResolutionCatalog::active)
    }
}

/// What to write to the controls once a device is up.
enum ControlSetup {
    /// Leave them as the device opened.
    Keep,
    /// Computed defaults.
    Defaults,
    /// Values carried over from before the switch.
    Restore(BTreeMap<String, i64>),
}

/// Preview settings put aside while a timelapse profile is active.
struct SavedSettings {
    resolution: Option<Resolution>,
    controls: BTreeMap<String, i64>,
}

enum Switch {
    Done(CoreState),
    RolledBack(CoreState, CameraError),
}

/// Point-in-time view of the whole camera.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    /// Open device, if any.
    pub device: Option<String>,
    /// Active resolution.
    pub resolution: Option<Resolution>,
    /// Every supported resolution.
    pub resolutions: Vec<Resolution>,
    /// Registered controls with current values.
    pub controls: Vec<Control>,
    /// Controls found on the device but not registered.
    pub unsupported_controls: Vec<SkippedControl>,
    /// Outcome of the last defaults application.
    pub last_reset: Option<ResetReport>,
    /// Streaming pipeline state and counters.
    pub pipeline: PipelineStats,
    /// Both sessions.
    pub sessions: SessionsStatus,
    /// Timelapse directory for the next session.
    pub timelapse_dir: PathBuf,
    /// Recording directory for the next session.
    pub recording_dir: PathBuf,
    /// When this snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

/// Single-camera capture service.
pub struct Camera {
    handle: Arc<DeviceHandle>,
    encoder: Arc<dyn FrameEncoder>,
    state: RwLock<CoreState>,
    commands: Mutex<()>,
    pipeline: StreamingPipeline,
    sessions: SessionScheduler,
    preferred_device: Option<String>,
    apply_defaults_on_open: bool,
    timelapse_profile: TimelapseProfile,
    preview: Mutex<Option<SavedSettings>>,
}

impl Camera {
    /// Build a camera service. No device is opened yet.
    pub fn new(opener: Arc<dyn DeviceOpener>, config: &Config) -> Self {
        let handle = Arc::new(DeviceHandle::new(opener, config.reconfigure_timeout()));
        let encoder: Arc<dyn FrameEncoder> = Arc::new(JpegEncoder::new(config.jpeg_quality));
        let pipeline = StreamingPipeline::new(Arc::clone(&handle), Arc::clone(&encoder), config.pipeline());
        let sessions = SessionScheduler::new(Arc::clone(&handle), Arc::clone(&encoder), config.sessions());
        Self {
            handle,
            encoder,
            state: RwLock::new(CoreState::default()),
            commands: Mutex::new(()),
            pipeline,
            sessions,
            preferred_device: config.device.clone(),
            apply_defaults_on_open: config.apply_defaults_on_open,
            timelapse_profile: config.timelapse.clone(),
            preview: Mutex::new(None),
        }
    }

    /// Open `device_id` (or the configured device, or the first discovered
    /// camera) and start streaming.
    pub fn open(&self, device_id: Option<&str>) -> Result<()> {
        let id = match device_id.map(str::to_owned).or_else(|| self.preferred_device.clone()) {
            Some(id) => id,
            None => self
                .list_cameras()
                .into_iter()
                .next()
                .map(|info| info.id)
                .ok_or_else(|| CameraError::DeviceUnavailable("no camera found".to_owned()))?,
        };
        self.set_camera(&id)
    }

    /// Cameras currently attached.
    pub fn list_cameras(&self) -> Vec<DeviceInfo> {
        self.handle.opener().discover()
    }

    /// Validate and write one control. Returns the value now in effect.
    pub fn set_control(&self, name: &str, value: i64) -> Result<i64> {
        let _command = self.commands.lock();
        let mut state = self.state.write();
        let id = state.registry.validate(name, value)?.id;
        self.handle.apply_property(id, value)?;
        state.registry.record(name, value);
        info!(control = %name, value, "control set");
        Ok(value)
    }

    /// One control by name.
    pub fn control(&self, name: &str) -> Result<Control> {
        self.state
            .read()
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| CameraError::UnknownControl(name.to_owned()))
    }

    /// Restore every control to its computed default and reopen the device.
    pub fn reset_controls(&self) -> Result<ResetReport> {
        let _command = self.commands.lock();
        let (id, resolution) = {
            let state = self.state.read();
            let id = state.device_id.clone().ok_or(CameraError::DeviceClosed)?;
            (id, state.active_resolution())
        };
        self.switch(&id, resolution, &ControlSetup::Defaults, |ctx, state| {
            let device = ctx.device()?;
            let report = state.registry.apply_defaults(device);
            for skipped in &report.skipped {
                warn!(control = %skipped.name, reason = %skipped.reason, "control skipped during reset");
            }
            Ok(())
        })?;
        info!(device = %id, "controls reset");
        Ok(self.state.read().last_reset.clone().unwrap_or_default())
    }

    /// Switch to another resolution from the catalog. Control values carry
    /// over wherever the rediscovered controls still accept them.
    pub fn set_resolution(&self, resolution: &Resolution) -> Result<Resolution> {
        let _command = self.commands.lock();
        let (id, values) = {
            let state = self.state.read();
            let catalog = state.catalog.as_ref().ok_or(CameraError::DeviceClosed)?;
            catalog.find(resolution)?;
            let id = state.device_id.clone().ok_or(CameraError::DeviceClosed)?;
            (id, state.registry.current_values())
        };
        self.switch(&id, Some(*resolution), &ControlSetup::Restore(values), |_, _| Ok(()))?;
        info!(resolution = %resolution, "resolution switched");
        Ok(*resolution)
    }

    /// Close the current camera and open `device_id` instead. If the new
    /// camera cannot be opened, the previous one is reopened.
    pub fn set_camera(&self, device_id: &str) -> Result<()> {
        let _command = self.commands.lock();
        let setup = if self.apply_defaults_on_open {
            ControlSetup::Defaults
        } else {
            ControlSetup::Keep
        };
        self.switch(device_id, None, &setup, |_, _| Ok(()))?;
        info!(device = %device_id, "camera selected");
        Ok(())
    }

    /// Pause readers, run `prepare` against the open device, then reopen
    /// `device_id` at `resolution` and rediscover. Falls back to the previous
    /// device and resolution if the reopen fails.
    fn switch<F>(
        &self,
        device_id: &str,
        resolution: Option<Resolution>,
        setup: &ControlSetup,
        prepare: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Reconfigure<'_>, &mut CoreState) -> Result<()>,
    {
        let pipeline_pause = self.pipeline.pause()?;
        let sessions_pause = self.sessions.pause();
        let mut state = self.state.write();
        let previous = state
            .device_id
            .clone()
            .map(|id| (id, state.active_resolution()));

        let outcome = self.handle.reconfigure(|ctx| {
            if ctx.device_id().is_some() {
                prepare(ctx, &mut *state)?;
            }
            match bring_up(ctx, device_id, resolution, setup) {
                Ok(next) => Ok(Switch::Done(next)),
                Err(err) => {
                    warn!(device = %device_id, error = %err, "switch failed");
                    let Some((prev_id, prev_resolution)) = &previous else {
                        return Err(err);
                    };
                    let restored = bring_up(ctx, prev_id, *prev_resolution, setup)?;
                    info!(device = %prev_id, "previous configuration restored");
                    Ok(Switch::RolledBack(restored, err))
                }
            }
        });

        let result = match outcome {
            Ok(Switch::Done(mut next)) => {
                if next.last_reset.is_none() && next.device_id == state.device_id {
                    next.last_reset = state.last_reset.take();
                }
                *state = next;
                Ok(())
            }
            Ok(Switch::RolledBack(restored, err)) => {
                *state = restored;
                Err(err)
            }
            Err(err @ CameraError::DeviceBusy(_)) => Err(err),
            Err(err) => {
                if previous.is_some() {
                    error!(error = %err, "device lost during switch");
                }
                *state = CoreState::default();
                Err(err)
            }
        };
        let open = state.device_id.is_some();
        drop(state);
        drop(sessions_pause);
        drop(pipeline_pause);

        if open {
            self.pipeline.start()?;
        } else if previous.is_some() {
            self.sessions.abort_all("device closed");
            self.pipeline.stop();
        }
        result
    }

    /// Start a timelapse with one snapshot per `interval`.
    ///
    /// A configured timelapse profile is applied first; the preview
    /// resolution and control values come back on [`Camera::stop_timelapse`].
    pub fn start_timelapse(&self, interval: Duration) -> Result<()> {
        let mut preview = self.preview.lock();
        if !self.handle.is_open() {
            return Err(CameraError::DeviceClosed);
        }
        if self.sessions.is_running(SessionKind::Timelapse) {
            return Err(CameraError::AlreadyRunning(SessionKind::Timelapse));
        }
        if let Some(saved) = preview.take() {
            self.restore_preview(&saved);
        }

        let saved = self.apply_timelapse_profile()?;
        match self.sessions.start_timelapse(interval) {
            Ok(()) => {
                *preview = saved;
                Ok(())
            }
            Err(err) => {
                if let Some(saved) = saved {
                    self.restore_preview(&saved);
                }
                Err(err)
            }
        }
    }

    /// Stop the timelapse and restore the preview settings. No-op if not
    /// running.
    pub fn stop_timelapse(&self) {
        let mut preview = self.preview.lock();
        self.sessions.stop_timelapse();
        if let Some(saved) = preview.take() {
            self.restore_preview(&saved);
        }
    }

    fn apply_timelapse_profile(&self) -> Result<Option<SavedSettings>> {
        let profile = &self.timelapse_profile;
        if profile.is_empty() {
            return Ok(None);
        }
        let saved = {
            let state = self.state.read();
            SavedSettings {
                resolution: state.active_resolution(),
                controls: state.registry.current_values(),
            }
        };
        if let Some(resolution) = profile.resolution.filter(|wanted| saved.resolution != Some(*wanted)) {
            self.set_resolution(&resolution)?;
        }
        for (name, value) in &profile.controls {
            if let Err(err) = self.set_control(name, *value) {
                warn!(control = %name, value, error = %err, "timelapse control not applied");
            }
        }
        info!("timelapse profile applied");
        Ok(Some(saved))
    }

    fn restore_preview(&self, saved: &SavedSettings) {
        if !self.handle.is_open() {
            return;
        }
        if let Some(resolution) = saved.resolution.filter(|res| self.status_resolution() != Some(*res)) {
            if let Err(err) = self.set_resolution(&resolution) {
                warn!(resolution = %resolution, error = %err, "preview resolution not restored");
            }
        }
        for (name, value) in &saved.controls {
            if self.control(name).is_ok_and(|ctrl| ctrl.current == *value) {
                continue;
            }
            if let Err(err) = self.set_control(name, *value) {
                warn!(control = %name, value, error = %err, "preview control not restored");
            }
        }
        info!("preview settings restored");
    }

    fn status_resolution(&self) -> Option<Resolution> {
        self.state.read().active_resolution()
    }

    /// Start a recording. Returns the output file.
    pub fn start_recording(&self) -> Result<PathBuf> {
        if !self.handle.is_open() {
            return Err(CameraError::DeviceClosed);
        }
        self.sessions.start_recording()
    }

    /// Stop the recording. No-op if not running.
    pub fn stop_recording(&self) {
        self.sessions.stop_recording();
    }

    /// Change where the next sessions write.
    pub fn set_output_dirs(&self, timelapse_dir: &Path, recording_dir: &Path) {
        self.sessions.set_output_dirs(timelapse_dir, recording_dir);
    }

    /// Consistent snapshot of device, controls, resolutions and sessions.
    pub fn status(&self) -> CameraStatus {
        let state = self.state.read();
        let (timelapse_dir, recording_dir) = self.sessions.output_dirs();
        CameraStatus {
            device: state.device_id.clone(),
            resolution: state.active_resolution(),
            resolutions: state
                .catalog
                .as_ref()
                .map(|catalog| catalog.list().to_vec())
                .unwrap_or_default(),
            controls: state.registry.controls().to_vec(),
            unsupported_controls: state.registry.unsupported().to_vec(),
            last_reset: state.last_reset.clone(),
            pipeline: self.pipeline.stats(),
            sessions: self.sessions.statuses(),
            timelapse_dir,
            recording_dir,
            captured_at: Utc::now(),
        }
    }

    /// Subscribe to the live stream.
    pub fn subscribe(&self) -> FrameSubscriber {
        self.pipeline.subscribe()
    }

    /// The most recent streamed frame.
    pub fn latest_frame(&self) -> Option<Arc<EncodedFrame>> {
        self.pipeline.latest()
    }

    /// Capture one frame and write it to `path` as JPEG.
    pub fn capture_photo(&self, path: &Path) -> Result<PathBuf> {
        let mut attempts = 0;
        let frame = loop {
            let frame = self.handle.read_frame()?;
            attempts += 1;
            if frame.generation == self.handle.generation() || attempts >= PHOTO_ATTEMPTS {
                break frame;
            }
        };
        let encoded = self.encoder.encode(&frame)?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &encoded.jpeg)?;
        info!(path = %path.display(), resolution = %encoded.resolution, "photo captured");
        Ok(path.to_path_buf())
    }

    /// Close the device. Running sessions stop as aborted and the stream ends.
    pub fn close(&self) -> Result<()> {
        self.preview.lock().take();
        let _command = self.commands.lock();
        self.sessions.abort_all("device closed");
        self.pipeline.stop();
        let mut state = self.state.write();
        self.handle.close()?;
        *state = CoreState::default();
        Ok(())
    }

    /// Cancel every session, stop streaming and release the device.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.preview.lock().take();
        let _command = self.commands.lock();
        self.sessions.abort_all("shutdown");
        self.pipeline.stop();
        let mut state = self.state.write();
        if let Err(err) = self.handle.close() {
            warn!(error = %err, "device not released cleanly");
        }
        *state = CoreState::default();
    }
}

/// Open `device_id`, pick a resolution, discover controls and write them as
/// `setup` asks. On failure the device is left closed.
fn bring_up(
    ctx: &mut Reconfigure<'_>,
    device_id: &str,
    resolution: Option<Resolution>,
    setup: &ControlSetup,
) -> Result<CoreState> {
    ctx.open(device_id)?;
    let result = configure(ctx, device_id, resolution, setup);
    if result.is_err() {
        ctx.close();
    }
    result
}

fn configure(
    ctx: &mut Reconfigure<'_>,
    device_id: &str,
    resolution: Option<Resolution>,
    setup: &ControlSetup,
) -> Result<CoreState> {
    let device = ctx.device()?;
    let mut catalog = ResolutionCatalog::from_device(device)?;

    let target = match resolution {
        Some(requested) => catalog.find(&requested)?,
        None => catalog.active(),
    };
    match device.set_resolution(&target) {
        Ok(actual) => catalog.set_active(&actual)?,
        Err(err) if resolution.is_none() => {
            let current = device.resolution()?;
            warn!(device = %device_id, wanted = %target, current = %current, error = %err, "keeping current format");
            catalog.set_active(&current)?;
        }
        Err(err) => return Err(err),
    }

    let mut registry = ControlRegistry::from_device(device)?;
    if registry.is_empty() {
        warn!(device = %device_id, "device exposes no usable controls");
    }
    let last_reset = match setup {
        ControlSetup::Keep => None,
        ControlSetup::Defaults => Some(registry.apply_defaults(device)),
        ControlSetup::Restore(values) => {
            let report = registry.apply_values(device, values);
            debug!(restored = report.applied.len(), skipped = report.skipped.len(), "control values carried over");
            None
        }
    };
    info!(device = %device_id, resolution = %catalog.active(), controls = registry.len(), "device configured");

    Ok(CoreState {
        device_id: Some(device_id.to_owned()),
        catalog: Some(catalog),
        registry,
        last_reset,
    })
}
