//! Background capture sessions.
//!
//! Two session kinds exist, at most one of each. A timelapse writes one JPEG
//! per interval into the timelapse directory; a recording appends every frame
//! it reads to a single `.mjpeg` file. Each session runs on its own thread
//! and reads through the shared [`DeviceHandle`], so a reconfiguration blocks
//! it exactly like it blocks the streaming pipeline.
//!
//! All session state lives in one status store guarded by a single mutex.
//! Workers and commands both go through it, so [`SessionScheduler::statuses`]
//! never sees a half-updated session.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Serialize, Serializer};
use tracing::{debug, error, info, warn};

use crate::encode::{EncodedFrame, FrameEncoder};
use crate::error::{CameraError, Result};
use crate::handle::DeviceHandle;

/// The two session kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// One still image per interval.
    Timelapse,
    /// Continuous stream into one file.
    Recording,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timelapse => f.write_str("timelapse"),
            Self::Recording => f.write_str("recording"),
        }
    }
}

/// Whether a session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No task running.
    Stopped,
    /// Task running.
    Running,
}

/// How the last run of a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "lowercase")]
pub enum SessionOutcome {
    /// Stopped on request.
    Completed,
    /// Stopped because the device went away.
    Aborted(String),
    /// Stopped because capture or storage kept failing.
    Failed(String),
}

/// Snapshot of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    /// Session kind.
    pub kind: SessionKind,
    /// Running or stopped.
    pub state: SessionState,
    /// When the current or last run started.
    pub started_at: Option<DateTime<Utc>>,
    /// Snapshot interval (timelapse only).
    #[serde(serialize_with = "serialize_secs")]
    pub interval: Option<Duration>,
    /// Directory (timelapse) or file (recording) being written.
    pub output: Option<PathBuf>,
    /// Frames persisted by the current or last run.
    pub frames_written: u64,
    /// How the last run ended. `None` while running or before the first run.
    pub last_outcome: Option<SessionOutcome>,
}

impl SessionStatus {
    const fn stopped(kind: SessionKind) -> Self {
        Self {
            kind,
            state: SessionState::Stopped,
            started_at: None,
            interval: None,
            output: None,
            frames_written: 0,
            last_outcome: None,
        }
    }

    /// Whether the session is running.
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }
}

#[allow(clippy::ref_option)]
fn serialize_secs<S: Serializer>(value: &Option<Duration>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

/// Both sessions at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct SessionsStatus {
    /// Timelapse session.
    pub timelapse: SessionStatus,
    /// Recording session.
    pub recording: SessionStatus,
}

/// Where sessions write and how they retry.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Timelapse snapshot directory.
    pub timelapse_dir: PathBuf,
    /// Recording directory.
    pub recording_dir: PathBuf,
    /// Consecutive capture failures tolerated per frame.
    pub max_retries: u32,
    /// Delay between retries.
    pub retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timelapse_dir: PathBuf::from("timelapse"),
            recording_dir: PathBuf::from("videos"),
            max_retries: 10,
            retry_delay: Duration::from_millis(33),
        }
    }
}

struct Slot {
    status: SessionStatus,
    run: u64,
    cancel: bool,
    worker: Option<JoinHandle<()>>,
}

impl Slot {
    const fn new(kind: SessionKind) -> Self {
        Self {
            status: SessionStatus::stopped(kind),
            run: 0,
            cancel: false,
            worker: None,
        }
    }
}

struct Store {
    paused: bool,
    timelapse: Slot,
    recording: Slot,
}

impl Store {
    const fn slot(&self, kind: SessionKind) -> &Slot {
        match kind {
            SessionKind::Timelapse => &self.timelapse,
            SessionKind::Recording => &self.recording,
        }
    }

    fn slot_mut(&mut self, kind: SessionKind) -> &mut Slot {
        match kind {
            SessionKind::Timelapse => &mut self.timelapse,
            SessionKind::Recording => &mut self.recording,
        }
    }
}

struct Shared {
    store: Mutex<Store>,
    wake: Condvar,
}

/// Starts, stops and tracks the background sessions.
pub struct SessionScheduler {
    handle: Arc<DeviceHandle>,
    encoder: Arc<dyn FrameEncoder>,
    shared: Arc<Shared>,
    config: Mutex<SessionConfig>,
}

impl SessionScheduler {
    /// Create a scheduler with both sessions stopped.
    pub fn new(
        handle: Arc<DeviceHandle>,
        encoder: Arc<dyn FrameEncoder>,
        config: SessionConfig,
    ) -> Self {
        Self {
            handle,
            encoder,
            shared: Arc::new(Shared {
                store: Mutex::new(Store {
                    paused: false,
                    timelapse: Slot::new(SessionKind::Timelapse),
                    recording: Slot::new(SessionKind::Recording),
                }),
                wake: Condvar::new(),
            }),
            config: Mutex::new(config),
        }
    }

    /// Change the output directories used by sessions started afterwards.
    pub fn set_output_dirs(&self, timelapse_dir: &Path, recording_dir: &Path) {
        let mut config = self.config.lock();
        config.timelapse_dir = timelapse_dir.to_path_buf();
        config.recording_dir = recording_dir.to_path_buf();
        info!(timelapse = %timelapse_dir.display(), recording = %recording_dir.display(), "output directories updated");
    }

    /// Current output directories as `(timelapse, recording)`.
    pub fn output_dirs(&self) -> (PathBuf, PathBuf) {
        let config = self.config.lock();
        (config.timelapse_dir.clone(), config.recording_dir.clone())
    }

    /// Start a timelapse taking one snapshot per `interval`.
    ///
    /// The first snapshot is taken one interval after the start.
    pub fn start_timelapse(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(CameraError::Config("timelapse interval must be positive".to_owned()));
        }
        if Instant::now().checked_add(interval).is_none() {
            return Err(CameraError::Config(format!("timelapse interval {interval:?} is too long")));
        }
        let dir = self.config.lock().timelapse_dir.clone();
        self.start(SessionKind::Timelapse, Some(interval), dir.clone(), move |worker| {
            fs::create_dir_all(&dir)?;
            let body: Box<dyn FnOnce() + Send> = Box::new(move || worker.run_timelapse(interval, &dir));
            Ok(body)
        })
    }

    /// Stop the timelapse. No-op if it is not running.
    pub fn stop_timelapse(&self) {
        self.stop(SessionKind::Timelapse);
    }

    /// Start a recording into a new file. Returns the file path.
    pub fn start_recording(&self) -> Result<PathBuf> {
        let dir = self.config.lock().recording_dir.clone();
        let path = dir.join(format!("record_{}.mjpeg", Utc::now().format("%Y%m%dT%H%M%S%.3f")));
        let output = path.clone();
        self.start(SessionKind::Recording, None, path.clone(), move |worker| {
            fs::create_dir_all(&dir)?;
            let file = File::create(&path)?;
            info!(path = %path.display(), "recording file created");
            let body: Box<dyn FnOnce() + Send> =
                Box::new(move || worker.run_recording(BufWriter::new(file)));
            Ok(body)
        })?;
        Ok(output)
    }

    /// Stop the recording. No-op if it is not running.
    pub fn stop_recording(&self) {
        self.stop(SessionKind::Recording);
    }

    /// Snapshot of one session.
    pub fn status(&self, kind: SessionKind) -> SessionStatus {
        self.shared.store.lock().slot(kind).status.clone()
    }

    /// Snapshot of both sessions taken under one lock.
    pub fn statuses(&self) -> SessionsStatus {
        let store = self.shared.store.lock();
        SessionsStatus {
            timelapse: store.timelapse.status.clone(),
            recording: store.recording.status.clone(),
        }
    }

    /// Whether a session of `kind` is running.
    pub fn is_running(&self, kind: SessionKind) -> bool {
        self.shared.store.lock().slot(kind).status.is_running()
    }

    /// Hold every session before its next read until the guard is dropped.
    pub fn pause(&self) -> SessionPause<'_> {
        self.shared.store.lock().paused = true;
        debug!("sessions paused");
        SessionPause { scheduler: self }
    }

    /// Stop every running session and record it as aborted.
    pub fn abort_all(&self, reason: &str) {
        for kind in [SessionKind::Timelapse, SessionKind::Recording] {
            let worker = {
                let mut store = self.shared.store.lock();
                let slot = store.slot_mut(kind);
                if slot.status.is_running() {
                    warn!(session = %kind, reason, "session aborted");
                    slot.status.state = SessionState::Stopped;
                    slot.status.last_outcome = Some(SessionOutcome::Aborted(reason.to_owned()));
                }
                slot.cancel = true;
                slot.worker.take()
            };
            self.shared.wake.notify_all();
            join_worker(worker);
        }
    }

    fn start<F>(&self, kind: SessionKind, interval: Option<Duration>, output: PathBuf, prepare: F) -> Result<()>
    where
        F: FnOnce(SessionWorker) -> Result<Box<dyn FnOnce() + Send>>,
    {
        let mut store = self.shared.store.lock();
        if store.slot(kind).status.is_running() {
            return Err(CameraError::AlreadyRunning(kind));
        }
        let finished = store.slot_mut(kind).worker.take();
        if finished.is_some() {
            MutexGuard::unlocked(&mut store, || join_worker(finished));
            if store.slot(kind).status.is_running() {
                return Err(CameraError::AlreadyRunning(kind));
            }
        }

        let slot = store.slot_mut(kind);
        let run = slot.run + 1;
        let worker = {
            let config = self.config.lock();
            SessionWorker {
                kind,
                run,
                handle: Arc::clone(&self.handle),
                encoder: Arc::clone(&self.encoder),
                shared: Arc::clone(&self.shared),
                max_retries: config.max_retries,
                retry_delay: config.retry_delay,
            }
        };
        let body = prepare(worker)?;
        let guard = PanicGuard {
            kind,
            run,
            shared: Arc::clone(&self.shared),
        };
        let join = thread::Builder::new()
            .name(format!("{kind}-session"))
            .spawn(move || {
                let _guard = guard;
                body();
            })?;

        slot.run = run;
        slot.cancel = false;
        slot.worker = Some(join);
        slot.status = SessionStatus {
            kind,
            state: SessionState::Running,
            started_at: Some(Utc::now()),
            interval,
            output: Some(output),
            frames_written: 0,
            last_outcome: None,
        };
        info!(session = %kind, interval = ?interval, "session started");
        Ok(())
    }

    fn stop(&self, kind: SessionKind) {
        let worker = {
            let mut store = self.shared.store.lock();
            let slot = store.slot_mut(kind);
            slot.cancel = true;
            slot.worker.take()
        };
        self.shared.wake.notify_all();
        join_worker(worker);
    }
}

impl Drop for SessionScheduler {
    fn drop(&mut self) {
        self.stop(SessionKind::Timelapse);
        self.stop(SessionKind::Recording);
    }
}

fn join_worker(worker: Option<JoinHandle<()>>) {
    if let Some(join) = worker {
        if join.join().is_err() {
            error!("session thread panicked");
        }
    }
}

/// Marks a session failed if its worker thread unwinds.
struct PanicGuard {
    kind: SessionKind,
    run: u64,
    shared: Arc<Shared>,
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        let mut store = self.shared.store.lock();
        let slot = store.slot_mut(self.kind);
        if slot.run == self.run && slot.status.is_running() {
            error!(session = %self.kind, "session worker panicked");
            slot.status.state = SessionState::Stopped;
            slot.status.last_outcome = Some(SessionOutcome::Failed("session worker panicked".to_owned()));
        }
    }
}

/// Holds sessions before their next read. Releases them on drop.
pub struct SessionPause<'a> {
    scheduler: &'a SessionScheduler,
}

impl Drop for SessionPause<'_> {
    fn drop(&mut self) {
        self.scheduler.shared.store.lock().paused = false;
        self.scheduler.shared.wake.notify_all();
        debug!("sessions resumed");
    }
}

struct SessionWorker {
    kind: SessionKind,
    run: u64,
    handle: Arc<DeviceHandle>,
    encoder: Arc<dyn FrameEncoder>,
    shared: Arc<Shared>,
    max_retries: u32,
    retry_delay: Duration,
}

impl SessionWorker {
    fn cancelled(&self, store: &Store) -> bool {
        let slot = store.slot(self.kind);
        slot.cancel || slot.run != self.run
    }

    /// Wait until `deadline` has passed and sessions are not paused.
    /// Returns `false` if the session was cancelled meanwhile.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut store = self.shared.store.lock();
        loop {
            if self.cancelled(&store) {
                return false;
            }
            if store.paused {
                self.shared.wake.wait(&mut store);
            } else if Instant::now() >= deadline {
                return true;
            } else {
                let _ = self.shared.wake.wait_until(&mut store, deadline);
            }
        }
    }

    /// Read and encode one frame, retrying transient failures and skipping
    /// frames read before a reconfiguration.
    fn capture(&self) -> Result<EncodedFrame> {
        let mut failures = 0u32;
        loop {
            let attempt = self.handle.read_frame().and_then(|frame| {
                let encoded = self.encoder.encode(&frame)?;
                Ok((frame.generation, encoded))
            });
            match attempt {
                Ok((generation, _)) if generation != self.handle.generation() => {
                    debug!(session = %self.kind, "discarding frame read before reconfiguration");
                }
                Ok((_, encoded)) => return Ok(encoded),
                Err(err) if err.is_transient() && failures < self.max_retries => {
                    failures += 1;
                    warn!(session = %self.kind, error = %err, attempt = failures, "session capture failed, retrying");
                    if !self.wait_until(Instant::now() + self.retry_delay) {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn frame_written(&self) {
        let mut store = self.shared.store.lock();
        let slot = store.slot_mut(self.kind);
        if slot.run == self.run {
            slot.status.frames_written += 1;
        }
    }

    fn finish(&self, result: Result<()>) {
        let mut store = self.shared.store.lock();
        let cancelled = self.cancelled(&store);
        let slot = store.slot_mut(self.kind);
        if slot.run != self.run || !slot.status.is_running() {
            return;
        }
        let outcome = match result {
            Ok(()) => SessionOutcome::Completed,
            Err(_) if cancelled => SessionOutcome::Completed,
            Err(CameraError::DeviceClosed) => SessionOutcome::Aborted(CameraError::DeviceClosed.to_string()),
            Err(err) => SessionOutcome::Failed(err.to_string()),
        };
        match &outcome {
            SessionOutcome::Completed => info!(session = %self.kind, frames = slot.status.frames_written, "session stopped"),
            SessionOutcome::Aborted(reason) => warn!(session = %self.kind, reason = %reason, "session aborted"),
            SessionOutcome::Failed(reason) => error!(session = %self.kind, reason = %reason, "session failed"),
        }
        slot.status.state = SessionState::Stopped;
        slot.status.last_outcome = Some(outcome);
    }

    fn run_timelapse(&self, interval: Duration, dir: &Path) {
        let started = Instant::now();
        let mut shots = 0u32;
        let mut slot = 1u32;
        let result = loop {
            let Some(due) = interval.checked_mul(slot).and_then(|offset| started.checked_add(offset)) else {
                break Err(CameraError::Config("timelapse schedule out of range".to_owned()));
            };
            if !self.wait_until(due) {
                break Ok(());
            }
            match self.capture().and_then(|frame| write_snapshot(dir, &frame, shots)) {
                Ok(path) => {
                    debug!(path = %path.display(), "timelapse snapshot written");
                    shots += 1;
                    self.frame_written();
                }
                Err(err) => break Err(err),
            }
            let next = next_slot(started.elapsed(), interval);
            if next > slot.saturating_add(1) {
                debug!(missed = next - slot - 1, "timelapse slots skipped");
            }
            slot = next;
        };
        self.finish(result);
    }

    fn run_recording(&self, mut out: BufWriter<File>) {
        let result = loop {
            if !self.wait_until(Instant::now()) {
                break out.flush().map_err(CameraError::from);
            }
            match self
                .capture()
                .and_then(|frame| out.write_all(&frame.jpeg).map_err(CameraError::from))
            {
                Ok(()) => self.frame_written(),
                Err(err) => {
                    let _ = out.flush();
                    break Err(err);
                }
            }
        };
        self.finish(result);
    }
}

/// First schedule slot still ahead after `elapsed`. Slots missed while the
/// session was held are skipped rather than fired back-to-back.
fn next_slot(elapsed: Duration, interval: Duration) -> u32 {
    let passed = elapsed.as_nanos() / interval.as_nanos().max(1);
    u32::try_from(passed).map_or(u32::MAX, |passed| passed.saturating_add(1))
}

/// Snapshot file name. Lexical order matches capture order.
pub fn snapshot_name(captured_at: DateTime<Utc>, seq: u32) -> String {
    format!("frame_{}_{seq:06}.jpg", captured_at.format("%Y%m%dT%H%M%S%.3f"))
}

fn write_snapshot(dir: &Path, frame: &EncodedFrame, seq: u32) -> Result<PathBuf> {
    let path = dir.join(snapshot_name(frame.captured_at, seq));
    fs::write(&path, &frame.jpeg)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::JpegEncoder;
    use crate::mock::MockCamera;
    use crate::validation::is_complete_jpeg;
    use chrono::TimeZone;

    fn scheduler_for(camera: &MockCamera, dir: &Path) -> (Arc<DeviceHandle>, SessionScheduler) {
        let handle = Arc::new(DeviceHandle::new(
            Arc::new(camera.opener()),
            Duration::from_secs(1),
        ));
        handle.open(&camera.id()).expect("open should succeed");
        let config = SessionConfig {
            timelapse_dir: dir.join("timelapse"),
            recording_dir: dir.join("videos"),
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
        };
        let scheduler = SessionScheduler::new(
            Arc::clone(&handle),
            Arc::new(JpegEncoder::default()),
            config,
        );
        (handle, scheduler)
    }

    fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_snapshot_names_sort_by_time_then_sequence() {
        let early = Utc.with_ymd_and_hms(2024, 3, 1, 9, 59, 59).single().expect("valid time");
        let late = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).single().expect("valid time");
        assert_eq!(snapshot_name(early, 7), "frame_20240301T095959.000_000007.jpg");
        assert!(snapshot_name(early, 9) < snapshot_name(late, 0));
        assert!(snapshot_name(late, 1) < snapshot_name(late, 2));
    }

    #[test]
    fn test_timelapse_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        scheduler.stop_timelapse();
        assert!(!scheduler.is_running(SessionKind::Timelapse));

        scheduler
            .start_timelapse(Duration::from_millis(50))
            .expect("start");
        assert!(matches!(
            scheduler.start_timelapse(Duration::from_millis(50)),
            Err(CameraError::AlreadyRunning(SessionKind::Timelapse))
        ));
        assert!(wait_for(|| scheduler.status(SessionKind::Timelapse).frames_written >= 2));

        scheduler.stop_timelapse();
        let status = scheduler.status(SessionKind::Timelapse);
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.last_outcome, Some(SessionOutcome::Completed));

        let files = fs::read_dir(dir.path().join("timelapse")).expect("timelapse dir").count();
        assert_eq!(u64::try_from(files).expect("count"), status.frames_written);

        scheduler.stop_timelapse();
        scheduler
            .start_timelapse(Duration::from_millis(50))
            .expect("restart after stop");
        scheduler.stop_timelapse();
    }

    #[test]
    fn test_recording_writes_complete_jpegs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        let path = scheduler.start_recording().expect("start");
        assert!(wait_for(|| scheduler.status(SessionKind::Recording).frames_written >= 3));
        scheduler.stop_recording();

        let status = scheduler.status(SessionKind::Recording);
        assert_eq!(status.output.as_deref(), Some(path.as_path()));
        let bytes = fs::read(&path).expect("recording file");
        assert!(bytes.starts_with(&[0xFF, 0xD8]));
        assert!(is_complete_jpeg(&bytes));
    }

    #[test]
    fn test_sessions_run_concurrently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        scheduler.start_recording().expect("recording");
        scheduler
            .start_timelapse(Duration::from_millis(30))
            .expect("timelapse");
        let statuses = scheduler.statuses();
        assert!(statuses.timelapse.is_running());
        assert!(statuses.recording.is_running());
        assert!(wait_for(|| scheduler.status(SessionKind::Timelapse).frames_written >= 1));

        scheduler.stop_recording();
        scheduler.stop_timelapse();
    }

    #[test]
    fn test_persistent_capture_failure_stops_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        camera.fail_all_reads(true);
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        scheduler.start_recording().expect("start");
        assert!(wait_for(|| !scheduler.is_running(SessionKind::Recording)));
        assert!(matches!(
            scheduler.status(SessionKind::Recording).last_outcome,
            Some(SessionOutcome::Failed(_))
        ));
    }

    #[test]
    fn test_device_close_aborts_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (handle, scheduler) = scheduler_for(&camera, dir.path());

        scheduler.start_recording().expect("start");
        handle.close().expect("close");
        assert!(wait_for(|| !scheduler.is_running(SessionKind::Recording)));
        assert!(matches!(
            scheduler.status(SessionKind::Recording).last_outcome,
            Some(SessionOutcome::Aborted(_))
        ));
    }

    #[test]
    fn test_pause_holds_sessions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        scheduler.start_recording().expect("start");
        assert!(wait_for(|| scheduler.status(SessionKind::Recording).frames_written >= 1));
        {
            let _pause = scheduler.pause();
            thread::sleep(Duration::from_millis(30));
            let held = scheduler.status(SessionKind::Recording).frames_written;
            thread::sleep(Duration::from_millis(60));
            assert_eq!(scheduler.status(SessionKind::Recording).frames_written, held);
        }
        let resumed_from = scheduler.status(SessionKind::Recording).frames_written;
        assert!(wait_for(|| scheduler.status(SessionKind::Recording).frames_written > resumed_from));
        scheduler.stop_recording();
    }

    #[test]
    fn test_abort_all_records_reason() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        scheduler
            .start_timelapse(Duration::from_secs(60))
            .expect("start");
        scheduler.abort_all("shutdown");
        assert_eq!(
            scheduler.status(SessionKind::Timelapse).last_outcome,
            Some(SessionOutcome::Aborted("shutdown".to_owned()))
        );
    }

    #[test]
    fn test_next_slot_skips_missed_slots() {
        let interval = Duration::from_millis(200);
        assert_eq!(next_slot(Duration::from_millis(210), interval), 2);
        assert_eq!(next_slot(Duration::from_millis(930), interval), 5);
        assert_eq!(next_slot(Duration::MAX, Duration::from_nanos(1)), u32::MAX);
    }

    #[test]
    fn test_overlong_timelapse_interval_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        for interval in [Duration::MAX, Duration::from_secs(u64::MAX / 2)] {
            assert!(matches!(
                scheduler.start_timelapse(interval),
                Err(CameraError::Config(_))
            ));
            assert!(!scheduler.is_running(SessionKind::Timelapse));
        }
        scheduler
            .start_timelapse(Duration::from_millis(50))
            .expect("sane interval starts");
        scheduler.stop_timelapse();
        assert_eq!(
            scheduler.status(SessionKind::Timelapse).last_outcome,
            Some(SessionOutcome::Completed)
        );
    }

    #[test]
    fn test_panicked_worker_marks_session_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        scheduler
            .start(SessionKind::Recording, None, dir.path().join("crash.mjpeg"), |_worker| {
                let body: Box<dyn FnOnce() + Send> = Box::new(|| panic!("encoder crashed"));
                Ok(body)
            })
            .expect("start");
        assert!(wait_for(|| !scheduler.is_running(SessionKind::Recording)));
        assert_eq!(
            scheduler.status(SessionKind::Recording).last_outcome,
            Some(SessionOutcome::Failed("session worker panicked".to_owned()))
        );

        scheduler.start_recording().expect("restart after a crashed worker");
        scheduler.stop_recording();
    }

    #[test]
    fn test_long_pause_does_not_burst_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let camera = MockCamera::new("mock://0");
        let (_handle, scheduler) = scheduler_for(&camera, dir.path());

        scheduler
            .start_timelapse(Duration::from_millis(200))
            .expect("start");
        {
            let _pause = scheduler.pause();
            thread::sleep(Duration::from_millis(900));
        }
        thread::sleep(Duration::from_millis(40));
        assert_eq!(scheduler.status(SessionKind::Timelapse).frames_written, 1);

        assert!(wait_for(|| scheduler.status(SessionKind::Timelapse).frames_written >= 2));
        scheduler.stop_timelapse();
    }
}
