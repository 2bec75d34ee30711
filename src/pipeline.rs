//! Live frame distribution.
//!
//! One capture thread reads from the [`DeviceHandle`], encodes, and
//! publishes into a [`FrameCell`]. The cell holds a single frame: publishing
//! replaces whatever was there, so a slow viewer skips frames instead of
//! building a backlog. Viewers hold a [`FrameSubscriber`] and block until a
//! frame newer than the last one they saw is published, or the stream ends.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::encode::{EncodedFrame, FrameEncoder};
use crate::error::{CameraError, Result};
use crate::handle::DeviceHandle;

/// What a viewer receives.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A complete encoded frame.
    Frame(Arc<EncodedFrame>),
    /// The stream ended; no more frames will follow.
    Ended(String),
}

#[derive(Default)]
struct CellState {
    latest: Option<Arc<EncodedFrame>>,
    seq: u64,
    ended: Option<String>,
}

/// Single-slot broadcast cell: the newest frame wins.
#[derive(Default)]
pub struct FrameCell {
    state: Mutex<CellState>,
    ready: Condvar,
}

impl FrameCell {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame and wake every waiting viewer.
    pub fn publish(&self, frame: EncodedFrame) {
        let mut state = self.state.lock();
        state.latest = Some(Arc::new(frame));
        state.seq += 1;
        drop(state);
        self.ready.notify_all();
    }

    /// End the stream for every viewer.
    pub fn end(&self, reason: &str) {
        let mut state = self.state.lock();
        state.ended = Some(reason.to_owned());
        drop(state);
        self.ready.notify_all();
    }

    /// Accept frames again after [`end`](Self::end).
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.ended = None;
        state.latest = None;
    }

    /// The current frame, if any.
    pub fn latest(&self) -> Option<Arc<EncodedFrame>> {
        self.state.lock().latest.clone()
    }

    /// Start watching this cell. The first call to
    /// [`FrameSubscriber::next`] returns the current frame if there is one.
    pub fn subscribe(self: &Arc<Self>) -> FrameSubscriber {
        FrameSubscriber {
            cell: Arc::clone(self),
            seen: 0,
        }
    }
}

/// A viewer's position in the stream.
pub struct FrameSubscriber {
    cell: Arc<FrameCell>,
    seen: u64,
}

impl FrameSubscriber {
    /// Wait up to `timeout` for a frame newer than the last one returned.
    ///
    /// Returns `None` on timeout. Once the stream has ended and no newer
    /// frame is pending, returns [`StreamEvent::Ended`]. A timeout too large
    /// to schedule waits without a deadline.
    pub fn next(&mut self, timeout: Duration) -> Option<StreamEvent> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.cell.state.lock();
        loop {
            if state.seq > self.seen {
                if let Some(frame) = state.latest.clone() {
                    self.seen = state.seq;
                    return Some(StreamEvent::Frame(frame));
                }
            }
            if let Some(reason) = &state.ended {
                return Some(StreamEvent::Ended(reason.clone()));
            }
            match deadline {
                Some(deadline) => {
                    if self.cell.ready.wait_until(&mut state, deadline).timed_out() {
                        return None;
                    }
                }
                None => self.cell.ready.wait(&mut state),
            }
        }
    }

    /// Return a newer frame or the end signal without waiting.
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        self.next(Duration::ZERO)
    }
}

/// Capture loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Not started, or stopped on request.
    Stopped,
    /// Capturing.
    Running,
    /// Parked for a reconfiguration.
    Paused,
    /// Gave up after repeated capture errors or a device loss.
    Failed,
}

/// Retry and pause tuning.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Consecutive failures tolerated before giving up.
    pub max_retries: u32,
    /// Delay between retries.
    pub retry_delay: Duration,
    /// How long [`StreamingPipeline::pause`] waits for the loop to park.
    pub pause_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay: Duration::from_millis(33),
            pause_timeout: Duration::from_secs(2),
        }
    }
}

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    /// Loop state.
    pub state: PipelineState,
    /// Frames published to viewers.
    pub frames_published: u64,
    /// Frames dropped because a reconfiguration happened mid-read.
    pub frames_discarded: u64,
    /// Last error seen by the loop.
    pub last_error: Option<String>,
}

struct LoopControl {
    state: PipelineState,
    running: bool,
    stop: bool,
    paused: bool,
    parked: bool,
    published: u64,
    discarded: u64,
    last_error: Option<String>,
}

struct Shared {
    control: Mutex<LoopControl>,
    wake: Condvar,
}

/// Continuous capture loop feeding a [`FrameCell`].
pub struct StreamingPipeline {
    handle: Arc<DeviceHandle>,
    encoder: Arc<dyn FrameEncoder>,
    cell: Arc<FrameCell>,
    shared: Arc<Shared>,
    config: PipelineConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingPipeline {
    /// Create a stopped pipeline.
    pub fn new(
        handle: Arc<DeviceHandle>,
        encoder: Arc<dyn FrameEncoder>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            handle,
            encoder,
            cell: Arc::new(FrameCell::new()),
            shared: Arc::new(Shared {
                control: Mutex::new(LoopControl {
                    state: PipelineState::Stopped,
                    running: false,
                    stop: false,
                    paused: false,
                    parked: false,
                    published: 0,
                    discarded: 0,
                    last_error: None,
                }),
                wake: Condvar::new(),
            }),
            config,
            worker: Mutex::new(None),
        }
    }

    /// Start the capture loop. Restarts it if it previously failed.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        {
            let mut control = self.shared.control.lock();
            if control.running {
                return Ok(());
            }
            control.stop = false;
            control.running = true;
            control.state = PipelineState::Running;
            control.last_error = None;
        }
        if let Some(finished) = worker.take() {
            let _ = finished.join();
        }
        self.cell.reopen();

        let ctx = LoopContext {
            handle: Arc::clone(&self.handle),
            encoder: Arc::clone(&self.encoder),
            cell: Arc::clone(&self.cell),
            shared: Arc::clone(&self.shared),
            config: self.config,
        };
        let spawned = thread::Builder::new()
            .name("capture".to_owned())
            .spawn(move || ctx.run());
        match spawned {
            Ok(join) => {
                *worker = Some(join);
                info!("streaming pipeline started");
                Ok(())
            }
            Err(err) => {
                let mut control = self.shared.control.lock();
                control.running = false;
                control.state = PipelineState::Stopped;
                Err(CameraError::Io(err))
            }
        }
    }

    /// Stop the loop and end the stream for every viewer.
    pub fn stop(&self) {
        {
            let mut control = self.shared.control.lock();
            control.stop = true;
        }
        self.shared.wake.notify_all();
        if let Some(join) = self.worker.lock().take() {
            let _ = join.join();
        }
        let mut control = self.shared.control.lock();
        if control.state != PipelineState::Failed {
            control.state = PipelineState::Stopped;
        }
        drop(control);
        self.cell.end("pipeline stopped");
        info!("streaming pipeline stopped");
    }

    /// Park the loop between frames until the guard is dropped.
    ///
    /// Fails with [`CameraError::DeviceBusy`] if the loop does not park
    /// within the pause timeout.
    pub fn pause(&self) -> Result<PauseGuard<'_>> {
        let deadline = Instant::now() + self.config.pause_timeout;
        let mut control = self.shared.control.lock();
        control.paused = true;
        self.shared.wake.notify_all();
        while control.running && !control.parked {
            if self
                .shared
                .wake
                .wait_until(&mut control, deadline)
                .timed_out()
                && !control.parked
            {
                control.paused = false;
                drop(control);
                self.shared.wake.notify_all();
                warn!("capture loop did not pause in time");
                return Err(CameraError::DeviceBusy(self.config.pause_timeout));
            }
        }
        debug!("capture loop paused");
        Ok(PauseGuard { pipeline: self })
    }

    fn resume(&self) {
        self.shared.control.lock().paused = false;
        self.shared.wake.notify_all();
        debug!("capture loop resumed");
    }

    /// Subscribe to the live stream.
    pub fn subscribe(&self) -> FrameSubscriber {
        self.cell.subscribe()
    }

    /// The most recent frame.
    pub fn latest(&self) -> Option<Arc<EncodedFrame>> {
        self.cell.latest()
    }

    /// Current loop state.
    pub fn state(&self) -> PipelineState {
        self.shared.control.lock().state
    }

    /// Counters and state.
    pub fn stats(&self) -> PipelineStats {
        let control = self.shared.control.lock();
        PipelineStats {
            state: control.state,
            frames_published: control.published,
            frames_discarded: control.discarded,
            last_error: control.last_error.clone(),
        }
    }
}

impl Drop for StreamingPipeline {
    fn drop(&mut self) {
        self.shared.control.lock().stop = true;
        self.shared.wake.notify_all();
        if let Some(join) = self.worker.get_mut().take() {
            let _ = join.join();
        }
    }
}

/// Keeps the capture loop parked. Resumes it on drop.
pub struct PauseGuard<'a> {
    pipeline: &'a StreamingPipeline,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.resume();
    }
}

struct LoopContext {
    handle: Arc<DeviceHandle>,
    encoder: Arc<dyn FrameEncoder>,
    cell: Arc<FrameCell>,
    shared: Arc<Shared>,
    config: PipelineConfig,
}

impl LoopContext {
    fn run(self) {
        let mut failures = 0u32;
        while self.wait_while_paused() {
            let outcome = self.handle.read_frame().and_then(|frame| {
                let encoded = self.encoder.encode(&frame)?;
                Ok((frame.generation, encoded))
            });

            match outcome {
                Ok((generation, encoded)) => {
                    if generation != self.handle.generation() {
                        self.shared.control.lock().discarded += 1;
                        debug!(generation, "discarding frame read before reconfiguration");
                        continue;
                    }
                    failures = 0;
                    self.cell.publish(encoded);
                    self.shared.control.lock().published += 1;
                }
                Err(err) if err.is_transient() && failures < self.config.max_retries => {
                    failures += 1;
                    warn!(error = %err, attempt = failures, "capture failed, retrying");
                    self.shared.control.lock().last_error = Some(err.to_string());
                    self.sleep(self.config.retry_delay);
                }
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            }
        }
        self.finish(PipelineState::Stopped);
    }

    /// Park while a pause is requested. Returns `false` once asked to stop.
    fn wait_while_paused(&self) -> bool {
        let mut control = self.shared.control.lock();
        if control.paused && !control.stop {
            control.parked = true;
            control.state = PipelineState::Paused;
            self.shared.wake.notify_all();
            while control.paused && !control.stop {
                self.shared.wake.wait(&mut control);
            }
            control.parked = false;
            control.state = PipelineState::Running;
        }
        !control.stop
    }

    fn sleep(&self, delay: Duration) {
        let mut control = self.shared.control.lock();
        if !control.stop {
            let _ = self.shared.wake.wait_for(&mut control, delay);
        }
    }

    fn fail(&self, err: &CameraError) {
        error!(error = %err, "capture loop giving up");
        self.shared.control.lock().last_error = Some(err.to_string());
        self.cell.end(&err.to_string());
        self.finish(PipelineState::Failed);
    }

    fn finish(&self, state: PipelineState) {
        let mut control = self.shared.control.lock();
        control.running = false;
        control.parked = false;
        control.state = state;
        drop(control);
        self.shared.wake.notify_all();
    }
}
