//! Pi-Cam-Server: single-camera V4L2 capture core.
//!
//! One process owns one camera. The [`Camera`] service shares the open
//! device between a live frame stream, a timelapse session and a recording
//! session, while commands adjust controls, switch resolutions or switch
//! cameras underneath them.
//!
//! The hardware sits behind the [`CameraDevice`] / [`DeviceOpener`] traits:
//! [`device`] talks to V4L2, [`mock`] simulates a camera in-process for tests
//! and for `mock://` device ids.

pub mod camera;
pub mod config;
pub mod controls;
pub mod device;
pub mod encode;
pub mod error;
pub mod handle;
pub mod mock;
pub mod pipeline;
pub mod resolution;
pub mod session;
pub mod traits;
pub mod validation;

pub use camera::{Camera, CameraStatus};
pub use config::{Config, TimelapseProfile};
pub use controls::{Control, ControlKind, ControlRegistry, ResetReport};
pub use device::{SystemOpener, V4l2Device, V4l2Opener};
pub use encode::{EncodedFrame, FrameEncoder, JpegEncoder};
pub use error::{CameraError, Result};
pub use handle::DeviceHandle;
pub use pipeline::{FrameSubscriber, PipelineState, StreamEvent, StreamingPipeline};
pub use resolution::ResolutionCatalog;
pub use session::{SessionKind, SessionOutcome, SessionScheduler, SessionState};
pub use traits::{
    CameraDevice, DeviceCapabilities, DeviceInfo, DeviceOpener, FourCC, Frame, FrameMetadata,
    Resolution,
};
