//! The shared device handle.
//!
//! One [`DeviceHandle`] owns the open camera for the whole process. Frame
//! reads take the gate shared and then serialize on the device itself;
//! anything that changes device state (control writes, format changes,
//! reopening) takes the gate exclusively through [`DeviceHandle::reconfigure`].
//!
//! The gate is a task-fair `parking_lot::RwLock`: once a reconfiguration is
//! waiting, new readers queue behind it instead of starving it. The
//! exclusive acquire is bounded by the configured timeout and fails with
//! [`CameraError::DeviceBusy`].
//!
//! Every exclusive section bumps the handle's generation. Frames carry the
//! generation they were read under, so a consumer can tell a frame that was
//! captured before a reconfiguration from one captured after it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{CameraError, Result};
use crate::traits::{CameraDevice, DeviceOpener, Frame};

struct OpenDevice {
    id: String,
    device: Mutex<Box<dyn CameraDevice>>,
}

#[derive(Default)]
struct Slot {
    open: Option<OpenDevice>,
}

/// Shared owner of the single open camera.
pub struct DeviceHandle {
    opener: Arc<dyn DeviceOpener>,
    gate: RwLock<Slot>,
    generation: AtomicU64,
    timeout: Duration,
}

impl DeviceHandle {
    /// Create a closed handle.
    pub fn new(opener: Arc<dyn DeviceOpener>, timeout: Duration) -> Self {
        Self {
            opener,
            gate: RwLock::new(Slot::default()),
            generation: AtomicU64::new(0),
            timeout,
        }
    }

    /// The opener this handle uses.
    pub fn opener(&self) -> &dyn DeviceOpener {
        &*self.opener
    }

    /// Current generation. Changes on every exclusive section.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Id of the open device, if any.
    pub fn device_id(&self) -> Option<String> {
        self.gate.read().open.as_ref().map(|open| open.id.clone())
    }

    /// Whether a device is open.
    pub fn is_open(&self) -> bool {
        self.gate.read().open.is_some()
    }

    /// Open `device_id`, closing any device currently held.
    pub fn open(&self, device_id: &str) -> Result<()> {
        self.reconfigure(|ctx| ctx.open(device_id))
    }

    /// Close the device. Readers that arrive afterwards get
    /// [`CameraError::DeviceClosed`].
    pub fn close(&self) -> Result<()> {
        self.reconfigure(|ctx| {
            ctx.close();
            Ok(())
        })
    }

    /// Read one frame, stamped with the current generation.
    ///
    /// Blocks while a reconfiguration is in progress.
    pub fn read_frame(&self) -> Result<Frame> {
        let slot = self.gate.read();
        let open = slot.open.as_ref().ok_or(CameraError::DeviceClosed)?;
        let generation = self.generation();
        let mut frame = open.device.lock().next_frame()?;
        frame.generation = generation;
        Ok(frame)
    }

    /// Write one control value under exclusive access.
    pub fn apply_property(&self, id: u32, value: i64) -> Result<()> {
        self.reconfigure(|ctx| ctx.device()?.set_control(id, value))
    }

    /// Run `f` with exclusive access to the device.
    ///
    /// Fails with [`CameraError::DeviceBusy`] if readers do not drain within
    /// the timeout; `f` is not run in that case.
    pub fn reconfigure<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Reconfigure<'_>) -> Result<T>,
    {
        let mut slot = self
            .gate
            .try_write_for(self.timeout)
            .ok_or(CameraError::DeviceBusy(self.timeout))?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "device reconfiguration");

        let mut ctx = Reconfigure {
            slot: &mut *slot,
            opener: &*self.opener,
        };
        f(&mut ctx)
    }
}

/// Exclusive access to the device inside [`DeviceHandle::reconfigure`].
pub struct Reconfigure<'a> {
    slot: &'a mut Slot,
    opener: &'a dyn DeviceOpener,
}

impl Reconfigure<'_> {
    /// The open device.
    pub fn device(&mut self) -> Result<&mut dyn CameraDevice> {
        let open = self.slot.open.as_mut().ok_or(CameraError::DeviceClosed)?;
        Ok(open.device.get_mut().as_mut())
    }

    /// Id of the open device, if any.
    pub fn device_id(&self) -> Option<&str> {
        self.slot.open.as_ref().map(|open| open.id.as_str())
    }

    /// Close the current device (if any) and open `device_id`.
    ///
    /// The old device is released first; a camera cannot be opened twice.
    /// On failure the slot is left closed.
    pub fn open(&mut self, device_id: &str) -> Result<()> {
        self.close();
        let device = self.opener.open(device_id)?;
        info!(device = %device_id, card = %device.capabilities().card, "device opened");
        self.slot.open = Some(OpenDevice {
            id: device_id.to_owned(),
            device: Mutex::new(device),
        });
        Ok(())
    }

    /// Close the current device.
    pub fn close(&mut self) {
        if let Some(open) = self.slot.open.take() {
            info!(device = %open.id, "device closed");
        }
    }
}
