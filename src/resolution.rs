//! Catalog of the formats a device advertises.

use tracing::info;

use crate::error::{CameraError, Result};
use crate::traits::{CameraDevice, FourCC, Resolution};

/// Supported resolutions in device order, plus which one is active.
#[derive(Debug, Clone)]
pub struct ResolutionCatalog {
    entries: Vec<Resolution>,
    active: usize,
}

impl ResolutionCatalog {
    /// Build a catalog. The first entry is active.
    ///
    /// Duplicate entries are dropped; an empty list means the device cannot
    /// capture at all.
    pub fn new(resolutions: Vec<Resolution>) -> Result<Self> {
        let mut entries: Vec<Resolution> = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            if !entries.contains(&resolution) {
                entries.push(resolution);
            }
        }
        if entries.is_empty() {
            return Err(CameraError::DeviceUnavailable(
                "no supported resolutions found".to_owned(),
            ));
        }
        Ok(Self { entries, active: 0 })
    }

    /// Enumerate the formats `device` advertises.
    pub fn from_device(device: &dyn CameraDevice) -> Result<Self> {
        let catalog = Self::new(device.resolutions()?)?;
        info!(count = catalog.entries.len(), first = %catalog.active(), "resolutions discovered");
        Ok(catalog)
    }

    /// Every supported resolution, in device order.
    pub fn list(&self) -> &[Resolution] {
        &self.entries
    }

    /// The active resolution.
    pub fn active(&self) -> Resolution {
        self.entries
            .get(self.active)
            .copied()
            .unwrap_or_else(|| Resolution::new(FourCC::MJPG, 0, 0))
    }

    /// Whether `resolution` is in the catalog.
    pub fn contains(&self, resolution: &Resolution) -> bool {
        self.entries.contains(resolution)
    }

    /// Look up an entry, failing with [`CameraError::UnsupportedResolution`].
    pub fn find(&self, resolution: &Resolution) -> Result<Resolution> {
        self.entries
            .iter()
            .find(|entry| *entry == resolution)
            .copied()
            .ok_or(CameraError::UnsupportedResolution(*resolution))
    }

    /// Mark `resolution` active. Leaves the catalog unchanged if absent.
    pub fn set_active(&mut self, resolution: &Resolution) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|entry| entry == resolution)
            .ok_or(CameraError::UnsupportedResolution(*resolution))?;
        self.active = idx;
        Ok(())
    }
}
