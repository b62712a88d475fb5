//! USB mass storage exposure
//!
//! Hands the block device handle to the USB host. Once installed the medium
//! belongs to the host until the process restarts; there is no way back to
//! local access within one boot.

pub mod configfs;
pub mod descriptor;
pub mod gadget;
pub mod msc;
pub mod scsi;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::block::BlockDeviceHandle;
use crate::error::{AppError, Result};

pub use descriptor::DeviceDescriptorSet;
pub use gadget::ConfigFsStack;
pub use msc::MscBackend;
pub use scsi::{ScsiCommand, ScsiError};

/// Whether the medium is currently visible to the USB host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsbExposureState {
    #[default]
    NotExposed,
    Exposed,
}

/// USB device stack able to present an MSC function
pub trait UsbStack: Send {
    /// Remove an exposure left behind by a previous process image
    fn release_stale(&mut self) -> Result<()>;

    /// Register descriptors and the class backend, then start the device
    fn install(&mut self, descriptors: &DeviceDescriptorSet, backend: MscBackend) -> Result<()>;

    /// Stop the device and drop the backend
    fn teardown(&mut self) -> Result<()>;
}

/// One-shot USB exposure of the medium
pub struct UsbExposure<U> {
    stack: U,
    descriptors: DeviceDescriptorSet,
    state: UsbExposureState,
    installed_once: bool,
}

impl<U: UsbStack> UsbExposure<U> {
    pub fn new(stack: U, descriptors: DeviceDescriptorSet) -> Self {
        Self {
            stack,
            descriptors,
            state: UsbExposureState::NotExposed,
            installed_once: false,
        }
    }

    pub fn state(&self) -> UsbExposureState {
        self.state
    }

    pub fn descriptors(&self) -> &DeviceDescriptorSet {
        &self.descriptors
    }

    pub fn stack(&self) -> &U {
        &self.stack
    }

    /// Clear a gadget still bound from before a restart
    pub fn release_stale(&mut self) -> Result<()> {
        self.stack.release_stale()
    }

    /// Expose the medium to the host
    ///
    /// Allowed once per boot; the handle is consumed either way.
    pub fn install(&mut self, handle: BlockDeviceHandle) -> Result<()> {
        if self.installed_once {
            return Err(AppError::UsbInstall("already installed".to_string()));
        }
        self.installed_once = true;

        let capacity = handle.capacity();
        info!(
            "Installing USB MSC {:04x}:{:04x} over {}",
            self.descriptors.device.vendor_id, self.descriptors.device.product_id, capacity
        );

        self.stack
            .install(&self.descriptors, MscBackend::new(handle))
            .map_err(|e| match e {
                e @ AppError::UsbInstall(_) => e,
                other => AppError::UsbInstall(other.to_string()),
            })?;

        self.state = UsbExposureState::Exposed;
        Ok(())
    }

    /// Remove the exposure; a no-op when nothing is exposed
    pub fn teardown(&mut self) -> Result<()> {
        if self.state == UsbExposureState::NotExposed {
            return Ok(());
        }
        let result = self.stack.teardown();
        if let Err(e) = &result {
            warn!("USB teardown failed: {}", e);
        }
        self.state = UsbExposureState::NotExposed;
        result
    }
}
