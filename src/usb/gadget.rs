//! configfs USB gadget exposing the medium through `f_mass_storage`
//!
//! The kernel function serves the Bulk-Only Transport and SCSI layer itself;
//! LUN 0 is pointed at the medium's device node. The [`MscBackend`] is held
//! for as long as the gadget is bound so nothing else can reach the medium.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::configfs::{
    create_dir, create_symlink, find_udc, remove_dir, remove_file, write_file,
};
use super::{DeviceDescriptorSet, MscBackend, UsbStack};
use crate::config::UsbConfig;
use crate::error::{AppError, Result};

/// Function instance name
const MSD_FUNCTION: &str = "mass_storage.usb0";

/// Time the UDC needs after a bind/unbind before it is touched again
const REBIND_DELAY: Duration = Duration::from_millis(300);

/// Mass storage gadget managed through configfs
pub struct ConfigFsStack {
    gadget_name: String,
    configfs_root: PathBuf,
    gadget_path: PathBuf,
    config_path: PathBuf,
    udc: Option<String>,
    udc_class_path: PathBuf,
    settle_delay: Duration,
    backend: Option<MscBackend>,
}

impl ConfigFsStack {
    pub fn new(config: &UsbConfig) -> Self {
        let configfs_root = PathBuf::from(&config.configfs_path);
        let gadget_path = configfs_root.join(&config.gadget_name);
        let config_path = gadget_path.join("configs/c.1");

        Self {
            gadget_name: config.gadget_name.clone(),
            configfs_root,
            gadget_path,
            config_path,
            udc: config.udc.clone().filter(|u| !u.is_empty()),
            udc_class_path: PathBuf::from(&config.udc_class_path),
            settle_delay: REBIND_DELAY,
            backend: None,
        }
    }

    /// Override the post-bind settle delay
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn gadget_path(&self) -> &Path {
        &self.gadget_path
    }

    pub fn gadget_exists(&self) -> bool {
        self.gadget_path.exists()
    }

    /// Check if gadget is bound to UDC
    pub fn is_bound(&self) -> bool {
        fs::read_to_string(self.gadget_path.join("UDC"))
            .map(|content| !content.trim().is_empty())
            .unwrap_or(false)
    }

    fn function_path(&self) -> PathBuf {
        self.gadget_path.join("functions").join(MSD_FUNCTION)
    }

    fn set_device_descriptors(&self, set: &DeviceDescriptorSet) -> Result<()> {
        let dev = &set.device;
        let attrs = [
            ("idVendor", format!("0x{:04x}", dev.vendor_id)),
            ("idProduct", format!("0x{:04x}", dev.product_id)),
            ("bcdDevice", format!("0x{:04x}", dev.bcd_device)),
            ("bcdUSB", format!("0x{:04x}", dev.bcd_usb)),
            ("bDeviceClass", format!("0x{:02x}", dev.device_class)),
            ("bDeviceSubClass", format!("0x{:02x}", dev.device_subclass)),
            ("bDeviceProtocol", format!("0x{:02x}", dev.device_protocol)),
            ("bMaxPacketSize0", dev.max_packet_size0.to_string()),
        ];
        for (name, value) in attrs {
            write_file(&self.gadget_path.join(name), &value)?;
        }
        debug!("Set device descriptors");
        Ok(())
    }

    fn create_strings(&self, set: &DeviceDescriptorSet) -> Result<()> {
        let strings_path = self
            .gadget_path
            .join(format!("strings/0x{:03x}", set.strings.language_id));
        create_dir(&strings_path)?;

        write_file(&strings_path.join("serialnumber"), set.serial_number())?;
        write_file(&strings_path.join("manufacturer"), set.manufacturer())?;
        write_file(&strings_path.join("product"), set.product())?;
        debug!("Created USB strings");
        Ok(())
    }

    fn create_configuration(&self, set: &DeviceDescriptorSet) -> Result<()> {
        let cfg = &set.configuration;
        create_dir(&self.config_path)?;

        let strings_path = self
            .config_path
            .join(format!("strings/0x{:03x}", set.strings.language_id));
        create_dir(&strings_path)?;
        write_file(&strings_path.join("configuration"), set.interface_name())?;

        write_file(&self.config_path.join("MaxPower"), &cfg.max_power_ma.to_string())?;
        write_file(
            &self.config_path.join("bmAttributes"),
            &format!("0x{:02x}", cfg.attributes),
        )?;
        debug!("Created configuration c.1");
        Ok(())
    }

    fn create_function(&self, file: &Path) -> Result<()> {
        let function_path = self.function_path();
        create_dir(&function_path)?;
        write_file(&function_path.join("stall"), "0")?;

        let lun_path = function_path.join("lun.0");
        create_dir(&lun_path)?;
        write_file(&lun_path.join("removable"), "1")?;
        write_file(&lun_path.join("ro"), "0")?;
        write_file(&lun_path.join("cdrom"), "0")?;
        write_file(&lun_path.join("nofua"), "1")?;
        // Setting the file attaches the medium
        write_file(&lun_path.join("file"), &file.to_string_lossy())?;

        create_symlink(&function_path, &self.config_path.join(MSD_FUNCTION))?;
        debug!("Created {} backed by {}", MSD_FUNCTION, file.display());
        Ok(())
    }

    fn bind(&self) -> Result<String> {
        let udc = match &self.udc {
            Some(udc) => udc.clone(),
            None => find_udc(&self.udc_class_path).ok_or_else(|| {
                AppError::UsbInstall("No USB Device Controller (UDC) found".to_string())
            })?,
        };

        info!("Binding gadget to UDC: {}", udc);
        write_file(&self.gadget_path.join("UDC"), &udc)?;
        std::thread::sleep(self.settle_delay);
        Ok(udc)
    }

    fn unbind(&self) -> Result<()> {
        if self.is_bound() {
            write_file(&self.gadget_path.join("UDC"), "")?;
            info!("Unbound gadget from UDC");
            std::thread::sleep(self.settle_delay);
        }
        Ok(())
    }

    /// Unbind and remove the gadget tree, best effort past the unbind
    fn cleanup(&mut self) -> Result<()> {
        if !self.gadget_exists() {
            return Ok(());
        }
        info!("Cleaning up USB gadget: {}", self.gadget_name);

        self.unbind()?;

        // Detach the medium before the function goes away
        let _ = write_file(&self.function_path().join("lun.0/file"), "");
        let _ = remove_file(&self.config_path.join(MSD_FUNCTION));
        let _ = remove_dir(&self.config_path.join("strings/0x409"));
        let _ = remove_dir(&self.config_path);
        let _ = remove_dir(&self.function_path());
        let _ = remove_dir(&self.gadget_path.join("strings/0x409"));
        if let Err(e) = remove_dir(&self.gadget_path) {
            warn!("Could not remove gadget directory: {}", e);
        }
        Ok(())
    }
}

impl UsbStack for ConfigFsStack {
    fn release_stale(&mut self) -> Result<()> {
        if self.gadget_exists() {
            warn!(
                "Gadget {} left over from a previous run, removing",
                self.gadget_name
            );
            self.cleanup()?;
        }
        Ok(())
    }

    fn install(&mut self, descriptors: &DeviceDescriptorSet, mut backend: MscBackend) -> Result<()> {
        let file = backend
            .backing_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| AppError::UsbInstall("Medium has no device node".to_string()))?;

        if !self.configfs_root.exists() {
            return Err(AppError::UsbInstall(format!(
                "ConfigFS not available at {}",
                self.configfs_root.display()
            )));
        }
        if self.gadget_exists() {
            warn!("Gadget exists but not bound by us, will reconfigure");
            self.cleanup()?;
        }

        // The kernel reads the node directly from here on
        backend.flush()?;

        create_dir(&self.gadget_path)?;
        self.set_device_descriptors(descriptors)?;
        self.create_strings(descriptors)?;
        self.create_configuration(descriptors)?;
        self.create_function(&file)?;
        self.bind()?;

        self.backend = Some(backend);
        info!("USB mass storage gadget ready");
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let result = self.cleanup();
        if let Some(backend) = self.backend.take() {
            drop(backend.into_handle());
        }
        result
    }
}
