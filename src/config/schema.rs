use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::block::DEFAULT_SECTOR_SIZE;
use crate::utils::retry::DEFAULT_RETRY_DELAY;
use crate::utils::RetryPolicy;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Storage medium bring-up
    pub storage: StorageConfig,
    /// Local mount settings
    pub filesystem: FilesystemConfig,
    /// USB gadget identity and binding
    pub usb: UsbConfig,
    /// Reset trigger sources
    pub trigger: TriggerConfig,
    /// Status display
    pub display: DisplayConfig,
}

/// Storage medium configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Block device node or image file (e.g., /dev/mmcblk0p1)
    pub device_path: String,
    /// Bus controller node that must exist before probing (e.g., a sysfs SPI/SDMMC path)
    pub bus_path: Option<String>,
    /// Logical sector size in bytes
    pub sector_size: u32,
    /// Delay between probe attempts in milliseconds
    pub probe_delay_ms: u64,
    /// Give up after this many probes (None = retry forever)
    pub max_probe_attempts: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/mmcblk0p1".to_string(),
            bus_path: None,
            sector_size: DEFAULT_SECTOR_SIZE,
            probe_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            max_probe_attempts: None,
        }
    }
}

impl StorageConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.probe_delay_ms);
        match self.max_probe_attempts {
            Some(n) => RetryPolicy::bounded(delay, n),
            None => RetryPolicy::unbounded(delay),
        }
    }
}

/// Local filesystem configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Base path the medium is mounted at
    pub mount_point: String,
    /// Kernel filesystem type
    pub fs_type: String,
    /// Format the medium when no filesystem is found
    pub format_if_mount_failed: bool,
    /// Cluster size used when formatting, in bytes
    pub allocation_unit_size: u32,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            mount_point: "/data".to_string(),
            fs_type: "vfat".to_string(),
            format_if_mount_failed: false,
            allocation_unit_size: 16 * 1024,
        }
    }
}

/// USB gadget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UsbConfig {
    /// Gadget directory name under configfs
    pub gadget_name: String,
    /// configfs USB gadget root
    pub configfs_path: String,
    /// UDC to bind (None = first available)
    pub udc: Option<String>,
    /// Directory listing available UDCs
    pub udc_class_path: String,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Device release number (BCD)
    pub bcd_device: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    /// MSC interface string
    pub interface_name: String,
    /// Size bulk endpoints for high speed (512) instead of full speed (64)
    pub high_speed: bool,
    /// Bus power draw in mA
    pub max_power_ma: u16,
    pub remote_wakeup: bool,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            gadget_name: "msc-gadget".to_string(),
            configfs_path: "/sys/kernel/config/usb_gadget".to_string(),
            udc: None,
            udc_class_path: "/sys/class/udc".to_string(),
            vendor_id: 0x303A,
            product_id: 0x4002,
            bcd_device: 0x0100,
            manufacturer: "TinyUSB".to_string(),
            product: "TinyUSB Device".to_string(),
            serial_number: "123456".to_string(),
            interface_name: "Example MSC".to_string(),
            high_speed: true,
            max_power_ma: 100,
            remote_wakeup: true,
        }
    }
}

/// Reset trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriggerConfig {
    /// GPIO chip of the reset button (e.g., /dev/gpiochip0); None disables it
    pub gpio_chip: Option<String>,
    /// Line offset of the reset button
    pub gpio_pin: u32,
    /// Button pulls the line low when pressed
    pub active_low: bool,
    /// Treat SIGUSR1 as a reset request
    pub signal: bool,
    /// Trigger poll interval in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            gpio_chip: None,
            gpio_pin: 0,
            active_low: true,
            signal: true,
            poll_interval_ms: 100,
        }
    }
}

impl TriggerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Status display configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    /// Framebuffer device (e.g., /dev/fb1); None logs status instead
    pub framebuffer: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Raw RGB565 image shown while booting
    pub boot_image: Option<String>,
    /// Raw RGB565 image shown once the medium is ready
    pub ready_image: Option<String>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            framebuffer: None,
            width: 128,
            height: 128,
            boot_image: None,
            ready_image: None,
        }
    }
}
