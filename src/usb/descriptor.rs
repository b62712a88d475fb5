//! USB identity of the mass storage device
//!
//! Device, configuration and string descriptors, fixed at startup. The byte
//! encoders follow the USB 2.0 layouts (chapter 9.6) so the same set can be
//! handed to a userspace stack or dumped for inspection.

use std::fmt::Write as _;

use crate::config::UsbConfig;
use crate::error::{AppError, Result};

/// USB 2.0
pub const USB_BCD_USB: u16 = 0x0200;

/// Miscellaneous device class
pub const CLASS_MISC: u8 = 0xEF;
/// Common class subclass
pub const MISC_SUBCLASS_COMMON: u8 = 0x02;
/// Interface Association Descriptor protocol
pub const MISC_PROTOCOL_IAD: u8 = 0x01;

/// Mass storage interface class
pub const CLASS_MSC: u8 = 0x08;
/// SCSI transparent command set
pub const MSC_SUBCLASS_SCSI: u8 = 0x06;
/// Bulk-Only Transport
pub const MSC_PROTOCOL_BOT: u8 = 0x50;

pub const ENDPOINT0_SIZE: u8 = 64;
pub const EP_MSC_OUT: u8 = 0x01;
pub const EP_MSC_IN: u8 = 0x81;

/// Bus powered
pub const CONFIG_ATT_RESERVED: u8 = 0x80;
pub const CONFIG_ATT_REMOTE_WAKEUP: u8 = 0x20;

const DESC_DEVICE: u8 = 0x01;
const DESC_CONFIGURATION: u8 = 0x02;
const DESC_STRING: u8 = 0x03;
const DESC_INTERFACE: u8 = 0x04;
const DESC_ENDPOINT: u8 = 0x05;
const EP_ATTR_BULK: u8 = 0x02;

const CONFIG_DESC_LEN: usize = 9;
const INTERFACE_DESC_LEN: usize = 9;
const ENDPOINT_DESC_LEN: usize = 7;
/// Interface + bulk OUT + bulk IN
const MSC_DESC_LEN: usize = INTERFACE_DESC_LEN + 2 * ENDPOINT_DESC_LEN;
/// String descriptors carry at most 126 UTF-16 code units
const MAX_STRING_UNITS: usize = 126;

/// Bus speed the bulk endpoints are sized for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Full,
    High,
}

impl UsbSpeed {
    /// Bulk endpoint max packet size
    pub fn bulk_packet_size(self) -> u16 {
        match self {
            UsbSpeed::High => 512,
            UsbSpeed::Full => 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn to_bytes(&self) -> [u8; 18] {
        let [usb_lo, usb_hi] = self.bcd_usb.to_le_bytes();
        let [vid_lo, vid_hi] = self.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = self.product_id.to_le_bytes();
        let [dev_lo, dev_hi] = self.bcd_device.to_le_bytes();
        [
            18,
            DESC_DEVICE,
            usb_lo,
            usb_hi,
            self.device_class,
            self.device_subclass,
            self.device_protocol,
            self.max_packet_size0,
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            dev_lo,
            dev_hi,
            self.manufacturer_index,
            self.product_index,
            self.serial_index,
            self.num_configurations,
        ]
    }
}

/// The single MSC interface with its two bulk endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MscInterface {
    pub interface_number: u8,
    pub string_index: u8,
    pub ep_out: u8,
    pub ep_in: u8,
    pub max_packet_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: u8,
    pub max_power_ma: u16,
    pub interface: MscInterface,
}

impl ConfigurationDescriptor {
    /// Configuration descriptor followed by the interface and endpoints
    pub fn to_bytes(&self) -> Vec<u8> {
        let total = (CONFIG_DESC_LEN + MSC_DESC_LEN) as u16;
        let itf = &self.interface;
        let mut out = Vec::with_capacity(total as usize);

        out.extend_from_slice(&[CONFIG_DESC_LEN as u8, DESC_CONFIGURATION]);
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&[
            1, // bNumInterfaces
            self.configuration_value,
            self.string_index,
            self.attributes,
            (self.max_power_ma / 2) as u8,
        ]);

        out.extend_from_slice(&[
            INTERFACE_DESC_LEN as u8,
            DESC_INTERFACE,
            itf.interface_number,
            0, // bAlternateSetting
            2, // bNumEndpoints
            CLASS_MSC,
            MSC_SUBCLASS_SCSI,
            MSC_PROTOCOL_BOT,
            itf.string_index,
        ]);

        for ep in [itf.ep_out, itf.ep_in] {
            out.extend_from_slice(&[ENDPOINT_DESC_LEN as u8, DESC_ENDPOINT, ep, EP_ATTR_BULK]);
            out.extend_from_slice(&itf.max_packet_size.to_le_bytes());
            out.push(0); // bInterval
        }

        out
    }
}

/// Indexed string table; index 0 is the language list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringTable {
    pub language_id: u16,
    /// Strings for index 1..=len
    pub strings: Vec<String>,
}

impl StringTable {
    pub fn get(&self, index: u8) -> Option<&str> {
        match index {
            0 => None,
            i => self.strings.get(i as usize - 1).map(String::as_str),
        }
    }

    /// String descriptor bytes for `index`
    pub fn to_bytes(&self, index: u8) -> Option<Vec<u8>> {
        if index == 0 {
            let [lo, hi] = self.language_id.to_le_bytes();
            return Some(vec![4, DESC_STRING, lo, hi]);
        }
        let units: Vec<u16> = self.get(index)?.encode_utf16().take(MAX_STRING_UNITS).collect();
        let mut out = Vec::with_capacity(2 + units.len() * 2);
        out.push((2 + units.len() * 2) as u8);
        out.push(DESC_STRING);
        for unit in units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        Some(out)
    }

    /// Number of entries including the language entry
    pub fn len(&self) -> usize {
        self.strings.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Complete USB identity, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptorSet {
    pub device: DeviceDescriptor,
    pub configuration: ConfigurationDescriptor,
    pub strings: StringTable,
}

impl DeviceDescriptorSet {
    pub const MANUFACTURER_INDEX: u8 = 1;
    pub const PRODUCT_INDEX: u8 = 2;
    pub const SERIAL_INDEX: u8 = 3;
    pub const INTERFACE_INDEX: u8 = 4;

    /// Build and validate the descriptor set
    pub fn from_config(config: &UsbConfig) -> Result<Self> {
        if config.vendor_id == 0 {
            return Err(AppError::Config("USB vendor id must not be 0".to_string()));
        }
        if config.max_power_ma > 500 {
            return Err(AppError::Config(format!(
                "USB max power {} mA exceeds 500 mA",
                config.max_power_ma
            )));
        }
        let strings = vec![
            config.manufacturer.clone(),
            config.product.clone(),
            config.serial_number.clone(),
            config.interface_name.clone(),
        ];
        for s in &strings {
            if s.encode_utf16().count() > MAX_STRING_UNITS {
                return Err(AppError::Config(format!("USB string too long: {}", s)));
            }
        }

        let speed = if config.high_speed {
            UsbSpeed::High
        } else {
            UsbSpeed::Full
        };
        let mut attributes = CONFIG_ATT_RESERVED;
        if config.remote_wakeup {
            attributes |= CONFIG_ATT_REMOTE_WAKEUP;
        }

        Ok(Self {
            device: DeviceDescriptor {
                bcd_usb: USB_BCD_USB,
                device_class: CLASS_MISC,
                device_subclass: MISC_SUBCLASS_COMMON,
                device_protocol: MISC_PROTOCOL_IAD,
                max_packet_size0: ENDPOINT0_SIZE,
                vendor_id: config.vendor_id,
                product_id: config.product_id,
                bcd_device: config.bcd_device,
                manufacturer_index: Self::MANUFACTURER_INDEX,
                product_index: Self::PRODUCT_INDEX,
                serial_index: Self::SERIAL_INDEX,
                num_configurations: 1,
            },
            configuration: ConfigurationDescriptor {
                configuration_value: 1,
                string_index: 0,
                attributes,
                max_power_ma: config.max_power_ma,
                interface: MscInterface {
                    interface_number: 0,
                    string_index: Self::INTERFACE_INDEX,
                    ep_out: EP_MSC_OUT,
                    ep_in: EP_MSC_IN,
                    max_packet_size: speed.bulk_packet_size(),
                },
            },
            strings: StringTable {
                language_id: 0x0409,
                strings,
            },
        })
    }

    pub fn manufacturer(&self) -> &str {
        self.strings.get(Self::MANUFACTURER_INDEX).unwrap_or_default()
    }

    pub fn product(&self) -> &str {
        self.strings.get(Self::PRODUCT_INDEX).unwrap_or_default()
    }

    pub fn serial_number(&self) -> &str {
        self.strings.get(Self::SERIAL_INDEX).unwrap_or_default()
    }

    pub fn interface_name(&self) -> &str {
        self.strings.get(Self::INTERFACE_INDEX).unwrap_or_default()
    }

    /// Human-readable hex dump of every descriptor
    pub fn hex_dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "device:        {}", hex(&self.device.to_bytes()));
        let _ = writeln!(out, "configuration: {}", hex(&self.configuration.to_bytes()));
        for index in 0..self.strings.len() as u8 {
            if let Some(bytes) = self.strings.to_bytes(index) {
                let _ = writeln!(out, "string[{}]:     {}", index, hex(&bytes));
            }
        }
        out
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
