//! Block device over a device node or image file
//!
//! Covers `/dev/mmcblkNpM` (SD card over SPI or SDMMC), MTD block nodes of
//! an on-board flash partition, and plain image files.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{BlockDevice, BlockError, BlockSource, BusError, Capacity, ProbeError};
use crate::config::StorageConfig;

/// Medium backed by a file descriptor, addressed with positional I/O
pub struct FileBlockDevice {
    path: PathBuf,
    file: File,
    capacity: Capacity,
}

impl FileBlockDevice {
    /// Open `path` read/write and size it
    pub fn open(path: &Path, sector_size: u32) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        // Seeking to the end works for block device nodes, metadata().len() does not
        let len = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            capacity: Capacity {
                sector_size,
                sector_count: len / sector_size as u64,
            },
        })
    }

    fn offset(&self, lba: u64) -> u64 {
        lba * self.capacity.sector_size as u64
    }
}

impl BlockDevice for FileBlockDevice {
    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn read_at(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        self.file.read_exact_at(buf, self.offset(lba))?;
        Ok(())
    }

    fn write_at(&mut self, lba: u64, buf: &[u8]) -> Result<(), BlockError> {
        self.file.write_all_at(buf, self.offset(lba))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BlockError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn backing_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// SD card (or flash partition) bring-up through the kernel block layer
pub struct SdCardSource {
    device_path: PathBuf,
    bus_path: Option<PathBuf>,
    sector_size: u32,
}

impl SdCardSource {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            device_path: PathBuf::from(&config.device_path),
            bus_path: config
                .bus_path
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            sector_size: config.sector_size,
        }
    }
}

impl BlockSource for SdCardSource {
    fn init_bus(&mut self) -> Result<(), BusError> {
        if self.sector_size == 0 || !self.sector_size.is_power_of_two() {
            return Err(BusError(format!(
                "Invalid sector size {}",
                self.sector_size
            )));
        }

        match &self.bus_path {
            Some(bus) if !bus.exists() => Err(BusError(format!(
                "Bus controller {} not present",
                bus.display()
            ))),
            Some(bus) => {
                info!("Using bus controller {}", bus.display());
                Ok(())
            }
            None => {
                debug!("No bus controller configured, using block layer directly");
                Ok(())
            }
        }
    }

    fn probe(&mut self) -> Result<Box<dyn BlockDevice>, ProbeError> {
        if !self.device_path.exists() {
            return Err(ProbeError::NoMedium);
        }

        let mut device = FileBlockDevice::open(&self.device_path, self.sector_size)?;
        let capacity = device.capacity();
        if capacity.sector_count == 0 {
            return Err(ProbeError::NotResponding(format!(
                "{} reports zero size",
                self.device_path.display()
            )));
        }

        // A card that enumerated but does not answer fails here
        let mut sector0 = vec![0u8; self.sector_size as usize];
        device
            .read_at(0, &mut sector0)
            .map_err(|e| ProbeError::NotResponding(e.to_string()))?;

        info!("Medium {}: {}", self.device_path.display(), capacity);
        Ok(Box::new(device))
    }
}
