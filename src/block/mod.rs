//! Block device provider
//!
//! Brings up the physical medium and hands out the single
//! [`BlockDeviceHandle`] that the rest of the system passes around.
//!
//! ```text
//! BlockSource::init_bus()  --fatal-->  AppError::BusInit
//!        |
//! BlockSource::probe()  --transient-->  sleep(delay), probe again
//!        |
//! BlockDeviceHandle  (moved: MountManager -> UsbExposure)
//! ```

pub mod file;

use std::fmt;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::utils::{RepeatThrottle, RetryPolicy};
use crate::warn_throttled;

pub use file::{FileBlockDevice, SdCardSource};

/// Default sector size for SD cards and flash partitions
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Raw sector access errors
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Sector range {lba}+{count} exceeds medium of {sector_count} sectors")]
    OutOfRange {
        lba: u64,
        count: u64,
        sector_count: u64,
    },

    #[error("Buffer of {len} bytes is not a multiple of the {sector_size}-byte sector size")]
    Misaligned { len: usize, sector_size: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Medium geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub sector_size: u32,
    pub sector_count: u64,
}

impl Capacity {
    /// Total size in bytes
    pub fn total_bytes(&self) -> u64 {
        self.sector_size as u64 * self.sector_count
    }

    fn check_range(&self, lba: u64, count: u64) -> std::result::Result<(), BlockError> {
        match lba.checked_add(count) {
            Some(end) if end <= self.sector_count => Ok(()),
            _ => Err(BlockError::OutOfRange {
                lba,
                count,
                sector_count: self.sector_count,
            }),
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sectors x {} B ({:.1} MB)",
            self.sector_count,
            self.sector_size,
            self.total_bytes() as f64 / 1024.0 / 1024.0
        )
    }
}

/// Sector-addressed medium
///
/// Buffers are always whole sectors; bounds are checked by the handle before
/// an implementation is called.
pub trait BlockDevice: Send {
    /// Geometry of the medium
    fn capacity(&self) -> Capacity;

    /// Fill `buf` starting at sector `lba`
    fn read_at(&mut self, lba: u64, buf: &mut [u8]) -> std::result::Result<(), BlockError>;

    /// Write `buf` starting at sector `lba`
    fn write_at(&mut self, lba: u64, buf: &[u8]) -> std::result::Result<(), BlockError>;

    /// Push cached writes to the medium
    fn flush(&mut self) -> std::result::Result<(), BlockError> {
        Ok(())
    }

    /// Device node or image file backing this medium, if any
    fn backing_path(&self) -> Option<&Path> {
        None
    }
}

/// Exclusive reference to an initialized medium
///
/// Not `Clone`: whoever holds the handle owns the medium.
pub struct BlockDeviceHandle {
    device: Box<dyn BlockDevice>,
    capacity: Capacity,
}

impl BlockDeviceHandle {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let capacity = device.capacity();
        Self { device, capacity }
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn backing_path(&self) -> Option<&Path> {
        self.device.backing_path()
    }

    /// Read `count` sectors starting at `lba`
    pub fn read_sectors(&mut self, lba: u64, count: u64) -> std::result::Result<Vec<u8>, BlockError> {
        self.capacity.check_range(lba, count)?;
        let mut buf = vec![0u8; (count * self.capacity.sector_size as u64) as usize];
        self.device.read_at(lba, &mut buf)?;
        Ok(buf)
    }

    /// Read whole sectors into `buf`
    pub fn read_into(&mut self, lba: u64, buf: &mut [u8]) -> std::result::Result<(), BlockError> {
        let count = self.sector_span(buf.len())?;
        self.capacity.check_range(lba, count)?;
        self.device.read_at(lba, buf)
    }

    /// Write `count` sectors of `data` starting at `lba`
    pub fn write_sectors(
        &mut self,
        lba: u64,
        count: u64,
        data: &[u8],
    ) -> std::result::Result<(), BlockError> {
        let span = self.sector_span(data.len())?;
        if span != count {
            return Err(BlockError::Misaligned {
                len: data.len(),
                sector_size: self.capacity.sector_size,
            });
        }
        self.capacity.check_range(lba, count)?;
        self.device.write_at(lba, data)
    }

    pub fn flush(&mut self) -> std::result::Result<(), BlockError> {
        self.device.flush()
    }

    fn sector_span(&self, len: usize) -> std::result::Result<u64, BlockError> {
        let sector_size = self.capacity.sector_size as usize;
        if sector_size == 0 || len % sector_size != 0 {
            return Err(BlockError::Misaligned {
                len,
                sector_size: self.capacity.sector_size,
            });
        }
        Ok((len / sector_size) as u64)
    }
}

impl fmt::Debug for BlockDeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDeviceHandle")
            .field("capacity", &self.capacity)
            .field("backing_path", &self.backing_path())
            .finish()
    }
}

/// Bus or transport could not be configured (fatal)
#[derive(Error, Debug)]
#[error("{0}")]
pub struct BusError(pub String);

/// Medium did not respond (transient)
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("No medium present")]
    NoMedium,

    #[error("Medium not responding: {0}")]
    NotResponding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Physical bring-up of a medium
pub trait BlockSource: Send {
    /// Configure the bus/transport; failure here is a configuration problem
    fn init_bus(&mut self) -> std::result::Result<(), BusError>;

    /// Probe the medium once
    fn probe(&mut self) -> std::result::Result<Box<dyn BlockDevice>, ProbeError>;
}

/// Produces the block device handle, retrying the medium probe
pub struct BlockDeviceProvider<S> {
    source: S,
    policy: RetryPolicy,
    throttle: RepeatThrottle,
}

impl<S: BlockSource> BlockDeviceProvider<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            throttle: RepeatThrottle::default(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Bring up the bus, then probe until the medium answers
    ///
    /// Only returns a fully initialized handle. A bus failure is returned
    /// immediately; probe failures are retried according to the policy.
    pub async fn acquire(&mut self) -> Result<BlockDeviceHandle> {
        info!("Initializing storage bus");
        self.source
            .init_bus()
            .map_err(|e| AppError::BusInit(e.to_string()))?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.source.probe() {
                Ok(device) => {
                    let handle = BlockDeviceHandle::new(device);
                    let failed = self.throttle.reset();
                    info!(
                        "Medium ready after {} attempt(s): {}",
                        attempts,
                        handle.capacity()
                    );
                    if failed > 0 {
                        debug!("{} probe failure(s) before success", failed);
                    }
                    return Ok(handle);
                }
                Err(e) => {
                    warn_throttled!(
                        self.throttle,
                        attempt = attempts,
                        "Failed to initialize medium: {}",
                        e
                    );
                    if !self.policy.allows_another(attempts) {
                        return Err(AppError::ProbeExhausted { attempts });
                    }
                    tokio::time::sleep(self.policy.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FlakySource, MemBlockDevice};
    use std::time::Duration;

    #[test]
    fn test_handle_bounds() {
        let mut handle = BlockDeviceHandle::new(Box::new(MemBlockDevice::new(512, 8)));
        assert_eq!(handle.capacity().total_bytes(), 4096);

        assert!(handle.read_sectors(7, 1).is_ok());
        assert!(matches!(
            handle.read_sectors(7, 2),
            Err(BlockError::OutOfRange { .. })
        ));
        assert!(matches!(
            handle.write_sectors(0, 1, &[0u8; 100]),
            Err(BlockError::Misaligned { .. })
        ));
        assert!(matches!(
            handle.write_sectors(0, 2, &[0u8; 512]),
            Err(BlockError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_handle_write_then_read() {
        let mut handle = BlockDeviceHandle::new(Box::new(MemBlockDevice::new(512, 4)));
        let data = vec![0xA5u8; 1024];
        handle.write_sectors(2, 2, &data).unwrap();
        assert_eq!(handle.read_sectors(2, 2).unwrap(), data);
        assert_eq!(handle.read_sectors(0, 1).unwrap(), vec![0u8; 512]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_fails_twice_then_succeeds() {
        let delay = Duration::from_millis(1000);
        let source = FlakySource::new(2, MemBlockDevice::new(512, 64));
        let probes = source.probe_times();
        let mut provider = BlockDeviceProvider::new(source, RetryPolicy::unbounded(delay));

        let handle = provider.acquire().await.unwrap();
        assert_eq!(handle.capacity().sector_count, 64);

        let times = probes.lock().unwrap().clone();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_policy_gives_up() {
        let source = FlakySource::new(5, MemBlockDevice::new(512, 8));
        let mut provider =
            BlockDeviceProvider::new(source, RetryPolicy::bounded(Duration::from_millis(10), 3));

        let err = provider.acquire().await.unwrap_err();
        assert!(matches!(err, AppError::ProbeExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_bus_failure_is_fatal() {
        let source = FlakySource::new(0, MemBlockDevice::new(512, 8)).with_bus_failure();
        let probes = source.probe_times();
        let mut provider = BlockDeviceProvider::new(source, RetryPolicy::default());

        let err = provider.acquire().await.unwrap_err();
        assert!(matches!(err, AppError::BusInit(_)));
        assert!(probes.lock().unwrap().is_empty());
    }
}
