//! Mass storage class backend
//!
//! Owns the block device handle once the medium is handed to the host and
//! answers the class driver's callbacks: capacity, READ(10), WRITE(10),
//! START STOP UNIT and TEST UNIT READY. Transfers carry a byte offset into
//! the first sector; unaligned writes go through read-modify-write.

use std::path::Path;

use tracing::{debug, info};

use super::scsi::{ScsiCommand, ScsiError};
use crate::block::{BlockDeviceHandle, BlockError};

/// Host-side view of the medium
pub struct MscBackend {
    handle: BlockDeviceHandle,
    /// Cleared by an eject, set again by a load
    ready: bool,
}

/// Absolute byte address of `offset` bytes into sector `lba`
fn byte_position(lba: u64, offset: u32, sector_size: usize) -> Result<u64, ScsiError> {
    lba.checked_mul(sector_size as u64)
        .and_then(|base| base.checked_add(offset as u64))
        .ok_or(ScsiError::OutOfRange)
}

impl MscBackend {
    pub fn new(handle: BlockDeviceHandle) -> Self {
        Self {
            handle,
            ready: true,
        }
    }

    /// (block count, block size) as reported by READ CAPACITY
    pub fn capacity(&self) -> (u64, u32) {
        let capacity = self.handle.capacity();
        (capacity.sector_count, capacity.sector_size)
    }

    pub fn backing_path(&self) -> Option<&Path> {
        self.handle.backing_path()
    }

    pub fn test_unit_ready(&self) -> bool {
        self.ready
    }

    /// START STOP UNIT
    ///
    /// With `load_eject` set, `start` loads the medium and a cleared `start`
    /// ejects it. Without `load_eject` only the power condition changes, which
    /// has no effect on a card.
    pub fn start_stop(&mut self, power_condition: u8, start: bool, load_eject: bool) -> bool {
        debug!(
            "start_stop: power_condition={} start={} load_eject={}",
            power_condition, start, load_eject
        );
        if load_eject {
            if start {
                info!("Medium loaded by host");
                self.ready = true;
            } else {
                info!("Medium ejected by host");
                if let Err(e) = self.handle.flush() {
                    tracing::warn!("Flush on eject failed: {}", e);
                }
                self.ready = false;
            }
        }
        true
    }

    /// Fill `buf` from `lba`, starting `offset` bytes into that sector
    ///
    /// Returns the number of bytes copied.
    pub fn read10(&mut self, lba: u64, offset: u32, buf: &mut [u8]) -> Result<usize, ScsiError> {
        if !self.ready {
            return Err(ScsiError::NotReady);
        }
        let sector_size = self.sector_size();

        if offset == 0 && buf.len() % sector_size == 0 {
            self.handle.read_into(lba, buf)?;
            return Ok(buf.len());
        }

        let mut pos = byte_position(lba, offset, sector_size)?;
        let mut done = 0;
        while done < buf.len() {
            let sector = pos / sector_size as u64;
            let within = (pos % sector_size as u64) as usize;
            let n = (sector_size - within).min(buf.len() - done);

            let data = self.handle.read_sectors(sector, 1)?;
            buf[done..done + n].copy_from_slice(&data[within..within + n]);

            done += n;
            pos += n as u64;
        }
        Ok(done)
    }

    /// Write `data` at `lba`, starting `offset` bytes into that sector
    ///
    /// Returns the number of bytes accepted.
    pub fn write10(&mut self, lba: u64, offset: u32, data: &[u8]) -> Result<usize, ScsiError> {
        if !self.ready {
            return Err(ScsiError::NotReady);
        }
        let sector_size = self.sector_size();

        if offset == 0 && data.len() % sector_size == 0 {
            let count = (data.len() / sector_size) as u64;
            self.handle.write_sectors(lba, count, data)?;
            return Ok(data.len());
        }

        let mut pos = byte_position(lba, offset, sector_size)?;
        let mut done = 0;
        while done < data.len() {
            let sector = pos / sector_size as u64;
            let within = (pos % sector_size as u64) as usize;
            let n = (sector_size - within).min(data.len() - done);

            if within == 0 && n == sector_size {
                self.handle
                    .write_sectors(sector, 1, &data[done..done + n])?;
            } else {
                let mut block = self.handle.read_sectors(sector, 1)?;
                block[within..within + n].copy_from_slice(&data[done..done + n]);
                self.handle.write_sectors(sector, 1, &block)?;
            }

            done += n;
            pos += n as u64;
        }
        Ok(done)
    }

    /// Execute one CDB
    ///
    /// `data_out` is the host payload of a WRITE(10). Returns the data-in
    /// phase bytes (empty for commands without one).
    pub fn execute(&mut self, cdb: &[u8], data_out: &[u8]) -> Result<Vec<u8>, ScsiError> {
        match ScsiCommand::parse(cdb)? {
            ScsiCommand::TestUnitReady => {
                if self.test_unit_ready() {
                    Ok(Vec::new())
                } else {
                    Err(ScsiError::NotReady)
                }
            }
            ScsiCommand::StartStopUnit {
                power_condition,
                start,
                load_eject,
            } => {
                self.start_stop(power_condition, start, load_eject);
                Ok(Vec::new())
            }
            ScsiCommand::ReadCapacity10 => {
                if !self.ready {
                    return Err(ScsiError::NotReady);
                }
                let (count, size) = self.capacity();
                let last_lba = u32::try_from(count.saturating_sub(1)).unwrap_or(u32::MAX);
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&last_lba.to_be_bytes());
                out.extend_from_slice(&size.to_be_bytes());
                Ok(out)
            }
            ScsiCommand::Read10 { lba, blocks } => {
                let mut buf = vec![0u8; blocks as usize * self.sector_size()];
                self.read10(lba as u64, 0, &mut buf)?;
                Ok(buf)
            }
            ScsiCommand::Write10 { lba, blocks } => {
                if data_out.len() != blocks as usize * self.sector_size() {
                    return Err(ScsiError::InvalidCdb("transfer length mismatch"));
                }
                self.write10(lba as u64, 0, data_out)?;
                Ok(Vec::new())
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), BlockError> {
        self.handle.flush()
    }

    /// Give the handle back, flushing first
    pub fn into_handle(mut self) -> BlockDeviceHandle {
        if let Err(e) = self.handle.flush() {
            tracing::warn!("Flush before releasing medium failed: {}", e);
        }
        self.handle
    }

    fn sector_size(&self) -> usize {
        self.handle.capacity().sector_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemBlockDevice;
    use crate::usb::scsi::{rw10_cdb, READ_10, WRITE_10};

    fn backend(sectors: u64) -> (MscBackend, MemBlockDevice) {
        let device = MemBlockDevice::new(512, sectors);
        let handle = BlockDeviceHandle::new(Box::new(device.clone()));
        (MscBackend::new(handle), device)
    }

    #[test]
    fn test_capacity() {
        let (msc, _) = backend(2048);
        assert_eq!(msc.capacity(), (2048, 512));
    }

    #[test]
    fn test_aligned_write_then_read() {
        let (mut msc, device) = backend(16);
        let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        assert_eq!(msc.write10(4, 0, &data).unwrap(), 1024);

        let mut buf = vec![0u8; 1024];
        assert_eq!(msc.read10(4, 0, &mut buf).unwrap(), 1024);
        assert_eq!(buf, data);
        assert_eq!(&device.contents()[4 * 512..6 * 512], &data[..]);
    }

    #[test]
    fn test_partial_sector_write_preserves_neighbours() {
        let (mut msc, device) = backend(4);
        msc.write10(1, 0, &[0x11u8; 512]).unwrap();

        // 64 bytes straddling the end of sector 1 and the start of sector 2
        assert_eq!(msc.write10(1, 480, &[0xEEu8; 64]).unwrap(), 64);

        let contents = device.contents();
        assert!(contents[512..992].iter().all(|&b| b == 0x11));
        assert!(contents[992..1056].iter().all(|&b| b == 0xEE));
        assert!(contents[1056..1536].iter().all(|&b| b == 0));

        let mut buf = [0u8; 40];
        msc.read10(1, 470, &mut buf).unwrap();
        assert!(buf[..10].iter().all(|&b| b == 0x11));
        assert!(buf[10..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_out_of_range() {
        let (mut msc, _) = backend(4);
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            msc.read10(4, 0, &mut buf),
            Err(ScsiError::OutOfRange)
        ));
    }

    #[test]
    fn test_huge_lba_with_offset_is_out_of_range() {
        let (mut msc, medium) = backend(4);
        let mut buf = vec![0u8; 16];
        assert!(matches!(
            msc.read10(u64::MAX, 8, &mut buf),
            Err(ScsiError::OutOfRange)
        ));
        assert!(matches!(
            msc.write10(u64::MAX / 256, 1, &[0xAB; 16]),
            Err(ScsiError::OutOfRange)
        ));
        assert!(medium.contents().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_eject_and_load() {
        let (mut msc, _) = backend(4);
        assert!(msc.test_unit_ready());

        assert!(msc.start_stop(0, false, true));
        assert!(!msc.test_unit_ready());
        let mut buf = vec![0u8; 512];
        assert!(matches!(msc.read10(0, 0, &mut buf), Err(ScsiError::NotReady)));

        // Power condition only
        msc.start_stop(0, true, false);
        assert!(!msc.test_unit_ready());

        msc.start_stop(0, true, true);
        assert!(msc.test_unit_ready());
    }

    #[test]
    fn test_execute_dispatch() {
        let (mut msc, _) = backend(100);

        let cap = msc.execute(&[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], &[]).unwrap();
        assert_eq!(cap, vec![0, 0, 0, 99, 0, 0, 2, 0]);

        let payload = vec![0x5Au8; 1024];
        assert!(msc
            .execute(&rw10_cdb(WRITE_10, 10, 2), &payload)
            .unwrap()
            .is_empty());
        assert_eq!(msc.execute(&rw10_cdb(READ_10, 10, 2), &[]).unwrap(), payload);

        assert!(matches!(
            msc.execute(&rw10_cdb(WRITE_10, 10, 2), &payload[..512]),
            Err(ScsiError::InvalidCdb(_))
        ));
        assert!(matches!(
            msc.execute(&[0x1A, 0, 0x3F, 0, 192, 0], &[]),
            Err(ScsiError::Unsupported(0x1A))
        ));

        msc.execute(&[0x1B, 0, 0, 0, 0x02, 0], &[]).unwrap();
        assert!(matches!(
            msc.execute(&[0x00, 0, 0, 0, 0, 0], &[]),
            Err(ScsiError::NotReady)
        ));
    }
}
