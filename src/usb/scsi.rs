//! SCSI transparent command set, the subset a removable disk needs
//!
//! Command blocks arrive inside Bulk-Only Transport CBWs; only the CDB is
//! handled here.

use thiserror::Error;

use crate::block::BlockError;

pub const TEST_UNIT_READY: u8 = 0x00;
pub const START_STOP_UNIT: u8 = 0x1B;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;

/// Sense key / additional sense code / qualifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

/// Failed SCSI command
#[derive(Error, Debug)]
pub enum ScsiError {
    #[error("Medium not present")]
    NotReady,

    #[error("LBA out of range")]
    OutOfRange,

    #[error("Unsupported SCSI opcode 0x{0:02x}")]
    Unsupported(u8),

    #[error("Invalid field in CDB: {0}")]
    InvalidCdb(&'static str),

    #[error("Medium error: {0}")]
    Medium(BlockError),
}

impl ScsiError {
    /// Sense data the host reads back with REQUEST SENSE
    pub fn sense(&self) -> Sense {
        let (key, asc, ascq) = match self {
            ScsiError::NotReady => (0x02, 0x3A, 0x00),
            ScsiError::OutOfRange => (0x05, 0x21, 0x00),
            ScsiError::Unsupported(_) => (0x05, 0x20, 0x00),
            ScsiError::InvalidCdb(_) => (0x05, 0x24, 0x00),
            ScsiError::Medium(_) => (0x03, 0x11, 0x00),
        };
        Sense { key, asc, ascq }
    }
}

impl From<BlockError> for ScsiError {
    fn from(e: BlockError) -> Self {
        match e {
            BlockError::OutOfRange { .. } => ScsiError::OutOfRange,
            other => ScsiError::Medium(other),
        }
    }
}

/// Decoded command descriptor block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiCommand {
    TestUnitReady,
    StartStopUnit {
        power_condition: u8,
        start: bool,
        load_eject: bool,
    },
    ReadCapacity10,
    Read10 { lba: u32, blocks: u16 },
    Write10 { lba: u32, blocks: u16 },
}

impl ScsiCommand {
    pub fn parse(cdb: &[u8]) -> Result<Self, ScsiError> {
        let opcode = *cdb.first().ok_or(ScsiError::InvalidCdb("empty CDB"))?;
        let need = |len: usize| {
            if cdb.len() < len {
                Err(ScsiError::InvalidCdb("CDB too short"))
            } else {
                Ok(())
            }
        };

        match opcode {
            TEST_UNIT_READY => {
                need(6)?;
                Ok(ScsiCommand::TestUnitReady)
            }
            START_STOP_UNIT => {
                need(6)?;
                Ok(ScsiCommand::StartStopUnit {
                    power_condition: cdb[4] >> 4,
                    start: cdb[4] & 0x01 != 0,
                    load_eject: cdb[4] & 0x02 != 0,
                })
            }
            READ_CAPACITY_10 => {
                need(10)?;
                Ok(ScsiCommand::ReadCapacity10)
            }
            READ_10 | WRITE_10 => {
                need(10)?;
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]);
                let blocks = u16::from_be_bytes([cdb[7], cdb[8]]);
                Ok(if opcode == READ_10 {
                    ScsiCommand::Read10 { lba, blocks }
                } else {
                    ScsiCommand::Write10 { lba, blocks }
                })
            }
            other => Err(ScsiError::Unsupported(other)),
        }
    }
}

/// Build a 10-byte READ(10) or WRITE(10) CDB
pub fn rw10_cdb(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
    let [l0, l1, l2, l3] = lba.to_be_bytes();
    let [b0, b1] = blocks.to_be_bytes();
    [opcode, 0, l0, l1, l2, l3, 0, b0, b1, 0]
}
