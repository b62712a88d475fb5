//! msc-gadget - hand an SD card or flash partition to a USB host
//!
//! The medium is mounted locally once at boot for inventory, then exposed
//! to the host through the USB Mass Storage Class until a reset trigger
//! restarts the process.

pub mod arbiter;
pub mod block;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod status;
pub mod trigger;
pub mod usb;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AppError, Result};
