//! Kernel filesystem driver (vfat by default)
//!
//! Mounting goes through mount(2) on the medium's device node; formatting
//! shells out to `mkfs.<type>`.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::{debug, info};

use super::{Filesystem, FsError, ListDiagnostic, Usage};
use crate::block::BlockDeviceHandle;

/// Filesystem mounted by the running kernel
#[derive(Debug, Clone)]
pub struct KernelFs {
    fs_type: String,
}

impl KernelFs {
    pub fn new(fs_type: impl Into<String>) -> Self {
        Self {
            fs_type: fs_type.into(),
        }
    }

    fn mkfs_command(&self, device: &Path, sector_size: u32, allocation_unit: u32) -> Command {
        let mut cmd = Command::new(format!("mkfs.{}", self.fs_type));
        if self.fs_type == "vfat" || self.fs_type == "fat" {
            let sectors_per_cluster = (allocation_unit / sector_size.max(1)).clamp(1, 128);
            cmd.arg("-S")
                .arg(sector_size.to_string())
                .arg("-s")
                .arg(sectors_per_cluster.to_string());
        }
        cmd.arg(device);
        cmd
    }
}

impl Default for KernelFs {
    fn default() -> Self {
        Self::new("vfat")
    }
}

fn device_node(device: &BlockDeviceHandle) -> Result<&Path, FsError> {
    device
        .backing_path()
        .ok_or_else(|| FsError::Backend("Medium has no device node".to_string()))
}

impl Filesystem for KernelFs {
    fn mount(&mut self, device: &mut BlockDeviceHandle, mount_point: &Path) -> Result<(), FsError> {
        // Our own writes must hit the medium before the kernel reads it
        device
            .flush()
            .map_err(|e| FsError::Backend(e.to_string()))?;
        let node = device_node(device)?;
        std::fs::create_dir_all(mount_point)?;

        debug!(
            "mount {} on {} type {}",
            node.display(),
            mount_point.display(),
            self.fs_type
        );
        match mount(
            Some(node),
            mount_point,
            Some(self.fs_type.as_str()),
            MsFlags::MS_NOATIME,
            None::<&str>,
        ) {
            Ok(()) => Ok(()),
            // EINVAL: superblock not recognized
            Err(Errno::EINVAL) => Err(FsError::NoFilesystem),
            Err(e) => Err(FsError::Backend(format!(
                "mount {} failed: {}",
                node.display(),
                e
            ))),
        }
    }

    fn format(&mut self, device: &mut BlockDeviceHandle, allocation_unit: u32) -> Result<(), FsError> {
        let sector_size = device.capacity().sector_size;
        let node = device_node(device)?;
        info!("Formatting {} as {}", node.display(), self.fs_type);

        let output = self
            .mkfs_command(node, sector_size, allocation_unit)
            .output()
            .map_err(|e| FsError::Backend(format!("mkfs.{} not runnable: {}", self.fs_type, e)))?;
        if !output.status.success() {
            return Err(FsError::Backend(format!(
                "mkfs.{} failed: {}",
                self.fs_type,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn unmount(&mut self, mount_point: &Path) -> Result<(), FsError> {
        umount2(mount_point, MntFlags::empty())
            .map_err(|e| FsError::Backend(format!("umount {} failed: {}", mount_point.display(), e)))
    }

    fn list_dir(&self, path: &Path) -> Result<Box<dyn Iterator<Item = String> + '_>, ListDiagnostic> {
        let entries = std::fs::read_dir(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ListDiagnostic::NotFound,
            _ => ListDiagnostic::NotReadable(e.to_string()),
        })?;
        Ok(Box::new(entries.filter_map(|entry| {
            entry
                .ok()
                .map(|e| e.file_name().to_string_lossy().to_string())
        })))
    }

    fn usage(&self, mount_point: &Path) -> Result<Usage, FsError> {
        let stat = nix::sys::statvfs::statvfs(mount_point)
            .map_err(|e| FsError::Backend(format!("Failed to get disk space: {}", e)))?;

        let block_size = stat.fragment_size() as u64;
        Ok(Usage {
            total_bytes: stat.blocks() as u64 * block_size,
            free_bytes: stat.blocks_free() as u64 * block_size,
        })
    }
}
