//! Filesystem mount manager
//!
//! Local (device-side) access to the medium. The manager takes the block
//! device handle while it is needed and gives it back only once nothing is
//! mounted, so the handle can move on to the USB exposure service.

pub mod kernel;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::block::BlockDeviceHandle;
use crate::config::FilesystemConfig;

pub use kernel::KernelFs;

/// Errors reported by a filesystem implementation
#[derive(Error, Debug)]
pub enum FsError {
    #[error("No valid filesystem on medium")]
    NoFilesystem,

    #[error("{0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors of the mount manager
#[derive(Error, Debug)]
pub enum MountError {
    #[error("Medium has no valid filesystem and formatting is disabled")]
    Unmountable,

    #[error("A filesystem is already mounted")]
    AlreadyMounted,

    #[error("Nothing is mounted")]
    NotMounted,

    #[error("Filesystem still mounted, unmount first")]
    StillMounted,

    #[error("No medium attached")]
    NoMedium,

    #[error("Format failed: {0}")]
    FormatFailed(String),

    #[error("Filesystem error: {0}")]
    Backend(String),
}

/// Why a directory could not be listed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListDiagnostic {
    /// The directory does not exist
    NotFound,
    /// The directory exists but cannot be read
    NotReadable(String),
}

/// Local mount state of the medium
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountState {
    #[default]
    Unmounted,
    MountedLocal,
}

/// Capacity figures of a mounted filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Result of a successful mount
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub free_bytes: u64,
    /// Whether the medium was formatted to get here
    pub formatted: bool,
}

/// Filesystem implementation over a block device handle
pub trait Filesystem: Send {
    /// Mount the filesystem found on `device` at `mount_point`
    ///
    /// Must return [`FsError::NoFilesystem`] when the medium carries no
    /// recognizable filesystem.
    fn mount(&mut self, device: &mut BlockDeviceHandle, mount_point: &Path)
        -> Result<(), FsError>;

    /// Create a fresh filesystem on `device`
    fn format(&mut self, device: &mut BlockDeviceHandle, allocation_unit: u32)
        -> Result<(), FsError>;

    fn unmount(&mut self, mount_point: &Path) -> Result<(), FsError>;

    /// Entry names of `path`
    fn list_dir(
        &self,
        path: &Path,
    ) -> Result<Box<dyn Iterator<Item = String> + '_>, ListDiagnostic>;

    fn usage(&self, mount_point: &Path) -> Result<Usage, FsError>;
}

/// Lazy, single-pass directory listing
///
/// An unreadable directory yields no entries; [`DirListing::diagnostic`]
/// tells why.
pub struct DirListing<'a> {
    entries: Option<Box<dyn Iterator<Item = String> + 'a>>,
    diagnostic: Option<ListDiagnostic>,
}

impl DirListing<'_> {
    pub fn diagnostic(&self) -> Option<&ListDiagnostic> {
        self.diagnostic.as_ref()
    }
}

impl Iterator for DirListing<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.entries.as_mut()?.next()
    }
}

/// Mounts and unmounts the medium for device-local access
pub struct MountManager<F> {
    fs: F,
    mount_point: PathBuf,
    format_if_mount_failed: bool,
    allocation_unit_size: u32,
    state: MountState,
    handle: Option<BlockDeviceHandle>,
}

impl<F: Filesystem> MountManager<F> {
    pub fn new(fs: F, config: &FilesystemConfig) -> Self {
        Self {
            fs,
            mount_point: PathBuf::from(&config.mount_point),
            format_if_mount_failed: config.format_if_mount_failed,
            allocation_unit_size: config.allocation_unit_size,
            state: MountState::Unmounted,
            handle: None,
        }
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Take the medium and mount it
    ///
    /// Without a filesystem the medium is formatted and mounted once more,
    /// if formatting is enabled. On failure the handle stays here and can be
    /// reclaimed with [`MountManager::take_handle`].
    pub fn mount(&mut self, handle: BlockDeviceHandle) -> Result<MountInfo, MountError> {
        if self.state == MountState::MountedLocal || self.handle.is_some() {
            error!("Mount requested while a medium is already attached");
            return Err(MountError::AlreadyMounted);
        }

        info!("Mount storage at {}", self.mount_point.display());
        let handle = self.handle.insert(handle);
        let mut formatted = false;

        match self.fs.mount(handle, &self.mount_point) {
            Ok(()) => {}
            Err(FsError::NoFilesystem) if self.format_if_mount_failed => {
                warn!("No filesystem found, formatting medium");
                self.fs
                    .format(handle, self.allocation_unit_size)
                    .map_err(|e| MountError::FormatFailed(e.to_string()))?;
                formatted = true;
                self.fs
                    .mount(handle, &self.mount_point)
                    .map_err(|e| match e {
                        FsError::NoFilesystem => MountError::Unmountable,
                        other => MountError::Backend(other.to_string()),
                    })?;
            }
            Err(FsError::NoFilesystem) => {
                error!("Medium has no filesystem and formatting is disabled");
                return Err(MountError::Unmountable);
            }
            Err(e) => return Err(MountError::Backend(e.to_string())),
        }

        // A mount we cannot report on is released again before failing
        let usage = match self.fs.usage(&self.mount_point) {
            Ok(usage) => usage,
            Err(e) => {
                error!("Mounted but usage unavailable, unmounting: {}", e);
                if let Err(undo) = self.fs.unmount(&self.mount_point) {
                    error!("Unmount after failed mount also failed: {}", undo);
                }
                return Err(MountError::Backend(e.to_string()));
            }
        };
        self.state = MountState::MountedLocal;
        Ok(MountInfo {
            mount_point: self.mount_point.clone(),
            total_bytes: usage.total_bytes,
            free_bytes: usage.free_bytes,
            formatted,
        })
    }

    /// Release the mount
    ///
    /// Rejected with [`MountError::NotMounted`] when nothing is mounted;
    /// the state is left untouched in that case.
    pub fn unmount(&mut self) -> Result<(), MountError> {
        if self.state != MountState::MountedLocal {
            return Err(MountError::NotMounted);
        }

        self.fs
            .unmount(&self.mount_point)
            .map_err(|e| MountError::Backend(e.to_string()))?;
        if let Some(handle) = self.handle.as_mut() {
            if let Err(e) = handle.flush() {
                warn!("Flush after unmount failed: {}", e);
            }
        }
        self.state = MountState::Unmounted;
        info!("Unmounted {}", self.mount_point.display());
        Ok(())
    }

    /// Give the medium back; only possible while unmounted
    pub fn take_handle(&mut self) -> Result<BlockDeviceHandle, MountError> {
        if self.state == MountState::MountedLocal {
            return Err(MountError::StillMounted);
        }
        self.handle.take().ok_or(MountError::NoMedium)
    }

    /// Total and free bytes of the mounted filesystem
    pub fn info(&self) -> Result<Usage, MountError> {
        if self.state != MountState::MountedLocal {
            return Err(MountError::NotMounted);
        }
        self.fs
            .usage(&self.mount_point)
            .map_err(|e| MountError::Backend(e.to_string()))
    }

    /// List entry names under `path`
    pub fn list(&self, path: &Path) -> DirListing<'_> {
        match self.fs.list_dir(path) {
            Ok(entries) => DirListing {
                entries: Some(entries),
                diagnostic: None,
            },
            Err(diagnostic) => {
                match &diagnostic {
                    ListDiagnostic::NotFound => {
                        error!("Directory doesn't exist {}", path.display())
                    }
                    ListDiagnostic::NotReadable(reason) => {
                        error!("Unable to read directory {}: {}", path.display(), reason)
                    }
                }
                DirListing {
                    entries: None,
                    diagnostic: Some(diagnostic),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemBlockDevice, MemFs};

    fn config(format: bool) -> FilesystemConfig {
        FilesystemConfig {
            format_if_mount_failed: format,
            ..Default::default()
        }
    }

    fn blank_handle(sectors: u64) -> BlockDeviceHandle {
        BlockDeviceHandle::new(Box::new(MemBlockDevice::new(512, sectors)))
    }

    #[test]
    fn test_blank_medium_without_format_is_unmountable() {
        let mut manager = MountManager::new(MemFs::new(), &config(false));
        let err = manager.mount(blank_handle(4096)).unwrap_err();
        assert!(matches!(err, MountError::Unmountable));
        assert_eq!(manager.state(), MountState::Unmounted);
        assert!(manager.take_handle().is_ok());
    }

    #[test]
    fn test_blank_medium_with_format_mounts() {
        let sectors = 8192u64;
        let mut manager = MountManager::new(MemFs::new(), &config(true));
        let info = manager.mount(blank_handle(sectors)).unwrap();
        assert!(info.formatted);
        assert_eq!(manager.state(), MountState::MountedLocal);

        let usage = manager.info().unwrap();
        let medium = sectors * 512;
        assert!(usage.total_bytes < medium);
        assert_eq!(usage.free_bytes, usage.total_bytes);
        // Overhead is boot sector, FATs and root directory: a few percent at most
        assert!(usage.free_bytes > medium * 95 / 100);
    }

    #[test]
    fn test_usage_failure_releases_mount() {
        let log = crate::testing::call_log();
        let fs = MemFs::new().with_failing_usage().with_log(log.clone());
        let mut manager = MountManager::new(fs, &config(true));

        let err = manager.mount(blank_handle(4096)).unwrap_err();
        assert!(matches!(err, MountError::Backend(_)));
        assert_eq!(manager.state(), MountState::Unmounted);
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("fs.unmount"));
        assert!(manager.take_handle().is_ok());
    }

    #[test]
    fn test_unmount_twice_is_rejected() {
        let mut manager = MountManager::new(MemFs::new(), &config(true));
        manager.mount(blank_handle(4096)).unwrap();

        manager.unmount().unwrap();
        assert!(matches!(manager.unmount(), Err(MountError::NotMounted)));
        assert_eq!(manager.state(), MountState::Unmounted);
        assert!(manager.take_handle().is_ok());
    }

    #[test]
    fn test_take_handle_while_mounted() {
        let mut manager = MountManager::new(MemFs::new(), &config(true));
        manager.mount(blank_handle(4096)).unwrap();
        assert!(matches!(
            manager.take_handle(),
            Err(MountError::StillMounted)
        ));
    }

    #[test]
    fn test_info_requires_mount() {
        let manager = MountManager::new(MemFs::new(), &config(false));
        assert!(matches!(manager.info(), Err(MountError::NotMounted)));
    }

    #[test]
    fn test_second_mount_rejected() {
        let mut manager = MountManager::new(MemFs::new(), &config(true));
        manager.mount(blank_handle(4096)).unwrap();
        assert!(matches!(
            manager.mount(blank_handle(4096)),
            Err(MountError::AlreadyMounted)
        ));
    }

    #[test]
    fn test_list_diagnostics() {
        let fs = MemFs::new().with_file("README.TXT").with_unreadable("/data/locked");
        let mut manager = MountManager::new(fs, &config(true));
        manager.mount(blank_handle(4096)).unwrap();

        let names: Vec<String> = manager.list(Path::new("/data")).collect();
        assert_eq!(names, vec!["README.TXT".to_string()]);

        let missing = manager.list(Path::new("/data/nope"));
        assert_eq!(missing.diagnostic(), Some(&ListDiagnostic::NotFound));
        assert_eq!(missing.count(), 0);

        let locked = manager.list(Path::new("/data/locked"));
        assert!(matches!(
            locked.diagnostic(),
            Some(ListDiagnostic::NotReadable(_))
        ));
        assert_eq!(locked.count(), 0);
    }
}
