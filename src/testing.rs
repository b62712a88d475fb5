//! In-memory collaborators for unit tests

use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::block::{
    BlockDevice, BlockDeviceHandle, BlockError, BlockSource, BusError, Capacity, ProbeError,
};
use crate::error::{AppError, Result};
use crate::fs::{Filesystem, FsError, ListDiagnostic, Usage};
use crate::status::{Display, DisplayError};
use crate::trigger::ResetTrigger;
use crate::usb::{DeviceDescriptorSet, MscBackend, UsbStack};

/// Ordered record of collaborator calls, shared between fakes
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &CallLog, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

// ============================================================================
// Block device
// ============================================================================

/// RAM disk; clones share the same sectors
#[derive(Clone)]
pub struct MemBlockDevice {
    data: Arc<Mutex<Vec<u8>>>,
    sector_size: u32,
}

impl MemBlockDevice {
    pub fn new(sector_size: u32, sectors: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; (sector_size as u64 * sectors) as usize])),
            sector_size,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDevice for MemBlockDevice {
    fn capacity(&self) -> Capacity {
        Capacity {
            sector_size: self.sector_size,
            sector_count: self.data.lock().unwrap().len() as u64 / self.sector_size as u64,
        }
    }

    fn read_at(&mut self, lba: u64, buf: &mut [u8]) -> std::result::Result<(), BlockError> {
        let start = (lba * self.sector_size as u64) as usize;
        buf.copy_from_slice(&self.data.lock().unwrap()[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, lba: u64, buf: &[u8]) -> std::result::Result<(), BlockError> {
        let start = (lba * self.sector_size as u64) as usize;
        self.data.lock().unwrap()[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// Source whose probe fails a fixed number of times
pub struct FlakySource {
    fail_count: usize,
    device: MemBlockDevice,
    bus_failure: bool,
    probes: Arc<Mutex<Vec<Instant>>>,
}

impl FlakySource {
    pub fn new(fail_count: usize, device: MemBlockDevice) -> Self {
        Self {
            fail_count,
            device,
            bus_failure: false,
            probes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_bus_failure(mut self) -> Self {
        self.bus_failure = true;
        self
    }

    /// Instants of every probe call
    pub fn probe_times(&self) -> Arc<Mutex<Vec<Instant>>> {
        self.probes.clone()
    }
}

impl BlockSource for FlakySource {
    fn init_bus(&mut self) -> std::result::Result<(), BusError> {
        if self.bus_failure {
            return Err(BusError("SPI host busy".to_string()));
        }
        Ok(())
    }

    fn probe(&mut self) -> std::result::Result<Box<dyn BlockDevice>, ProbeError> {
        let mut probes = self.probes.lock().unwrap();
        probes.push(Instant::now());
        if probes.len() <= self.fail_count {
            return Err(ProbeError::NotResponding("CMD0 timeout".to_string()));
        }
        Ok(Box::new(self.device.clone()))
    }
}

// ============================================================================
// Filesystem
// ============================================================================

const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const FS_TYPE_OFFSET: usize = 82;
const RESERVED_SECTORS: u64 = 32;

/// FAT-like filesystem that only cares about the boot sector signature
pub struct MemFs {
    files: Vec<String>,
    unreadable: HashSet<PathBuf>,
    mounted: Option<PathBuf>,
    usage: Option<Usage>,
    usage_ok_calls: Option<u32>,
    usage_calls: Cell<u32>,
    log: CallLog,
}

impl MemFs {
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            unreadable: HashSet::new(),
            mounted: None,
            usage: None,
            usage_ok_calls: None,
            usage_calls: Cell::new(0),
            log: call_log(),
        }
    }

    pub fn with_file(mut self, name: &str) -> Self {
        self.files.push(name.to_string());
        self
    }

    pub fn with_unreadable(mut self, path: &str) -> Self {
        self.unreadable.insert(PathBuf::from(path));
        self
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// statfs fails even while mounted
    pub fn with_failing_usage(self) -> Self {
        self.with_failing_usage_after(0)
    }

    /// statfs answers `ok_calls` times, then fails
    pub fn with_failing_usage_after(mut self, ok_calls: u32) -> Self {
        self.usage_ok_calls = Some(ok_calls);
        self
    }

    fn geometry(capacity: Capacity, allocation_unit: u32) -> (u64, u64) {
        let cluster_sectors = (allocation_unit / capacity.sector_size).max(1) as u64;
        let clusters = capacity.sector_count / cluster_sectors;
        let fat_sectors = (clusters * 4).div_ceil(capacity.sector_size as u64);
        // Boot area, two FATs, one cluster of root directory
        let overhead = RESERVED_SECTORS + 2 * fat_sectors + cluster_sectors;
        let data_clusters = capacity.sector_count.saturating_sub(overhead) / cluster_sectors;
        (data_clusters, cluster_sectors * capacity.sector_size as u64)
    }
}

impl Filesystem for MemFs {
    fn mount(&mut self, device: &mut BlockDeviceHandle, mount_point: &Path) -> std::result::Result<(), FsError> {
        record(&self.log, "fs.mount");
        let boot = device
            .read_sectors(0, 1)
            .map_err(|e| FsError::Backend(e.to_string()))?;
        if boot[510..512] != BOOT_SIGNATURE || &boot[FS_TYPE_OFFSET..FS_TYPE_OFFSET + 3] != b"FAT" {
            return Err(FsError::NoFilesystem);
        }

        let clusters = u32::from_le_bytes([boot[32], boot[33], boot[34], boot[35]]) as u64;
        let cluster_bytes = u32::from_le_bytes([boot[36], boot[37], boot[38], boot[39]]) as u64;
        let total = clusters * cluster_bytes;
        let used = (self.files.len() as u64 * cluster_bytes).min(total);
        self.usage = Some(Usage {
            total_bytes: total,
            free_bytes: total - used,
        });
        self.mounted = Some(mount_point.to_path_buf());
        Ok(())
    }

    fn format(&mut self, device: &mut BlockDeviceHandle, allocation_unit: u32) -> std::result::Result<(), FsError> {
        record(&self.log, "fs.format");
        let capacity = device.capacity();
        let (clusters, cluster_bytes) = Self::geometry(capacity, allocation_unit);

        let mut boot = vec![0u8; capacity.sector_size as usize];
        boot[32..36].copy_from_slice(&(clusters as u32).to_le_bytes());
        boot[36..40].copy_from_slice(&(cluster_bytes as u32).to_le_bytes());
        boot[FS_TYPE_OFFSET..FS_TYPE_OFFSET + 8].copy_from_slice(b"FAT32   ");
        boot[510..512].copy_from_slice(&BOOT_SIGNATURE);
        device
            .write_sectors(0, 1, &boot)
            .map_err(|e| FsError::Backend(e.to_string()))
    }

    fn unmount(&mut self, _mount_point: &Path) -> std::result::Result<(), FsError> {
        record(&self.log, "fs.unmount");
        self.mounted = None;
        self.usage = None;
        Ok(())
    }

    fn list_dir(
        &self,
        path: &Path,
    ) -> std::result::Result<Box<dyn Iterator<Item = String> + '_>, ListDiagnostic> {
        if self.unreadable.contains(path) {
            return Err(ListDiagnostic::NotReadable("Permission denied".to_string()));
        }
        match &self.mounted {
            Some(mount_point) if mount_point == path => Ok(Box::new(self.files.iter().cloned())),
            _ => Err(ListDiagnostic::NotFound),
        }
    }

    fn usage(&self, _mount_point: &Path) -> std::result::Result<Usage, FsError> {
        let calls = self.usage_calls.get();
        self.usage_calls.set(calls + 1);
        if self.usage_ok_calls.is_some_and(|ok| calls >= ok) {
            return Err(FsError::Backend("statfs: I/O error".to_string()));
        }
        self.usage
            .ok_or_else(|| FsError::Backend("not mounted".to_string()))
    }
}

/// Write a blank formatted boot sector so a fresh [`MemFs`] mounts it
pub fn preformat(device: &MemBlockDevice) {
    let mut handle = BlockDeviceHandle::new(Box::new(device.clone()));
    MemFs::new().format(&mut handle, 16 * 1024).unwrap();
}

// ============================================================================
// USB
// ============================================================================

#[derive(Default)]
struct StackInner {
    fail_install: bool,
    backend: Option<MscBackend>,
    vendor_id: Option<u16>,
}

/// USB stack that keeps the backend in memory; clones share state
#[derive(Clone)]
pub struct RecordingStack {
    inner: Arc<Mutex<StackInner>>,
    log: CallLog,
}

impl RecordingStack {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StackInner::default())),
            log: call_log(),
        }
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn fail_install(&self) {
        self.inner.lock().unwrap().fail_install = true;
    }

    /// Calls made to this stack, without the `usb.` prefix
    pub fn calls(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.strip_prefix("usb.").map(str::to_string))
            .collect()
    }

    pub fn backend_capacity(&self) -> Option<(u64, u32)> {
        self.inner.lock().unwrap().backend.as_ref().map(|b| b.capacity())
    }

    pub fn installed_vendor(&self) -> Option<u16> {
        self.inner.lock().unwrap().vendor_id
    }

    /// Run `f` against the installed backend, as the host would
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut MscBackend) -> R) -> Option<R> {
        self.inner.lock().unwrap().backend.as_mut().map(f)
    }
}

impl UsbStack for RecordingStack {
    fn release_stale(&mut self) -> Result<()> {
        record(&self.log, "usb.release_stale");
        Ok(())
    }

    fn install(&mut self, descriptors: &DeviceDescriptorSet, backend: MscBackend) -> Result<()> {
        record(&self.log, "usb.install");
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_install {
            return Err(AppError::UsbInstall("UDC refused bind".to_string()));
        }
        inner.vendor_id = Some(descriptors.device.vendor_id);
        inner.backend = Some(backend);
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        record(&self.log, "usb.teardown");
        self.inner.lock().unwrap().backend = None;
        Ok(())
    }
}

// ============================================================================
// Display / trigger
// ============================================================================

/// Display that records what was drawn; clones share the record
#[derive(Clone)]
pub struct RecordingDisplay {
    drawn: Arc<Mutex<Vec<String>>>,
    text_supported: bool,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self {
            drawn: Arc::new(Mutex::new(Vec::new())),
            text_supported: true,
        }
    }

    /// Behave like a display without a font
    pub fn without_text(mut self) -> Self {
        self.text_supported = false;
        self
    }

    pub fn drawn(&self) -> Vec<String> {
        self.drawn.lock().unwrap().clone()
    }
}

impl Display for RecordingDisplay {
    fn dimensions(&self) -> (u32, u32) {
        (128, 128)
    }

    fn draw_image(&mut self, pixels: &[u16], width: u32, height: u32) -> std::result::Result<(), DisplayError> {
        self.drawn
            .lock()
            .unwrap()
            .push(format!("image {}x{} {:04x}", width, height, pixels.first().copied().unwrap_or(0)));
        Ok(())
    }

    fn draw_text(&mut self, text: &str, x: u32, y: u32, color: u16) -> std::result::Result<(), DisplayError> {
        if !self.text_supported {
            return Err(DisplayError::Unsupported("text"));
        }
        self.drawn
            .lock()
            .unwrap()
            .push(format!("text {} @{},{} #{:04x}", text, x, y, color));
        Ok(())
    }
}

/// Trigger that fires on the n-th poll
pub struct ScriptedTrigger {
    fire_on: u32,
    polls: Arc<AtomicU32>,
}

impl ScriptedTrigger {
    pub fn after(fire_on: u32) -> Self {
        Self {
            fire_on,
            polls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn never() -> Self {
        Self::after(u32::MAX)
    }

    pub fn polls(&self) -> Arc<AtomicU32> {
        self.polls.clone()
    }
}

impl ResetTrigger for ScriptedTrigger {
    fn poll(&mut self) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst) + 1 == self.fire_on
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
