//! Storage ownership arbitration
//!
//! The medium is owned by exactly one side at a time: the local filesystem
//! or the USB host. Ownership only ever moves local -> host within a boot;
//! going back requires a process restart.
//!
//! ```text
//! Booting --mount--> LocalAccess --unmount, install--> HostExposed
//!    ^                                                      |
//!    +------------------- trigger: teardown ---------------+
//!                         (RunOutcome::Restart)
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::block::{BlockDeviceProvider, BlockSource};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::fs::{Filesystem, MountInfo, MountManager, MountState};
use crate::status::{Display, SplashStage, StatusReporter, StatusSnapshot};
use crate::trigger::ResetTrigger;
use crate::usb::{UsbExposure, UsbExposureState, UsbStack};

/// Arbiter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterState {
    Booting,
    LocalAccess,
    HostExposed,
}

/// Who may touch the medium right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipMode {
    Idle,
    Local,
    Host,
}

/// Mount and USB state seen together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageContext {
    pub mount: MountState,
    pub usb: UsbExposureState,
}

impl StorageContext {
    pub fn mode(&self) -> OwnershipMode {
        match (self.mount, self.usb) {
            (MountState::MountedLocal, _) => OwnershipMode::Local,
            (MountState::Unmounted, UsbExposureState::Exposed) => OwnershipMode::Host,
            (MountState::Unmounted, UsbExposureState::NotExposed) => OwnershipMode::Idle,
        }
    }

    /// Fails if both sides hold the medium
    pub fn check(&self) -> Result<()> {
        if self.mount == MountState::MountedLocal && self.usb == UsbExposureState::Exposed {
            return Err(AppError::OwnershipViolation(
                "medium mounted locally while exposed over USB".to_string(),
            ));
        }
        Ok(())
    }
}

/// How [`Arbiter::run`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Reset trigger fired; the process must be restarted
    Restart,
    /// Cancelled from outside
    Shutdown,
}

/// What the boot sequence found
#[derive(Debug, Clone)]
pub struct BootReport {
    pub mount: MountInfo,
    pub inventory: Vec<String>,
    pub snapshot: StatusSnapshot,
}

/// Drives the medium from bring-up to USB exposure
pub struct Arbiter<S, F, U, D> {
    provider: BlockDeviceProvider<S>,
    mounts: MountManager<F>,
    usb: UsbExposure<U>,
    status: StatusReporter<D>,
    events: Arc<EventBus>,
    poll_interval: Duration,
    state: ArbiterState,
    booted: bool,
}

impl<S, F, U, D> Arbiter<S, F, U, D>
where
    S: BlockSource,
    F: Filesystem,
    U: UsbStack,
    D: Display,
{
    pub fn new(
        provider: BlockDeviceProvider<S>,
        mounts: MountManager<F>,
        usb: UsbExposure<U>,
        status: StatusReporter<D>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            mounts,
            usb,
            status,
            events,
            poll_interval: Duration::from_millis(100),
            state: ArbiterState::Booting,
            booted: false,
        }
    }

    /// Trigger poll interval used by [`Arbiter::run`]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> ArbiterState {
        self.state
    }

    pub fn context(&self) -> StorageContext {
        StorageContext {
            mount: self.mounts.state(),
            usb: self.usb.state(),
        }
    }

    pub fn usb(&self) -> &UsbExposure<U> {
        &self.usb
    }

    fn transition(&mut self, to: ArbiterState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Ownership: {:?} -> {:?}", from, to);
        self.state = to;
        self.events
            .publish(SystemEvent::OwnershipChanged { from, to });
    }

    fn expect_state(&self, expected: ArbiterState, operation: &str) -> Result<()> {
        if self.state != expected {
            return Err(AppError::OwnershipViolation(format!(
                "{} requires {:?}, current state is {:?}",
                operation, expected, self.state
            )));
        }
        Ok(())
    }

    /// Acquire, mount, inventory, unmount and hand the medium to the host
    ///
    /// Runs once per process. Errors out of this are fatal for the boot.
    pub async fn boot(&mut self) -> Result<BootReport> {
        self.expect_state(ArbiterState::Booting, "boot")?;
        if self.booted {
            return Err(AppError::OwnershipViolation(
                "boot already ran, a process restart is required".to_string(),
            ));
        }
        self.booted = true;

        // A gadget still bound from before a restart would share the medium
        self.usb.release_stale()?;
        self.status.splash(SplashStage::Boot);

        let handle = self.provider.acquire().await?;
        let capacity = handle.capacity();
        self.events.publish(SystemEvent::StorageAcquired {
            sector_size: capacity.sector_size,
            sector_count: capacity.sector_count,
            device: handle
                .backing_path()
                .map(|p| p.to_string_lossy().to_string()),
        });
        self.status.splash(SplashStage::Ready);

        let mount = self.mounts.mount(handle).map_err(|e| {
            error!("Mount failed: {}", e);
            AppError::Mount(e)
        })?;
        self.events.publish(SystemEvent::StorageMounted {
            mount_point: mount.mount_point.to_string_lossy().to_string(),
            total_bytes: mount.total_bytes,
            free_bytes: mount.free_bytes,
            formatted: mount.formatted,
        });
        self.transition(ArbiterState::LocalAccess);

        let (inventory, snapshot) = match self.local_access(&mount.mount_point) {
            Ok(found) => found,
            Err(e) => {
                // Never leave the medium mounted behind a failed boot
                if let Err(undo) = self.mounts.unmount() {
                    warn!("Unmount after failed boot failed: {}", undo);
                }
                return Err(e);
            }
        };

        self.mounts.unmount()?;
        self.events.publish(SystemEvent::StorageUnmounted {
            mount_point: mount.mount_point.to_string_lossy().to_string(),
        });
        if self.mounts.state() != MountState::Unmounted {
            return Err(AppError::OwnershipViolation(
                "medium still mounted before USB install".to_string(),
            ));
        }

        let handle = self.mounts.take_handle()?;
        let capacity = handle.capacity();
        self.usb.install(handle)?;
        let device = &self.usb.descriptors().device;
        self.events.publish(SystemEvent::UsbInstalled {
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            block_count: capacity.sector_count,
            block_size: capacity.sector_size,
        });
        self.transition(ArbiterState::HostExposed);
        self.context().check()?;

        Ok(BootReport {
            mount,
            inventory,
            snapshot,
        })
    }

    /// Everything done while the medium is mounted locally
    fn local_access(&mut self, base: &Path) -> Result<(Vec<String>, StatusSnapshot)> {
        self.context().check()?;
        let inventory = self.inventory(base);

        let usage = self.mounts.info()?;
        let snapshot = StatusSnapshot::new(
            usage.total_bytes,
            usage.free_bytes,
            self.context().mode(),
        );
        self.status.render(&snapshot);
        Ok((inventory, snapshot))
    }

    fn inventory(&self, base: &Path) -> Vec<String> {
        info!("Listing {}", base.display());
        let mut listing = self.mounts.list(base);
        let names: Vec<String> = listing.by_ref().inspect(|name| info!("  {}", name)).collect();
        let error = listing.diagnostic().map(|d| format!("{:?}", d));
        self.events.publish(SystemEvent::StorageInventory {
            path: base.to_string_lossy().to_string(),
            entries: names.len(),
            error,
        });
        names
    }

    /// Serve the host until the reset trigger fires or `cancel` is triggered
    ///
    /// On return the USB exposure has been torn down.
    pub async fn run<T>(&mut self, trigger: &mut T, cancel: CancellationToken) -> Result<RunOutcome>
    where
        T: ResetTrigger + ?Sized,
    {
        self.expect_state(ArbiterState::HostExposed, "run")?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested");
                    break RunOutcome::Shutdown;
                }
                _ = ticker.tick() => {
                    if trigger.poll() {
                        info!("Reset trigger ({}) fired", trigger.name());
                        self.events.publish(SystemEvent::RestartRequested {
                            source: trigger.name().to_string(),
                        });
                        break RunOutcome::Restart;
                    }
                }
            }
        };

        self.release_usb();
        self.transition(ArbiterState::Booting);
        Ok(outcome)
    }

    fn release_usb(&mut self) {
        let error = match self.usb.teardown() {
            Ok(()) => None,
            Err(e) => {
                warn!("Continuing despite USB teardown failure: {}", e);
                Some(e.to_string())
            }
        };
        self.events.publish(SystemEvent::UsbTeardown { error });
    }
}
