//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::arbiter::ArbiterState;

/// System event enumeration
///
/// Tagged with the event name for serialization:
/// ```json
/// {
///   "event": "storage.mounted",
///   "data": { "mount_point": "/data", "total_bytes": 1024, "free_bytes": 512, "formatted": false }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // Storage Events
    // ============================================================================
    /// Medium answered its probe
    #[serde(rename = "storage.acquired")]
    StorageAcquired {
        sector_size: u32,
        sector_count: u64,
        /// Device node, if the medium has one
        device: Option<String>,
    },

    /// Medium mounted for local access
    #[serde(rename = "storage.mounted")]
    StorageMounted {
        mount_point: String,
        total_bytes: u64,
        free_bytes: u64,
        /// Medium had to be formatted first
        formatted: bool,
    },

    /// Base directory listing finished
    #[serde(rename = "storage.inventory")]
    StorageInventory {
        path: String,
        entries: usize,
        /// Set when the directory could not be read
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Local mount released
    #[serde(rename = "storage.unmounted")]
    StorageUnmounted { mount_point: String },

    // ============================================================================
    // Ownership Events
    // ============================================================================
    /// Arbiter moved to a new state
    #[serde(rename = "ownership.changed")]
    OwnershipChanged {
        from: ArbiterState,
        to: ArbiterState,
    },

    // ============================================================================
    // USB Events
    // ============================================================================
    /// Medium exposed to the USB host
    #[serde(rename = "usb.installed")]
    UsbInstalled {
        vendor_id: u16,
        product_id: u16,
        block_count: u64,
        block_size: u32,
    },

    /// USB exposure removed
    #[serde(rename = "usb.teardown")]
    UsbTeardown {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ============================================================================
    // System Events
    // ============================================================================
    /// Reset trigger fired, the process is about to restart
    #[serde(rename = "system.restart_requested")]
    RestartRequested { source: String },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StorageAcquired { .. } => "storage.acquired",
            Self::StorageMounted { .. } => "storage.mounted",
            Self::StorageInventory { .. } => "storage.inventory",
            Self::StorageUnmounted { .. } => "storage.unmounted",
            Self::OwnershipChanged { .. } => "ownership.changed",
            Self::UsbInstalled { .. } => "usb.installed",
            Self::UsbTeardown { .. } => "usb.teardown",
            Self::RestartRequested { .. } => "system.restart_requested",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `storage.*` matches all storage events
    /// - `usb.installed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        match topic.strip_suffix(".*") {
            Some(prefix) => event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => event_name == topic,
        }
    }
}
