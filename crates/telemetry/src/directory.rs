//! Device to vehicle resolution.
//!
//! The marketplace owns vehicle and device registration; the pipeline only
//! needs a flat lookup, so it is modelled as a repository trait.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Flat view of the vehicle a device reports for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    /// Vehicle identifier
    pub vehicle_id: String,
    /// Current owner, notified about fraud flags
    pub owner_id: String,
}

/// Resolves a reporting device to its vehicle.
pub trait VehicleDirectory: Send + Sync {
    /// Vehicle bound to `device_id`, if any
    fn lookup_device(&self, device_id: &str) -> Option<VehicleRecord>;
}

/// In-memory directory populated at startup.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    devices: RwLock<HashMap<String, VehicleRecord>>,
}

impl StaticDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking writer leaves the map itself intact
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, VehicleRecord>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, VehicleRecord>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a device to a vehicle
    pub fn register(&self, device_id: &str, vehicle_id: &str, owner_id: &str) {
        self.write().insert(
            device_id.to_string(),
            VehicleRecord {
                vehicle_id: vehicle_id.to_string(),
                owner_id: owner_id.to_string(),
            },
        );
    }

    /// Update the owner on every device bound to `vehicle_id`
    pub fn update_owner(&self, vehicle_id: &str, owner_id: &str) {
        self.write()
            .values_mut()
            .filter(|record| record.vehicle_id == vehicle_id)
            .for_each(|record| record.owner_id = owner_id.to_string());
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when no device is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VehicleDirectory for StaticDirectory {
    fn lookup_device(&self, device_id: &str) -> Option<VehicleRecord> {
        self.read().get(device_id).cloned()
    }
}
