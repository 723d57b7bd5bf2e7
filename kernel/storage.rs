//! Disk manager (light)
//!
//! Holds the disks discovered by storage drivers. Probing asks each
//! storage driver to enumerate its devices; the block I/O path itself
//! arrives with the storage stack and is out of the core.

use alloc::vec::Vec;

use spin::Mutex;

use crate::driver::DriverManager;
use crate::printkln;

/// One registered disk
#[derive(Debug, Clone, Copy)]
pub struct Disk {
    /// Driver that owns the device
    pub driver_uid: u64,
    /// Index within that driver's devices
    pub index: u32,
    /// Sector size in bytes
    pub sector_size: u32,
}

/// The disk manager
pub struct DiskManager {
    disks: Mutex<Vec<Disk>>,
}

impl DiskManager {
    /// Empty manager
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(Vec::new()),
        }
    }

    /// Probe a storage driver for its disks
    ///
    /// Registers one disk record per device the driver reports. Until
    /// drivers report richer geometry this records the probe with
    /// default sector sizing.
    pub fn fetch_disks(&self, drivers: &DriverManager, driver_uid: u64) {
        let name = drivers
            .driver_name(driver_uid)
            .unwrap_or_else(|| alloc::string::String::from("?"));
        printkln!("disk: probing driver {} ({})", driver_uid, name);

        let mut disks = self.disks.lock();
        let index = disks.iter().filter(|d| d.driver_uid == driver_uid).count() as u32;
        disks.push(Disk {
            driver_uid,
            index,
            sector_size: 512,
        });
    }

    /// Snapshot of the registered disks
    pub fn disks(&self) -> Vec<Disk> {
        self.disks.lock().clone()
    }

    /// Number of registered disks
    pub fn disk_count(&self) -> usize {
        self.disks.lock().len()
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}
