//! Network interface manager (stub)
//!
//! Keeps the registry of interfaces network drivers announce and runs
//! the service thread that will poll them. Protocol processing is out
//! of the core; the service loop is the attachment point for it.

use alloc::string::String;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::printkln;
use crate::task::manager::task_manager;
use crate::task::{TaskArchitecture, TaskCompatibility, TaskPriority};

/// One registered network interface
#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: [u8; 6],
    pub driver_uid: u64,
}

/// The network interface manager
pub struct NetworkInterfaceManager {
    interfaces: Mutex<Vec<NetworkInterface>>,
    service_running: AtomicBool,
}

impl NetworkInterfaceManager {
    /// Empty manager
    pub fn new() -> Self {
        Self {
            interfaces: Mutex::new(Vec::new()),
            service_running: AtomicBool::new(false),
        }
    }

    /// Register an interface announced by a network driver
    pub fn add_interface(&self, interface: NetworkInterface) {
        printkln!(
            "net: interface {} ({:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x})",
            interface.name,
            interface.mac[0],
            interface.mac[1],
            interface.mac[2],
            interface.mac[3],
            interface.mac[4],
            interface.mac[5]
        );
        self.interfaces.lock().push(interface);
    }

    /// Number of registered interfaces
    pub fn interface_count(&self) -> usize {
        self.interfaces.lock().len()
    }

    /// Start the network service thread
    pub fn start_service(&self) {
        if self.service_running.swap(true, Ordering::AcqRel) {
            return;
        }

        let manager = task_manager();
        let Some(process) = manager.current_process() else {
            printkln!("net: no process context, service not started");
            return;
        };
        match manager.create_thread(
            &process,
            network_service_thread as usize as u64,
            0,
            0,
            0,
            TaskArchitecture::X64,
            TaskCompatibility::Native,
        ) {
            Ok(thread) => {
                thread.rename("Network Service");
                thread.set_priority(TaskPriority::Low);
            }
            Err(e) => printkln!("net: failed to start service: {:?}", e),
        }
    }
}

impl Default for NetworkInterfaceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Service loop: the polling attachment point for interface drivers
fn network_service_thread() -> ! {
    loop {
        task_manager().sleep(1_000_000);
    }
}
