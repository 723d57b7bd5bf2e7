//! Power management collaborator
//!
//! ACPI programming lives outside the core; the platform glue
//! registers shutdown/reboot functions here and the kernel shutdown
//! path drives them. Shutdown is serialized by one lock so concurrent
//! requests collapse into the first.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{CurrentArch, HaltOps};
use crate::lock::SmartLock;
use crate::printkln;

static SHUTDOWN_FN: AtomicUsize = AtomicUsize::new(0);
static REBOOT_FN: AtomicUsize = AtomicUsize::new(0);

static SHUTDOWN_LOCK: SmartLock<()> = SmartLock::new("shutdown", ());

/// Register the platform power functions
pub fn register(shutdown: fn() -> !, reboot: fn() -> !) {
    SHUTDOWN_FN.store(shutdown as usize, Ordering::Release);
    REBOOT_FN.store(reboot as usize, Ordering::Release);
}

fn invoke(slot: &AtomicUsize) -> ! {
    let raw = slot.load(Ordering::Acquire);
    if raw != 0 {
        let f: fn() -> ! = unsafe { core::mem::transmute(raw) };
        f();
    }
    // No platform hook: the halt loop is the best we can do
    printkln!("power: no platform handler registered, halting");
    CurrentArch::halt_loop()
}

/// Shut the system down or reboot it
///
/// Never returns. Concurrent callers serialize on the shutdown lock;
/// only the first proceeds.
pub fn kernel_shutdown_thread(reboot: bool) -> ! {
    let _guard = SHUTDOWN_LOCK.lock();
    printkln!("power: {}...", if reboot { "rebooting" } else { "shutting down" });

    if reboot {
        invoke(&REBOOT_FN)
    } else {
        invoke(&SHUTDOWN_FN)
    }
}
