//! Kernel recovery screen (light)
//!
//! Entered when init fails to start or exits non-zero. The interactive
//! crash UI is an external collaborator; the core logs the failure,
//! gives the log a moment to drain, then reboots through the power
//! collaborator.

use crate::printkln;
use crate::task::manager::task_manager;

/// Seconds the failure banner stays up before rebooting
const RECOVERY_GRACE_US: u64 = 10_000_000;

/// Drop into recovery
pub fn enter(reason: &str) -> ! {
    printkln!("========================================");
    printkln!("RECOVERY: {}", reason);
    printkln!("The system will reboot shortly.");
    printkln!("========================================");

    task_manager().sleep(RECOVERY_GRACE_US);
    crate::power::kernel_shutdown_thread(true)
}
