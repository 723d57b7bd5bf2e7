//! Interrupt hook table (x86-64)
//!
//! The IDT, PIC/APIC programming and the low-level stubs are external
//! collaborators; this module owns the table those stubs dispatch into.
//! Driver modules install hooks here (vector, raw callback into the
//! module image, per-driver scratch record) and the loader removes them
//! on unload or rollback.
//!
//! A hook runs on the CPU that took the interrupt with local interrupts
//! masked; its scratch region is per-driver and not re-entrant.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Number of interrupt vectors
pub const VECTOR_COUNT: usize = 256;

/// A registered interrupt hook
#[derive(Clone, Copy)]
pub struct InterruptHook {
    /// Raw callback address inside a validated driver image
    pub callback: u64,
    /// Per-driver scratch record handed to the callback
    pub scratch: u64,
    /// Owning driver uid, for diagnostics and bulk removal
    pub driver_uid: u64,
}

/// One slot per vector; drivers do not share vectors
static HOOKS: Mutex<[Option<InterruptHook>; VECTOR_COUNT]> = Mutex::new([None; VECTOR_COUNT]);

/// Install a hook on `vector`
///
/// Fails if the vector already has a hook installed.
pub fn register_hook(vector: u16, hook: InterruptHook) -> KernelResult<()> {
    let mut hooks = HOOKS.lock();
    let entry = hooks
        .get_mut(vector as usize)
        .ok_or(KernelError::InvalidParameter)?;
    if entry.is_some() {
        return Err(KernelError::AlreadyExists);
    }
    *entry = Some(hook);
    Ok(())
}

/// Remove the hook on `vector`, if any
pub fn unregister_hook(vector: u16) {
    if let Some(entry) = HOOKS.lock().get_mut(vector as usize) {
        *entry = None;
    }
}

/// Remove every hook owned by `driver_uid`
pub fn unregister_driver_hooks(driver_uid: u64) {
    let mut hooks = HOOKS.lock();
    for entry in hooks.iter_mut() {
        if let Some(hook) = entry
            && hook.driver_uid == driver_uid
        {
            *entry = None;
        }
    }
}

/// Look up the hook for `vector`
pub fn hook_for(vector: u16) -> Option<InterruptHook> {
    *HOOKS.lock().get(vector as usize)?
}

/// Dispatch an interrupt to its hook, if one is installed
///
/// Called by the low-level interrupt stubs with local interrupts masked.
/// Returns true if a hook consumed the interrupt.
pub fn dispatch(vector: u16) -> bool {
    let Some(hook) = hook_for(vector) else {
        return false;
    };

    // The image was validated and executable-mapped at load time; the
    // callback address is module_base + header offset.
    let callback: extern "C" fn(u64) -> i32 = unsafe { core::mem::transmute(hook.callback) };
    callback(hook.scratch);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let hook = InterruptHook {
            callback: 0x1000,
            scratch: 0x2000,
            driver_uid: 9,
        };
        assert!(register_hook(200, hook).is_ok());
        assert!(hook_for(200).is_some());

        // Occupied vector rejects a second hook
        assert_eq!(register_hook(200, hook), Err(KernelError::AlreadyExists));

        unregister_hook(200);
        assert!(hook_for(200).is_none());
    }

    #[test]
    fn test_unregister_by_driver() {
        let mk = |uid| InterruptHook {
            callback: 0x1000,
            scratch: 0,
            driver_uid: uid,
        };
        register_hook(210, mk(1)).unwrap();
        register_hook(211, mk(1)).unwrap();
        register_hook(212, mk(2)).unwrap();

        unregister_driver_hooks(1);
        assert!(hook_for(210).is_none());
        assert!(hook_for(211).is_none());
        assert!(hook_for(212).is_some());
        unregister_hook(212);
    }
}
