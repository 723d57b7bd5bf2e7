//! Named kernel locks
//!
//! `SmartLock` wraps a spin mutex with a name (reported when acquisition
//! times out) and a best-effort `timeout_lock`: spin until the deadline,
//! then give up with the lock unheld. Ordinary acquisition is `lock()`.
//!
//! Anything touched from interrupt context uses the arch `IrqSpinlock`
//! instead; SmartLock is for long-lived kernel-thread critical sections
//! where a hang should surface as a log line, not a silent lockup.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::printkln;

/// Calibrated TSC ticks per microsecond, set by the timer glue at boot.
/// The default assumes a 1 GHz invariant TSC, which only skews timeout
/// lengths, never correctness.
static TSC_TICKS_PER_US: AtomicU64 = AtomicU64::new(1000);

/// Record the calibrated TSC frequency
pub fn set_tsc_ticks_per_us(ticks: u64) {
    if ticks > 0 {
        TSC_TICKS_PER_US.store(ticks, Ordering::Relaxed);
    }
}

#[cfg(target_arch = "x86_64")]
fn now_ticks() -> u64 {
    crate::arch::x86_64::cpu::read_tsc()
}

#[cfg(not(target_arch = "x86_64"))]
fn now_ticks() -> u64 {
    0
}

/// A named spin lock with best-effort timeout acquisition
pub struct SmartLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> SmartLock<T> {
    /// Create a new named lock
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    /// Acquire the lock, spinning until it is free
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Acquire the lock, giving up after `microseconds`
    ///
    /// Returns `None` with the lock unheld if the deadline passes first;
    /// logs the lock name so a stuck holder is visible.
    pub fn timeout_lock(&self, microseconds: u64) -> Option<MutexGuard<'_, T>> {
        let ticks_per_us = TSC_TICKS_PER_US.load(Ordering::Relaxed);
        let deadline = now_ticks().wrapping_add(microseconds.saturating_mul(ticks_per_us));

        loop {
            if let Some(guard) = self.inner.try_lock() {
                return Some(guard);
            }
            if now_ticks().wrapping_sub(deadline) < u64::MAX / 2 {
                // Deadline passed
                printkln!("lock '{}': timed out after {}us", self.name, microseconds);
                return None;
            }
            core::hint::spin_loop();
        }
    }

    /// The lock's name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_roundtrip() {
        let lock = SmartLock::new("test", 41u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn test_timeout_lock_uncontended() {
        let lock = SmartLock::new("uncontended", ());
        assert!(lock.timeout_lock(1000).is_some());
    }

    #[test]
    fn test_timeout_lock_contended_returns_none() {
        let lock = SmartLock::new("contended", ());
        let _held = lock.lock();
        assert!(lock.timeout_lock(10).is_none());
    }
}
