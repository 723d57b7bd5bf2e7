//! IRQ-safe spinlock (x86-64)
//!
//! A spinlock that masks local interrupts and pins the holder to its
//! CPU for the duration: the saved RFLAGS come back when the guard
//! drops, and the per-CPU preempt count keeps the scheduler away. Any
//! state shared with interrupt context goes behind one of these; a
//! plain `spin::Mutex` taken from an ISR on the same CPU would spin on
//! itself forever.
//!
//! Lock ordering: IrqSpinlock is always the innermost lock.

use ::core::cell::UnsafeCell;
use ::core::ops::{Deref, DerefMut};
use ::core::sync::atomic::{AtomicBool, Ordering};

use super::percpu;

/// RFLAGS interrupt-enable bit
#[cfg(target_os = "none")]
const RFLAGS_IF: u64 = 1 << 9;

/// An IRQ-safe spinlock
pub struct IrqSpinlock<T> {
    held: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: exclusion is enforced through `held`
unsafe impl<T: Send> Send for IrqSpinlock<T> {}
unsafe impl<T: Send> Sync for IrqSpinlock<T> {}

impl<T> IrqSpinlock<T> {
    /// Create an unlocked IrqSpinlock
    pub const fn new(data: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire, masking interrupts and preemption until the guard drops
    #[inline]
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        let saved_rflags = mask_local_irqs();
        percpu::preempt_disable();

        // Test-and-test-and-set: spin on the cached line, CAS only when
        // the lock looks free
        loop {
            if self.try_acquire() {
                break;
            }
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        IrqSpinlockGuard {
            lock: self,
            saved_rflags,
        }
    }

    /// Single acquisition attempt; interrupt state is restored on failure
    #[inline]
    pub fn try_lock(&self) -> Option<IrqSpinlockGuard<'_, T>> {
        let saved_rflags = mask_local_irqs();
        percpu::preempt_disable();

        if self.try_acquire() {
            Some(IrqSpinlockGuard {
                lock: self,
                saved_rflags,
            })
        } else {
            percpu::preempt_enable();
            unmask_local_irqs(saved_rflags);
            None
        }
    }
}

/// Guard releasing the lock and restoring interrupt state on drop
pub struct IrqSpinlockGuard<'a, T> {
    lock: &'a IrqSpinlock<T>,
    saved_rflags: u64,
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding the guard means holding the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard means holding the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
        percpu::preempt_enable();
        // Interrupts come back only after preemption is legal again
        unmask_local_irqs(self.saved_rflags);
    }
}

/// Save RFLAGS and clear IF
///
/// Hosted builds (unit tests) run unprivileged where `cli` faults, so
/// the asm only exists on bare-metal targets.
#[inline]
fn mask_local_irqs() -> u64 {
    #[cfg(target_os = "none")]
    {
        let rflags: u64;
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                "cli",
                out(reg) rflags,
                options(nomem, preserves_flags)
            );
        }
        rflags
    }
    #[cfg(not(target_os = "none"))]
    0
}

/// Re-enable interrupts iff they were enabled at mask time
#[inline]
fn unmask_local_irqs(saved_rflags: u64) {
    #[cfg(target_os = "none")]
    if saved_rflags & RFLAGS_IF != 0 {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = saved_rflags;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mutates_data() {
        let lock = IrqSpinlock::new(1u32);
        {
            let mut guard = lock.lock();
            *guard = 7;
        }
        assert_eq!(*lock.lock(), 7);
    }

    #[test]
    fn test_try_lock_fails_when_held() {
        let lock = IrqSpinlock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
