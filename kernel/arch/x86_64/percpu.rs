//! Per-CPU state (x86-64)
//!
//! One slot per possible CPU: preempt count, current thread id. Slots
//! are plain atomics indexed by the CPU id reported by the local
//! interrupt controller glue, so no GS-relative addressing is needed
//! before that glue runs.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Maximum CPUs supported
pub const MAX_CPUS: usize = 64;

struct PerCpuSlot {
    preempt_count: AtomicU32,
    current_tid: AtomicU64,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: PerCpuSlot = PerCpuSlot {
    preempt_count: AtomicU32::new(0),
    current_tid: AtomicU64::new(0),
};

static SLOTS: [PerCpuSlot; MAX_CPUS] = [EMPTY_SLOT; MAX_CPUS];

/// Number of CPUs brought online (at least the BSP)
static ONLINE_CPUS: AtomicUsize = AtomicUsize::new(1);

/// Hardware CPU id of the caller, set by the SMP glue; 0 until then
static CPU_ID: AtomicUsize = AtomicUsize::new(0);

/// Current CPU id
#[inline]
pub fn current_cpu_id() -> usize {
    CPU_ID.load(Ordering::Relaxed)
}

/// Number of online CPUs
#[inline]
pub fn online_cpus() -> usize {
    ONLINE_CPUS.load(Ordering::Relaxed)
}

/// Record the number of online CPUs (SMP bring-up glue)
pub fn set_online_cpus(count: usize) {
    ONLINE_CPUS.store(count.clamp(1, MAX_CPUS), Ordering::Relaxed);
}

/// Disable preemption on this CPU
#[inline]
pub fn preempt_disable() {
    SLOTS[current_cpu_id()]
        .preempt_count
        .fetch_add(1, Ordering::Relaxed);
}

/// Re-enable preemption on this CPU
#[inline]
pub fn preempt_enable() {
    SLOTS[current_cpu_id()]
        .preempt_count
        .fetch_sub(1, Ordering::Relaxed);
}

/// Whether preemption is currently disabled on this CPU
#[inline]
pub fn preempt_disabled() -> bool {
    SLOTS[current_cpu_id()].preempt_count.load(Ordering::Relaxed) > 0
}

/// Current thread id on this CPU (0 = none)
#[inline]
pub fn current_tid() -> u64 {
    SLOTS[current_cpu_id()].current_tid.load(Ordering::Relaxed)
}

/// Set the current thread id on this CPU
#[inline]
pub fn set_current_tid(tid: u64) {
    SLOTS[current_cpu_id()]
        .current_tid
        .store(tid, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_cpu_clamping() {
        set_online_cpus(0);
        assert_eq!(online_cpus(), 1);
        set_online_cpus(MAX_CPUS + 10);
        assert_eq!(online_cpus(), MAX_CPUS);
        set_online_cpus(1);
    }
}
