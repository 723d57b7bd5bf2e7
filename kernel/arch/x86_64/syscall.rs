//! Syscall entry glue (x86-64)
//!
//! The MSR programming and the assembly entry stub are external
//! collaborators. This module defines the trap frame the stub builds and
//! the handler registration the stub dispatches through.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Saved register state at syscall entry
///
/// Number in `rax`, arguments in `rdi rsi rdx r10 r8 r9`; the dispatcher
/// writes the result back into `rax` before the stub returns to
/// userspace.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SyscallFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// User instruction pointer at entry
    pub rip: u64,
    /// User stack pointer at entry
    pub rsp: u64,
    /// User RFLAGS at entry
    pub rflags: u64,
}

impl SyscallFrame {
    /// The six syscall arguments in ABI order
    #[inline]
    pub fn args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }
}

/// Registered syscall handler
pub type SyscallHandler = fn(&mut SyscallFrame) -> i64;

static HANDLER: AtomicUsize = AtomicUsize::new(0);

/// Install the syscall handler the entry stub dispatches into
pub fn set_syscall_handler(handler: SyscallHandler) {
    HANDLER.store(handler as usize, Ordering::Release);
}

/// Entry point called by the assembly stub
///
/// Returns the value already written into `frame.rax`.
pub fn syscall_entry(frame: &mut SyscallFrame) -> i64 {
    let raw = HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        frame.rax = kestrel_syscall::SYSCALL_NOT_IMPLEMENTED as u64;
        return kestrel_syscall::SYSCALL_NOT_IMPLEMENTED;
    }
    let handler: SyscallHandler = unsafe { core::mem::transmute(raw) };
    handler(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_order_matches_abi() {
        let frame = SyscallFrame {
            rdi: 1,
            rsi: 2,
            rdx: 3,
            r10: 4,
            r8: 5,
            r9: 6,
            ..Default::default()
        };
        assert_eq!(frame.args(), [1, 2, 3, 4, 5, 6]);
    }
}
