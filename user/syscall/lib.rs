//! Native syscall ABI for the kestrel kernel
//!
//! This crate is shared between the kernel's dispatcher and userspace
//! programs. It defines the syscall numbers, the return codes, and the
//! `KernelCtl` sub-commands, plus raw invocation wrappers per supported
//! architecture.
//!
//! # Calling Convention
//!
//! | Aspect | x86_64 |
//! |--------|--------|
//! | Instruction | `syscall` |
//! | Syscall number | RAX |
//! | Arguments | RDI, RSI, RDX, R10, R8, R9 |
//! | Return value | RAX |
//!
//! Every non-success return is negative; positive returns are
//! handler-specific. i386 and AArch64 wrappers slot in as sibling
//! modules once those ports grow a syscall entry path.

#![no_std]

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::*;

mod types;
pub use types::*;
