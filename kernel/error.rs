//! Unified kernel error type
//!
//! Every recoverable failure in the kernel is a `KernelError` variant and
//! travels through `KernelResult<T>`. Fatal invariant violations panic
//! instead; partial failures (recursive deletes) get their own variant so
//! the caller can see that part of the tree survived.
//!
//! `sysret()` collapses any error onto the negative syscall ABI codes, so
//! handlers can end with `.map(..).unwrap_or_else(|e| e.sysret())`.

use kestrel_syscall::{SYSCALL_ACCESS_DENIED, SYSCALL_INTERNAL_ERROR, SYSCALL_INVALID_ARGUMENT};

/// Kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    /// Allocation failed: no free frames or heap space
    NoMemory = 1,
    /// Path or object does not exist
    NotFound = 2,
    /// Path component does not resolve
    InvalidPath = 3,
    /// A handle, pointer or argument was malformed
    InvalidParameter = 4,
    /// The object already exists (create over an existing path)
    AlreadyExists = 5,
    /// A node that needed an operator has none
    InvalidOperator = 6,
    /// Directory delete without `recursive` on a non-empty directory
    DirectoryNotEmpty = 7,
    /// A recursive operation succeeded on some children and failed on others
    PartiallyCompleted = 8,
    /// Caller's trust token does not satisfy the required mask
    AccessDenied = 9,
    /// The binary or request shape is recognized but not supported
    Unsupported = 10,
    /// The operation would wait on itself (wait-graph cycle)
    Deadlock = 11,
    /// File descriptor is not open
    BadDescriptor = 12,
    /// The target is not a regular file
    NotAFile = 13,
    /// The executable image is malformed
    InvalidFileHeader = 14,
    /// The executable's entry point is unusable
    InvalidFileEntryPoint = 15,
    /// A loaded driver's entry point returned an error
    DriverReturnedError = 16,
    /// The handler or operation is a stub
    NotImplemented = 17,
    /// The operation timed out
    TimedOut = 18,
}

impl KernelError {
    /// Map onto the negative syscall ABI return codes
    #[inline]
    pub const fn sysret(self) -> i64 {
        match self {
            Self::AccessDenied => SYSCALL_ACCESS_DENIED,
            Self::InvalidParameter
            | Self::InvalidPath
            | Self::BadDescriptor
            | Self::AlreadyExists => SYSCALL_INVALID_ARGUMENT,
            Self::NotImplemented => kestrel_syscall::SYSCALL_NOT_IMPLEMENTED,
            _ => SYSCALL_INTERNAL_ERROR,
        }
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysret_mapping() {
        assert_eq!(KernelError::AccessDenied.sysret(), -1);
        assert_eq!(KernelError::InvalidParameter.sysret(), -2);
        assert_eq!(KernelError::NotImplemented.sysret(), -3);
        assert_eq!(KernelError::NoMemory.sysret(), -4);
        assert_eq!(KernelError::PartiallyCompleted.sysret(), -4);
    }
}
