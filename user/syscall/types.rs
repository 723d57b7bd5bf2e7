//! Syscall numbers, return codes and shared types (architecture-independent)

// ============================================================================
// Return codes
// ============================================================================

/// Operation completed successfully
pub const SYSCALL_OK: i64 = 0;
/// The calling thread's trust level does not satisfy the handler's mask
pub const SYSCALL_ACCESS_DENIED: i64 = -1;
/// An argument was out of range or malformed
pub const SYSCALL_INVALID_ARGUMENT: i64 = -2;
/// The syscall number is unknown or the handler is a stub
pub const SYSCALL_NOT_IMPLEMENTED: i64 = -3;
/// The kernel failed internally while servicing the call
pub const SYSCALL_INTERNAL_ERROR: i64 = -4;

// ============================================================================
// Syscall numbers
// ============================================================================

/// Terminate the calling thread with an exit code
pub const SYS_EXIT: u64 = 0;
/// Print one character to the kernel console
pub const SYS_PRINT: u64 = 1;
/// Allocate `count` pages into the calling process
pub const SYS_REQUEST_PAGES: u64 = 2;
/// Free pages previously obtained from RequestPages
pub const SYS_FREE_PAGES: u64 = 3;
/// Detach an allocation from the process tracker without freeing it
pub const SYS_DETACH_ADDRESS: u64 = 4;
/// Kernel control multiplexer (see [`KernelCtl`])
pub const SYS_KERNEL_CTL: u64 = 5;
/// Inter-process communication multiplexer
pub const SYS_IPC: u64 = 6;
/// Open a path, returning a file descriptor
pub const SYS_FILE_OPEN: u64 = 7;
/// Close a file descriptor
pub const SYS_FILE_CLOSE: u64 = 8;
/// Read from a file descriptor at its current offset
pub const SYS_FILE_READ: u64 = 9;
/// Write to a file descriptor at its current offset
pub const SYS_FILE_WRITE: u64 = 10;
/// Reposition a file descriptor's offset
pub const SYS_FILE_SEEK: u64 = 11;
/// Query a file descriptor's status
pub const SYS_FILE_STATUS: u64 = 12;
/// Wait for a thread to terminate
pub const SYS_WAIT: u64 = 13;
/// Terminate another thread
pub const SYS_KILL: u64 = 14;
/// Spawn a new process from an executable path
pub const SYS_SPAWN: u64 = 15;
/// Spawn a new thread in the calling process
pub const SYS_SPAWN_THREAD: u64 = 16;
/// List the thread ids of a process
pub const SYS_GET_THREAD_LIST_OF_PROCESS: u64 = 17;
/// Get the calling process id
pub const SYS_GET_CURRENT_PROCESS: u64 = 18;
/// Get the calling thread id
pub const SYS_GET_CURRENT_THREAD: u64 = 19;
/// Look up a process by pid
pub const SYS_GET_PROCESS_BY_PID: u64 = 20;
/// Look up a thread by tid
pub const SYS_GET_THREAD_BY_TID: u64 = 21;
/// Terminate a process by pid
pub const SYS_KILL_PROCESS: u64 = 22;
/// Terminate a thread by tid
pub const SYS_KILL_THREAD: u64 = 23;
/// Reserved for the kernel's own process bring-up
pub const SYS_RESERVED_CREATE_PROCESS: u64 = 24;
/// Reserved for the kernel's own thread bring-up
pub const SYS_RESERVED_CREATE_THREAD: u64 = 25;

/// Number of entries in the native syscall table
pub const SYSCALL_COUNT: u64 = 26;

// ============================================================================
// KernelCtl
// ============================================================================

/// Sub-commands of the KernelCtl syscall
///
/// Unknown commands return `SYSCALL_INVALID_ARGUMENT`.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCtl {
    /// Process id of the calling thread's process
    GetPid = 0,
    /// Thread id of the calling thread
    GetTid = 1,
    /// Size in bytes of one page
    GetPageSize = 2,
    /// Whether the calling thread is marked critical
    IsCritical = 3,
}

impl KernelCtl {
    /// Decode a raw command value
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::GetPid),
            1 => Some(Self::GetTid),
            2 => Some(Self::GetPageSize),
            3 => Some(Self::IsCritical),
            _ => None,
        }
    }
}

// ============================================================================
// IPC commands
// ============================================================================

/// Commands accepted by the Ipc syscall
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcCommand {
    /// Create a new channel, returning its id
    Create = 0,
    /// Destroy a channel
    Destroy = 1,
    /// Resize a channel's buffer
    Allocate = 2,
    /// Read from a channel
    Read = 3,
    /// Write to a channel
    Write = 4,
    /// Block until a channel has data
    Wait = 5,
}

impl IpcCommand {
    /// Decode a raw command value
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Create),
            1 => Some(Self::Destroy),
            2 => Some(Self::Allocate),
            3 => Some(Self::Read),
            4 => Some(Self::Write),
            5 => Some(Self::Wait),
            _ => None,
        }
    }
}

// ============================================================================
// File seek
// ============================================================================

/// Seek relative to the start of the file
pub const SEEK_SET: u64 = 0;
/// Seek relative to the current offset
pub const SEEK_CUR: u64 = 1;
/// Seek relative to the end of the file
pub const SEEK_END: u64 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernelctl_roundtrip() {
        assert_eq!(KernelCtl::from_raw(0), Some(KernelCtl::GetPid));
        assert_eq!(KernelCtl::from_raw(3), Some(KernelCtl::IsCritical));
        assert_eq!(KernelCtl::from_raw(4), None);
    }

    #[test]
    fn test_return_codes_negative() {
        assert!(SYSCALL_ACCESS_DENIED < 0);
        assert!(SYSCALL_INVALID_ARGUMENT < 0);
        assert!(SYSCALL_NOT_IMPLEMENTED < 0);
        assert!(SYSCALL_INTERNAL_ERROR < 0);
        assert_eq!(SYSCALL_OK, 0);
    }
}
