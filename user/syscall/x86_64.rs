//! x86_64 native syscall wrappers
//!
//! # Calling Convention
//! - Syscall number in RAX
//! - Arguments in RDI, RSI, RDX, R10, R8, R9
//! - Return value in RAX
//! - RCX and R11 are clobbered by the syscall instruction

use crate::types::*;

// ============================================================================
// Syscall helper macros
// ============================================================================

/// Raw syscall with 1 argument
macro_rules! syscall1 {
    ($nr:expr, $a0:expr) => {{
        let ret: i64;
        core::arch::asm!(
            "syscall",
            in("rax") $nr,
            in("rdi") $a0 as u64,
            lateout("rax") ret,
            out("rcx") _,
            out("r11") _,
            options(nostack),
        );
        ret
    }};
}

/// Raw syscall with 2 arguments
macro_rules! syscall2 {
    ($nr:expr, $a0:expr, $a1:expr) => {{
        let ret: i64;
        core::arch::asm!(
            "syscall",
            in("rax") $nr,
            in("rdi") $a0 as u64,
            in("rsi") $a1 as u64,
            lateout("rax") ret,
            out("rcx") _,
            out("r11") _,
            options(nostack),
        );
        ret
    }};
}

/// Raw syscall with 3 arguments
macro_rules! syscall3 {
    ($nr:expr, $a0:expr, $a1:expr, $a2:expr) => {{
        let ret: i64;
        core::arch::asm!(
            "syscall",
            in("rax") $nr,
            in("rdi") $a0 as u64,
            in("rsi") $a1 as u64,
            in("rdx") $a2 as u64,
            lateout("rax") ret,
            out("rcx") _,
            out("r11") _,
            options(nostack),
        );
        ret
    }};
}

/// Raw syscall with 5 arguments
macro_rules! syscall5 {
    ($nr:expr, $a0:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr) => {{
        let ret: i64;
        core::arch::asm!(
            "syscall",
            in("rax") $nr,
            in("rdi") $a0 as u64,
            in("rsi") $a1 as u64,
            in("rdx") $a2 as u64,
            in("r10") $a3 as u64,
            in("r8") $a4 as u64,
            lateout("rax") ret,
            out("rcx") _,
            out("r11") _,
            options(nostack),
        );
        ret
    }};
}

/// Raw syscall with 6 arguments
macro_rules! syscall6 {
    ($nr:expr, $a0:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr, $a5:expr) => {{
        let ret: i64;
        core::arch::asm!(
            "syscall",
            in("rax") $nr,
            in("rdi") $a0 as u64,
            in("rsi") $a1 as u64,
            in("rdx") $a2 as u64,
            in("r10") $a3 as u64,
            in("r8") $a4 as u64,
            in("r9") $a5 as u64,
            lateout("rax") ret,
            out("rcx") _,
            out("r11") _,
            options(nostack),
        );
        ret
    }};
}

// ============================================================================
// Wrappers
// ============================================================================

/// Terminate the calling thread
pub fn sys_exit(code: i64) -> i64 {
    unsafe { syscall1!(SYS_EXIT, code) }
}

/// Print one character to the kernel console
pub fn sys_print(ch: u8, index: u64) -> i64 {
    unsafe { syscall2!(SYS_PRINT, ch as u64, index) }
}

/// Request `count` zeroed pages mapped into the calling process
///
/// Returns the virtual base address, or a negative error.
pub fn sys_request_pages(count: usize) -> i64 {
    unsafe { syscall1!(SYS_REQUEST_PAGES, count) }
}

/// Free pages previously obtained from [`sys_request_pages`]
pub fn sys_free_pages(address: u64, count: usize) -> i64 {
    unsafe { syscall2!(SYS_FREE_PAGES, address, count) }
}

/// Detach an allocation from the process tracker without freeing it
pub fn sys_detach_address(address: u64) -> i64 {
    unsafe { syscall1!(SYS_DETACH_ADDRESS, address) }
}

/// Kernel control multiplexer
pub fn sys_kernel_ctl(command: KernelCtl, arg1: u64, arg2: u64, arg3: u64, arg4: u64) -> i64 {
    unsafe { syscall5!(SYS_KERNEL_CTL, command as u64, arg1, arg2, arg3, arg4) }
}

/// Inter-process communication multiplexer
pub fn sys_ipc(
    command: IpcCommand,
    kind: u64,
    id: u64,
    flags: u64,
    buffer: *mut u8,
    size: usize,
) -> i64 {
    unsafe { syscall6!(SYS_IPC, command as u64, kind, id, flags, buffer as u64, size) }
}

/// Open a path, returning a file descriptor
pub fn sys_file_open(path: *const u8, path_len: usize) -> i64 {
    unsafe { syscall2!(SYS_FILE_OPEN, path as u64, path_len) }
}

/// Close a file descriptor
pub fn sys_file_close(fd: i64) -> i64 {
    unsafe { syscall1!(SYS_FILE_CLOSE, fd) }
}

/// Read from a file descriptor at its current offset
pub fn sys_file_read(fd: i64, buf: *mut u8, len: usize) -> i64 {
    unsafe { syscall3!(SYS_FILE_READ, fd, buf as u64, len) }
}

/// Write to a file descriptor at its current offset
pub fn sys_file_write(fd: i64, buf: *const u8, len: usize) -> i64 {
    unsafe { syscall3!(SYS_FILE_WRITE, fd, buf as u64, len) }
}

/// Reposition a file descriptor's offset
pub fn sys_file_seek(fd: i64, offset: i64, whence: u64) -> i64 {
    unsafe { syscall3!(SYS_FILE_SEEK, fd, offset, whence) }
}

/// Query a file descriptor's status
pub fn sys_file_status(fd: i64) -> i64 {
    unsafe { syscall1!(SYS_FILE_STATUS, fd) }
}

/// Wait for a thread to terminate, returning its exit code
pub fn sys_wait(tid: u64) -> i64 {
    unsafe { syscall1!(SYS_WAIT, tid) }
}

/// Terminate another thread
pub fn sys_kill(tid: u64, code: i64) -> i64 {
    unsafe { syscall2!(SYS_KILL, tid, code) }
}

/// Spawn a new process from an executable path
pub fn sys_spawn(path: *const u8, path_len: usize) -> i64 {
    unsafe { syscall2!(SYS_SPAWN, path as u64, path_len) }
}

/// Spawn a new thread in the calling process
pub fn sys_spawn_thread(entry: u64, arg0: u64, arg1: u64) -> i64 {
    unsafe { syscall3!(SYS_SPAWN_THREAD, entry, arg0, arg1) }
}

/// Get the calling process id
pub fn sys_get_current_process() -> i64 {
    unsafe { syscall1!(SYS_GET_CURRENT_PROCESS, 0u64) }
}

/// Get the calling thread id
pub fn sys_get_current_thread() -> i64 {
    unsafe { syscall1!(SYS_GET_CURRENT_THREAD, 0u64) }
}
