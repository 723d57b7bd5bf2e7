//! Native syscall dispatch
//!
//! The architecture's entry stub hands the trap frame to
//! [`handle_native_syscalls`]: bounds-check the number, resolve the
//! calling thread, invoke the handler, write the result back into the
//! return register.
//!
//! Every handler's first action is a trust check against the calling
//! thread's token; an insufficient mask is `SYSCALL_ACCESS_DENIED`
//! before any argument is touched.

use alloc::sync::Arc;

use kestrel_syscall::*;

use crate::arch::x86_64::syscall::SyscallFrame;
use crate::arch::{PAGE_SIZE, PageFlags, PageTable};
use crate::error::KernelError;
use crate::fs;
use crate::mm::frame_alloc::FrameAllocRef;
use crate::printkln;
use crate::task::manager::{TaskManager, task_manager};
use crate::task::security::TrustLevel;
use crate::task::{TaskArchitecture, TaskCompatibility, Tcb};

/// Any trust level, including Untrusted and Unknown
const ANY_TRUST: TrustLevel = TrustLevel::all();

/// TrustedByKernel or Trusted only
const ELEVATED: TrustLevel = TrustLevel::FULL_TRUST;

/// Largest buffer a single syscall may move
const MAX_USER_IO: u64 = 1 << 20;

/// Longest path accepted from userspace
const MAX_USER_PATH: u64 = 4096;

/// Resolved calling context for one syscall
struct SyscallContext<'a> {
    manager: &'static TaskManager,
    thread: Arc<Tcb>,
    frame: &'a mut SyscallFrame,
}

type Handler = for<'a> fn(&mut SyscallContext<'a>, [u64; 6]) -> i64;

/// Handler table, indexed by syscall number
static NATIVE_SYSCALLS: [Handler; SYSCALL_COUNT as usize] = [
    sys_exit,
    sys_print,
    sys_request_pages,
    sys_free_pages,
    sys_detach_address,
    sys_kernel_ctl,
    sys_ipc,
    sys_file_open,
    sys_file_close,
    sys_file_read,
    sys_file_write,
    sys_file_seek,
    sys_file_status,
    sys_wait,
    sys_kill,
    sys_spawn,
    sys_spawn_thread,
    sys_get_thread_list_of_process,
    sys_get_current_process,
    sys_get_current_thread,
    sys_get_process_by_pid,
    sys_get_thread_by_tid,
    sys_kill_process,
    sys_kill_thread,
    sys_reserved,
    sys_reserved,
];

/// Handler for a syscall number, if in range
fn lookup(number: u64) -> Option<Handler> {
    NATIVE_SYSCALLS.get(number as usize).copied()
}

/// Dispatch one native syscall
///
/// The return value is also written into `frame.rax`.
pub fn handle_native_syscalls(frame: &mut SyscallFrame) -> i64 {
    let Some(handler) = lookup(frame.rax) else {
        printkln!("syscall: number {} not implemented", frame.rax);
        frame.rax = SYSCALL_NOT_IMPLEMENTED as u64;
        return SYSCALL_NOT_IMPLEMENTED;
    };

    let manager = task_manager();
    let Some(thread) = manager.current_thread() else {
        frame.rax = SYSCALL_INTERNAL_ERROR as u64;
        return SYSCALL_INTERNAL_ERROR;
    };

    let args = frame.args();
    let mut context = SyscallContext {
        manager,
        thread,
        frame,
    };
    let ret = handler(&mut context, args);
    context.frame.rax = ret as u64;
    ret
}

/// Trust gate: does the caller's token intersect `required`?
fn check_trust(context: &SyscallContext<'_>, required: TrustLevel) -> bool {
    let trusted = context
        .manager
        .security()
        .is_token_trusted(context.thread.token, required);
    if !trusted {
        printkln!(
            "syscall: thread {} ({}) denied, insufficient trust",
            context.thread.id,
            context.thread.name()
        );
    }
    trusted
}

/// Borrow a userspace buffer
///
/// The caller's pages are identity-addressed; length is capped so a
/// bad argument cannot walk the kernel.
fn user_slice<'a>(ptr: u64, len: u64) -> Option<&'a mut [u8]> {
    if ptr == 0 || len > MAX_USER_IO {
        return None;
    }
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

/// Borrow a userspace path string
fn user_path<'a>(ptr: u64, len: u64) -> Option<&'a str> {
    if len > MAX_USER_PATH {
        return None;
    }
    let bytes = user_slice(ptr, len)?;
    core::str::from_utf8(bytes).ok()
}

// ============================================================================
// Handlers
// ============================================================================

fn sys_exit(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    // Everyone may exit
    if !check_trust(context, ANY_TRUST) {
        return SYSCALL_ACCESS_DENIED;
    }

    let code = args[0] as i64;
    context.manager.terminate_thread(&context.thread, code);
    SYSCALL_OK
}

fn sys_print(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    // Only trusted threads write to the kernel console
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let ch = args[0] as u8;
    crate::console::console_write(&[ch]);
    ch as i64
}

fn sys_request_pages(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    // Everyone may request pages
    if !check_trust(context, ANY_TRUST) {
        return SYSCALL_ACCESS_DENIED;
    }

    let count = args[0] as usize;
    if count == 0 || count > 65536 {
        return SYSCALL_INVALID_ARGUMENT;
    }
    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };

    let base = match process.tracker.lock().request_frames(count) {
        Ok(base) => base,
        Err(e) => return e.sysret(),
    };

    // Identity-map into the caller's address space
    let mut table_guard = process.page_table.lock();
    if let Some(table) = table_guard.as_mut() {
        let mut fa = FrameAllocRef(&crate::mm::FRAME_ALLOCATOR);
        for i in 0..count as u64 {
            if table
                .map(
                    base + i * PAGE_SIZE,
                    base + i * PAGE_SIZE,
                    PageFlags::RW | PageFlags::US,
                    &mut fa,
                )
                .is_err()
            {
                drop(table_guard);
                let _ = process.tracker.lock().free_frames(base, count);
                return KernelError::NoMemory.sysret();
            }
        }
    }

    base as i64
}

fn sys_free_pages(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    // Everyone may free their own pages
    if !check_trust(context, ANY_TRUST) {
        return SYSCALL_ACCESS_DENIED;
    }

    let (base, count) = (args[0], args[1] as usize);
    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };

    match process.tracker.lock().free_frames(base, count) {
        Ok(()) => {}
        Err(e) => return e.sysret(),
    }

    let mut table_guard = process.page_table.lock();
    if let Some(table) = table_guard.as_mut() {
        for i in 0..count as u64 {
            table.unmap(base + i * PAGE_SIZE);
        }
    }
    SYSCALL_OK
}

fn sys_detach_address(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    // Only trusted threads may detach tracked allocations
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    match process.tracker.lock().detach(args[0]) {
        Ok(()) => SYSCALL_OK,
        Err(e) => e.sysret(),
    }
}

fn sys_kernel_ctl(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    // Only trusted threads may poke kernel control
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    match KernelCtl::from_raw(args[0]) {
        Some(KernelCtl::GetPid) => context
            .thread
            .process
            .upgrade()
            .map(|p| p.id as i64)
            .unwrap_or(SYSCALL_INTERNAL_ERROR),
        Some(KernelCtl::GetTid) => context.thread.id as i64,
        Some(KernelCtl::GetPageSize) => PAGE_SIZE as i64,
        Some(KernelCtl::IsCritical) => context.thread.is_critical() as i64,
        None => {
            printkln!("syscall: unknown kernelctl command {}", args[0]);
            SYSCALL_INVALID_ARGUMENT
        }
    }
}

fn sys_ipc(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    // Everyone may use IPC
    if !check_trust(context, ANY_TRUST) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    let (id, buffer_ptr, size) = (args[2], args[4], args[5]);

    let Some(command) = IpcCommand::from_raw(args[0]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };

    match command {
        IpcCommand::Create => process.ipc.lock().create() as i64,
        IpcCommand::Destroy => match process.ipc.lock().destroy(id) {
            Ok(()) => SYSCALL_OK,
            Err(e) => e.sysret(),
        },
        IpcCommand::Allocate => match process.ipc.lock().allocate(id, size as usize) {
            Ok(()) => SYSCALL_OK,
            Err(e) => e.sysret(),
        },
        IpcCommand::Read => {
            let Some(buffer) = user_slice(buffer_ptr, size) else {
                return SYSCALL_INVALID_ARGUMENT;
            };
            match process.ipc.lock().read(id, buffer) {
                Ok(n) => n as i64,
                Err(e) => e.sysret(),
            }
        }
        IpcCommand::Write => {
            let Some(buffer) = user_slice(buffer_ptr, size) else {
                return SYSCALL_INVALID_ARGUMENT;
            };
            match process.ipc.lock().write(id, buffer) {
                Ok(n) => n as i64,
                Err(e) => e.sysret(),
            }
        }
        IpcCommand::Wait => loop {
            match process.ipc.lock().has_data(id) {
                Ok(true) => return SYSCALL_OK,
                Ok(false) => context.manager.sleep(1_000),
                Err(e) => return e.sysret(),
            }
        },
    }
}

fn sys_file_open(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(path) = user_path(args[0], args[1]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };
    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    match process.fd_table.lock().open(fs::vfs(), path) {
        Ok(fd) => fd,
        Err(e) => e.sysret(),
    }
}

fn sys_file_close(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    match process.fd_table.lock().close(args[0] as i64) {
        Ok(()) => SYSCALL_OK,
        Err(e) => e.sysret(),
    }
}

fn sys_file_read(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(buffer) = user_slice(args[1], args[2]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };
    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    match process.fd_table.lock().read(fs::vfs(), args[0] as i64, buffer) {
        Ok(n) => n as i64,
        Err(e) => e.sysret(),
    }
}

fn sys_file_write(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(buffer) = user_slice(args[1], args[2]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };
    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    match process
        .fd_table
        .lock()
        .write(fs::vfs(), args[0] as i64, buffer)
    {
        Ok(n) => n as i64,
        Err(e) => e.sysret(),
    }
}

fn sys_file_seek(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    match process
        .fd_table
        .lock()
        .seek(args[0] as i64, args[1] as i64, args[2])
    {
        Ok(offset) => offset as i64,
        Err(e) => e.sysret(),
    }
}

fn sys_file_status(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    match process.fd_table.lock().status(args[0] as i64) {
        Ok(status) => status as i64,
        Err(e) => e.sysret(),
    }
}

fn sys_wait(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(target) = context.manager.get_thread_by_tid(args[0]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };
    match context.manager.wait_for_thread(&target) {
        Ok(code) => code,
        Err(e) => e.sysret(),
    }
}

fn sys_kill(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(target) = context.manager.get_thread_by_tid(args[0]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };
    // Critical threads are not killable from userspace
    if target.is_critical() {
        return SYSCALL_ACCESS_DENIED;
    }
    context.manager.terminate_thread(&target, args[1] as i64);
    SYSCALL_OK
}

fn sys_spawn(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(path) = user_path(args[0], args[1]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };
    match crate::exec::spawn(fs::vfs(), path, &[path], &[]) {
        Ok(data) => data.process.id as i64,
        Err(e) => e.sysret(),
    }
}

fn sys_spawn_thread(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(process) = context.thread.process.upgrade() else {
        return SYSCALL_INTERNAL_ERROR;
    };
    match context.manager.create_thread(
        &process,
        args[0],
        args[1],
        args[2],
        0,
        TaskArchitecture::X64,
        TaskCompatibility::Native,
    ) {
        Ok(thread) => thread.id as i64,
        Err(e) => e.sysret(),
    }
}

fn sys_get_thread_list_of_process(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(process) = context.manager.get_process_by_pid(args[0]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };
    let capacity = args[2] as usize;
    let Some(buffer) = user_slice(args[1], (capacity * 8) as u64) else {
        return SYSCALL_INVALID_ARGUMENT;
    };

    let threads = process.threads();
    let n = threads.len().min(capacity);
    for (i, thread) in threads.iter().take(n).enumerate() {
        buffer[i * 8..i * 8 + 8].copy_from_slice(&thread.id.to_le_bytes());
    }
    n as i64
}

fn sys_get_current_process(context: &mut SyscallContext<'_>, _args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }
    context
        .thread
        .process
        .upgrade()
        .map(|p| p.id as i64)
        .unwrap_or(SYSCALL_INTERNAL_ERROR)
}

fn sys_get_current_thread(context: &mut SyscallContext<'_>, _args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }
    context.thread.id as i64
}

fn sys_get_process_by_pid(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }
    match context.manager.get_process_by_pid(args[0]) {
        Some(process) => process.id as i64,
        None => SYSCALL_INVALID_ARGUMENT,
    }
}

fn sys_get_thread_by_tid(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }
    match context.manager.get_thread_by_tid(args[0]) {
        Some(thread) => thread.id as i64,
        None => SYSCALL_INVALID_ARGUMENT,
    }
}

fn sys_kill_process(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    if !check_trust(context, ELEVATED) {
        return SYSCALL_ACCESS_DENIED;
    }

    let Some(process) = context.manager.get_process_by_pid(args[0]) else {
        return SYSCALL_INVALID_ARGUMENT;
    };
    if process.threads().iter().any(|t| t.is_critical()) {
        return SYSCALL_ACCESS_DENIED;
    }
    context.manager.kill_process(&process, args[1] as i64);
    SYSCALL_OK
}

fn sys_kill_thread(context: &mut SyscallContext<'_>, args: [u64; 6]) -> i64 {
    sys_kill(context, args)
}

fn sys_reserved(_context: &mut SyscallContext<'_>, _args: [u64; 6]) -> i64 {
    SYSCALL_NOT_IMPLEMENTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::{MAX_MEMORY_ENTRIES, MemoryEntry, MemoryMap, MemoryType};
    use crate::mm::BitmapFrameAllocator;
    use crate::task::{TaskTrustLevel, TaskStatus};

    fn fresh_context() -> (&'static TaskManager, Arc<Tcb>) {
        let mut map = MemoryMap {
            entries: 1,
            entry: [MemoryEntry::default(); MAX_MEMORY_ENTRIES],
            size: 16 * 1024 * 1024,
        };
        map.entry[0] = MemoryEntry {
            base_address: 0,
            length: 16 * 1024 * 1024,
            kind: MemoryType::Usable,
        };
        let pfa: &'static BitmapFrameAllocator =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(BitmapFrameAllocator::new()));
        pfa.init(&map);

        let manager: &'static TaskManager =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(TaskManager::with_cpus(pfa, 1)));
        let process = manager
            .create_process(None, "testproc", TaskTrustLevel::Kernel)
            .unwrap();
        let thread = manager
            .create_thread(
                &process,
                0x1000,
                0,
                0,
                0,
                TaskArchitecture::X64,
                TaskCompatibility::Native,
            )
            .unwrap();
        (manager, thread)
    }

    fn call(
        manager: &'static TaskManager,
        thread: &Arc<Tcb>,
        handler: Handler,
        args: [u64; 6],
    ) -> i64 {
        let mut frame = SyscallFrame::default();
        let mut context = SyscallContext {
            manager,
            thread: thread.clone(),
            frame: &mut frame,
        };
        handler(&mut context, args)
    }

    #[test]
    fn test_out_of_range_number() {
        assert!(lookup(SYS_EXIT).is_some());
        assert!(lookup(SYSCALL_COUNT - 1).is_some());
        assert!(lookup(SYSCALL_COUNT).is_none());
        assert!(lookup(u64::MAX).is_none());
    }

    #[test]
    fn test_untrusted_print_denied_but_exit_allowed() {
        let (manager, thread) = fresh_context();
        manager
            .security()
            .trust_token(thread.token, TrustLevel::UNTRUSTED);

        // Print requires elevated trust
        assert_eq!(
            call(manager, &thread, sys_print, [b'A' as u64, 0, 0, 0, 0, 0]),
            SYSCALL_ACCESS_DENIED
        );

        // Exit is open to every trust level
        assert_eq!(call(manager, &thread, sys_exit, [7, 0, 0, 0, 0, 0]), SYSCALL_OK);
        assert_eq!(thread.status(), TaskStatus::Terminated);
        assert_eq!(thread.exit_code(), 7);
    }

    #[test]
    fn test_kernelctl_queries() {
        let (manager, thread) = fresh_context();
        manager
            .security()
            .trust_token(thread.token, TrustLevel::FULL_TRUST);

        let pid = call(manager, &thread, sys_kernel_ctl, [0, 0, 0, 0, 0, 0]);
        assert_eq!(pid, 1);
        let tid = call(manager, &thread, sys_kernel_ctl, [1, 0, 0, 0, 0, 0]);
        assert_eq!(tid as u64, thread.id);
        let page = call(manager, &thread, sys_kernel_ctl, [2, 0, 0, 0, 0, 0]);
        assert_eq!(page as u64, PAGE_SIZE);
        let critical = call(manager, &thread, sys_kernel_ctl, [3, 0, 0, 0, 0, 0]);
        assert_eq!(critical, 0);

        // Unknown sub-command
        assert_eq!(
            call(manager, &thread, sys_kernel_ctl, [99, 0, 0, 0, 0, 0]),
            SYSCALL_INVALID_ARGUMENT
        );
    }

    #[test]
    fn test_unknown_token_denied() {
        let (manager, thread) = fresh_context();
        // Default token trust is UNKNOWN: elevated calls fail closed
        assert_eq!(
            call(manager, &thread, sys_get_current_thread, [0; 6]),
            SYSCALL_ACCESS_DENIED
        );
        assert_eq!(
            call(manager, &thread, sys_kernel_ctl, [1, 0, 0, 0, 0, 0]),
            SYSCALL_ACCESS_DENIED
        );
        // But ANY_TRUST calls pass even at UNKNOWN
        let base = call(manager, &thread, sys_request_pages, [1, 0, 0, 0, 0, 0]);
        assert!(base > 0);
        assert_eq!(
            call(manager, &thread, sys_free_pages, [base as u64, 1, 0, 0, 0, 0]),
            SYSCALL_OK
        );
    }

    #[test]
    fn test_ipc_roundtrip_through_syscall() {
        let (manager, thread) = fresh_context();
        manager
            .security()
            .trust_token(thread.token, TrustLevel::FULL_TRUST);

        let id = call(manager, &thread, sys_ipc, [0, 0, 0, 0, 0, 0]);
        assert!(id > 0);

        let mut payload = *b"hello";
        let wrote = call(
            manager,
            &thread,
            sys_ipc,
            [4, 0, id as u64, 0, payload.as_mut_ptr() as u64, 5],
        );
        assert_eq!(wrote, 5);

        let mut readback = [0u8; 8];
        let read = call(
            manager,
            &thread,
            sys_ipc,
            [3, 0, id as u64, 0, readback.as_mut_ptr() as u64, 8],
        );
        assert_eq!(read, 5);
        assert_eq!(&readback[..5], b"hello");
    }

    #[test]
    fn test_thread_lookup_syscalls() {
        let (manager, thread) = fresh_context();
        manager
            .security()
            .trust_token(thread.token, TrustLevel::FULL_TRUST);

        assert_eq!(
            call(manager, &thread, sys_get_thread_by_tid, [thread.id, 0, 0, 0, 0, 0]),
            thread.id as i64
        );
        assert_eq!(
            call(manager, &thread, sys_get_thread_by_tid, [9999, 0, 0, 0, 0, 0]),
            SYSCALL_INVALID_ARGUMENT
        );

        let mut tids = [0u8; 32];
        let count = call(
            manager,
            &thread,
            sys_get_thread_list_of_process,
            [1, tids.as_mut_ptr() as u64, 4, 0, 0, 0],
        );
        assert_eq!(count, 1);
        assert_eq!(
            u64::from_le_bytes(tids[..8].try_into().unwrap()),
            thread.id
        );
    }

    #[test]
    fn test_kill_critical_thread_denied() {
        let (manager, thread) = fresh_context();
        manager
            .security()
            .trust_token(thread.token, TrustLevel::FULL_TRUST);
        thread.set_critical(true);

        assert_eq!(
            call(manager, &thread, sys_kill, [thread.id, 1, 0, 0, 0, 0]),
            SYSCALL_ACCESS_DENIED
        );
        assert_ne!(thread.status(), TaskStatus::Terminated);
    }
}
