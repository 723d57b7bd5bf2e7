//! Task manager
//!
//! Owns the process table, hands out pids/tids and trust tokens, and
//! drives the per-CPU schedulers from the timer tick: preemptive
//! priority round-robin, FIFO within a priority.
//!
//! Context-switch assembly and timer programming are external
//! collaborators; `preempt` does everything register-frame-shaped (save
//! the outgoing frame, load the incoming one, swap CR3) and the glue
//! around it does the iretq.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Once;

use super::sched::{CpuScheduler, SleepEntry};
use super::security::{SecurityManager, TrustLevel};
use super::{
    Pcb, Pid, StatusCell, TaskArchitecture, TaskCompatibility, TaskInfo, TaskPriority, TaskStatus,
    TaskTrustLevel, Tcb, Tid,
};
use crate::arch::x86_64::syscall::SyscallFrame;
use crate::arch::{ArchPageTable, CpuOps, CurrentArch, IrqSpinlock, PAGE_SIZE, PageTable, PerCpuOps};
use crate::error::{KernelError, KernelResult};
use crate::fs::fd::FileDescriptorTable;
use crate::ipc::IpcTable;
use crate::mm::frame_alloc::FrameAllocRef;
use crate::mm::{BitmapFrameAllocator, MemoryTracker};
use crate::printkln;

/// Kernel stack size per thread
pub const KERNEL_STACK_PAGES: usize = 4;

/// User stack size per thread
pub const USER_STACK_PAGES: usize = 4;

/// Top of the user stack mapping
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;

/// Microseconds advanced per scheduler tick (100 Hz)
pub const TICK_INTERVAL_US: u64 = 10_000;

struct TaskTables {
    processes: Vec<Arc<Pcb>>,
    next_pid: Pid,
    next_tid: Tid,
}

/// The task manager
pub struct TaskManager {
    tables: IrqSpinlock<TaskTables>,
    cpus: Vec<IrqSpinlock<CpuScheduler>>,
    security: SecurityManager,
    pfa: &'static BitmapFrameAllocator,
    /// Microseconds since boot, advanced by the BSP tick
    uptime_us: AtomicU64,
    /// Round-robin CPU placement for new threads
    next_cpu: AtomicUsize,
    /// Tid of the cleanup thread, once registered
    cleanup_tid: AtomicU64,
}

impl TaskManager {
    /// Create a manager drawing frames from `pfa`, one scheduler per
    /// online CPU
    pub fn with_allocator(pfa: &'static BitmapFrameAllocator) -> Self {
        Self::with_cpus(pfa, CurrentArch::online_cpus())
    }

    /// Create a manager with an explicit CPU count
    pub(crate) fn with_cpus(pfa: &'static BitmapFrameAllocator, cpu_count: usize) -> Self {
        let cpu_count = cpu_count.max(1);
        let mut cpus = Vec::with_capacity(cpu_count);
        for _ in 0..cpu_count {
            cpus.push(IrqSpinlock::new(CpuScheduler::new()));
        }

        Self {
            tables: IrqSpinlock::new(TaskTables {
                processes: Vec::new(),
                next_pid: 1,
                next_tid: 1,
            }),
            cpus,
            security: SecurityManager::new(),
            pfa,
            uptime_us: AtomicU64::new(0),
            next_cpu: AtomicUsize::new(0),
            cleanup_tid: AtomicU64::new(0),
        }
    }

    /// The token registry
    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    /// Microseconds since boot
    pub fn uptime_us(&self) -> u64 {
        self.uptime_us.load(Ordering::Acquire)
    }

    /// Register the cleanup thread
    pub fn set_cleanup_thread(&self, tid: Tid) {
        self.cleanup_tid.store(tid, Ordering::Release);
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a process
    ///
    /// User processes get their own page table seeded with the kernel's
    /// upper half; kernel processes run on the kernel table.
    pub fn create_process(
        &self,
        parent: Option<&Arc<Pcb>>,
        name: &str,
        trust: TaskTrustLevel,
    ) -> KernelResult<Arc<Pcb>> {
        let page_table = match trust {
            TaskTrustLevel::User => {
                let mut fa = FrameAllocRef(self.pfa);
                let mut table =
                    ArchPageTable::new_user(&mut fa).ok_or(KernelError::NoMemory)?;
                table.copy_kernel_mappings();
                Some(table)
            }
            TaskTrustLevel::Kernel => None,
        };

        let token = self.security.create_token();
        let process = {
            let mut tables = self.tables.lock();
            let id = tables.next_pid;
            tables.next_pid += 1;

            let process = Arc::new(Pcb {
                id,
                parent_id: parent.map(|p| p.id).unwrap_or(0),
                trust,
                token,
                name: spin::Mutex::new(String::from(name)),
                status: StatusCell::new(TaskStatus::Ready),
                exit_code: core::sync::atomic::AtomicI64::new(0),
                page_table: spin::Mutex::new(page_table),
                tracker: spin::Mutex::new(MemoryTracker::new(self.pfa)),
                threads: spin::Mutex::new(Vec::new()),
                fd_table: spin::Mutex::new(FileDescriptorTable::new()),
                ipc: spin::Mutex::new(IpcTable::new()),
                program_break: spin::Mutex::new(None),
                info: spin::Mutex::new(TaskInfo::default()),
            });
            tables.processes.push(process.clone());
            process
        };

        Ok(process)
    }

    /// Create a thread in `process`
    ///
    /// Registers start at `entry + ip_offset` with `arg0`/`arg1` in the
    /// first two argument registers. User-trust processes also get a
    /// mapped user stack.
    #[allow(clippy::too_many_arguments)]
    pub fn create_thread(
        &self,
        process: &Arc<Pcb>,
        entry: u64,
        arg0: u64,
        arg1: u64,
        ip_offset: u64,
        arch: TaskArchitecture,
        compat: TaskCompatibility,
    ) -> KernelResult<Arc<Tcb>> {
        let kernel_stack_base = process
            .tracker
            .lock()
            .request_frames(KERNEL_STACK_PAGES)?;
        let kernel_stack_top = kernel_stack_base + (KERNEL_STACK_PAGES as u64) * PAGE_SIZE;

        // User processes get a stack mapped just under USER_STACK_TOP
        let user_stack_top = if process.trust == TaskTrustLevel::User {
            let stack_base = process.tracker.lock().request_frames(USER_STACK_PAGES)?;
            let stack_bottom = USER_STACK_TOP - (USER_STACK_PAGES as u64) * PAGE_SIZE;

            let mut table_guard = process.page_table.lock();
            let table = table_guard.as_mut().ok_or(KernelError::NoMemory)?;
            let mut fa = FrameAllocRef(self.pfa);
            for i in 0..USER_STACK_PAGES as u64 {
                table
                    .map(
                        stack_bottom + i * PAGE_SIZE,
                        stack_base + i * PAGE_SIZE,
                        crate::arch::PageFlags::RW | crate::arch::PageFlags::US,
                        &mut fa,
                    )
                    .map_err(|_| KernelError::NoMemory)?;
            }
            USER_STACK_TOP
        } else {
            0
        };

        let mut registers = SyscallFrame {
            rip: entry + ip_offset,
            rdi: arg0,
            rsi: arg1,
            ..Default::default()
        };
        registers.rsp = if user_stack_top != 0 {
            // Entered via iret, not call: keep the ABI's pre-call
            // alignment by backing off one slot
            user_stack_top - 8
        } else {
            kernel_stack_top
        };

        let token = self.security.create_token();
        let cpu = self.next_cpu.fetch_add(1, Ordering::Relaxed) % self.cpus.len();

        let thread = {
            let mut tables = self.tables.lock();
            let id = tables.next_tid;
            tables.next_tid += 1;

            Arc::new(Tcb {
                id,
                process: Arc::downgrade(process),
                arch,
                compat,
                token,
                kernel_stack_base,
                kernel_stack_pages: KERNEL_STACK_PAGES,
                user_stack_top,
                name: spin::Mutex::new(process.name()),
                priority: core::sync::atomic::AtomicU8::new(TaskPriority::Normal as u8),
                status: StatusCell::new(TaskStatus::Ready),
                exit_code: core::sync::atomic::AtomicI64::new(0),
                critical: core::sync::atomic::AtomicBool::new(false),
                registers: spin::Mutex::new(registers),
                fs_base: AtomicU64::new(0),
                gs_base: AtomicU64::new(0),
                cpu: AtomicUsize::new(cpu),
                wake_deadline: AtomicU64::new(0),
                waiting_on: AtomicU64::new(0),
                info: spin::Mutex::new(TaskInfo::default()),
            })
        };

        process.add_thread(thread.clone());
        self.cpus[cpu].lock().ready.enqueue(thread.id, thread.priority());
        Ok(thread)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Snapshot of all processes
    pub fn processes(&self) -> Vec<Arc<Pcb>> {
        self.tables.lock().processes.clone()
    }

    /// Process by pid
    pub fn get_process_by_pid(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.tables
            .lock()
            .processes
            .iter()
            .find(|p| p.id == pid)
            .cloned()
    }

    /// Thread by tid
    pub fn get_thread_by_tid(&self, tid: Tid) -> Option<Arc<Tcb>> {
        let processes = self.processes();
        for process in processes {
            if let Some(thread) = process.threads().into_iter().find(|t| t.id == tid) {
                return Some(thread);
            }
        }
        None
    }

    /// The thread running on this CPU
    pub fn current_thread(&self) -> Option<Arc<Tcb>> {
        let tid = CurrentArch::current_tid();
        if tid == 0 {
            return None;
        }
        self.get_thread_by_tid(tid)
    }

    /// The process of the thread running on this CPU
    pub fn current_process(&self) -> Option<Arc<Pcb>> {
        self.current_thread().and_then(|t| t.process.upgrade())
    }

    // ========================================================================
    // Blocking
    // ========================================================================

    /// Put the calling thread to sleep for `microseconds`
    pub fn sleep(&self, microseconds: u64) {
        let deadline = self.uptime_us().saturating_add(microseconds);

        if let Some(current) = self.current_thread() {
            current.wake_deadline.store(deadline, Ordering::Release);
            current.set_status(TaskStatus::Sleeping);
            let cpu = current.cpu.load(Ordering::Relaxed);
            self.cpus[cpu].lock().sleeping.push(SleepEntry {
                tid: current.id,
                wake_at: deadline,
                priority: current.priority(),
            });

            // Block until the scheduler moves us back past Sleeping
            while current.status() == TaskStatus::Sleeping {
                CurrentArch::halt();
            }
        } else {
            // Early boot, before the first thread: spin the clock
            while self.uptime_us() < deadline {
                CurrentArch::halt();
            }
        }
    }

    /// Whether `waiter` waiting on `target` would close a cycle
    fn would_deadlock(&self, waiter: Tid, target: Tid) -> bool {
        let mut hops = 0;
        let mut current = target;
        while current != 0 {
            if current == waiter {
                return true;
            }
            let Some(thread) = self.get_thread_by_tid(current) else {
                return false;
            };
            current = thread.waiting_on.load(Ordering::Acquire);
            hops += 1;
            if hops > 1024 {
                // A chain this long is itself wedged
                return true;
            }
        }
        false
    }

    /// Block the calling thread until `target` terminates
    ///
    /// Returns the target's exit code. A wait that would close a cycle
    /// in the wait graph fails with `Deadlock` instead of blocking.
    pub fn wait_for_thread(&self, target: &Arc<Tcb>) -> KernelResult<i64> {
        let Some(current) = self.current_thread() else {
            // No thread context; poll the target directly
            while target.status() != TaskStatus::Terminated {
                CurrentArch::halt();
            }
            return Ok(target.exit_code());
        };

        if current.id == target.id {
            return Err(KernelError::InvalidParameter);
        }
        if target.status() == TaskStatus::Terminated {
            return Ok(target.exit_code());
        }
        if self.would_deadlock(current.id, target.id) {
            return Err(KernelError::Deadlock);
        }

        current.waiting_on.store(target.id, Ordering::Release);
        current.set_status(TaskStatus::Waiting);

        while current.status() == TaskStatus::Waiting {
            CurrentArch::halt();
        }
        Ok(target.exit_code())
    }

    /// Move every thread waiting on `tid` back to Ready
    fn wake_waiters(&self, tid: Tid) {
        for process in self.processes() {
            for thread in process.threads() {
                if thread.waiting_on.load(Ordering::Acquire) == tid {
                    thread.waiting_on.store(0, Ordering::Release);
                    thread.set_status(TaskStatus::Ready);
                    let cpu = thread.cpu.load(Ordering::Relaxed);
                    self.cpus[cpu]
                        .lock()
                        .ready
                        .enqueue(thread.id, thread.priority());
                }
            }
        }
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Terminate `thread` with `code` and wake its waiters
    ///
    /// When the last thread of a process terminates, the process
    /// becomes Terminated with the same code. The thread's resources
    /// stay put until the cleanup thread collects them.
    pub fn terminate_thread(&self, thread: &Arc<Tcb>, code: i64) {
        thread.set_exit_code(code);
        thread.set_status(TaskStatus::Terminated);

        let cpu = thread.cpu.load(Ordering::Relaxed);
        self.cpus[cpu].lock().ready.remove(thread.id);
        self.wake_waiters(thread.id);

        if let Some(process) = thread.process.upgrade() {
            let all_done = process
                .threads()
                .iter()
                .all(|t| t.status() == TaskStatus::Terminated);
            if all_done {
                process.set_exit_code(code);
                process.set_status(TaskStatus::Terminated);
            }
        }
    }

    /// Forcibly terminate a thread (kill path)
    ///
    /// Killing a critical thread is an invariant violation: the kernel
    /// panics rather than continuing without it.
    pub fn kill_thread(&self, thread: &Arc<Tcb>, code: i64) {
        if thread.is_critical() {
            panic!("critical thread {} ({}) killed", thread.id, thread.name());
        }
        self.terminate_thread(thread, code);
    }

    /// Forcibly terminate every thread of a process
    pub fn kill_process(&self, process: &Arc<Pcb>, code: i64) {
        for thread in process.threads() {
            if thread.status() != TaskStatus::Terminated {
                self.kill_thread(&thread, code);
            }
        }
        process.set_exit_code(code);
        process.set_status(TaskStatus::Terminated);
    }

    /// Stop a thread (removed from scheduling until started again)
    pub fn stop_thread(&self, thread: &Arc<Tcb>) {
        thread.set_status(TaskStatus::Stopped);
        let cpu = thread.cpu.load(Ordering::Relaxed);
        self.cpus[cpu].lock().ready.remove(thread.id);
    }

    /// Make a stopped thread runnable again
    pub fn start_thread(&self, thread: &Arc<Tcb>) {
        if thread.status() != TaskStatus::Stopped {
            return;
        }
        thread.set_status(TaskStatus::Ready);
        let cpu = thread.cpu.load(Ordering::Relaxed);
        self.cpus[cpu]
            .lock()
            .ready
            .enqueue(thread.id, thread.priority());
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Timer-tick entry for one CPU
    ///
    /// Saves the outgoing thread's frame, accounts its CPU time, wakes
    /// expired sleepers, picks the next Ready thread (priority, then
    /// FIFO) and loads its frame. Returns the incoming tid, if any.
    pub fn preempt(&self, cpu_id: usize, frame: &mut SyscallFrame) -> Option<Tid> {
        if cpu_id == 0 {
            self.uptime_us
                .fetch_add(TICK_INTERVAL_US, Ordering::AcqRel);
        }
        let now = self.uptime_us();
        let cpu_id = cpu_id % self.cpus.len();

        // Resolve the outgoing thread before touching the CPU lock
        let outgoing = {
            let current = self.cpus[cpu_id].lock().current;
            current.and_then(|tid| self.get_thread_by_tid(tid))
        };

        if let Some(ref thread) = outgoing {
            *thread.registers.lock() = *frame;

            let mut info = thread.info.lock();
            let delta = now.saturating_sub(info.entered_running_at);
            if info.in_kernel {
                info.kernel_time += delta;
            } else {
                info.user_time += delta;
            }
            drop(info);

            if thread.status() == TaskStatus::Running {
                thread.set_status(TaskStatus::Ready);
                self.cpus[cpu_id]
                    .lock()
                    .ready
                    .enqueue(thread.id, thread.priority());
            }
        }

        let woken = self.cpus[cpu_id].lock().wake_expired(now);
        for tid in woken {
            if let Some(thread) = self.get_thread_by_tid(tid)
                && thread.status() == TaskStatus::Sleeping
            {
                thread.set_status(TaskStatus::Ready);
            }
        }

        // Pick the next runnable thread, skipping stale queue entries
        let next = loop {
            let candidate = self.cpus[cpu_id].lock().ready.dequeue_highest();
            let Some(tid) = candidate else {
                break None;
            };
            let Some(thread) = self.get_thread_by_tid(tid) else {
                continue;
            };
            if thread.status() == TaskStatus::Ready {
                break Some(thread);
            }
        };

        let Some(thread) = next else {
            self.cpus[cpu_id].lock().current = None;
            CurrentArch::set_current_tid(0);
            return None;
        };

        thread.set_status(TaskStatus::Running);
        thread.info.lock().entered_running_at = now;
        *frame = *thread.registers.lock();
        self.cpus[cpu_id].lock().current = Some(thread.id);
        CurrentArch::set_current_tid(thread.id);

        // Address-space switch for user processes
        if let Some(process) = thread.process.upgrade() {
            let table = process.page_table.lock();
            if let Some(ref pt) = *table {
                unsafe {
                    crate::arch::x86_64::paging::load_cr3(pt.root_table_phys());
                }
            }
        }

        Some(thread.id)
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Collect terminated threads and processes
    ///
    /// Frees kernel stacks, destroys tokens, tears down page tables and
    /// drops process-owned memory. Runs from the idle-priority cleanup
    /// thread, never inline with termination.
    pub fn cleanup_terminated(&self) {
        let processes = self.processes();

        for process in &processes {
            for thread in process.threads() {
                if thread.status() != TaskStatus::Terminated {
                    continue;
                }
                // Another holder (a waiter mid-wake) still needs the TCB
                if Arc::strong_count(&thread) > 2 {
                    continue;
                }

                let cpu = thread.cpu.load(Ordering::Relaxed);
                self.cpus[cpu].lock().ready.remove(thread.id);

                if process.remove_thread(thread.id).is_some() {
                    let _ = process
                        .tracker
                        .lock()
                        .free_frames(thread.kernel_stack_base, thread.kernel_stack_pages);
                    self.security.destroy_token(thread.token);
                }
            }
        }

        // Processes with no threads left and a terminal status go away
        // entirely; dropping the PCB drops its tracker, fd table and IPC
        let mut tables = self.tables.lock();
        tables.processes.retain(|process| {
            let done =
                process.status() == TaskStatus::Terminated && process.thread_count() == 0;
            if done {
                if let Some(table) = process.page_table.lock().take() {
                    let mut fa = FrameAllocRef(self.pfa);
                    table.destroy(&mut fa);
                }
                self.security.destroy_token(process.token);
                printkln!("task: cleaned up process {} ({})", process.id, process.name());
            }
            !done
        });
    }

    /// Body of the cleanup thread
    pub fn cleanup_processes_thread(&self) -> ! {
        loop {
            self.cleanup_terminated();
            self.sleep(100_000);
        }
    }
}

/// Global task manager
static TASK_MANAGER: Once<TaskManager> = Once::new();

/// Install the task manager and start the kernel main thread
///
/// Creates the kernel process and its first thread at `kernel_main`;
/// the scheduler picks it up on the first tick.
pub fn init_task_manager(
    pfa: &'static BitmapFrameAllocator,
    kernel_main: fn() -> !,
) -> KernelResult<&'static TaskManager> {
    let manager = TASK_MANAGER.call_once(|| TaskManager::with_allocator(pfa));

    let kernel_process = manager.create_process(None, "kernel", TaskTrustLevel::Kernel)?;
    manager
        .security
        .trust_token(kernel_process.token, TrustLevel::FULL_TRUST);

    let main_thread = manager.create_thread(
        &kernel_process,
        kernel_main as usize as u64,
        0,
        0,
        0,
        TaskArchitecture::X64,
        TaskCompatibility::Native,
    )?;
    main_thread.rename("Kernel Main Thread");
    main_thread.set_priority(TaskPriority::Critical);
    manager
        .security
        .trust_token(main_thread.token, TrustLevel::FULL_TRUST);

    Ok(manager)
}

/// The task manager; panics if used before [`init_task_manager`]
pub fn task_manager() -> &'static TaskManager {
    TASK_MANAGER.get().expect("task manager used before init")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::{MAX_MEMORY_ENTRIES, MemoryEntry, MemoryMap, MemoryType};

    fn fresh_pfa() -> &'static BitmapFrameAllocator {
        let mut map = MemoryMap {
            entries: 1,
            entry: [MemoryEntry::default(); MAX_MEMORY_ENTRIES],
            size: 32 * 1024 * 1024,
        };
        map.entry[0] = MemoryEntry {
            base_address: 0,
            length: 32 * 1024 * 1024,
            kind: MemoryType::Usable,
        };
        let pfa: &'static BitmapFrameAllocator =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(BitmapFrameAllocator::new()));
        pfa.init(&map);
        pfa
    }

    fn fresh_manager() -> (&'static TaskManager, Arc<Pcb>) {
        let pfa = fresh_pfa();
        let manager: &'static TaskManager =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(TaskManager::with_cpus(pfa, 1)));
        let process = manager
            .create_process(None, "kernel", TaskTrustLevel::Kernel)
            .unwrap();
        (manager, process)
    }

    fn spawn(manager: &TaskManager, process: &Arc<Pcb>, priority: TaskPriority) -> Arc<Tcb> {
        let thread = manager
            .create_thread(
                process,
                0x1000,
                0,
                0,
                0,
                TaskArchitecture::X64,
                TaskCompatibility::Native,
            )
            .unwrap();
        thread.set_priority(priority);
        // Re-queue under the new priority
        let cpu = thread.cpu.load(Ordering::Relaxed);
        manager.cpus[cpu].lock().ready.remove(thread.id);
        manager.cpus[cpu].lock().ready.enqueue(thread.id, priority);
        thread
    }

    #[test]
    fn test_create_process_and_thread() {
        let (manager, process) = fresh_manager();
        assert_eq!(process.id, 1);
        assert_eq!(process.status(), TaskStatus::Ready);

        let thread = spawn(manager, &process, TaskPriority::Normal);
        assert_eq!(thread.status(), TaskStatus::Ready);
        assert_eq!(process.thread_count(), 1);
        assert!(thread.kernel_stack_base != 0);
        assert_eq!(thread.user_stack_top, 0);
        assert_ne!(thread.token, process.token);

        let found = manager.get_thread_by_tid(thread.id).unwrap();
        assert!(Arc::ptr_eq(&found, &thread));
    }

    #[test]
    fn test_registers_initialized_with_offset() {
        let (manager, process) = fresh_manager();
        let thread = manager
            .create_thread(
                &process,
                0x40,
                7,
                9,
                0x40_0000,
                TaskArchitecture::X64,
                TaskCompatibility::Native,
            )
            .unwrap();
        let regs = thread.registers.lock();
        assert_eq!(regs.rip, 0x40_0040);
        assert_eq!(regs.rdi, 7);
        assert_eq!(regs.rsi, 9);
        assert_eq!(
            regs.rsp,
            thread.kernel_stack_base + (KERNEL_STACK_PAGES as u64) * PAGE_SIZE
        );
    }

    #[test]
    fn test_preempt_picks_priority_then_round_robins() {
        let (manager, process) = fresh_manager();
        let normal_a = spawn(manager, &process, TaskPriority::Normal);
        let normal_b = spawn(manager, &process, TaskPriority::Normal);
        let high = spawn(manager, &process, TaskPriority::High);

        let mut frame = SyscallFrame::default();
        assert_eq!(manager.preempt(0, &mut frame), Some(high.id));
        assert_eq!(high.status(), TaskStatus::Running);

        // High is re-queued behind nobody at its priority; it keeps the CPU
        assert_eq!(manager.preempt(0, &mut frame), Some(high.id));

        manager.terminate_thread(&high, 0);
        assert_eq!(manager.preempt(0, &mut frame), Some(normal_a.id));
        assert_eq!(manager.preempt(0, &mut frame), Some(normal_b.id));
        assert_eq!(manager.preempt(0, &mut frame), Some(normal_a.id));
        assert_eq!(normal_b.status(), TaskStatus::Ready);
    }

    #[test]
    fn test_preempt_saves_and_restores_frames() {
        let (manager, process) = fresh_manager();
        let a = spawn(manager, &process, TaskPriority::Normal);
        let b = spawn(manager, &process, TaskPriority::Normal);
        a.registers.lock().rbx = 0xAAAA;
        b.registers.lock().rbx = 0xBBBB;

        let mut frame = SyscallFrame::default();
        assert_eq!(manager.preempt(0, &mut frame), Some(a.id));
        assert_eq!(frame.rbx, 0xAAAA);

        // Mutate while A runs; the next switch must save it
        frame.rbx = 0xA1A1;
        assert_eq!(manager.preempt(0, &mut frame), Some(b.id));
        assert_eq!(frame.rbx, 0xBBBB);
        assert_eq!(a.registers.lock().rbx, 0xA1A1);
    }

    #[test]
    fn test_sleep_wakes_after_deadline() {
        let (manager, process) = fresh_manager();
        let thread = spawn(manager, &process, TaskPriority::Normal);

        let mut frame = SyscallFrame::default();
        assert_eq!(manager.preempt(0, &mut frame), Some(thread.id));

        // Simulate the thread going to sleep for two ticks
        thread.set_status(TaskStatus::Sleeping);
        let deadline = manager.uptime_us() + TICK_INTERVAL_US + 1;
        manager.cpus[0].lock().sleeping.push(SleepEntry {
            tid: thread.id,
            wake_at: deadline,
            priority: thread.priority(),
        });

        // First tick: still sleeping, CPU goes idle
        assert_eq!(manager.preempt(0, &mut frame), None);
        assert_eq!(thread.status(), TaskStatus::Sleeping);

        // Second tick: deadline passed, thread runs again
        assert_eq!(manager.preempt(0, &mut frame), Some(thread.id));
        assert_eq!(thread.status(), TaskStatus::Running);
    }

    #[test]
    fn test_wait_cycle_detected() {
        let (manager, process) = fresh_manager();
        let a = spawn(manager, &process, TaskPriority::Normal);
        let b = spawn(manager, &process, TaskPriority::Normal);
        let c = spawn(manager, &process, TaskPriority::Normal);

        // a waits on b, b waits on c
        a.waiting_on.store(b.id, Ordering::Release);
        b.waiting_on.store(c.id, Ordering::Release);

        // c waiting on a would close the cycle
        assert!(manager.would_deadlock(c.id, a.id));
        // an outside thread waiting on a is fine
        assert!(!manager.would_deadlock(c.id + 100, a.id));
    }

    #[test]
    fn test_terminate_wakes_waiters() {
        let (manager, process) = fresh_manager();
        let target = spawn(manager, &process, TaskPriority::Normal);
        let waiter = spawn(manager, &process, TaskPriority::Normal);

        waiter.waiting_on.store(target.id, Ordering::Release);
        waiter.set_status(TaskStatus::Waiting);

        manager.terminate_thread(&target, 7);
        assert_eq!(target.status(), TaskStatus::Terminated);
        assert_eq!(target.exit_code(), 7);
        assert_eq!(waiter.status(), TaskStatus::Ready);
        assert_eq!(waiter.waiting_on.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_last_thread_exit_terminates_process() {
        let (manager, process) = fresh_manager();
        let a = spawn(manager, &process, TaskPriority::Normal);
        let b = spawn(manager, &process, TaskPriority::Normal);

        manager.terminate_thread(&a, 0);
        assert_ne!(process.status(), TaskStatus::Terminated);

        manager.terminate_thread(&b, 3);
        assert_eq!(process.status(), TaskStatus::Terminated);
        assert_eq!(process.exit_code(), 3);
    }

    #[test]
    fn test_cleanup_frees_stacks_and_process() {
        let pfa = fresh_pfa();
        let manager: &'static TaskManager =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(TaskManager::with_cpus(pfa, 1)));
        let baseline = pfa.get_used();

        let process = manager
            .create_process(None, "doomed", TaskTrustLevel::Kernel)
            .unwrap();
        let thread = spawn(manager, &process, TaskPriority::Normal);
        assert!(pfa.get_used() > baseline);

        manager.terminate_thread(&thread, 0);
        drop(thread);
        drop(process);
        manager.cleanup_terminated();

        assert_eq!(manager.processes().len(), 0);
        assert_eq!(pfa.get_used(), baseline);
    }

    #[test]
    #[should_panic(expected = "critical thread")]
    fn test_killing_critical_thread_panics() {
        let (manager, process) = fresh_manager();
        let thread = spawn(manager, &process, TaskPriority::Normal);
        thread.set_critical(true);
        manager.kill_thread(&thread, -1);
    }

    #[test]
    fn test_stop_and_start() {
        let (manager, process) = fresh_manager();
        let thread = spawn(manager, &process, TaskPriority::Normal);

        manager.stop_thread(&thread);
        assert_eq!(thread.status(), TaskStatus::Stopped);
        let mut frame = SyscallFrame::default();
        assert_eq!(manager.preempt(0, &mut frame), None);

        manager.start_thread(&thread);
        assert_eq!(manager.preempt(0, &mut frame), Some(thread.id));
    }
}
