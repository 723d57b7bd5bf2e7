//! Tasking
//!
//! Process and thread control blocks, trust tokens, per-CPU scheduling
//! and the task manager.

pub mod manager;
pub mod sched;
pub mod security;

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use crate::arch::ArchPageTable;
use crate::arch::x86_64::syscall::SyscallFrame;
use crate::fs::fd::FileDescriptorTable;
use crate::ipc::IpcTable;
use crate::mm::MemoryTracker;
use crate::mm::brk::ProgramBreak;

/// Process id
pub type Pid = u64;

/// Thread id
pub type Tid = u64;

/// Thread scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskPriority {
    Idle = 1,
    Low = 2,
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl TaskPriority {
    /// Dense index for the per-priority ready queues, highest first
    pub fn queue_index(self) -> usize {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
            TaskPriority::Idle => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TaskPriority::Idle,
            2 => TaskPriority::Low,
            8 => TaskPriority::High,
            10 => TaskPriority::Critical,
            _ => TaskPriority::Normal,
        }
    }
}

/// Lifecycle state shared by processes and threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Unknown = 0,
    Ready = 1,
    Running = 2,
    Sleeping = 3,
    Waiting = 4,
    Stopped = 5,
    Terminated = 6,
}

impl TaskStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TaskStatus::Ready,
            2 => TaskStatus::Running,
            3 => TaskStatus::Sleeping,
            4 => TaskStatus::Waiting,
            5 => TaskStatus::Stopped,
            6 => TaskStatus::Terminated,
            _ => TaskStatus::Unknown,
        }
    }
}

/// Atomically readable status cell
pub struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: TaskStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn load(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, status: TaskStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

/// Coarse process trust classification at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTrustLevel {
    /// Kernel-side process: shares the kernel page table, no user stack
    Kernel,
    /// Userspace process: own page table, user stacks
    User,
}

/// Instruction-set architecture a thread executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskArchitecture {
    UnknownArchitecture,
    X32,
    X64,
    Arm64,
}

/// Syscall personality of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompatibility {
    Native,
    Linux,
}

/// CPU-time accounting
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskInfo {
    /// Time spent in kernel mode, microseconds
    pub kernel_time: u64,
    /// Time spent in user mode, microseconds
    pub user_time: u64,
    /// Snapshot of kernel_time at the last usage query
    pub old_kernel_time: u64,
    /// Snapshot of user_time at the last usage query
    pub old_user_time: u64,
    /// Timestamp when the task last entered Running
    pub entered_running_at: u64,
    /// Whether the task was executing kernel code at the last tick
    pub in_kernel: bool,
}

impl TaskInfo {
    /// Usage percentage over the window since the last query, clamped
    ///
    /// Also rolls the old-time snapshots forward.
    pub fn usage_percent(&mut self, system_delta: u64) -> u64 {
        if self.old_kernel_time == 0 && self.old_user_time == 0 {
            self.old_kernel_time = self.kernel_time;
            self.old_user_time = self.user_time;
            return 0;
        }

        let current = self.kernel_time + self.user_time;
        let old = self.old_kernel_time + self.old_user_time;
        self.old_kernel_time = self.kernel_time;
        self.old_user_time = self.user_time;

        if system_delta == 0 {
            return 0;
        }
        (current.saturating_sub(old) * 100 / system_delta).min(100)
    }
}

/// Process control block
pub struct Pcb {
    /// Process id
    pub id: Pid,
    /// Parent process id (0 for the kernel process)
    pub parent_id: Pid,
    /// Creation trust classification
    pub trust: TaskTrustLevel,
    /// Security token
    pub token: u64,
    name: Mutex<String>,
    status: StatusCell,
    exit_code: AtomicI64,
    /// Own page table for User processes; None for kernel processes,
    /// which run on the kernel table
    pub page_table: Mutex<Option<ArchPageTable>>,
    /// Frames owned by this process, freed when it is cleaned up
    pub tracker: Mutex<MemoryTracker>,
    /// Threads belonging to this process
    threads: Mutex<Vec<Arc<Tcb>>>,
    /// Open file descriptors
    pub fd_table: Mutex<FileDescriptorTable>,
    /// IPC channels
    pub ipc: Mutex<IpcTable>,
    /// Userspace heap break, set up once the image is loaded
    pub program_break: Mutex<Option<ProgramBreak>>,
    /// CPU-time accounting
    pub info: Mutex<TaskInfo>,
}

impl Pcb {
    /// Process name
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Rename the process
    pub fn rename(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    /// Lifecycle state
    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    /// Set the lifecycle state
    pub fn set_status(&self, status: TaskStatus) {
        self.status.store(status);
    }

    /// Exit code, meaningful once Terminated
    pub fn exit_code(&self) -> i64 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Record the exit code
    pub fn set_exit_code(&self, code: i64) {
        self.exit_code.store(code, Ordering::Release);
    }

    /// Snapshot of this process's threads
    pub fn threads(&self) -> Vec<Arc<Tcb>> {
        self.threads.lock().clone()
    }

    fn add_thread(&self, thread: Arc<Tcb>) {
        self.threads.lock().push(thread);
    }

    fn remove_thread(&self, tid: Tid) -> Option<Arc<Tcb>> {
        let mut threads = self.threads.lock();
        let pos = threads.iter().position(|t| t.id == tid)?;
        Some(threads.remove(pos))
    }

    /// Number of live threads
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}

/// Thread control block
pub struct Tcb {
    /// Thread id
    pub id: Tid,
    /// Owning process
    pub process: Weak<Pcb>,
    /// Execution architecture
    pub arch: TaskArchitecture,
    /// Syscall personality
    pub compat: TaskCompatibility,
    /// Security token
    pub token: u64,
    /// Kernel stack base (physical, identity-addressed)
    pub kernel_stack_base: u64,
    /// Kernel stack length in pages
    pub kernel_stack_pages: usize,
    /// User stack top (0 when the thread has no user stack)
    pub user_stack_top: u64,
    name: Mutex<String>,
    priority: AtomicU8,
    status: StatusCell,
    exit_code: AtomicI64,
    critical: AtomicBool,
    /// Saved register frame
    pub registers: Mutex<SyscallFrame>,
    /// x86-64 segment bases
    pub fs_base: AtomicU64,
    pub gs_base: AtomicU64,
    /// CPU whose queues this thread lives on
    pub cpu: AtomicUsize,
    /// Wakeup deadline in microseconds-of-uptime while Sleeping
    pub wake_deadline: AtomicU64,
    /// Tid this thread is waiting on while Waiting (0 = none)
    pub waiting_on: AtomicU64,
    /// CPU-time accounting
    pub info: Mutex<TaskInfo>,
}

impl Tcb {
    /// Thread name
    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Rename the thread
    pub fn rename(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    /// Scheduling priority
    pub fn priority(&self) -> TaskPriority {
        TaskPriority::from_u8(self.priority.load(Ordering::Acquire))
    }

    /// Change the scheduling priority
    pub fn set_priority(&self, priority: TaskPriority) {
        self.priority.store(priority as u8, Ordering::Release);
    }

    /// Lifecycle state
    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    /// Set the lifecycle state
    pub fn set_status(&self, status: TaskStatus) {
        self.status.store(status);
    }

    /// Exit code, meaningful once Terminated
    pub fn exit_code(&self) -> i64 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Record the exit code
    pub fn set_exit_code(&self, code: i64) {
        self.exit_code.store(code, Ordering::Release);
    }

    /// Whether the system must panic rather than lose this thread
    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::Acquire)
    }

    /// Mark or unmark the thread critical
    pub fn set_critical(&self, critical: bool) {
        self.critical.store(critical, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_queue_order() {
        // Higher priority sorts into a lower queue index
        assert!(TaskPriority::Critical.queue_index() < TaskPriority::High.queue_index());
        assert!(TaskPriority::High.queue_index() < TaskPriority::Normal.queue_index());
        assert!(TaskPriority::Normal.queue_index() < TaskPriority::Low.queue_index());
        assert!(TaskPriority::Low.queue_index() < TaskPriority::Idle.queue_index());
    }

    #[test]
    fn test_status_cell_roundtrip() {
        let cell = StatusCell::new(TaskStatus::Ready);
        assert_eq!(cell.load(), TaskStatus::Ready);
        cell.store(TaskStatus::Terminated);
        assert_eq!(cell.load(), TaskStatus::Terminated);
    }

    #[test]
    fn test_usage_percent() {
        let mut info = TaskInfo::default();
        info.kernel_time = 50;
        info.user_time = 10;

        // First query primes the snapshots
        assert_eq!(info.usage_percent(100), 0);

        info.kernel_time = 100;
        info.user_time = 20;
        // 60 microseconds busy over a 100 microsecond window
        assert_eq!(info.usage_percent(100), 60);

        // Clamped at 100
        info.kernel_time += 1000;
        assert_eq!(info.usage_percent(10), 100);
    }
}
