//! kestrel kernel entry point
//!
//! Boot glue hands `_start` a `BootInfo` record; `entry` brings up the
//! memory subsystem leaves-first (frame allocator, kernel page table,
//! heap), constructs the VFS, starts the task manager with the kernel
//! main thread, and parks the BSP. The kernel main thread mounts the
//! initrd, loads drivers, starts services and spawns init.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

pub mod bootinfo;
pub mod cmdline;
pub mod console;
pub mod driver;
pub mod error;
pub mod exec;
pub mod fs;
pub mod ipc;
pub mod lock;
pub mod net;
pub mod power;
pub mod printk;
pub mod random;
pub mod recovery;
pub mod storage;
pub mod syscall;
pub mod task;

mod arch;
mod mm;

use ::core::panic::PanicInfo;

use spin::Once;

use crate::arch::{
    ArchPageTable, CpuOps, CurrentArch, HaltOps, PAGE_SIZE, PageFlags, PageTable, phys_to_virt,
};
use crate::bootinfo::BootInfo;
use crate::cmdline::KernelConfig;
use crate::driver::DriverManager;
use crate::driver::fex::FexDriverType;
use crate::fs::{NodeFlags, vfs};
use crate::mm::frame_alloc::FrameAllocRef;
use crate::mm::heap::{KERNEL_HEAP, KernelHeapGlobal};
use crate::mm::{FRAME_ALLOCATOR, pages_for};
use crate::net::NetworkInterfaceManager;
use crate::storage::DiskManager;
use crate::task::TaskPriority;
use crate::task::manager::{init_task_manager, task_manager};
use crate::task::security::TrustLevel;

/// Kernel heap allocator
#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: KernelHeapGlobal = KernelHeapGlobal;

/// Parsed kernel configuration
static CONFIG: Once<KernelConfig> = Once::new();

/// Initrd archive handed over by the bootloader
static INITRD: Once<&'static [u8]> = Once::new();

/// First discovered framebuffer, for the boot animation thread
static BOOT_FRAMEBUFFER: Once<bootinfo::FramebufferInfo> = Once::new();

/// Singletons constructed by the kernel main thread
static DRIVER_MANAGER: Once<DriverManager> = Once::new();
static DISK_MANAGER: Once<DiskManager> = Once::new();
static NI_MANAGER: Once<NetworkInterfaceManager> = Once::new();

/// The kernel configuration; panics before `entry` has parsed it
pub fn config() -> &'static KernelConfig {
    CONFIG.get().expect("config used before init")
}

/// x86-64 entry point, called by the boot glue
///
/// `boot_info` points at the glue's `BootInfo` record, which must stay
/// intact (its memory is reserved from the frame allocator below).
#[cfg(all(target_arch = "x86_64", not(test)))]
#[unsafe(no_mangle)]
pub extern "C" fn _start(boot_info: *const BootInfo) -> ! {
    let info = unsafe { &*boot_info };
    entry(info)
}

/// Bring the kernel up from the boot record
pub fn entry(info: &'static BootInfo) -> ! {
    printkln!("kestrel starting...");

    let cmdline = info.kernel.command_line();
    if !cmdline.is_empty() {
        printkln!("cmdline: {}", cmdline);
    }
    let config = *CONFIG.call_once(|| cmdline::parse_config(cmdline));

    // ========================================================================
    // Physical memory
    // ========================================================================
    FRAME_ALLOCATOR.init(&info.memory);
    printkln!(
        "mem: {} MB total, {} MB reserved",
        FRAME_ALLOCATOR.get_total() / (1024 * 1024),
        FRAME_ALLOCATOR.get_reserved() / (1024 * 1024)
    );

    // The kernel image, boot modules and framebuffers must never be
    // handed out as free frames
    FRAME_ALLOCATOR.reserve_frames(info.kernel.physical_base, pages_for(info.kernel.size));
    for module in info.modules.iter().take_while(|m| m.address != 0) {
        FRAME_ALLOCATOR.reserve_frames(module.address, pages_for(module.size));
    }
    for fb in info.framebuffer.iter().take_while(|f| f.base_address != 0) {
        FRAME_ALLOCATOR.reserve_frames(fb.base_address, pages_for(fb.pitch * fb.height as u64));
    }

    if let Some(initrd) = info.initrd() {
        INITRD.call_once(|| unsafe { initrd.data() });
    }
    if info.framebuffer[0].base_address != 0 {
        BOOT_FRAMEBUFFER.call_once(|| info.framebuffer[0]);
    }

    // ========================================================================
    // Virtual memory
    // ========================================================================
    arch::x86_64::paging::init_paging_features();

    let mut fa = FrameAllocRef(&FRAME_ALLOCATOR);
    let mut kernel_table =
        ArchPageTable::new_user(&mut fa).expect("no frames for the kernel page table");

    // Identity map all of RAM (1 GiB pages where the CPU allows), then
    // the framebuffers, and drop page zero as a null guard
    kernel_table
        .optimized_map(PAGE_SIZE, PAGE_SIZE, info.memory.size - PAGE_SIZE, PageFlags::RW | PageFlags::G, &mut fa)
        .expect("failed to map physical memory");
    for fb in info.framebuffer.iter().take_while(|f| f.base_address != 0) {
        kernel_table
            .optimized_map(
                fb.base_address,
                fb.base_address,
                fb.pitch * fb.height as u64,
                PageFlags::RW | PageFlags::US | PageFlags::G,
                &mut fa,
            )
            .expect("failed to map framebuffer");
    }

    unsafe {
        arch::x86_64::paging::load_cr3(kernel_table.root_table_phys());
    }
    mm::set_kernel_page_table(kernel_table);

    // ========================================================================
    // Heap, VFS, tasking
    // ========================================================================
    KERNEL_HEAP.init(config.allocator);
    printkln!("heap: {:?} allocator", config.allocator);

    fs::init_vfs();

    init_task_manager(&FRAME_ALLOCATOR, kernel_main_thread)
        .expect("failed to start the kernel main thread");

    // The scheduler takes over from the timer tick; park the BSP
    CurrentArch::enable_interrupts();
    loop {
        CurrentArch::halt();
    }
}

/// Cleanup thread entry
fn cleanup_processes_thread() -> ! {
    task_manager().cleanup_processes_thread()
}

/// Boot animation thread
///
/// Streams raw frames from `/etc/bootanim/<n>.img` into the boot
/// framebuffer. Frame preparation (image decoding) happens at initrd
/// build time; this just blits.
fn boot_animation_thread() -> ! {
    let manager = task_manager();
    let Some(fb) = BOOT_FRAMEBUFFER.get() else {
        manager.sleep(u64::MAX);
        unreachable!()
    };
    let fb_len = (fb.pitch * fb.height as u64) as usize;

    let mut frame = 1u32;
    loop {
        let path = alloc::format!("/etc/bootanim/{}.img", frame);
        let handle = vfs().open(&path, None);
        if !handle.is_ok() {
            break;
        }

        let len = handle.node().map(|n| n.length()).unwrap_or(0) as usize;
        let mut data = alloc::vec![0u8; len.min(fb_len)];
        let n = vfs().read(&handle, 0, &mut data);
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), phys_to_virt(fb.base_address), n);
        }

        frame += 1;
        manager.sleep(50_000);
    }

    loop {
        manager.sleep(u64::MAX);
    }
}

/// The kernel main thread
///
/// Mounts the initrd, starts the cleanup and service threads, loads
/// drivers, probes disks, spawns init and waits for it.
fn kernel_main_thread() -> ! {
    let manager = task_manager();
    let kernel_process = manager
        .current_process()
        .expect("kernel main thread without a process");

    // Cleanup thread at idle priority
    match manager.create_thread(
        &kernel_process,
        cleanup_processes_thread as usize as u64,
        0,
        0,
        0,
        task::TaskArchitecture::X64,
        task::TaskCompatibility::Native,
    ) {
        Ok(thread) => {
            thread.rename("Tasks Cleanup");
            thread.set_priority(TaskPriority::Idle);
            manager.set_cleanup_thread(thread.id);
        }
        Err(e) => printkln!("task: no cleanup thread: {:?}", e),
    }

    // ========================================================================
    // Initrd
    // ========================================================================
    match INITRD.get() {
        Some(archive) => match fs::ustar::mount_root(vfs(), archive) {
            Ok(count) => printkln!("initrd: {} nodes", count),
            Err(e) => {
                printkln!("initrd: mount failed: {:?}", e);
                recovery::enter("initrd unusable");
            }
        },
        None => {
            printkln!("initrd: no module from bootloader");
            recovery::enter("no initrd");
        }
    }

    // Conventional tree roots next to the initrd content
    for dir in ["/dev", "/mnt", "/proc"] {
        let _ = vfs().create(dir, NodeFlags::Directory, None);
    }

    // Animation frames come out of the initrd, so this waits for the
    // mount
    if config().boot_animation
        && let Ok(thread) = manager.create_thread(
            &kernel_process,
            boot_animation_thread as usize as u64,
            0,
            0,
            0,
            task::TaskArchitecture::X64,
            task::TaskCompatibility::Native,
        )
    {
        thread.rename("Logo Animation");
        thread.set_priority(TaskPriority::Low);
    }

    // ========================================================================
    // Drivers, disks, network
    // ========================================================================
    printkln!("init: disk manager");
    let disks = DISK_MANAGER.call_once(DiskManager::new);

    printkln!("init: loading drivers");
    let drivers = DRIVER_MANAGER.call_once(|| DriverManager::new(&FRAME_ALLOCATOR));
    drivers.load_from_initrd(vfs());

    let storage_uids = drivers.driver_uids_of_type(FexDriverType::Storage);
    if storage_uids.is_empty() {
        printkln!("disk: no storage drivers, nothing to probe");
    } else {
        for uid in storage_uids {
            disks.fetch_disks(drivers, uid);
        }
    }

    printkln!("init: network service");
    NI_MANAGER.call_once(NetworkInterfaceManager::new).start_service();

    // Userspace can call in from here on
    arch::x86_64::syscall::set_syscall_handler(syscall::handle_native_syscalls);

    // ========================================================================
    // Init
    // ========================================================================
    let init_path = config().init_path();
    let argv = [init_path, "--init", "--critical"];
    let envp = [
        "PATH=/system:/system/bin",
        "TERM=tty",
        "HOME=/",
        "USER=root",
    ];

    printkln!("init: spawning {}", init_path);
    let spawned = match exec::spawn(vfs(), init_path, &argv, &envp) {
        Ok(data) => data,
        Err(e) => {
            printkln!("init: failed to start {}: {:?}", init_path, e);
            recovery::enter("init did not start");
        }
    };

    spawned.thread.set_critical(true);
    let security = manager.security();
    security.trust_token(spawned.process.token, TrustLevel::FULL_TRUST);
    security.trust_token(spawned.thread.token, TrustLevel::FULL_TRUST);

    printkln!("init: waiting for {}", init_path);
    let exit_code = manager
        .wait_for_thread(&spawned.thread)
        .unwrap_or(-1);

    if exit_code != 0 {
        printkln!("init: {} exited with code {}", init_path, exit_code);
        manager.sleep(2_500_000);
        recovery::enter("init exited with a failure code");
    }

    // Init returning at all is unexpected; it should have driven a
    // shutdown instead
    printkln!(
        "init: {} exited with code 0 without requesting shutdown",
        init_path
    );
    printkln!("system halted");
    CurrentArch::halt_loop()
}

/// Panic handler (bare metal only)
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    CurrentArch::disable_interrupts();

    // Panic-safe printk: try_lock with emergency fallback
    crate::printk::set_oops_in_progress();

    printkln!("\n========================================");
    printkln!("!!! KERNEL PANIC !!!");
    printkln!("========================================");

    if let Some(location) = info.location() {
        printkln!("location: {}:{}", location.file(), location.line());
    }
    if let Some(message) = info.message().as_str() {
        printkln!("message: {}", message);
    }

    // Frame-pointer backtrace
    #[cfg(target_arch = "x86_64")]
    {
        let mut frame_ptr: u64;
        unsafe {
            ::core::arch::asm!("mov {}, rbp", out(reg) frame_ptr, options(nomem, preserves_flags));
        }

        printkln!("backtrace:");
        let mut depth = 0;
        while frame_ptr != 0 && depth < 16 {
            if !(0x1000..=0xFFFF_FFFF_FFFF_0000).contains(&frame_ptr) {
                break;
            }
            let return_addr = unsafe { *((frame_ptr + 8) as *const u64) };
            if return_addr == 0 {
                break;
            }
            printkln!("  #{}: {:#018x}", depth, return_addr);

            let prev = unsafe { *(frame_ptr as *const u64) };
            if prev <= frame_ptr {
                break;
            }
            frame_ptr = prev;
            depth += 1;
        }
        if depth == 0 {
            printkln!("  <no frames available>");
        }
    }

    let (used, total, overflow) = crate::printk::stats();
    printkln!(
        "printk buffer: {}/{} bytes{}",
        used,
        total,
        if overflow { " (overflow)" } else { "" }
    );
    printkln!("system halted.");

    CurrentArch::halt_loop()
}
