//! Executable loading
//!
//! `spawn` turns a VFS path into a new process with its first thread:
//! Fex executables and ELF64 (ET_EXEC directly, ET_REL through the
//! relocation loader; ET_DYN and ET_CORE are rejected). The image is
//! copied into process-owned frames and identity-mapped RW|US; the
//! thread starts at the format's entry point offset into that image.

pub mod elf;

use alloc::string::String;
use alloc::sync::Arc;

use self::elf::{ET_CORE, ET_DYN, ET_EXEC, ET_REL, Elf64};
use crate::arch::{PAGE_SIZE, PageFlags, PageTable, phys_to_virt};
use crate::driver::fex::{FexFormatType, FexHeader};
use crate::error::{KernelError, KernelResult};
use crate::fs::{NodeFlags, Virtual, path};
use crate::mm::brk::ProgramBreak;
use crate::mm::frame_alloc::FrameAllocRef;
use crate::mm::pages_for;
use crate::task::manager::task_manager;
use crate::task::{Pcb, TaskArchitecture, TaskCompatibility, TaskStatus, TaskTrustLevel, Tcb};

/// Result of a successful spawn
pub struct SpawnData {
    pub process: Arc<Pcb>,
    pub thread: Arc<Tcb>,
}

/// Identity-map `pages` pages at `base` into the process table
fn map_identity(process: &Arc<Pcb>, base: u64, pages: usize, flags: PageFlags) -> KernelResult<()> {
    let mut table_guard = process.page_table.lock();
    let Some(table) = table_guard.as_mut() else {
        // Kernel-trust processes run on the kernel table
        return Ok(());
    };
    let mut fa = FrameAllocRef(&crate::mm::FRAME_ALLOCATOR);
    for i in 0..pages as u64 {
        table
            .map(base + i * PAGE_SIZE, base + i * PAGE_SIZE, flags, &mut fa)
            .map_err(|_| KernelError::NoMemory)?;
    }
    Ok(())
}

/// Copy `argv` and `envp` into a fresh process-owned page
///
/// Layout: argv pointer array (NULL-terminated), envp pointer array
/// (NULL-terminated), then the string bytes. Returns `(argc,
/// argv_array_address)`.
fn build_args_block(process: &Arc<Pcb>, argv: &[&str], envp: &[&str]) -> KernelResult<(u64, u64)> {
    let pointers = (argv.len() + 1 + envp.len() + 1) * 8;
    let strings: usize = argv.iter().chain(envp.iter()).map(|s| s.len() + 1).sum();
    let total = pointers + strings;

    let pages = pages_for(total as u64).max(1);
    let base = process.tracker.lock().request_frames(pages)?;
    map_identity(process, base, pages, PageFlags::RW | PageFlags::US)?;

    unsafe {
        let block = phys_to_virt(base);
        core::ptr::write_bytes(block, 0, pages * PAGE_SIZE as usize);

        let mut string_cursor = pointers;
        let mut write_string = |slot: usize, s: &str| unsafe {
            let addr = base + string_cursor as u64;
            (block.add(slot * 8) as *mut u64).write(addr);
            core::ptr::copy_nonoverlapping(s.as_ptr(), block.add(string_cursor), s.len());
            string_cursor += s.len() + 1;
        };

        for (i, s) in argv.iter().enumerate() {
            write_string(i, s);
        }
        // Slot argv.len() stays NULL, terminating the argv array
        for (i, s) in envp.iter().enumerate() {
            write_string(argv.len() + 1 + i, s);
        }
    }

    Ok((argv.len() as u64, base))
}

/// Load a Fex executable image and start its first thread
fn spawn_fex(
    process: &Arc<Pcb>,
    header: &FexHeader,
    data: &[u8],
    argc: u64,
    argv_ptr: u64,
) -> KernelResult<Arc<Tcb>> {
    let pages = pages_for(data.len() as u64);
    let base = process.tracker.lock().request_frames(pages)?;
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), phys_to_virt(base), data.len());
    }
    map_identity(process, base, pages, PageFlags::RW | PageFlags::US)?;

    install_program_break(process, base + (pages as u64) * PAGE_SIZE);
    task_manager().create_thread(
        process,
        header.pointer,
        argc,
        argv_ptr,
        base,
        TaskArchitecture::X64,
        TaskCompatibility::Native,
    )
}

/// Load an ELF image and start its first thread
fn spawn_elf(
    process: &Arc<Pcb>,
    elf: &Elf64,
    data: &[u8],
    argc: u64,
    argv_ptr: u64,
) -> KernelResult<Arc<Tcb>> {
    let arch = elf.arch();
    if arch == TaskArchitecture::UnknownArchitecture {
        return Err(KernelError::Unsupported);
    }

    match elf.e_type {
        ET_EXEC => {
            // Back the whole range up to the highest segment end, then
            // place each segment at base + p_vaddr
            let span = elf.highest_load_end();
            if span == 0 {
                return Err(KernelError::InvalidFileHeader);
            }
            let pages = pages_for(span);
            let base = process.tracker.lock().request_frames(pages)?;
            map_identity(process, base, pages, PageFlags::RW | PageFlags::US)?;

            for segment in &elf.segments {
                if segment.mem_size == 0 {
                    continue;
                }
                let dst = phys_to_virt(base + segment.vaddr);
                let src = data
                    .get(segment.offset as usize..(segment.offset + segment.file_size) as usize)
                    .ok_or(KernelError::InvalidFileHeader)?;
                unsafe {
                    core::ptr::write_bytes(dst, 0, segment.mem_size as usize);
                    core::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
                }
            }

            install_program_break(process, base + (pages as u64) * PAGE_SIZE);
            task_manager().create_thread(
                process,
                elf.entry,
                argc,
                argv_ptr,
                base,
                arch,
                TaskCompatibility::Native,
            )
        }
        ET_REL => {
            // Two passes: size the flat image, then relocate against
            // its real base
            let sized = elf::load_relocatable(elf, data, 0)
                .map_err(|_| KernelError::InvalidFileHeader)?;
            let pages = pages_for(sized.image.len() as u64).max(1);
            let base = process.tracker.lock().request_frames(pages)?;

            let loaded = elf::load_relocatable(elf, data, base)
                .map_err(|_| KernelError::InvalidFileEntryPoint)?;
            if loaded.entry_offset as usize >= loaded.image.len() {
                return Err(KernelError::InvalidFileEntryPoint);
            }
            unsafe {
                core::ptr::copy_nonoverlapping(
                    loaded.image.as_ptr(),
                    phys_to_virt(base),
                    loaded.image.len(),
                );
            }
            map_identity(process, base, pages, PageFlags::RW | PageFlags::US)?;

            install_program_break(process, base + (pages as u64) * PAGE_SIZE);
            task_manager().create_thread(
                process,
                loaded.entry_offset,
                argc,
                argv_ptr,
                base,
                arch,
                TaskCompatibility::Native,
            )
        }
        ET_DYN | ET_CORE => Err(KernelError::Unsupported),
        _ => Err(KernelError::InvalidFileHeader),
    }
}

/// Give the process a userspace heap starting past its image
fn install_program_break(process: &Arc<Pcb>, heap_start: u64) {
    *process.program_break.lock() = Some(ProgramBreak::new(heap_start));
}

/// Spawn a new process from the executable at `path`
///
/// On failure the half-constructed process (if any) is marked
/// Terminated for the cleanup thread; the file handle is always
/// released.
pub fn spawn(vfs: &Virtual, spawn_path: &str, argv: &[&str], envp: &[&str]) -> KernelResult<SpawnData> {
    let handle = vfs.open(spawn_path, None);
    if !handle.is_ok() {
        return Err(KernelError::InvalidPath);
    }
    let node = handle.node().ok_or(KernelError::InvalidPath)?;
    if node.flags() != NodeFlags::File {
        return Err(KernelError::NotAFile);
    }

    let mut data = alloc::vec![0u8; node.length() as usize];
    let n = vfs.read(&handle, 0, &mut data);
    data.truncate(n);
    // Dropping the handle below closes it on every path

    let manager = task_manager();
    let parent = manager.current_process();
    let name: String = String::from(path::basename(spawn_path));
    let process = manager.create_process(parent.as_ref(), &name, TaskTrustLevel::User)?;

    let result = (|| -> KernelResult<Arc<Tcb>> {
        let (argc, argv_ptr) = build_args_block(&process, argv, envp)?;

        if FexHeader::is_fex(&data) {
            let header = FexHeader::parse(&data)?;
            if header.format != FexFormatType::Executable {
                return Err(KernelError::InvalidFileHeader);
            }
            spawn_fex(&process, &header, &data, argc, argv_ptr)
        } else if Elf64::is_elf(&data) {
            let elf = Elf64::parse(&data).map_err(|_| KernelError::InvalidFileHeader)?;
            spawn_elf(&process, &elf, &data, argc, argv_ptr)
        } else {
            Err(KernelError::Unsupported)
        }
    })();

    match result {
        Ok(thread) => Ok(SpawnData { process, thread }),
        Err(e) => {
            process.set_status(TaskStatus::Terminated);
            Err(e)
        }
    }
}
