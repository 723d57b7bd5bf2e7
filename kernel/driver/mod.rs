//! Driver module loader
//!
//! Loads in-tree driver modules from the initrd: recognizes the Fex
//! format (and relocatable ELF), copies the image into tracker-owned
//! frames, calls the module's entry point with the kernel API record,
//! runs the configuration callback, and installs interrupt hooks for
//! drivers that bind vectors. Failure at any step rolls everything
//! back; nothing half-loaded reaches the driver list.

pub mod fex;
pub mod md5;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use self::fex::{FexBind, FexDriverType, FexExtended, FexFormatType, FexHeader};
use crate::arch::x86_64::interrupts::{self, InterruptHook};
use crate::arch::{ARCH_BASE_VECTOR, PAGE_SIZE, phys_to_virt};
use crate::error::{KernelError, KernelResult};
use crate::exec::elf::{self, Elf64};
use crate::fs::{NodeFlags, Virtual};
use crate::mm::{BitmapFrameAllocator, MemoryTracker, pages_for};
use crate::printkln;

/// Directory in the initrd scanned for modules
pub const MODULE_DIRECTORY: &str = "/modules";

/// Section carrying the extended header in ELF driver modules
const ELF_EXTENDED_SECTION: &str = ".extended";

/// Return codes a module's entry and callback use
pub mod retcode {
    pub const OK: i32 = 0;
    pub const NOT_IMPLEMENTED: i32 = -3;
}

/// Why a driver callback is being invoked
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReason {
    Unknown = 0,
    Configuration = 1,
    Interrupt = 2,
}

/// Scratch record handed to driver callbacks
///
/// One per driver, allocated out of the driver's tracker; not
/// re-entrant.
#[repr(C)]
pub struct KernelCallback {
    /// A `CallbackReason` value
    pub reason: u32,
    _pad: u32,
    /// Callback-specific payload pointer
    pub raw_ptr: u64,
}

/// Kernel services record handed to a module's entry point
#[repr(C)]
pub struct KernelApi {
    /// ABI version of this record
    pub version: u32,
    _pad: u32,
    /// Uid assigned to the module being loaded
    pub driver_uid: u64,
    /// Size in bytes of one page
    pub page_size: u64,
    /// Base address the image was loaded at
    pub image_base: u64,
    /// Allocate `pages` frames for the driver; returns the base or 0
    pub alloc_pages: extern "C" fn(u64) -> u64,
    /// Log a message from the driver
    pub log: extern "C" fn(*const u8, usize),
}

/// Current KernelApi ABI version
pub const KAPI_VERSION: u32 = 1;

extern "C" fn kapi_alloc_pages(pages: u64) -> u64 {
    crate::mm::FRAME_ALLOCATOR
        .request_frames(pages as usize)
        .unwrap_or(0)
}

extern "C" fn kapi_log(ptr: *const u8, len: usize) {
    if ptr.is_null() || len > 512 {
        return;
    }
    let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
    if let Ok(message) = core::str::from_utf8(bytes) {
        printkln!("driver: {}", message);
    }
}

/// One loaded driver
pub struct DriverRecord {
    /// Unique driver id
    pub uid: u64,
    /// Base of the executable image copy
    pub image_base: u64,
    /// Image length in pages
    pub image_pages: usize,
    /// Parsed extended header
    pub header: FexExtended,
    /// Owns the image, the callback scratch and the KernelApi record
    tracker: MemoryTracker,
    /// Vectors hooked by this driver
    pub hooks: Vec<u16>,
}

/// The driver manager
pub struct DriverManager {
    drivers: Mutex<Vec<DriverRecord>>,
    next_uid: AtomicU64,
    pfa: &'static BitmapFrameAllocator,
}

impl DriverManager {
    /// Create a manager drawing frames from `pfa`
    pub fn new(pfa: &'static BitmapFrameAllocator) -> Self {
        Self {
            drivers: Mutex::new(Vec::new()),
            next_uid: AtomicU64::new(1),
            pfa,
        }
    }

    /// Load every module found under [`MODULE_DIRECTORY`]
    ///
    /// Returns the number of drivers that loaded successfully; failures
    /// are logged and skipped.
    pub fn load_from_initrd(&self, vfs: &Virtual) -> usize {
        let Some(dir) = vfs.get_node_from_path(MODULE_DIRECTORY, None) else {
            printkln!("driver: no {} directory in initrd", MODULE_DIRECTORY);
            return 0;
        };

        let mut loaded = 0;
        for node in dir.children() {
            if node.flags() != NodeFlags::File {
                continue;
            }

            let handle = vfs.open(&alloc::format!("{}/{}", MODULE_DIRECTORY, node.name()), None);
            if !handle.is_ok() {
                continue;
            }
            let mut image = alloc::vec![0u8; node.length() as usize];
            let n = vfs.read(&handle, 0, &mut image);
            image.truncate(n);

            match self.load_driver(&image) {
                Ok(uid) => {
                    printkln!("driver: loaded '{}' as uid {}", node.name(), uid);
                    loaded += 1;
                }
                Err(e) => {
                    printkln!("driver: '{}' failed to load: {:?}", node.name(), e);
                }
            }
        }
        loaded
    }

    /// Load one driver module from its raw image bytes
    pub fn load_driver(&self, image: &[u8]) -> KernelResult<u64> {
        if FexHeader::is_fex(image) {
            let header = FexHeader::parse(image)?;
            if header.format != FexFormatType::Driver {
                return Err(KernelError::InvalidFileHeader);
            }
            let extended = FexExtended::parse(image)?;
            self.install(image, header.pointer, extended)
        } else if Elf64::is_elf(image) {
            let elf = Elf64::parse(image).map_err(|_| KernelError::InvalidFileHeader)?;
            let (ext_offset, _) = elf
                .find_section(image, ELF_EXTENDED_SECTION)
                .ok_or(KernelError::InvalidFileHeader)?;
            let extended = FexExtended::parse_at(image, ext_offset as usize)?;

            // Relocate into a flat image; entry/callback offsets come
            // out of the relocation pass
            let loaded = elf::load_relocatable(&elf, image, 0)
                .map_err(|_| KernelError::InvalidFileHeader)?;
            let entry = loaded.entry_offset;
            self.install(&loaded.image, entry, extended)
        } else {
            Err(KernelError::Unsupported)
        }
    }

    /// Copy the image in, run entry and configuration, bind interrupts
    fn install(&self, image: &[u8], entry_offset: u64, extended: FexExtended) -> KernelResult<u64> {
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        let mut tracker = MemoryTracker::new(self.pfa);

        // The image becomes executable only after this validated copy;
        // until here it was data
        let image_pages = pages_for(image.len() as u64);
        let image_base = tracker.request_frames(image_pages)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                image.as_ptr(),
                phys_to_virt(image_base),
                image.len(),
            );
        }

        #[cfg(debug_assertions)]
        {
            let sum = md5::digest(image);
            printkln!(
                "driver: '{}' md5 {:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
                extended.name,
                sum[0], sum[1], sum[2], sum[3], sum[4], sum[5], sum[6], sum[7],
                sum[8], sum[9], sum[10], sum[11], sum[12], sum[13], sum[14], sum[15]
            );
        }

        // KernelApi record, owned by the tracker like everything else
        let kapi_base = tracker.request_frames(pages_for(
            core::mem::size_of::<KernelApi>() as u64,
        ))?;
        let kapi = phys_to_virt(kapi_base) as *mut KernelApi;
        unsafe {
            kapi.write(KernelApi {
                version: KAPI_VERSION,
                _pad: 0,
                driver_uid: uid,
                page_size: PAGE_SIZE,
                image_base,
                alloc_pages: kapi_alloc_pages,
                log: kapi_log,
            });
        }

        let entry: extern "C" fn(*const KernelApi) -> i32 =
            unsafe { core::mem::transmute(image_base + entry_offset) };
        if entry(kapi) != retcode::OK {
            return Err(KernelError::DriverReturnedError);
        }

        // Callback scratch record
        let scratch_base = tracker.request_frames(1)?;
        let scratch = phys_to_virt(scratch_base) as *mut KernelCallback;
        unsafe {
            scratch.write(KernelCallback {
                reason: CallbackReason::Configuration as u32,
                _pad: 0,
                raw_ptr: 0,
            });
        }

        let callback_addr = image_base + extended.callback;
        let callback: extern "C" fn(*mut KernelCallback) -> i32 =
            unsafe { core::mem::transmute(callback_addr) };

        let ret = callback(scratch);
        if ret == retcode::NOT_IMPLEMENTED {
            printkln!(
                "driver: '{}' does not implement the configuration callback",
                extended.name
            );
            return Err(KernelError::DriverReturnedError);
        }
        if ret != retcode::OK {
            printkln!("driver: '{}' configuration returned {}", extended.name, ret);
            return Err(KernelError::DriverReturnedError);
        }

        // Interrupt binding: Input drivers hook their declared vectors
        // (Storage joins once storage interrupts are wired through)
        let mut hooks: Vec<u16> = Vec::new();
        if extended.driver_type == FexDriverType::Input
            && let FexBind::Interrupt(ref bind) = extended.bind
        {
            unsafe {
                (*scratch).reason = CallbackReason::Interrupt as u32;
            }
            for raw_vector in bind.active() {
                let vector = raw_vector + ARCH_BASE_VECTOR;
                let result = interrupts::register_hook(
                    vector,
                    InterruptHook {
                        callback: callback_addr,
                        scratch: scratch_base,
                        driver_uid: uid,
                    },
                );
                if let Err(e) = result {
                    // Roll back everything installed so far
                    for &v in &hooks {
                        interrupts::unregister_hook(v);
                    }
                    return Err(e);
                }
                hooks.push(vector);
            }
        }

        self.drivers.lock().push(DriverRecord {
            uid,
            image_base,
            image_pages,
            header: extended,
            tracker,
            hooks,
        });
        Ok(uid)
    }

    /// Unload a driver: remove its hooks and free its memory
    pub fn unload(&self, uid: u64) -> KernelResult<()> {
        let mut drivers = self.drivers.lock();
        let pos = drivers
            .iter()
            .position(|d| d.uid == uid)
            .ok_or(KernelError::NotFound)?;

        interrupts::unregister_driver_hooks(uid);
        // Dropping the record drops its tracker, freeing the image
        drivers.remove(pos);
        Ok(())
    }

    /// Number of loaded drivers
    pub fn driver_count(&self) -> usize {
        self.drivers.lock().len()
    }

    /// Uids of loaded drivers with the given type
    pub fn driver_uids_of_type(&self, driver_type: FexDriverType) -> Vec<u64> {
        self.drivers
            .lock()
            .iter()
            .filter(|d| d.header.driver_type == driver_type)
            .map(|d| d.uid)
            .collect()
    }

    /// Name of a loaded driver
    pub fn driver_name(&self, uid: u64) -> Option<String> {
        self.drivers
            .lock()
            .iter()
            .find(|d| d.uid == uid)
            .map(|d| d.header.name.clone())
    }
}
