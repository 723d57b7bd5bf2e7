//! Boot information record
//!
//! The multiboot-style boot glue parses firmware tables and hands `Entry` a
//! single `BootInfo` record: the physical memory map, discovered
//! framebuffers, the kernel image placement, and any loaded modules
//! (the initrd is `modules[0]`). The glue itself is an external
//! collaborator; nothing in the kernel re-parses bootloader structures.

/// Maximum framebuffers carried in the boot record
pub const MAX_FRAMEBUFFERS: usize = 4;
/// Maximum memory-map entries carried in the boot record
pub const MAX_MEMORY_ENTRIES: usize = 64;
/// Maximum bootloader modules carried in the boot record
pub const MAX_MODULES: usize = 16;
/// Maximum command-line length preserved from the bootloader
pub const MAX_CMDLINE: usize = 256;

/// Classification of one memory-map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum MemoryType {
    /// Free RAM, available to the frame allocator
    Usable = 0,
    /// Firmware-reserved, never touched
    #[default]
    Reserved = 1,
    /// ACPI tables, reclaimable after parsing
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage
    AcpiNvs = 3,
    /// Known-bad RAM
    BadMemory = 4,
    /// Bootloader structures, reclaimable once boot info is copied
    BootloaderReclaimable = 5,
    /// Kernel image and boot modules
    KernelAndModules = 6,
    /// Framebuffer aperture
    Framebuffer = 7,
}

/// One physical memory region
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MemoryEntry {
    /// Physical base address
    pub base_address: u64,
    /// Length in bytes
    pub length: u64,
    /// Region classification
    pub kind: MemoryType,
}

/// Physical memory map
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemoryMap {
    /// Number of valid entries
    pub entries: usize,
    /// The entries themselves
    pub entry: [MemoryEntry; MAX_MEMORY_ENTRIES],
    /// Total addressable RAM in bytes (end of the highest entry)
    pub size: u64,
}

impl MemoryMap {
    /// Iterate the valid entries
    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entry[..self.entries].iter()
    }
}

/// One discovered framebuffer
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct FramebufferInfo {
    /// Physical base address (0 terminates the array)
    pub base_address: u64,
    /// Bytes per scanline
    pub pitch: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bits per pixel
    pub bits_per_pixel: u16,
}

/// Kernel image placement
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct KernelInfo {
    /// Address of the kernel file as loaded by the bootloader
    pub file_base: u64,
    /// Physical load base
    pub physical_base: u64,
    /// Virtual load base
    pub virtual_base: u64,
    /// Image size in bytes
    pub size: u64,
    /// NUL-terminated command line
    pub command_line: [u8; MAX_CMDLINE],
}

impl KernelInfo {
    /// Command line as a str (up to the first NUL)
    pub fn command_line(&self) -> &str {
        let len = self
            .command_line
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.command_line.len());
        core::str::from_utf8(&self.command_line[..len]).unwrap_or("")
    }
}

/// One bootloader-loaded module (module 0 is the initrd)
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ModuleInfo {
    /// Physical address of the module image (0 = unused slot)
    pub address: u64,
    /// Module size in bytes
    pub size: u64,
    /// NUL-terminated module command line
    pub command_line: [u8; 64],
}

impl Default for ModuleInfo {
    fn default() -> Self {
        ModuleInfo {
            address: 0,
            size: 0,
            command_line: [0; 64],
        }
    }
}

impl ModuleInfo {
    /// Module contents as a byte slice
    ///
    /// # Safety
    /// The module region must still be intact (it is reserved from the
    /// frame allocator during `Entry`).
    pub unsafe fn data(&self) -> &'static [u8] {
        unsafe { core::slice::from_raw_parts(self.address as *const u8, self.size as usize) }
    }
}

/// Boot record handed to `Entry` by the boot glue
#[repr(C)]
pub struct BootInfo {
    /// Discovered framebuffers; a zero base address terminates the array
    pub framebuffer: [FramebufferInfo; MAX_FRAMEBUFFERS],
    /// Physical memory map
    pub memory: MemoryMap,
    /// Kernel image placement and command line
    pub kernel: KernelInfo,
    /// Bootloader modules; a zero address terminates the array
    pub modules: [ModuleInfo; MAX_MODULES],
}

impl BootInfo {
    /// The initrd module, if the bootloader provided one
    pub fn initrd(&self) -> Option<&ModuleInfo> {
        if self.modules[0].address != 0 {
            Some(&self.modules[0])
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_truncates_at_nul() {
        let mut kernel = KernelInfo {
            file_base: 0,
            physical_base: 0,
            virtual_base: 0,
            size: 0,
            command_line: [0; MAX_CMDLINE],
        };
        kernel.command_line[..9].copy_from_slice(b"init=/sbn");
        assert_eq!(kernel.command_line(), "init=/sbn");
    }

    #[test]
    fn test_memory_map_iter_stops_at_count() {
        let mut map = MemoryMap {
            entries: 2,
            entry: [MemoryEntry::default(); MAX_MEMORY_ENTRIES],
            size: 0,
        };
        map.entry[0].length = 0x1000;
        map.entry[1].length = 0x2000;
        map.entry[2].length = 0x4000;
        let total: u64 = map.iter().map(|e| e.length).sum();
        assert_eq!(total, 0x3000);
    }
}
