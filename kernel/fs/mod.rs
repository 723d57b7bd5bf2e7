//! Virtual file system
//!
//! - [`path`] - POSIX-style path normalization and segmentation
//! - [`vfs`] - the in-memory node tree and per-mount operators
//! - [`ustar`] - USTAR initrd archives mounted as the root tree
//! - [`fd`] - per-process file descriptor tables

pub mod fd;
pub mod path;
pub mod ustar;
pub mod vfs;

pub use vfs::{FileHandle, FileStatus, FileSystemOperations, Node, NodeFlags, Virtual};

use spin::Once;

/// The kernel's VFS instance
static VFS: Once<Virtual> = Once::new();

/// Install the VFS (once, during `Entry`)
pub fn init_vfs() -> &'static Virtual {
    VFS.call_once(Virtual::new)
}

/// The VFS; panics if used before [`init_vfs`]
pub fn vfs() -> &'static Virtual {
    VFS.get().expect("VFS used before init")
}
