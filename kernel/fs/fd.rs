//! Per-process file descriptor table
//!
//! Descriptors map small non-negative integers onto shared file
//! handles with a per-descriptor offset. The `File*` syscalls are thin
//! delegates over this table.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_syscall::{SEEK_CUR, SEEK_END, SEEK_SET};

use crate::error::{KernelError, KernelResult};
use crate::fs::vfs::{FileHandle, Virtual};

/// One open descriptor
struct FdEntry {
    handle: Arc<FileHandle>,
    offset: u64,
}

/// A process's descriptor table
pub struct FileDescriptorTable {
    entries: Vec<Option<FdEntry>>,
}

impl FileDescriptorTable {
    /// Empty table
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn entry_mut(&mut self, fd: i64) -> KernelResult<&mut FdEntry> {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.entries.get_mut(idx))
            .and_then(|slot| slot.as_mut())
            .ok_or(KernelError::BadDescriptor)
    }

    /// Open `path` and install a descriptor for it
    pub fn open(&mut self, vfs: &Virtual, path: &str) -> KernelResult<i64> {
        let handle = vfs.open(path, None);
        if !handle.is_ok() {
            return Err(KernelError::NotFound);
        }

        let entry = FdEntry { handle, offset: 0 };
        let fd = match self.entries.iter().position(|slot| slot.is_none()) {
            Some(idx) => {
                self.entries[idx] = Some(entry);
                idx
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        Ok(fd as i64)
    }

    /// Close a descriptor
    ///
    /// The node survives; only this descriptor's reference goes away.
    pub fn close(&mut self, fd: i64) -> KernelResult<()> {
        let idx = usize::try_from(fd).map_err(|_| KernelError::BadDescriptor)?;
        let slot = self
            .entries
            .get_mut(idx)
            .ok_or(KernelError::BadDescriptor)?;
        if slot.take().is_none() {
            return Err(KernelError::BadDescriptor);
        }
        Ok(())
    }

    /// Read at the descriptor's offset, advancing it by the bytes read
    pub fn read(&mut self, vfs: &Virtual, fd: i64, buffer: &mut [u8]) -> KernelResult<usize> {
        let entry = self.entry_mut(fd)?;
        let n = vfs.read(&entry.handle, entry.offset, buffer);
        if !entry.handle.is_ok() {
            return Err(KernelError::InvalidOperator);
        }
        entry.offset += n as u64;
        Ok(n)
    }

    /// Write at the descriptor's offset, advancing it by the bytes written
    pub fn write(&mut self, vfs: &Virtual, fd: i64, buffer: &[u8]) -> KernelResult<usize> {
        let entry = self.entry_mut(fd)?;
        let n = vfs.write(&entry.handle, entry.offset, buffer);
        if !entry.handle.is_ok() {
            return Err(KernelError::InvalidOperator);
        }
        entry.offset += n as u64;
        Ok(n)
    }

    /// Reposition the descriptor's offset
    pub fn seek(&mut self, fd: i64, offset: i64, whence: u64) -> KernelResult<u64> {
        let entry = self.entry_mut(fd)?;
        let length = entry.handle.node().map(|n| n.length()).unwrap_or(0);

        let base = match whence {
            SEEK_SET => 0i64,
            SEEK_CUR => entry.offset as i64,
            SEEK_END => length as i64,
            _ => return Err(KernelError::InvalidParameter),
        };
        let target = base.checked_add(offset).ok_or(KernelError::InvalidParameter)?;
        if target < 0 {
            return Err(KernelError::InvalidParameter);
        }

        entry.offset = target as u64;
        Ok(entry.offset)
    }

    /// Status of the descriptor's handle (ABI value of `FileStatus`)
    pub fn status(&mut self, fd: i64) -> KernelResult<u64> {
        let entry = self.entry_mut(fd)?;
        Ok(entry.handle.status() as u64)
    }

    /// Number of open descriptors
    pub fn open_count(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FileDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ustar;

    fn vfs_with_file() -> Virtual {
        let data = ustar::tests::archive(&[("etc/motd", b"0123456789", b'0')]);
        let vfs = Virtual::new();
        ustar::mount_root(&vfs, alloc::boxed::Box::leak(data.into_boxed_slice())).unwrap();
        vfs
    }

    #[test]
    fn test_open_read_close() {
        let vfs = vfs_with_file();
        let mut table = FileDescriptorTable::new();

        let fd = table.open(&vfs, "/etc/motd").unwrap();
        assert_eq!(fd, 0);

        let mut buf = [0u8; 4];
        assert_eq!(table.read(&vfs, fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"0123");

        // Offset advanced
        assert_eq!(table.read(&vfs, fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"4567");

        table.close(fd).unwrap();
        assert_eq!(table.read(&vfs, fd, &mut buf), Err(KernelError::BadDescriptor));
    }

    #[test]
    fn test_open_missing_fails() {
        let vfs = vfs_with_file();
        let mut table = FileDescriptorTable::new();
        assert_eq!(table.open(&vfs, "/nope"), Err(KernelError::NotFound));
        assert_eq!(table.open_count(), 0);
    }

    #[test]
    fn test_fd_slots_reused() {
        let vfs = vfs_with_file();
        let mut table = FileDescriptorTable::new();

        let a = table.open(&vfs, "/etc/motd").unwrap();
        let b = table.open(&vfs, "/etc/motd").unwrap();
        assert_ne!(a, b);

        table.close(a).unwrap();
        let c = table.open(&vfs, "/etc/motd").unwrap();
        assert_eq!(c, a);
        assert_eq!(table.open_count(), 2);
    }

    #[test]
    fn test_seek_whence() {
        let vfs = vfs_with_file();
        let mut table = FileDescriptorTable::new();
        let fd = table.open(&vfs, "/etc/motd").unwrap();

        assert_eq!(table.seek(fd, 4, SEEK_SET).unwrap(), 4);
        assert_eq!(table.seek(fd, 2, SEEK_CUR).unwrap(), 6);
        assert_eq!(table.seek(fd, -1, SEEK_END).unwrap(), 9);
        assert_eq!(table.seek(fd, -100, SEEK_SET), Err(KernelError::InvalidParameter));
        assert_eq!(table.seek(fd, 0, 9), Err(KernelError::InvalidParameter));

        let mut buf = [0u8; 4];
        table.seek(fd, 8, SEEK_SET).unwrap();
        assert_eq!(table.read(&vfs, fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");
    }

    #[test]
    fn test_status_reports_handle_state() {
        let vfs = vfs_with_file();
        let mut table = FileDescriptorTable::new();
        let fd = table.open(&vfs, "/etc/motd").unwrap();
        assert_eq!(table.status(fd).unwrap(), 0);
        assert_eq!(table.status(99), Err(KernelError::BadDescriptor));
    }
}
