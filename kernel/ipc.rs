//! Inter-process communication (light)
//!
//! Per-process table of byte-stream channels behind the Ipc syscall.
//! A channel is a bounded byte queue; readers drain it, writers fail
//! once it is full. The table dies with its process, closing every
//! channel.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

/// Default channel capacity in bytes
const DEFAULT_CAPACITY: usize = 4096;

/// One byte-stream channel
struct IpcChannel {
    id: u64,
    buffer: VecDeque<u8>,
    capacity: usize,
}

/// A process's IPC channels
pub struct IpcTable {
    channels: Vec<IpcChannel>,
    next_id: u64,
}

impl IpcTable {
    /// Empty table
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            next_id: 1,
        }
    }

    fn channel_mut(&mut self, id: u64) -> KernelResult<&mut IpcChannel> {
        self.channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(KernelError::InvalidParameter)
    }

    /// Create a channel, returning its id
    pub fn create(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.channels.push(IpcChannel {
            id,
            buffer: VecDeque::new(),
            capacity: DEFAULT_CAPACITY,
        });
        id
    }

    /// Destroy a channel, discarding buffered data
    pub fn destroy(&mut self, id: u64) -> KernelResult<()> {
        let pos = self
            .channels
            .iter()
            .position(|c| c.id == id)
            .ok_or(KernelError::InvalidParameter)?;
        self.channels.remove(pos);
        Ok(())
    }

    /// Resize a channel's capacity; buffered data is preserved
    pub fn allocate(&mut self, id: u64, capacity: usize) -> KernelResult<()> {
        if capacity == 0 {
            return Err(KernelError::InvalidParameter);
        }
        let channel = self.channel_mut(id)?;
        if channel.buffer.len() > capacity {
            return Err(KernelError::InvalidParameter);
        }
        channel.capacity = capacity;
        Ok(())
    }

    /// Drain up to `buffer.len()` bytes from a channel
    pub fn read(&mut self, id: u64, buffer: &mut [u8]) -> KernelResult<usize> {
        let channel = self.channel_mut(id)?;
        let n = channel.buffer.len().min(buffer.len());
        for slot in buffer.iter_mut().take(n) {
            *slot = channel.buffer.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    /// Append bytes to a channel, bounded by its capacity
    pub fn write(&mut self, id: u64, data: &[u8]) -> KernelResult<usize> {
        let channel = self.channel_mut(id)?;
        let room = channel.capacity.saturating_sub(channel.buffer.len());
        if room == 0 {
            return Err(KernelError::NoMemory);
        }
        let n = room.min(data.len());
        channel.buffer.extend(&data[..n]);
        Ok(n)
    }

    /// Whether a channel has buffered data (the Wait command polls this)
    pub fn has_data(&mut self, id: u64) -> KernelResult<bool> {
        Ok(!self.channel_mut(id)?.buffer.is_empty())
    }
}

impl Default for IpcTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read() {
        let mut table = IpcTable::new();
        let id = table.create();

        assert_eq!(table.write(id, b"ping").unwrap(), 4);
        assert!(table.has_data(id).unwrap());

        let mut buf = [0u8; 8];
        assert_eq!(table.read(id, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        assert!(!table.has_data(id).unwrap());
    }

    #[test]
    fn test_capacity_bounds_writes() {
        let mut table = IpcTable::new();
        let id = table.create();
        table.allocate(id, 4).unwrap();

        assert_eq!(table.write(id, b"123456").unwrap(), 4);
        assert_eq!(table.write(id, b"x"), Err(KernelError::NoMemory));

        let mut buf = [0u8; 4];
        table.read(id, &mut buf).unwrap();
        assert_eq!(table.write(id, b"x").unwrap(), 1);
    }

    #[test]
    fn test_destroy_invalidates() {
        let mut table = IpcTable::new();
        let id = table.create();
        table.destroy(id).unwrap();
        assert_eq!(table.destroy(id), Err(KernelError::InvalidParameter));
        assert_eq!(table.write(id, b"x"), Err(KernelError::InvalidParameter));
    }
}
