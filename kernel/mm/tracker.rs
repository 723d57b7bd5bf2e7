//! Per-owner frame tracking
//!
//! A `MemoryTracker` records every frame span allocated through it and
//! frees them all when dropped. Driver records and process control
//! blocks each own one, so tearing the owner down releases its physical
//! memory deterministically.
//!
//! Entries are kept sorted by base address and never overlap: the frame
//! allocator hands out disjoint spans, and `free`/`detach` only remove
//! whole recorded entries.

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::mm::BitmapFrameAllocator;
use crate::mm::frame_alloc::FRAME_SIZE;

/// One tracked allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrackedSpan {
    /// Physical base address
    base: u64,
    /// Number of frames
    count: usize,
}

/// Records allocations for one owner; frees them on drop
pub struct MemoryTracker {
    pfa: &'static BitmapFrameAllocator,
    spans: Vec<TrackedSpan>,
}

impl MemoryTracker {
    /// Create a tracker drawing from `pfa`
    pub fn new(pfa: &'static BitmapFrameAllocator) -> Self {
        Self {
            pfa,
            spans: Vec::new(),
        }
    }

    /// Allocate `count` contiguous frames and record them
    pub fn request_frames(&mut self, count: usize) -> KernelResult<u64> {
        let base = self
            .pfa
            .request_frames(count)
            .ok_or(KernelError::NoMemory)?;

        let pos = self
            .spans
            .iter()
            .position(|s| s.base > base)
            .unwrap_or(self.spans.len());
        self.spans.insert(pos, TrackedSpan { base, count });
        Ok(base)
    }

    /// Free a previously recorded span
    ///
    /// `base` and `count` must match a recorded entry exactly.
    pub fn free_frames(&mut self, base: u64, count: usize) -> KernelResult<()> {
        let pos = self
            .spans
            .iter()
            .position(|s| s.base == base && s.count == count)
            .ok_or(KernelError::InvalidParameter)?;
        self.spans.remove(pos);
        self.pfa.free_frames(base, count);
        Ok(())
    }

    /// Remove a recorded span without freeing it
    ///
    /// The caller takes over ownership of the frames; used by the
    /// DetachAddress syscall to hand memory across process teardown.
    pub fn detach(&mut self, base: u64) -> KernelResult<()> {
        let pos = self
            .spans
            .iter()
            .position(|s| s.base == base)
            .ok_or(KernelError::InvalidParameter)?;
        self.spans.remove(pos);
        Ok(())
    }

    /// Whether `base` is a recorded span start
    pub fn owns(&self, base: u64) -> bool {
        self.spans.iter().any(|s| s.base == base)
    }

    /// Frame count of the span starting at `base`
    pub fn span_len(&self, base: u64) -> Option<usize> {
        self.spans.iter().find(|s| s.base == base).map(|s| s.count)
    }

    /// Total tracked bytes
    pub fn tracked_bytes(&self) -> u64 {
        self.spans
            .iter()
            .map(|s| (s.count * FRAME_SIZE) as u64)
            .sum()
    }
}

impl Drop for MemoryTracker {
    fn drop(&mut self) {
        // Every entry is freed exactly once; entries never overlap
        for span in self.spans.drain(..) {
            self.pfa.free_frames(span.base, span.count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootinfo::{MAX_MEMORY_ENTRIES, MemoryEntry, MemoryMap, MemoryType};

    fn fresh_pfa() -> &'static BitmapFrameAllocator {
        let mut map = MemoryMap {
            entries: 1,
            entry: [MemoryEntry::default(); MAX_MEMORY_ENTRIES],
            size: 8 * 1024 * 1024,
        };
        map.entry[0] = MemoryEntry {
            base_address: 0,
            length: 8 * 1024 * 1024,
            kind: MemoryType::Usable,
        };
        let pfa: &'static BitmapFrameAllocator =
            alloc::boxed::Box::leak(alloc::boxed::Box::new(BitmapFrameAllocator::new()));
        pfa.init(&map);
        pfa
    }

    #[test]
    fn test_drop_frees_everything() {
        let pfa = fresh_pfa();
        {
            let mut tracker = MemoryTracker::new(pfa);
            tracker.request_frames(3).unwrap();
            tracker.request_frames(1).unwrap();
            assert_eq!(pfa.get_used(), 4 * FRAME_SIZE as u64);
            assert_eq!(tracker.tracked_bytes(), 4 * FRAME_SIZE as u64);
        }
        assert_eq!(pfa.get_used(), 0);
    }

    #[test]
    fn test_explicit_free_then_drop_does_not_double_free() {
        let pfa = fresh_pfa();
        let other = pfa.request_frame().unwrap();
        {
            let mut tracker = MemoryTracker::new(pfa);
            let base = tracker.request_frames(2).unwrap();
            tracker.free_frames(base, 2).unwrap();
            assert_eq!(pfa.get_used(), FRAME_SIZE as u64);
        }
        // Only the untracked frame remains allocated
        assert_eq!(pfa.get_used(), FRAME_SIZE as u64);
        pfa.free_frame(other);
    }

    #[test]
    fn test_detach_leaves_frames_allocated() {
        let pfa = fresh_pfa();
        let base;
        {
            let mut tracker = MemoryTracker::new(pfa);
            base = tracker.request_frames(2).unwrap();
            tracker.detach(base).unwrap();
            assert!(!tracker.owns(base));
        }
        // Detached span survived the tracker
        assert_eq!(pfa.get_used(), 2 * FRAME_SIZE as u64);
        pfa.free_frames(base, 2);
    }

    #[test]
    fn test_free_rejects_unknown_span() {
        let pfa = fresh_pfa();
        let mut tracker = MemoryTracker::new(pfa);
        assert_eq!(
            tracker.free_frames(0xdead_000, 1),
            Err(KernelError::InvalidParameter)
        );
    }
}
