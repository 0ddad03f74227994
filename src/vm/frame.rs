//! Physical Frames
//!
//! [`PhysicalMemory`] is the simulated main memory; [`FrameAllocator`] owns
//! the set of frames not currently holding a page. Allocation when the pool
//! is empty goes through eviction, which lives with the rest of the shared
//! paging state in [`super::memory`].

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use super::PAGE_SIZE;
use crate::error::VmError;
use crate::types::FrameNumber;

// ============================================================================
// Physical Memory
// ============================================================================

/// Simulated main memory, `total_frames * PAGE_SIZE` bytes
pub struct PhysicalMemory {
    bytes: Vec<u8>,
    frames: usize,
}

impl PhysicalMemory {
    pub fn new(frames: usize) -> Self {
        Self {
            bytes: vec![0u8; frames * PAGE_SIZE],
            frames,
        }
    }

    /// Number of frames
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// Contents of a frame
    pub fn frame(&self, frame: FrameNumber) -> &[u8] {
        let start = frame.index() * PAGE_SIZE;
        &self.bytes[start..start + PAGE_SIZE]
    }

    /// Mutable contents of a frame
    pub fn frame_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        let start = frame.index() * PAGE_SIZE;
        &mut self.bytes[start..start + PAGE_SIZE]
    }

    /// Zero a frame
    pub fn zero(&mut self, frame: FrameNumber) {
        self.frame_mut(frame).fill(0);
    }
}

// ============================================================================
// Frame Allocator
// ============================================================================

/// Pool of free physical frames
///
/// Frames are handed out lowest number first. A frame is either in this pool
/// or owned by exactly one resident page.
#[derive(Debug)]
pub struct FrameAllocator {
    free: BTreeSet<FrameNumber>,
    total: usize,
}

impl FrameAllocator {
    /// Create an allocator with every frame free
    pub fn new(total: usize) -> Self {
        Self {
            free: (0..total as u32).map(FrameNumber).collect(),
            total,
        }
    }

    /// Take a free frame, if any
    pub fn allocate(&mut self) -> Option<FrameNumber> {
        self.free.pop_first()
    }

    /// Return a frame to the pool
    ///
    /// A frame that is already free is refused rather than counted twice.
    pub fn free(&mut self, frame: FrameNumber) -> Result<(), VmError> {
        if frame.index() >= self.total {
            return Err(VmError::InvalidFrame(frame));
        }
        if !self.free.insert(frame) {
            log::warn!(target: "vm", "double free of frame {}", frame);
            return Err(VmError::DoubleFree(frame));
        }
        Ok(())
    }

    /// Check if a frame is in the pool
    pub fn is_free(&self, frame: FrameNumber) -> bool {
        self.free.contains(&frame)
    }

    /// Number of free frames
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of frames in the system
    pub fn total(&self) -> usize {
        self.total
    }

    /// True if no frame is free
    pub fn is_exhausted(&self) -> bool {
        self.free.is_empty()
    }
}
