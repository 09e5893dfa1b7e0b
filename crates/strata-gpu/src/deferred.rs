//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! GPU resources cannot be freed while a frame that still references them is
//! in flight. The [`FrameRing`] keeps one free-list per frame slot. Anything
//! scheduled for deletion lands in the slot of the frame that is *current when
//! it is marked*, and is released the next time that slot is initialized,
//! which is one full trip around the ring later.

use crate::allocator::{BufferId, ImageId};
use crate::error::{GpuError, Result};
use crate::memory_type::MemoryCategory;

/// A callback run when its frame slot comes around again.
pub type FrameOp = Box<dyn FnOnce() + Send>;

/// Snapshot of a buffer taken when it is scheduled for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeInfo {
    pub id: BufferId,
    pub size: u64,
    pub category: MemoryCategory,
}

/// Snapshot of an image taken when it is scheduled for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFreeInfo {
    pub id: ImageId,
    pub size: u64,
    pub category: MemoryCategory,
}

/// Everything queued for one frame slot.
#[derive(Default)]
pub struct FrameSlot {
    pub buffers: Vec<FreeInfo>,
    pub images: Vec<ImageFreeInfo>,
    pub ops: Vec<FrameOp>,
}

impl FrameSlot {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty() && self.ops.is_empty()
    }

    fn len(&self) -> usize {
        self.buffers.len() + self.images.len() + self.ops.len()
    }
}

/// Fixed ring of per-frame free-lists.
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FrameRing {
    /// Create a ring with one slot per frame in flight.
    pub fn new(frames: usize) -> Self {
        let frames = frames.max(1);
        Self {
            slots: (0..frames).map(|_| FrameSlot::default()).collect(),
            current: 0,
        }
    }

    /// Number of slots.
    pub fn frames(&self) -> usize {
        self.slots.len()
    }

    /// Slot that new deletions are queued into.
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn set_current(&mut self, frame: usize) -> Result<()> {
        if frame >= self.slots.len() {
            return Err(GpuError::FrameOutOfRange {
                frame,
                frames: self.slots.len(),
            });
        }
        self.current = frame;
        Ok(())
    }

    pub fn push_buffer(&mut self, info: FreeInfo) {
        self.slots[self.current].buffers.push(info);
    }

    pub fn push_image(&mut self, info: ImageFreeInfo) {
        self.slots[self.current].images.push(info);
    }

    pub fn push_op(&mut self, op: FrameOp) {
        self.slots[self.current].ops.push(op);
    }

    /// Remove and return everything queued in `frame`.
    pub fn take(&mut self, frame: usize) -> Result<FrameSlot> {
        let frames = self.slots.len();
        let slot = self
            .slots
            .get_mut(frame)
            .ok_or(GpuError::FrameOutOfRange { frame, frames })?;
        Ok(std::mem::take(slot))
    }

    /// Drain every slot, oldest first (the slot after the current one).
    pub fn take_all(&mut self) -> Vec<FrameSlot> {
        let frames = self.slots.len();
        (1..=frames)
            .map(|step| std::mem::take(&mut self.slots[(self.current + step) % frames]))
            .collect()
    }

    /// Number of queued entries across all slots.
    pub fn pending_count(&self) -> usize {
        self.slots.iter().map(FrameSlot::len).sum()
    }
}
