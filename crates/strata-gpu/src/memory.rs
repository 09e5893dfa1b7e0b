//! GPU memory management.
//!
//! The [`MemoryManager`] owns the allocation backend and tracks every live
//! buffer and image together with per-category byte counters. Deletions go
//! through the frame ring; [`MemoryManager::init_frame`] must be called once
//! per frame before recording.

use crate::allocator::{
    BufferId, BufferRequest, ImageId, ImageRequest, MemoryBackend, RawBuffer, RawImage,
};
use crate::buffer::Buffer;
use crate::deferred::{FrameOp, FrameRing, FrameSlot, FreeInfo, ImageFreeInfo};
use crate::error::{GpuError, Result};
use crate::memory_type::{MemoryCategory, MemoryType, MemoryTypes};
use crate::upload::StagedTransfer;
use ash::vk;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy)]
struct Tracked {
    size: u64,
    category: MemoryCategory,
}

/// Bytes currently allocated in each category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub device_local: u64,
    pub host_local: u64,
}

impl MemoryUsage {
    fn add(&mut self, category: MemoryCategory, size: u64) {
        match category {
            MemoryCategory::DeviceLocal => self.device_local += size,
            MemoryCategory::HostLocal => self.host_local += size,
        }
    }

    fn sub(&mut self, category: MemoryCategory, size: u64) {
        match category {
            MemoryCategory::DeviceLocal => {
                self.device_local = self.device_local.saturating_sub(size)
            }
            MemoryCategory::HostLocal => self.host_local = self.host_local.saturating_sub(size),
        }
    }

    pub fn get(&self, category: MemoryCategory) -> u64 {
        match category {
            MemoryCategory::DeviceLocal => self.device_local,
            MemoryCategory::HostLocal => self.host_local,
        }
    }
}

/// Snapshot of the manager's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub usage: MemoryUsage,
    pub live_buffers: usize,
    pub live_images: usize,
    /// Buffers, images and frame ops waiting in the frame ring.
    pub pending: usize,
}

/// Tracked usage against the heap backing a memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub heap_index: u32,
    pub used: u64,
    pub size: u64,
}

struct ManagerState {
    backend: Box<dyn MemoryBackend>,
    ring: FrameRing,
    buffers: HashMap<BufferId, Tracked>,
    images: HashMap<ImageId, Tracked>,
    scheduled: HashSet<BufferId>,
    scheduled_images: HashSet<ImageId>,
    usage: MemoryUsage,
}

impl ManagerState {
    fn release_buffer(&mut self, id: BufferId) -> Result<()> {
        let tracked = self
            .buffers
            .remove(&id)
            .ok_or(GpuError::UntrackedBuffer(id.0))?;
        self.scheduled.remove(&id);
        self.usage.sub(tracked.category, tracked.size);
        self.backend.destroy_buffer(id)
    }

    fn release_image(&mut self, id: ImageId) -> Result<()> {
        let tracked = self
            .images
            .remove(&id)
            .ok_or(GpuError::UntrackedImage(id.0))?;
        self.scheduled_images.remove(&id);
        self.usage.sub(tracked.category, tracked.size);
        self.backend.destroy_image(id)
    }

    /// Release a drained slot's resources, returning its frame ops and the
    /// first error encountered.
    fn release_slot(&mut self, slot: FrameSlot) -> (Vec<FrameOp>, Result<()>) {
        let mut result = Ok(());

        for info in slot.buffers {
            if let Err(e) = self.release_buffer(info.id) {
                tracing::error!("Failed to free buffer {:#x}: {e}", info.id.0);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        for info in slot.images {
            if let Err(e) = self.release_image(info.id) {
                tracing::error!("Failed to free image {:#x}: {e}", info.id.0);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        (slot.ops, result)
    }
}

fn run_ops(ops: Vec<FrameOp>) {
    for op in ops {
        op();
    }
}

/// Buffer and image lifetime manager with a frame-indexed deferred-free ring.
pub struct MemoryManager {
    types: MemoryTypes,
    state: Mutex<ManagerState>,
    staged: OnceLock<Arc<dyn StagedTransfer>>,
}

impl MemoryManager {
    /// Create a manager with `frames` slots in its deferred-free ring.
    pub fn new(backend: Box<dyn MemoryBackend>, types: MemoryTypes, frames: usize) -> Self {
        tracing::debug!(frames, "Creating memory manager");
        Self {
            types,
            state: Mutex::new(ManagerState {
                backend,
                ring: FrameRing::new(frames),
                buffers: HashMap::new(),
                images: HashMap::new(),
                scheduled: HashSet::new(),
                scheduled_images: HashSet::new(),
                usage: MemoryUsage::default(),
            }),
            staged: OnceLock::new(),
        }
    }

    pub fn memory_types(&self) -> &MemoryTypes {
        &self.types
    }

    /// Number of frame slots in the deferred-free ring.
    pub fn frames(&self) -> usize {
        self.state.lock().ring.frames()
    }

    pub fn current_frame(&self) -> usize {
        self.state.lock().ring.current()
    }

    /// Attach the path used to move data in and out of non-mappable memory.
    pub fn set_staged_transfer(&self, staged: Arc<dyn StagedTransfer>) -> Result<()> {
        self.staged
            .set(staged)
            .map_err(|_| GpuError::InvalidState("Staged transfer already attached".to_string()))
    }

    pub(crate) fn staged(&self) -> Result<Arc<dyn StagedTransfer>> {
        self.staged.get().cloned().ok_or_else(|| {
            GpuError::InvalidState(
                "Device-local buffer written before a staged transfer path was attached"
                    .to_string(),
            )
        })
    }

    /// Create a buffer of at least `size` bytes in `memory`.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryType,
    ) -> Result<Buffer> {
        let usage = memory.buffer_usage(usage);
        let raw = self.allocate_buffer(size, usage, memory, "buffer")?;
        Ok(Buffer::from_raw(raw, usage, memory))
    }

    /// Create a buffer in GPU memory.
    pub fn create_gpu_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<Buffer> {
        self.create_buffer(size, usage, self.types.gpu())
    }

    /// Create a buffer in host-visible memory.
    pub fn create_host_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<Buffer> {
        self.create_buffer(size, usage, self.types.host())
    }

    pub(crate) fn allocate_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryType,
        name: &str,
    ) -> Result<RawBuffer> {
        // Zero-sized buffers are invalid in Vulkan.
        let size = size.max(1);
        let mut state = self.state.lock();

        let raw = match state.backend.create_buffer(&BufferRequest {
            size,
            usage,
            memory,
            name,
        }) {
            Ok(raw) => raw,
            Err(e) => {
                let used = state.usage.device_local;
                drop(state);
                return Err(self.allocation_error(size, used, e));
            }
        };

        let category = memory.category();
        state.buffers.insert(raw.id, Tracked { size, category });
        state.usage.add(category, size);

        tracing::trace!(id = raw.id.0, size, ?category, "Created buffer");
        Ok(raw)
    }

    fn allocation_error(&self, size: u64, device_used: u64, source: GpuError) -> GpuError {
        let heap = self.types.gpu().heap_size;
        tracing::error!(
            size,
            device_used,
            heap,
            "Failed to allocate {size} bytes ({device_used} of {heap} device bytes in use): {source}"
        );
        GpuError::AllocationFailed(format!(
            "{size} bytes requested, {device_used} bytes of device memory in use, device heap is {heap} bytes: {source}"
        ))
    }

    /// Create an image.
    pub fn create_image(&self, request: &ImageRequest) -> Result<RawImage> {
        let mut state = self.state.lock();

        let image = match state.backend.create_image(request) {
            Ok(image) => image,
            Err(e) => {
                let used = state.usage.device_local;
                drop(state);
                let size = u64::from(request.extent.width) * u64::from(request.extent.height);
                return Err(self.allocation_error(size, used, e));
            }
        };

        let category = request.memory.category();
        state.images.insert(
            image.id,
            Tracked {
                size: image.size,
                category,
            },
        );
        state.usage.add(category, image.size);
        Ok(image)
    }

    /// Queue a buffer for deletion in the current frame's slot.
    ///
    /// The buffer is destroyed the next time this slot is initialized. Fails if
    /// the id is not live or is already queued.
    pub fn add_to_freeable(&self, info: FreeInfo) -> Result<()> {
        let mut state = self.state.lock();

        if !state.buffers.contains_key(&info.id) {
            return Err(GpuError::UntrackedBuffer(info.id.0));
        }
        if !state.scheduled.insert(info.id) {
            return Err(GpuError::InvalidState(format!(
                "Buffer {:#x} is already scheduled for deletion",
                info.id.0
            )));
        }

        state.ring.push_buffer(info);
        Ok(())
    }

    /// Queue an image for deletion in the current frame's slot.
    pub fn schedule_image_free(&self, image: RawImage) -> Result<()> {
        let mut state = self.state.lock();

        let tracked = *state
            .images
            .get(&image.id)
            .ok_or(GpuError::UntrackedImage(image.id.0))?;
        if !state.scheduled_images.insert(image.id) {
            return Err(GpuError::InvalidState(format!(
                "Image {:#x} is already scheduled for deletion",
                image.id.0
            )));
        }

        state.ring.push_image(ImageFreeInfo {
            id: image.id,
            size: tracked.size,
            category: tracked.category,
        });
        Ok(())
    }

    /// Run `op` when the current frame slot comes around again.
    pub fn add_frame_op<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state.lock().ring.push_op(Box::new(op));
    }

    /// Destroy a buffer immediately, bypassing the frame ring.
    ///
    /// The caller guarantees no pending GPU work references it.
    pub fn destroy_buffer_now(&self, id: BufferId) -> Result<()> {
        self.state.lock().release_buffer(id)
    }

    pub fn set_current_frame(&self, frame: usize) -> Result<()> {
        self.state.lock().ring.set_current(frame)
    }

    /// Start `frame`: make it current, release its queued resources and run
    /// its frame ops.
    ///
    /// Every queued entry is processed even if one fails; the first error is
    /// returned.
    pub fn init_frame(&self, frame: usize) -> Result<()> {
        let (ops, result) = {
            let mut state = self.state.lock();
            state.ring.set_current(frame)?;
            let slot = state.ring.take(frame)?;
            state.release_slot(slot)
        };

        // Ops may call back into the manager.
        run_ops(ops);
        result
    }

    /// Flush every slot of the frame ring. Used at shutdown after the device is idle.
    pub fn free_all(&self) -> Result<()> {
        let mut ops = Vec::new();
        let mut result = Ok(());
        {
            let mut state = self.state.lock();
            for slot in state.ring.take_all() {
                let (slot_ops, slot_result) = state.release_slot(slot);
                ops.extend(slot_ops);
                if result.is_ok() {
                    result = slot_result;
                }
            }

            if !state.buffers.is_empty() || !state.images.is_empty() {
                tracing::debug!(
                    buffers = state.buffers.len(),
                    images = state.images.len(),
                    "Live resources remain after flushing the frame ring"
                );
            }
        }

        run_ops(ops);
        result
    }

    /// Release all remaining memory. The manager is unusable afterwards.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if !state.buffers.is_empty() {
            tracing::warn!(
                count = state.buffers.len(),
                "Buffers still alive at shutdown"
            );
        }
        state.buffers.clear();
        state.images.clear();
        state.scheduled.clear();
        state.scheduled_images.clear();
        state.usage = MemoryUsage::default();
        state.backend.shutdown();
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            usage: state.usage,
            live_buffers: state.buffers.len(),
            live_images: state.images.len(),
            pending: state.ring.pending_count(),
        }
    }

    /// Tracked usage against the GPU and host heaps.
    pub fn heap_stats(&self) -> (HeapStats, HeapStats) {
        let usage = self.state.lock().usage;
        let heap = |memory: MemoryType| HeapStats {
            heap_index: memory.heap_index,
            used: usage.get(memory.category()),
            size: memory.heap_size,
        };
        (heap(self.types.gpu()), heap(self.types.host()))
    }

    /// Whether `id` is a live buffer.
    pub fn is_live(&self, id: BufferId) -> bool {
        self.state.lock().buffers.contains_key(&id)
    }
}
