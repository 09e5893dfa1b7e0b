//! Synchronization primitives and the in-flight fence batch.

use crate::command::CommandBuffer;
use crate::config::DEFAULT_FENCE_BATCH_CAPACITY;
use crate::error::Result;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Blocking fence operations.
pub trait FenceWaiter: Send + Sync {
    /// Block until every fence is signaled. There is no timeout.
    fn wait_all(&self, fences: &[vk::Fence]) -> Result<()>;

    /// Non-blocking status query.
    fn is_signaled(&self, fence: vk::Fence) -> Result<bool>;
}

impl FenceWaiter for ash::Device {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn wait_all(&self, fences: &[vk::Fence]) -> Result<()> {
        unsafe { self.wait_for_fences(fences, true, u64::MAX)? };
        Ok(())
    }

    fn is_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.get_fence_status(fence)? })
    }
}

struct FenceBatch {
    fences: Vec<vk::Fence>,
    command_buffers: Vec<CommandBuffer>,
}

/// Bounded batch of in-flight fences.
///
/// Submitted command buffers are parked here until a wait-all returns them to
/// their pools. The batch never holds more than `capacity` fences: adding to a
/// full batch waits on it first.
pub struct Synchronization {
    waiter: Arc<dyn FenceWaiter>,
    capacity: usize,
    batch: Mutex<FenceBatch>,
}

impl Synchronization {
    /// Create a batch with the given fence capacity.
    pub fn new(waiter: Arc<dyn FenceWaiter>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            waiter,
            capacity,
            batch: Mutex::new(FenceBatch {
                fences: Vec::with_capacity(capacity),
                command_buffers: Vec::new(),
            }),
        }
    }

    /// Create a batch with the default capacity of 50 fences.
    pub fn with_default_capacity(waiter: Arc<dyn FenceWaiter>) -> Self {
        Self::new(waiter, DEFAULT_FENCE_BATCH_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fences waiting in the current batch.
    pub fn pending_fences(&self) -> usize {
        self.batch.lock().fences.len()
    }

    /// Command buffers waiting to be reset.
    pub fn pending_command_buffers(&self) -> usize {
        self.batch.lock().command_buffers.len()
    }

    /// Track a submitted command buffer; it is reset after the next wait-all.
    pub fn add_command_buffer(&self, command_buffer: CommandBuffer) -> Result<()> {
        let mut batch = self.batch.lock();
        self.push_fence(&mut batch, command_buffer.fence())?;
        batch.command_buffers.push(command_buffer);
        Ok(())
    }

    /// Track a bare fence.
    pub fn add_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut batch = self.batch.lock();
        self.push_fence(&mut batch, fence)
    }

    /// Block on every pending fence and recycle the tracked command buffers.
    pub fn wait_fences(&self) -> Result<()> {
        let mut batch = self.batch.lock();
        self.wait_batch(&mut batch)
    }

    fn push_fence(&self, batch: &mut FenceBatch, fence: vk::Fence) -> Result<()> {
        if batch.fences.len() >= self.capacity {
            tracing::trace!(capacity = self.capacity, "Fence batch full, waiting");
            self.wait_batch(batch)?;
        }
        batch.fences.push(fence);
        Ok(())
    }

    fn wait_batch(&self, batch: &mut FenceBatch) -> Result<()> {
        if batch.fences.is_empty() {
            return Ok(());
        }

        self.waiter.wait_all(&batch.fences)?;

        for command_buffer in batch.command_buffers.drain(..) {
            command_buffer.reset();
        }
        batch.fences.clear();
        Ok(())
    }

    /// Block on a single fence, outside the batch.
    pub fn wait_fence(waiter: &dyn FenceWaiter, fence: vk::Fence) -> Result<()> {
        waiter.wait_all(&[fence])
    }

    /// Whether a single fence has signaled.
    pub fn check_fence_status(waiter: &dyn FenceWaiter, fence: vk::Fence) -> Result<bool> {
        waiter.is_signaled(fence)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Records every wait instead of touching a device.
    #[derive(Default)]
    pub struct RecordingWaiter {
        pub waits: Mutex<Vec<Vec<vk::Fence>>>,
    }

    impl RecordingWaiter {
        pub fn wait_count(&self) -> usize {
            self.waits.lock().len()
        }
    }

    impl FenceWaiter for RecordingWaiter {
        fn wait_all(&self, fences: &[vk::Fence]) -> Result<()> {
            self.waits.lock().push(fences.to_vec());
            Ok(())
        }

        fn is_signaled(&self, fence: vk::Fence) -> Result<bool> {
            Ok(self.waits.lock().iter().flatten().any(|f| *f == fence))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::RecordingWaiter;
    use super::*;
    use crate::command::detached_buffer;
    use ash::vk::Handle;
    use std::collections::VecDeque;

    #[test]
    fn wait_on_empty_batch_is_noop() {
        let waiter = Arc::new(RecordingWaiter::default());
        let sync = Synchronization::new(waiter.clone(), 4);

        sync.wait_fences().unwrap();
        assert_eq!(waiter.wait_count(), 0);
    }

    #[test]
    fn full_batch_waits_before_append() {
        let waiter = Arc::new(RecordingWaiter::default());
        let sync = Synchronization::with_default_capacity(waiter.clone());

        for i in 1..=50 {
            sync.add_fence(vk::Fence::from_raw(i)).unwrap();
        }
        assert_eq!(sync.pending_fences(), 50);
        assert_eq!(waiter.wait_count(), 0);

        sync.add_fence(vk::Fence::from_raw(51)).unwrap();

        assert_eq!(waiter.wait_count(), 1);
        assert_eq!(waiter.waits.lock()[0].len(), 50);
        assert_eq!(sync.pending_fences(), 1);
    }

    #[test]
    fn wait_resets_tracked_command_buffers() {
        let waiter = Arc::new(RecordingWaiter::default());
        let sync = Synchronization::new(waiter.clone(), 8);
        let recycle = Arc::new(Mutex::new(VecDeque::new()));

        for i in 1..=3 {
            sync.add_command_buffer(detached_buffer(i, &recycle)).unwrap();
        }
        assert_eq!(sync.pending_command_buffers(), 3);
        assert!(recycle.lock().is_empty());

        sync.wait_fences().unwrap();

        assert_eq!(sync.pending_fences(), 0);
        assert_eq!(sync.pending_command_buffers(), 0);
        assert_eq!(recycle.lock().len(), 3);
        assert!(recycle.lock().iter().all(|cb| !cb.is_submitted()));
    }

    #[test]
    fn single_fence_helpers_bypass_batch() {
        let waiter = Arc::new(RecordingWaiter::default());
        let sync = Synchronization::new(waiter.clone(), 8);
        let fence = vk::Fence::from_raw(99);

        assert!(!Synchronization::check_fence_status(waiter.as_ref(), fence).unwrap());
        Synchronization::wait_fence(waiter.as_ref(), fence).unwrap();
        assert!(Synchronization::check_fence_status(waiter.as_ref(), fence).unwrap());
        assert_eq!(sync.pending_fences(), 0);
    }
}
