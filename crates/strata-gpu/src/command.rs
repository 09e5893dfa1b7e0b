//! Command pool and recyclable command buffers.
//!
//! A [`CommandPool`] hands out [`CommandBuffer`]s that each carry their own
//! fence and semaphore. A buffer moves through three states:
//!
//! - available: sitting in the pool's recycle queue
//! - recording: checked out, between [`CommandBuffer::begin`] and submit
//! - submitted: waiting for its fence, until [`CommandBuffer::reset`] hands it back

use crate::error::{GpuError, Result};
use crate::sync::{create_fence, create_semaphore, FenceWaiter};
use ash::vk;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

type RecycleQueue = Arc<Mutex<VecDeque<CommandBuffer>>>;

/// Native calls needed to allocate, record and submit command buffers.
pub trait CommandDevice: FenceWaiter {
    /// Create a pool whose buffers can be reset individually.
    ///
    /// # Safety
    /// `queue_family` must exist on the device.
    unsafe fn new_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool>;

    /// Allocate `count` primary buffers from `pool`.
    ///
    /// # Safety
    /// `pool` must belong to this device and be externally synchronized.
    unsafe fn allocate_primary(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    /// # Safety
    /// The device must be valid.
    unsafe fn new_fence(&self, signaled: bool) -> Result<vk::Fence>;

    /// # Safety
    /// The device must be valid.
    unsafe fn new_semaphore(&self) -> Result<vk::Semaphore>;

    /// Begin one-time-submit recording.
    ///
    /// # Safety
    /// `cmd` must not be pending execution.
    unsafe fn begin_one_time(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// End `cmd`, reset `fence` and submit, signaling `fence` and `semaphore`.
    ///
    /// # Safety
    /// `queue` must be externally synchronized and `cmd` must be recording.
    unsafe fn end_and_submit(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
        semaphore: Option<vk::Semaphore>,
    ) -> Result<()>;

    /// # Safety
    /// None of the objects may still be in use.
    unsafe fn release_sync_objects(&self, fences: &[vk::Fence], semaphores: &[vk::Semaphore]);

    /// Reset `pool` releasing its memory, then destroy it.
    ///
    /// # Safety
    /// No buffer from `pool` may still be executing.
    unsafe fn release_command_pool(&self, pool: vk::CommandPool);

    /// # Safety
    /// The device must have been created with a queue in `queue_family`.
    unsafe fn device_queue(&self, queue_family: u32) -> vk::Queue;

    /// # Safety
    /// `queue` must be externally synchronized.
    unsafe fn wait_queue_idle(&self, queue: vk::Queue) -> Result<()>;

    /// # Safety
    /// `cmd` must be recording and both buffers must be valid.
    unsafe fn copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
}

impl CommandDevice for ash::Device {
    unsafe fn new_command_pool(&self, queue_family: u32) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        Ok(self.create_command_pool(&create_info, None)?)
    }

    unsafe fn allocate_primary(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(self.allocate_command_buffers(&alloc_info)?)
    }

    unsafe fn new_fence(&self, signaled: bool) -> Result<vk::Fence> {
        create_fence(self, signaled)
    }

    unsafe fn new_semaphore(&self) -> Result<vk::Semaphore> {
        create_semaphore(self)
    }

    unsafe fn begin_one_time(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.begin_command_buffer(cmd, &begin_info)?;
        Ok(())
    }

    unsafe fn end_and_submit(
        &self,
        queue: vk::Queue,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
        semaphore: Option<vk::Semaphore>,
    ) -> Result<()> {
        self.end_command_buffer(cmd)?;
        self.reset_fences(&[fence])?;

        let command_buffers = [cmd];
        let signal_semaphores: Vec<vk::Semaphore> = semaphore.into_iter().collect();
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        self.queue_submit(queue, &[submit_info], fence)?;
        Ok(())
    }

    unsafe fn release_sync_objects(&self, fences: &[vk::Fence], semaphores: &[vk::Semaphore]) {
        for &fence in fences {
            self.destroy_fence(fence, None);
        }
        for &semaphore in semaphores {
            self.destroy_semaphore(semaphore, None);
        }
    }

    unsafe fn release_command_pool(&self, pool: vk::CommandPool) {
        if let Err(e) = self.reset_command_pool(pool, vk::CommandPoolResetFlags::RELEASE_RESOURCES) {
            tracing::warn!("Failed to reset command pool: {e}");
        }
        self.destroy_command_pool(pool, None);
    }

    unsafe fn device_queue(&self, queue_family: u32) -> vk::Queue {
        self.get_device_queue(queue_family, 0)
    }

    unsafe fn wait_queue_idle(&self, queue: vk::Queue) -> Result<()> {
        self.queue_wait_idle(queue)?;
        Ok(())
    }

    unsafe fn copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.cmd_copy_buffer(cmd, src, dst, &[region]);
    }
}

/// A primary command buffer with a dedicated fence and semaphore.
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    fence: vk::Fence,
    semaphore: vk::Semaphore,
    recording: bool,
    submitted: bool,
    recycle: Weak<Mutex<VecDeque<CommandBuffer>>>,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("fence", &self.fence)
            .field("recording", &self.recording)
            .field("submitted", &self.submitted)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    fn new(
        handle: vk::CommandBuffer,
        fence: vk::Fence,
        semaphore: vk::Semaphore,
        recycle: Weak<Mutex<VecDeque<CommandBuffer>>>,
    ) -> Self {
        Self {
            handle,
            fence,
            semaphore,
            recording: false,
            submitted: false,
            recycle,
        }
    }

    /// Raw command buffer handle.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Fence signaled when the last submission completes.
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    /// Semaphore optionally signaled on submission.
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Begin one-time-submit recording.
    ///
    /// # Safety
    /// The device must be the one that allocated this buffer, and the buffer
    /// must not be pending execution.
    pub unsafe fn begin<D: CommandDevice + ?Sized>(&mut self, device: &D) -> Result<()> {
        if self.recording {
            return Err(GpuError::InvalidState(
                "Command buffer is already recording".to_string(),
            ));
        }

        device.begin_one_time(self.handle)?;

        self.mark_recording();
        Ok(())
    }

    /// End recording and submit to `queue`, returning the fence to wait on.
    ///
    /// # Safety
    /// The queue must belong to the device and be externally synchronized.
    pub unsafe fn submit<D: CommandDevice + ?Sized>(
        &mut self,
        device: &D,
        queue: vk::Queue,
        signal_semaphore: bool,
    ) -> Result<vk::Fence> {
        if !self.recording {
            return Err(GpuError::InvalidState(
                "Submitting a command buffer that is not recording".to_string(),
            ));
        }

        let semaphore = signal_semaphore.then_some(self.semaphore);
        device.end_and_submit(queue, self.handle, self.fence, semaphore)?;

        self.mark_submitted();
        Ok(self.fence)
    }

    /// Return the buffer to its pool. Call only after its fence has signaled,
    /// or when a submit failed and the buffer never reached the queue.
    ///
    /// The fence may be left unsignaled by a failed submit; it is reset before
    /// every submit, so the next user is unaffected. If the pool has already
    /// been destroyed the buffer is dropped.
    pub fn reset(mut self) {
        self.recording = false;
        self.submitted = false;
        if let Some(recycle) = self.recycle.upgrade() {
            recycle.lock().push_back(self);
        }
    }

    fn mark_recording(&mut self) {
        self.recording = true;
    }

    fn mark_submitted(&mut self) {
        self.recording = false;
        self.submitted = true;
    }
}

/// Command pool that allocates command buffers in batches and recycles them.
pub struct CommandPool<D: CommandDevice = ash::Device> {
    device: Arc<D>,
    pool: vk::CommandPool,
    queue_family: u32,
    batch_size: u32,
    fences: Vec<vk::Fence>,
    semaphores: Vec<vk::Semaphore>,
    available: RecycleQueue,
}

impl<D: CommandDevice> CommandPool<D> {
    /// Create a new command pool whose buffers can be reset individually.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(device: Arc<D>, queue_family: u32, batch_size: u32) -> Result<Self> {
        let pool = device.new_command_pool(queue_family)?;

        Ok(Self {
            device,
            pool,
            queue_family,
            batch_size: batch_size.max(1),
            fences: Vec::new(),
            semaphores: Vec::new(),
            available: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Total command buffers this pool has allocated.
    pub fn allocated(&self) -> usize {
        self.fences.len()
    }

    /// Buffers ready for reuse.
    pub fn available(&self) -> usize {
        self.available.lock().len()
    }

    /// Check out a buffer, allocating a new batch when none is available.
    pub fn acquire(&mut self) -> Result<CommandBuffer> {
        if let Some(buffer) = self.available.lock().pop_front() {
            return Ok(buffer);
        }

        self.allocate_batch()?;
        self.available
            .lock()
            .pop_front()
            .ok_or_else(|| GpuError::InvalidState("Command buffer batch was empty".to_string()))
    }

    fn allocate_batch(&mut self) -> Result<()> {
        let handles = unsafe { self.device.allocate_primary(self.pool, self.batch_size)? };

        tracing::debug!(
            queue_family = self.queue_family,
            count = handles.len(),
            "Allocated command buffer batch"
        );

        let mut available = self.available.lock();
        for handle in handles {
            let fence = unsafe { self.device.new_fence(true)? };
            self.fences.push(fence);
            let semaphore = unsafe { self.device.new_semaphore()? };
            self.semaphores.push(semaphore);

            available.push_back(CommandBuffer::new(
                handle,
                fence,
                semaphore,
                Arc::downgrade(&self.available),
            ));
        }

        Ok(())
    }

    /// Destroy every fence and semaphore, release the pool's memory and destroy it.
    ///
    /// # Safety
    /// No buffer from this pool may still be executing.
    pub unsafe fn destroy(&mut self) {
        self.available.lock().clear();

        self.device
            .release_sync_objects(&self.fences, &self.semaphores);
        self.fences.clear();
        self.semaphores.clear();

        self.device.release_command_pool(self.pool);
        self.pool = vk::CommandPool::null();
    }
}

/// Record a single buffer-to-buffer copy.
///
/// # Safety
/// `cmd` must be recording on `device`, and the buffers must be valid.
pub unsafe fn record_buffer_copy<D: CommandDevice + ?Sized>(
    device: &D,
    cmd: vk::CommandBuffer,
    src: vk::Buffer,
    src_offset: u64,
    dst: vk::Buffer,
    dst_offset: u64,
    size: u64,
) {
    let region = vk::BufferCopy::default()
        .src_offset(src_offset)
        .dst_offset(dst_offset)
        .size(size);
    device.copy_buffer(cmd, src, dst, region);
}

#[cfg(test)]
pub(crate) fn detached_buffer(id: u64, recycle: &Arc<Mutex<VecDeque<CommandBuffer>>>) -> CommandBuffer {
    use ash::vk::Handle;

    let mut buffer = CommandBuffer::new(
        vk::CommandBuffer::from_raw(id),
        vk::Fence::from_raw(id),
        vk::Semaphore::from_raw(id),
        Arc::downgrade(recycle),
    );
    buffer.mark_recording();
    buffer.mark_submitted();
    buffer
}


#[cfg(test)]
mod tests {
    use super::mock::RecordingDevice;
    use super::*;
    use ash::vk::Handle;

    fn pool(batch_size: u32) -> (Arc<RecordingDevice>, CommandPool<RecordingDevice>) {
        let device = Arc::new(RecordingDevice::default());
        let pool = unsafe { CommandPool::new(Arc::clone(&device), 0, batch_size) }.unwrap();
        (device, pool)
    }

    #[test]
    fn acquire_allocates_whole_batches() {
        let (device, mut pool) = pool(10);
        assert_eq!(pool.allocated(), 0);

        let first = pool.acquire().unwrap();
        assert_eq!(*device.batches.lock(), vec![10]);
        assert_eq!(pool.allocated(), 10);
        assert_eq!(pool.available(), 9);

        let mut held = vec![first];
        for _ in 0..9 {
            held.push(pool.acquire().unwrap());
        }
        assert_eq!(device.batches.lock().len(), 1);
        assert_eq!(pool.available(), 0);

        held.push(pool.acquire().unwrap());
        assert_eq!(*device.batches.lock(), vec![10, 10]);
        assert_eq!(pool.allocated(), 20);
        assert_eq!(pool.available(), 9);
    }

    #[test]
    fn recycled_buffers_are_reused_before_allocating() {
        let (device, mut pool) = pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let handle = a.handle();
        assert_eq!(pool.available(), 0);

        a.reset();
        let again = pool.acquire().unwrap();

        assert_eq!(again.handle(), handle);
        assert_eq!(device.batches.lock().len(), 1);
        drop(b);
    }

    #[test]
    fn begin_and_submit_go_through_the_device() {
        let (device, mut pool) = pool(1);
        let mut buffer = pool.acquire().unwrap();

        unsafe { buffer.begin(device.as_ref()) }.unwrap();
        assert!(unsafe { buffer.begin(device.as_ref()) }.is_err());

        let fence = unsafe { buffer.submit(device.as_ref(), vk::Queue::null(), false) }.unwrap();
        assert_eq!(fence, buffer.fence());
        assert!(buffer.is_submitted());
        assert_eq!(*device.submits.lock(), vec![(buffer.handle(), fence)]);

        assert!(unsafe { buffer.submit(device.as_ref(), vk::Queue::null(), false) }.is_err());
    }

    #[test]
    fn state_transitions() {
        let recycle: RecycleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let mut buffer = CommandBuffer::new(
            vk::CommandBuffer::from_raw(7),
            vk::Fence::from_raw(8),
            vk::Semaphore::from_raw(9),
            Arc::downgrade(&recycle),
        );
        assert!(!buffer.is_recording());
        assert!(!buffer.is_submitted());

        buffer.mark_recording();
        assert!(buffer.is_recording());

        buffer.mark_submitted();
        assert!(!buffer.is_recording());
        assert!(buffer.is_submitted());
    }

    #[test]
    fn reset_returns_buffer_to_pool() {
        let recycle: RecycleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let buffer = detached_buffer(3, &recycle);
        assert!(buffer.is_submitted());

        buffer.reset();

        let queue = recycle.lock();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].fence().as_raw(), 3);
        assert!(!queue[0].is_submitted());
        assert!(!queue[0].is_recording());
    }
}
