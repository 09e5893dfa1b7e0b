//! Device queues and their command submission helpers.

use crate::command::{record_buffer_copy, CommandBuffer, CommandDevice, CommandPool};
use crate::error::{GpuError, Result};
use crate::queue_family::QueueFamilyIndices;
use crate::sync::Synchronization;
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A device queue with an optional command pool.
///
/// Queues that share a family share one native queue, so they also share the
/// submit lock.
pub struct Queue<D: CommandDevice = ash::Device> {
    device: Arc<D>,
    handle: vk::Queue,
    family: u32,
    pool: Option<Mutex<CommandPool<D>>>,
    submit_lock: Arc<Mutex<()>>,
}

impl<D: CommandDevice> Queue<D> {
    /// Fetch queue 0 of `family`, creating a command pool when `batch_size` is set.
    ///
    /// # Safety
    /// The device must have been created with a queue in `family`.
    pub unsafe fn new(
        device: Arc<D>,
        family: u32,
        batch_size: Option<u32>,
        submit_lock: Arc<Mutex<()>>,
    ) -> Result<Self> {
        let handle = device.device_queue(family);
        let pool = match batch_size {
            Some(batch_size) => Some(Mutex::new(CommandPool::new(
                Arc::clone(&device),
                family,
                batch_size,
            )?)),
            None => None,
        };

        Ok(Self {
            device,
            handle,
            family,
            pool,
            submit_lock,
        })
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Command buffers sitting in the pool ready for reuse.
    pub fn idle_command_buffers(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.lock().available())
    }

    /// Check out a command buffer and begin recording.
    pub fn begin_commands(&self) -> Result<CommandBuffer> {
        let pool = self.pool.as_ref().ok_or_else(|| {
            GpuError::InvalidState(format!(
                "Queue family {} has no command pool",
                self.family
            ))
        })?;

        let mut command_buffer = pool.lock().acquire()?;
        if let Err(e) = unsafe { command_buffer.begin(self.device.as_ref()) } {
            command_buffer.reset();
            return Err(e);
        }
        Ok(command_buffer)
    }

    /// End recording and submit. Returns the fence signaled on completion.
    pub fn submit_commands(
        &self,
        command_buffer: &mut CommandBuffer,
        signal_semaphore: bool,
    ) -> Result<vk::Fence> {
        let _guard = self.submit_lock.lock();
        unsafe { command_buffer.submit(self.device.as_ref(), self.handle, signal_semaphore) }
    }

    /// Submit an owned buffer. On failure the buffer never reached the queue
    /// and goes straight back to the pool.
    fn submit_owned(
        &self,
        mut command_buffer: CommandBuffer,
        signal_semaphore: bool,
    ) -> Result<(vk::Fence, CommandBuffer)> {
        match self.submit_commands(&mut command_buffer, signal_semaphore) {
            Ok(fence) => Ok((fence, command_buffer)),
            Err(e) => {
                command_buffer.reset();
                Err(e)
            }
        }
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.submit_lock.lock();
        unsafe { self.device.wait_queue_idle(self.handle) }
    }

    /// Destroy the command pool, if any.
    ///
    /// # Safety
    /// No command buffer from this queue may still be executing.
    pub unsafe fn destroy(&self) {
        if let Some(pool) = &self.pool {
            pool.lock().destroy();
        }
    }
}

/// Queue used for buffer-to-buffer copies.
pub struct TransferQueue<D: CommandDevice = ash::Device> {
    queue: Queue<D>,
}

impl<D: CommandDevice> TransferQueue<D> {
    pub fn new(queue: Queue<D>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Queue<D> {
        &self.queue
    }

    /// Record and submit one copy without waiting. The command buffer is parked
    /// in `sync` and the returned fence signals when the copy is done.
    pub fn copy_buffer_cmd(
        &self,
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
        sync: &Synchronization,
    ) -> Result<vk::Fence> {
        let command_buffer = self.queue.begin_commands()?;
        unsafe {
            self.record_copy(command_buffer.handle(), src, src_offset, dst, dst_offset, size);
        }
        let (fence, command_buffer) = self.queue.submit_owned(command_buffer, false)?;
        sync.add_command_buffer(command_buffer)?;
        Ok(fence)
    }

    /// Record and submit one copy, blocking until it completes.
    pub fn upload_buffer_immediate(
        &self,
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let command_buffer = self.queue.begin_commands()?;
        unsafe {
            self.record_copy(command_buffer.handle(), src, src_offset, dst, dst_offset, size);
        }
        let (fence, command_buffer) = self.queue.submit_owned(command_buffer, false)?;

        let waited = Synchronization::wait_fence(self.queue.device(), fence);
        if waited.is_err() {
            // Idle the queue before the buffer can be checked out again.
            if let Err(e) = self.queue.wait_idle() {
                tracing::warn!("Failed to idle transfer queue after a failed wait: {e}");
            }
        }
        command_buffer.reset();
        waited
    }

    /// Record a copy into a caller-owned command buffer.
    ///
    /// # Safety
    /// `cmd` must be recording and the buffers must be valid.
    pub unsafe fn record_copy(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        src_offset: u64,
        dst: vk::Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        record_buffer_copy(
            self.queue.device(),
            cmd,
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        );
    }
}

/// Where graphics commands should be recorded.
pub enum RecordTarget {
    /// The open frame batch. Submitted by [`GraphicsQueue::end_recording_and_submit`].
    Batch(vk::CommandBuffer),
    /// A buffer checked out for this call only.
    Standalone(CommandBuffer),
}

impl RecordTarget {
    pub fn handle(&self) -> vk::CommandBuffer {
        match self {
            Self::Batch(handle) => *handle,
            Self::Standalone(command_buffer) => command_buffer.handle(),
        }
    }
}

/// Graphics queue with an optional open batch that collects a frame's commands.
pub struct GraphicsQueue<D: CommandDevice = ash::Device> {
    queue: Queue<D>,
    batch: Mutex<Option<CommandBuffer>>,
}

impl<D: CommandDevice> GraphicsQueue<D> {
    pub fn new(queue: Queue<D>) -> Self {
        Self {
            queue,
            batch: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Queue<D> {
        &self.queue
    }

    pub fn is_recording(&self) -> bool {
        self.batch.lock().is_some()
    }

    /// Open the frame batch.
    pub fn start_recording(&self) -> Result<()> {
        let mut batch = self.batch.lock();
        if batch.is_some() {
            return Err(GpuError::InvalidState(
                "Graphics batch is already recording".to_string(),
            ));
        }
        *batch = Some(self.queue.begin_commands()?);
        Ok(())
    }

    /// Close and submit the frame batch.
    pub fn end_recording_and_submit(&self, sync: &Synchronization) -> Result<vk::Fence> {
        let command_buffer = self.batch.lock().take().ok_or_else(|| {
            GpuError::InvalidState("No graphics batch is recording".to_string())
        })?;

        let (fence, command_buffer) = self.queue.submit_owned(command_buffer, false)?;
        sync.add_command_buffer(command_buffer)?;
        Ok(fence)
    }

    /// The open batch, or a fresh recording buffer when no batch is open.
    pub fn command_buffer(&self) -> Result<RecordTarget> {
        if let Some(command_buffer) = self.batch.lock().as_ref() {
            return Ok(RecordTarget::Batch(command_buffer.handle()));
        }
        Ok(RecordTarget::Standalone(self.queue.begin_commands()?))
    }

    /// Submit `target` if it is standalone. Batch targets return a null fence
    /// since the batch is submitted later.
    pub fn end_if_needed(&self, target: RecordTarget, sync: &Synchronization) -> Result<vk::Fence> {
        match target {
            RecordTarget::Batch(_) => Ok(vk::Fence::null()),
            RecordTarget::Standalone(command_buffer) => {
                let (fence, command_buffer) = self.queue.submit_owned(command_buffer, false)?;
                sync.add_command_buffer(command_buffer)?;
                Ok(fence)
            }
        }
    }

    /// Record with `f` into the open batch or a standalone buffer.
    pub fn record<F>(&self, sync: &Synchronization, f: F) -> Result<vk::Fence>
    where
        F: FnOnce(&D, vk::CommandBuffer),
    {
        let target = self.command_buffer()?;
        f(self.queue.device(), target.handle());
        self.end_if_needed(target, sync)
    }
}

/// Every queue the context uses.
pub struct Queues<D: CommandDevice = ash::Device> {
    pub graphics: GraphicsQueue<D>,
    pub present: Queue<D>,
    pub transfer: Arc<TransferQueue<D>>,
    pub compute: Queue<D>,
}

impl<D: CommandDevice> Queues<D> {
    /// Fetch a queue for each role. Graphics, transfer and compute get command
    /// pools; present does not.
    ///
    /// # Safety
    /// The device must have been created with a queue in every family of `indices`.
    pub unsafe fn new(
        device: &Arc<D>,
        indices: &QueueFamilyIndices,
        batch_size: u32,
    ) -> Result<Self> {
        let mut locks: HashMap<u32, Arc<Mutex<()>>> = HashMap::new();
        let mut lock_for = |family: u32| Arc::clone(locks.entry(family).or_default());

        let graphics = Queue::new(
            Arc::clone(device),
            indices.graphics,
            Some(batch_size),
            lock_for(indices.graphics),
        )?;
        let present = Queue::new(
            Arc::clone(device),
            indices.present,
            None,
            lock_for(indices.present),
        )?;
        let transfer = Queue::new(
            Arc::clone(device),
            indices.transfer,
            Some(batch_size),
            lock_for(indices.transfer),
        )?;
        let compute = Queue::new(
            Arc::clone(device),
            indices.compute,
            Some(batch_size),
            lock_for(indices.compute),
        )?;

        tracing::debug!(
            graphics = indices.graphics,
            present = indices.present,
            transfer = indices.transfer,
            compute = indices.compute,
            "Created queues"
        );

        Ok(Self {
            graphics: GraphicsQueue::new(graphics),
            present,
            transfer: Arc::new(TransferQueue::new(transfer)),
            compute,
        })
    }

    /// Destroy every command pool.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&self) {
        self.graphics.queue().destroy();
        self.present.destroy();
        self.transfer.queue().destroy();
        self.compute.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::RecordingDevice;
    use crate::sync::mock::RecordingWaiter;
    use ash::vk::Handle;
    use std::sync::atomic::Ordering;

    fn queue(device: &Arc<RecordingDevice>) -> Queue<RecordingDevice> {
        unsafe { Queue::new(Arc::clone(device), 2, Some(4), Arc::default()) }.unwrap()
    }

    fn sync() -> Synchronization {
        Synchronization::new(Arc::new(RecordingWaiter::default()), 8)
    }

    #[test]
    fn present_queue_has_no_pool() {
        let device = Arc::new(RecordingDevice::default());
        let present =
            unsafe { Queue::new(Arc::clone(&device), 1, None, Arc::default()) }.unwrap();

        assert_eq!(present.handle().as_raw(), 0x1001);
        assert!(matches!(
            present.begin_commands(),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn batch_target_is_not_submitted() {
        let device = Arc::new(RecordingDevice::default());
        let graphics = GraphicsQueue::new(queue(&device));
        let sync = sync();

        graphics.start_recording().unwrap();
        assert!(graphics.start_recording().is_err());

        let target = graphics.command_buffer().unwrap();
        assert!(matches!(target, RecordTarget::Batch(_)));
        let fence = graphics.end_if_needed(target, &sync).unwrap();

        assert_eq!(fence, vk::Fence::null());
        assert!(device.submits.lock().is_empty());
        assert!(graphics.is_recording());

        let fence = graphics.end_recording_and_submit(&sync).unwrap();
        assert_ne!(fence, vk::Fence::null());
        assert_eq!(device.submits.lock().len(), 1);
        assert_eq!(sync.pending_command_buffers(), 1);
        assert!(!graphics.is_recording());
    }

    #[test]
    fn standalone_target_is_submitted_and_tracked() {
        let device = Arc::new(RecordingDevice::default());
        let graphics = GraphicsQueue::new(queue(&device));
        let sync = sync();

        let mut recorded = None;
        let fence = graphics
            .record(&sync, |_, cmd| recorded = Some(cmd))
            .unwrap();

        let submits = device.submits.lock();
        assert_eq!(submits.len(), 1);
        assert_eq!(Some(submits[0].0), recorded);
        assert_eq!(submits[0].1, fence);
        assert_eq!(sync.pending_fences(), 1);
        assert_eq!(sync.pending_command_buffers(), 1);
    }

    #[test]
    fn copy_is_recorded_and_parked_in_sync() {
        let device = Arc::new(RecordingDevice::default());
        let transfer = TransferQueue::new(queue(&device));
        let sync = sync();

        let fence = transfer
            .copy_buffer_cmd(
                vk::Buffer::from_raw(1),
                16,
                vk::Buffer::from_raw(2),
                32,
                64,
                &sync,
            )
            .unwrap();

        let copies = device.copies.lock();
        assert_eq!(copies.len(), 1);
        assert_eq!(
            (copies[0].src_offset, copies[0].dst_offset, copies[0].size),
            (16, 32, 64)
        );
        assert_eq!(device.submits.lock()[0].1, fence);
        assert_eq!(sync.pending_command_buffers(), 1);
        assert_eq!(transfer.queue().idle_command_buffers(), 3);
    }

    #[test]
    fn failed_submit_returns_buffer_to_pool() {
        let device = Arc::new(RecordingDevice::default());
        let transfer = TransferQueue::new(queue(&device));
        let sync = sync();
        device.fail_submit.store(true, Ordering::Relaxed);

        let result = transfer.copy_buffer_cmd(
            vk::Buffer::from_raw(1),
            0,
            vk::Buffer::from_raw(2),
            0,
            8,
            &sync,
        );

        assert!(matches!(result, Err(GpuError::Vulkan(_))));
        assert_eq!(sync.pending_command_buffers(), 0);
        assert_eq!(transfer.queue().idle_command_buffers(), 4);

        device.fail_submit.store(false, Ordering::Relaxed);
        let buffer = transfer.queue().begin_commands().unwrap();
        assert!(buffer.is_recording());
    }

    #[test]
    fn immediate_upload_waits_and_recycles() {
        let device = Arc::new(RecordingDevice::default());
        let transfer = TransferQueue::new(queue(&device));

        transfer
            .upload_buffer_immediate(vk::Buffer::from_raw(1), 0, vk::Buffer::from_raw(2), 0, 8)
            .unwrap();

        let fence = device.submits.lock()[0].1;
        assert_eq!(*device.waits.lock(), vec![vec![fence]]);
        assert_eq!(transfer.queue().idle_command_buffers(), 4);
    }

    #[test]
    fn failed_immediate_wait_idles_queue_and_recycles() {
        let device = Arc::new(RecordingDevice::default());
        let transfer = TransferQueue::new(queue(&device));
        device.fail_wait.store(true, Ordering::Relaxed);

        let result = transfer.upload_buffer_immediate(
            vk::Buffer::from_raw(1),
            0,
            vk::Buffer::from_raw(2),
            0,
            8,
        );

        assert!(result.is_err());
        assert_eq!(device.idle_waits.load(Ordering::Relaxed), 1);
        assert_eq!(transfer.queue().idle_command_buffers(), 4);
    }

    #[test]
    fn shared_family_shares_submit_lock() {
        let device = Arc::new(RecordingDevice::default());
        let indices = QueueFamilyIndices {
            graphics: 0,
            present: 0,
            transfer: 1,
            compute: 0,
        };

        let queues = unsafe { Queues::new(&device, &indices, 2) }.unwrap();

        assert!(Arc::ptr_eq(
            &queues.graphics.queue().submit_lock,
            &queues.compute.submit_lock
        ));
        assert!(Arc::ptr_eq(
            &queues.graphics.queue().submit_lock,
            &queues.present.submit_lock
        ));
        assert!(!Arc::ptr_eq(
            &queues.graphics.queue().submit_lock,
            &queues.transfer.queue().submit_lock
        ));
    }
}
