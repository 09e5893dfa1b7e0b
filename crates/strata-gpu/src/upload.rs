//! Staged transfers for memory the CPU cannot map.

use crate::buffer::StagingBuffer;
use crate::error::{GpuError, Result};
use crate::memory::MemoryManager;
use crate::queue::TransferQueue;
use crate::sync::Synchronization;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Moves bytes in and out of device-local buffers.
pub trait StagedTransfer: Send + Sync {
    /// Copy `data` into `dst` at `dst_offset`. The copy may still be in
    /// flight when this returns.
    fn upload(&self, dst: vk::Buffer, dst_offset: u64, data: &[u8]) -> Result<()>;

    /// Copy the first `size` bytes of `src` into `dst` and wait for it.
    fn copy_immediate(&self, src: vk::Buffer, dst: vk::Buffer, size: u64) -> Result<()>;

    /// Read `out.len()` bytes of `src` starting at `src_offset`.
    fn read_back(&self, src: vk::Buffer, src_offset: u64, out: &mut [u8]) -> Result<()>;
}

/// Split `total` bytes into `(offset, len)` pieces of at most `capacity`.
fn chunks(total: u64, capacity: u64) -> impl Iterator<Item = (u64, u64)> {
    let capacity = capacity.max(1);
    (0..total.div_ceil(capacity)).map(move |i| {
        let offset = i * capacity;
        (offset, capacity.min(total - offset))
    })
}

/// [`StagedTransfer`] over a [`StagingBuffer`] and the transfer queue.
pub struct Uploader {
    staging: Mutex<Option<StagingBuffer>>,
    transfer: Arc<TransferQueue>,
    sync: Arc<Synchronization>,
}

impl Uploader {
    pub fn new(
        staging: StagingBuffer,
        transfer: Arc<TransferQueue>,
        sync: Arc<Synchronization>,
    ) -> Self {
        Self {
            staging: Mutex::new(Some(staging)),
            transfer,
            sync,
        }
    }

    fn with_staging<R>(&self, f: impl FnOnce(&mut StagingBuffer) -> Result<R>) -> Result<R> {
        let mut staging = self.staging.lock();
        let staging = staging
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Staging buffer destroyed".to_string()))?;
        f(staging)
    }

    /// Destroy the staging buffer. Later transfers fail.
    pub fn destroy(&self, memory: &MemoryManager) -> Result<()> {
        match self.staging.lock().take() {
            Some(staging) => staging.destroy(memory),
            None => Ok(()),
        }
    }
}

impl StagedTransfer for Uploader {
    fn upload(&self, dst: vk::Buffer, dst_offset: u64, data: &[u8]) -> Result<()> {
        self.with_staging(|staging| {
            for (offset, len) in chunks(data.len() as u64, staging.capacity()) {
                let bytes = &data[offset as usize..(offset + len) as usize];
                let src_offset = staging.copy(bytes, &self.sync)?;
                self.transfer.copy_buffer_cmd(
                    staging.handle(),
                    src_offset,
                    dst,
                    dst_offset + offset,
                    len,
                    &self.sync,
                )?;
            }
            Ok(())
        })
    }

    fn copy_immediate(&self, src: vk::Buffer, dst: vk::Buffer, size: u64) -> Result<()> {
        // Pending uploads into `src` must land first.
        self.sync.wait_fences()?;
        self.transfer.upload_buffer_immediate(src, 0, dst, 0, size)
    }

    fn read_back(&self, src: vk::Buffer, src_offset: u64, out: &mut [u8]) -> Result<()> {
        self.sync.wait_fences()?;
        self.with_staging(|staging| {
            for (offset, len) in chunks(out.len() as u64, staging.capacity()) {
                let staged = staging.reserve(len, &self.sync)?;
                self.transfer.upload_buffer_immediate(
                    src,
                    src_offset + offset,
                    staging.handle(),
                    staged,
                    len,
                )?;
                staging.read(staged, &mut out[offset as usize..(offset + len) as usize])?;
            }
            Ok(())
        })
    }
}
