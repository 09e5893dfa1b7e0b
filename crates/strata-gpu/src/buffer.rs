//! Growable GPU buffers and the fixed-size staging scratchpad.

use crate::allocator::{BufferId, MappedPtr, RawBuffer};
use crate::deferred::FreeInfo;
use crate::error::{GpuError, Result};
use crate::memory::MemoryManager;
use crate::memory_type::MemoryType;
use crate::sync::Synchronization;
use ash::vk;

/// An append-only buffer that grows on overflow.
///
/// Writes go through the persistent mapping when the memory type is mappable
/// and through the staged-transfer path otherwise. `used_bytes()` never
/// exceeds `size()`.
#[derive(Debug)]
pub struct Buffer {
    raw: RawBuffer,
    usage: vk::BufferUsageFlags,
    memory: MemoryType,
    used: u64,
    offset: u64,
}

impl Buffer {
    pub(crate) fn from_raw(raw: RawBuffer, usage: vk::BufferUsageFlags, memory: MemoryType) -> Self {
        Self {
            raw,
            usage,
            memory,
            used: 0,
            offset: 0,
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.raw.handle
    }

    pub fn id(&self) -> BufferId {
        self.raw.id
    }

    /// Allocated size in bytes.
    pub fn size(&self) -> u64 {
        self.raw.size
    }

    /// High-water mark of written bytes.
    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    /// Offset of the most recent write.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory
    }

    pub fn is_mapped(&self) -> bool {
        self.raw.mapped.is_some()
    }

    /// Snapshot used when scheduling this buffer for deletion.
    pub fn free_info(&self) -> FreeInfo {
        FreeInfo {
            id: self.raw.id,
            size: self.raw.size,
            category: self.memory.category(),
        }
    }

    /// Append `data`, growing the buffer if it does not fit. Returns the offset
    /// the data was written at.
    pub fn copy(&mut self, memory: &MemoryManager, data: &[u8]) -> Result<u64> {
        let len = data.len() as u64;
        if checked_end(self.used, data.len())? > self.raw.size {
            self.resize(memory, self.raw.size.saturating_add(len).saturating_mul(2))?;
        }

        let dst_offset = self.used;
        self.write(memory, dst_offset, data)?;
        self.offset = dst_offset;
        self.used = dst_offset + len;
        Ok(dst_offset)
    }

    /// Write `data` at `dst_offset`. The end of the write becomes the new
    /// high-water mark.
    pub fn copy_at(&mut self, memory: &MemoryManager, data: &[u8], dst_offset: u64) -> Result<()> {
        let end = checked_end(dst_offset, data.len())?;
        if end > self.raw.size {
            let grown = self
                .raw
                .size
                .saturating_add(data.len() as u64)
                .saturating_mul(2);
            self.resize(memory, grown.max(end))?;
        }

        self.write(memory, dst_offset, data)?;
        self.offset = dst_offset;
        self.used = end;
        Ok(())
    }

    /// Append a slice of plain-old-data values.
    pub fn copy_pod<T: bytemuck::Pod>(&mut self, memory: &MemoryManager, data: &[T]) -> Result<u64> {
        self.copy(memory, bytemuck::cast_slice(data))
    }

    /// Read `out.len()` bytes starting at `offset`.
    pub fn read(&self, memory: &MemoryManager, offset: u64, out: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, out.len())?;
        if end > self.raw.size {
            return Err(GpuError::InvalidState(format!(
                "Read of {}..{end} past the end of a {} byte buffer",
                offset, self.raw.size
            )));
        }

        match self.raw.mapped {
            Some(ptr) => {
                // SAFETY: the range was checked against the allocation size.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        ptr.as_ptr().add(offset as usize),
                        out.as_mut_ptr(),
                        out.len(),
                    );
                }
                Ok(())
            }
            None => memory.staged()?.read_back(self.raw.handle, offset, out),
        }
    }

    /// Read plain-old-data values starting at `offset`.
    pub fn read_pod<T: bytemuck::Pod>(
        &self,
        memory: &MemoryManager,
        offset: u64,
        out: &mut [T],
    ) -> Result<()> {
        self.read(memory, offset, bytemuck::cast_slice_mut(out))
    }

    /// Rewind the write cursor. Contents are left in place.
    pub fn reset(&mut self) {
        self.used = 0;
        self.offset = 0;
    }

    /// Hand the buffer to the frame ring. It is destroyed once the current
    /// frame slot comes around again.
    pub fn schedule_free(self, memory: &MemoryManager) -> Result<()> {
        memory.add_to_freeable(self.free_info())
    }

    fn write(&self, memory: &MemoryManager, dst_offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        match self.raw.mapped {
            Some(ptr) => {
                // SAFETY: callers grow the buffer so the write fits.
                unsafe { write_mapped(ptr, dst_offset, data) };
                Ok(())
            }
            None => memory.staged()?.upload(self.raw.handle, dst_offset, data),
        }
    }

    /// Move to a larger allocation, keeping bytes `0..used`. The old storage
    /// goes to the frame ring since in-flight frames may still read it.
    fn resize(&mut self, memory: &MemoryManager, new_size: u64) -> Result<()> {
        tracing::debug!(
            old = self.raw.size,
            new = new_size,
            used = self.used,
            "Resizing buffer"
        );

        let new = memory.allocate_buffer(new_size, self.usage, self.memory, "buffer")?;

        if self.used > 0 {
            let preserved = match (self.raw.mapped, new.mapped) {
                (Some(src), Some(dst)) => {
                    // SAFETY: both mappings cover at least `used` bytes.
                    unsafe {
                        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), self.used as usize);
                    }
                    Ok(())
                }
                _ => memory
                    .staged()
                    .and_then(|staged| staged.copy_immediate(self.raw.handle, new.handle, self.used)),
            };

            if let Err(e) = preserved {
                memory.destroy_buffer_now(new.id)?;
                return Err(e);
            }
        }

        memory.add_to_freeable(self.free_info())?;
        self.raw = new;
        Ok(())
    }
}

/// `offset + len`, or an error when the range does not fit in a `u64`.
fn checked_end(offset: u64, len: usize) -> Result<u64> {
    offset.checked_add(len as u64).ok_or_else(|| {
        GpuError::InvalidState(format!("Range of {len} bytes at offset {offset} overflows"))
    })
}

unsafe fn write_mapped(ptr: MappedPtr, offset: u64, data: &[u8]) {
    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset as usize), data.len());
}

/// Fixed-size host-visible upload scratchpad.
///
/// The staging buffer never grows. When a write does not fit, it waits for
/// every pending transfer through [`Synchronization`] and starts over at
/// offset zero.
#[derive(Debug)]
pub struct StagingBuffer {
    raw: RawBuffer,
    mapped: MappedPtr,
    used: u64,
}

impl StagingBuffer {
    /// Allocate a staging buffer of `capacity` bytes in host memory.
    pub fn new(memory: &MemoryManager, capacity: u64) -> Result<Self> {
        let host = memory.memory_types().host();
        let usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let raw = memory.allocate_buffer(capacity, usage, host, "staging")?;

        let Some(mapped) = raw.mapped else {
            memory.destroy_buffer_now(raw.id)?;
            return Err(GpuError::InvalidState(
                "Staging memory is not host visible".to_string(),
            ));
        };

        tracing::debug!(capacity = raw.size, "Created staging buffer");
        Ok(Self {
            raw,
            mapped,
            used: 0,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.raw.handle
    }

    pub fn id(&self) -> BufferId {
        self.raw.id
    }

    pub fn capacity(&self) -> u64 {
        self.raw.size
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    /// Append `data` and return its offset, flushing first if it does not fit.
    pub fn copy(&mut self, data: &[u8], sync: &Synchronization) -> Result<u64> {
        let offset = self.reserve(data.len() as u64, sync)?;
        // SAFETY: `reserve` guarantees offset + len <= capacity.
        unsafe { write_mapped(self.mapped, offset, data) };
        Ok(offset)
    }

    /// Reserve `len` bytes and return their offset, flushing first if they do
    /// not fit.
    pub fn reserve(&mut self, len: u64, sync: &Synchronization) -> Result<u64> {
        if len > self.raw.size {
            return Err(GpuError::InvalidState(format!(
                "{len} bytes do not fit in a {} byte staging buffer",
                self.raw.size
            )));
        }

        if self.used + len > self.raw.size {
            self.flush(sync)?;
        }

        let offset = self.used;
        self.used += len;
        Ok(offset)
    }

    /// Round the cursor up to a multiple of `alignment`. If that passes the
    /// end, flush and restart at zero.
    pub fn align(&mut self, alignment: u64, sync: &Synchronization) -> Result<()> {
        if alignment == 0 {
            return Ok(());
        }

        let aligned = self.used.next_multiple_of(alignment);
        if aligned > self.raw.size {
            self.flush(sync)?;
        } else {
            self.used = aligned;
        }
        Ok(())
    }

    /// Copy staged bytes back out.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        if checked_end(offset, out.len())? > self.raw.size {
            return Err(GpuError::InvalidState(
                "Staging read out of bounds".to_string(),
            ));
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapped.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                out.len(),
            );
        }
        Ok(())
    }

    /// Wait for every pending transfer and rewind.
    pub fn flush(&mut self, sync: &Synchronization) -> Result<()> {
        tracing::trace!(used = self.used, "Flushing staging buffer");
        sync.wait_fences()?;
        self.used = 0;
        Ok(())
    }

    /// Destroy the staging buffer immediately.
    pub fn destroy(self, memory: &MemoryManager) -> Result<()> {
        memory.destroy_buffer_now(self.raw.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::manager;
    use crate::sync::mock::RecordingWaiter;
    use crate::upload::StagedTransfer;
    use ash::vk::Handle;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Device memory simulated on the host, keyed by buffer handle.
    #[derive(Default)]
    struct HostTransfer {
        memory: Mutex<HashMap<vk::Buffer, Vec<u8>>>,
    }

    impl HostTransfer {
        fn region(memory: &mut HashMap<vk::Buffer, Vec<u8>>, buffer: vk::Buffer, end: usize) -> &mut Vec<u8> {
            let bytes = memory.entry(buffer).or_default();
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            bytes
        }
    }

    impl StagedTransfer for HostTransfer {
        fn upload(&self, dst: vk::Buffer, dst_offset: u64, data: &[u8]) -> Result<()> {
            let start = dst_offset as usize;
            let mut memory = self.memory.lock();
            Self::region(&mut memory, dst, start + data.len())[start..start + data.len()]
                .copy_from_slice(data);
            Ok(())
        }

        fn copy_immediate(&self, src: vk::Buffer, dst: vk::Buffer, size: u64) -> Result<()> {
            let mut memory = self.memory.lock();
            let bytes = Self::region(&mut memory, src, size as usize)[..size as usize].to_vec();
            Self::region(&mut memory, dst, size as usize)[..size as usize].copy_from_slice(&bytes);
            Ok(())
        }

        fn read_back(&self, src: vk::Buffer, src_offset: u64, out: &mut [u8]) -> Result<()> {
            let start = src_offset as usize;
            let mut memory = self.memory.lock();
            out.copy_from_slice(&Self::region(&mut memory, src, start + out.len())[start..start + out.len()]);
            Ok(())
        }
    }

    fn sync_with_pending_fence() -> (Synchronization, Arc<RecordingWaiter>) {
        let waiter = Arc::new(RecordingWaiter::default());
        let sync = Synchronization::new(waiter.clone(), 8);
        sync.add_fence(vk::Fence::from_raw(1)).unwrap();
        (sync, waiter)
    }

    #[test]
    fn resize_preserves_previous_bytes() {
        let (memory, _log) = manager(2);
        let mut buffer = memory
            .create_host_buffer(8, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        let old_id = buffer.id();

        let first: Vec<u8> = (1..=6).collect();
        buffer.copy(&memory, &first).unwrap();
        let offset = buffer.copy(&memory, &[42; 10]).unwrap();

        assert_eq!(offset, 6);
        assert_eq!(buffer.size(), (8 + 10) * 2);
        assert_eq!(buffer.used_bytes(), 16);
        assert_ne!(buffer.id(), old_id);

        let mut out = [0u8; 16];
        buffer.read(&memory, 0, &mut out).unwrap();
        assert_eq!(&out[..6], first.as_slice());
        assert_eq!(&out[6..], &[42; 10]);

        // The old storage waits in the frame ring.
        assert!(memory.is_live(old_id));
        memory.init_frame(1).unwrap();
        memory.init_frame(0).unwrap();
        assert!(!memory.is_live(old_id));
    }

    #[test]
    fn used_never_exceeds_size() {
        let (memory, _log) = manager(2);
        let mut buffer = memory
            .create_host_buffer(1, vk::BufferUsageFlags::empty())
            .unwrap();

        for len in [1usize, 3, 0, 17, 2, 64, 5] {
            buffer.copy(&memory, &vec![7u8; len]).unwrap();
            assert!(buffer.used_bytes() <= buffer.size());
        }
        buffer.copy_at(&memory, &[1, 2, 3], buffer.size() + 40).unwrap();
        assert!(buffer.used_bytes() <= buffer.size());
    }

    #[test]
    fn copy_at_sets_high_water_mark() {
        let (memory, _log) = manager(2);
        let mut buffer = memory
            .create_host_buffer(64, vk::BufferUsageFlags::empty())
            .unwrap();

        buffer.copy(&memory, &[1; 32]).unwrap();
        buffer.copy_at(&memory, &[9; 4], 8).unwrap();

        assert_eq!(buffer.offset(), 8);
        assert_eq!(buffer.used_bytes(), 12);
        let next = buffer.copy(&memory, &[5; 2]).unwrap();
        assert_eq!(next, 12);
    }

    #[test]
    fn pod_round_trip() {
        let (memory, _log) = manager(2);
        let mut buffer = memory
            .create_host_buffer(4, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();

        let values = [1.5f32, -2.0, 8.25];
        let offset = buffer.copy_pod(&memory, &values).unwrap();

        let mut out = [0f32; 3];
        buffer.read_pod(&memory, offset, &mut out).unwrap();
        assert_eq!(out, values);
    }

    #[test]
    fn device_local_writes_go_through_staging() {
        let (memory, _log) = manager(2);
        memory
            .set_staged_transfer(Arc::new(HostTransfer::default()))
            .unwrap();
        let mut buffer = memory
            .create_gpu_buffer(4, vk::BufferUsageFlags::INDEX_BUFFER)
            .unwrap();
        assert!(!buffer.is_mapped());

        buffer.copy(&memory, &[1, 2, 3]).unwrap();
        buffer.copy(&memory, &[4, 5, 6]).unwrap();
        assert_eq!(buffer.size(), (4 + 3) * 2);

        let mut out = [0u8; 6];
        buffer.read(&memory, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn device_local_without_staging_is_an_error() {
        let (memory, _log) = manager(2);
        let mut buffer = memory
            .create_gpu_buffer(4, vk::BufferUsageFlags::empty())
            .unwrap();

        assert!(matches!(
            buffer.copy(&memory, &[1]),
            Err(GpuError::InvalidState(_))
        ));
    }

    #[test]
    fn read_past_end_is_rejected() {
        let (memory, _log) = manager(2);
        let buffer = memory
            .create_host_buffer(4, vk::BufferUsageFlags::empty())
            .unwrap();

        let mut out = [0u8; 8];
        assert!(buffer.read(&memory, 0, &mut out).is_err());
    }

    #[test]
    fn overflowing_offsets_are_rejected() {
        let (memory, _log) = manager(2);
        let mut buffer = memory
            .create_host_buffer(4, vk::BufferUsageFlags::empty())
            .unwrap();
        let staging = StagingBuffer::new(&memory, 16).unwrap();

        let mut out = [0u8; 2];
        assert!(matches!(
            buffer.read(&memory, u64::MAX, &mut out),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            buffer.copy_at(&memory, &[1, 2], u64::MAX - 1),
            Err(GpuError::InvalidState(_))
        ));
        assert!(matches!(
            staging.read(u64::MAX, &mut out),
            Err(GpuError::InvalidState(_))
        ));
        assert_eq!(buffer.used_bytes(), 0);
    }

    #[test]
    fn staging_overflow_flushes_exactly_once() {
        let (memory, _log) = manager(2);
        let (sync, waiter) = sync_with_pending_fence();
        let mut staging = StagingBuffer::new(&memory, 16).unwrap();

        assert_eq!(staging.copy(&[1; 10], &sync).unwrap(), 0);
        assert_eq!(waiter.wait_count(), 0);

        let offset = staging.copy(&[2; 10], &sync).unwrap();

        assert_eq!(waiter.wait_count(), 1);
        assert_eq!(offset, 0);
        assert_eq!(staging.used_bytes(), 10);
        assert_eq!(staging.capacity(), 16);

        let mut out = [0u8; 10];
        staging.read(0, &mut out).unwrap();
        assert_eq!(out, [2; 10]);
    }

    #[test]
    fn staging_rejects_oversized_writes() {
        let (memory, _log) = manager(2);
        let (sync, waiter) = sync_with_pending_fence();
        let mut staging = StagingBuffer::new(&memory, 16).unwrap();

        assert!(staging.copy(&[0; 17], &sync).is_err());
        assert_eq!(waiter.wait_count(), 0);
        assert_eq!(staging.used_bytes(), 0);
    }

    #[test]
    fn staging_align() {
        let (memory, _log) = manager(2);
        let (sync, waiter) = sync_with_pending_fence();
        let mut staging = StagingBuffer::new(&memory, 32).unwrap();

        staging.align(0, &sync).unwrap();
        assert_eq!(staging.used_bytes(), 0);

        staging.copy(&[1; 8], &sync).unwrap();
        staging.align(4, &sync).unwrap();
        assert_eq!(staging.used_bytes(), 8);

        staging.copy(&[1; 3], &sync).unwrap();
        staging.align(4, &sync).unwrap();
        assert_eq!(staging.used_bytes(), 12);

        staging.align(64, &sync).unwrap();
        assert_eq!(staging.used_bytes(), 0);
        assert_eq!(waiter.wait_count(), 1);
    }

    #[test]
    fn staging_destroy_releases_memory() {
        let (memory, log) = manager(2);
        let staging = StagingBuffer::new(&memory, 16).unwrap();
        let id = staging.id();

        staging.destroy(&memory).unwrap();
        assert_eq!(log.lock().destroyed, vec![id]);
        assert_eq!(memory.stats().usage.host_local, 0);
    }
}
