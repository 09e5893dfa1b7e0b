//! Buffer and image allocation.
//!
//! [`MemoryBackend`] is the seam between the memory manager and the allocator
//! library. [`GpuAllocator`] implements it over `gpu-allocator`.

use crate::error::{GpuError, Result};
use crate::memory_type::MemoryType;
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// Identifies a live buffer (the raw Vulkan handle value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

/// Identifies a live image (the raw Vulkan handle value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u64);

/// Persistent CPU mapping of a host-visible allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer refers to driver-owned memory that stays mapped for the
// lifetime of the allocation; access is serialized by the owning `Buffer`.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Parameters for a buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferRequest<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryType,
    pub name: &'a str,
}

/// A created buffer and its backing memory.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer {
    pub id: BufferId,
    pub handle: vk::Buffer,
    pub size: u64,
    pub mapped: Option<MappedPtr>,
}

/// Parameters for a 2D image allocation.
#[derive(Debug, Clone, Copy)]
pub struct ImageRequest {
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub memory: MemoryType,
}

impl ImageRequest {
    fn create_info(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(self.mip_levels.max(1))
            .array_layers(1)
            .format(self.format)
            .tiling(self.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(self.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
    }
}

/// A created image and its backing memory.
#[derive(Debug, Clone, Copy)]
pub struct RawImage {
    pub id: ImageId,
    pub handle: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    /// Bytes of device memory backing the image.
    pub size: u64,
}

/// Creates and destroys buffers and images.
pub trait MemoryBackend: Send {
    fn create_buffer(&mut self, request: &BufferRequest<'_>) -> Result<RawBuffer>;

    fn destroy_buffer(&mut self, id: BufferId) -> Result<()>;

    fn create_image(&mut self, request: &ImageRequest) -> Result<RawImage>;

    fn destroy_image(&mut self, id: ImageId) -> Result<()>;

    /// Release all remaining memory. Called once before the device is destroyed.
    fn shutdown(&mut self);
}

/// `gpu-allocator` backed implementation of [`MemoryBackend`].
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    buffers: HashMap<BufferId, (vk::Buffer, Allocation)>,
    images: HashMap<ImageId, (vk::Image, Allocation)>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            buffers: HashMap::new(),
            images: HashMap::new(),
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Allocate memory, pinned to the classified memory type when the
    /// resource can live there.
    fn allocate(
        &mut self,
        name: &str,
        mut requirements: vk::MemoryRequirements,
        memory: &MemoryType,
        linear: bool,
    ) -> Result<Allocation> {
        let pinned = 1u32 << memory.type_index;
        if requirements.memory_type_bits & pinned != 0 {
            requirements.memory_type_bits = pinned;
        } else {
            tracing::debug!(
                name,
                type_index = memory.type_index,
                "Resource cannot use the classified memory type, letting the allocator choose"
            );
        }

        self.allocator()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory.location(),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.allocator()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }
}

impl MemoryBackend for GpuAllocator {
    fn create_buffer(&mut self, request: &BufferRequest<'_>) -> Result<RawBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(request.size)
            .usage(request.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(request.name, requirements, &request.memory, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation)?;
            return Err(e.into());
        }

        let mapped = if request.memory.mappable() {
            allocation
                .mapped_ptr()
                .map(|p| MappedPtr::new(p.cast::<u8>()))
        } else {
            None
        };

        let id = BufferId(buffer.as_raw());
        self.buffers.insert(id, (buffer, allocation));

        Ok(RawBuffer {
            id,
            handle: buffer,
            size: request.size,
            mapped,
        })
    }

    fn destroy_buffer(&mut self, id: BufferId) -> Result<()> {
        let (buffer, allocation) = self
            .buffers
            .remove(&id)
            .ok_or(GpuError::UntrackedBuffer(id.0))?;

        self.free(allocation)?;
        unsafe { self.device.destroy_buffer(buffer, None) };
        Ok(())
    }

    fn create_image(&mut self, request: &ImageRequest) -> Result<RawImage> {
        let create_info = request.create_info();
        let image = unsafe { self.device.create_image(&create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let linear = request.tiling == vk::ImageTiling::LINEAR;
        let allocation = match self.allocate("image", requirements, &request.memory, linear) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation)?;
            return Err(e.into());
        }

        let id = ImageId(image.as_raw());
        self.images.insert(id, (image, allocation));

        Ok(RawImage {
            id,
            handle: image,
            format: request.format,
            extent: create_info.extent,
            size: requirements.size,
        })
    }

    fn destroy_image(&mut self, id: ImageId) -> Result<()> {
        let (image, allocation) = self
            .images
            .remove(&id)
            .ok_or(GpuError::UntrackedImage(id.0))?;

        self.free(allocation)?;
        unsafe { self.device.destroy_image(image, None) };
        Ok(())
    }

    fn shutdown(&mut self) {
        let buffers: Vec<BufferId> = self.buffers.keys().copied().collect();
        for id in buffers {
            if let Err(e) = self.destroy_buffer(id) {
                tracing::warn!("Failed to free buffer {:#x} on shutdown: {e}", id.0);
            }
        }
        let images: Vec<ImageId> = self.images.keys().copied().collect();
        for id in images {
            if let Err(e) = self.destroy_image(id) {
                tracing::warn!("Failed to free image {:#x} on shutdown: {e}", id.0);
            }
        }

        // Dropping the allocator frees its device memory blocks.
        self.allocator.take();
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        if self.allocator.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Host-memory backend for exercising the memory manager without a device.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct BackendLog {
        pub created: Vec<BufferId>,
        pub destroyed: Vec<BufferId>,
        pub destroyed_images: Vec<ImageId>,
    }

    pub struct HostBackend {
        next_id: u64,
        storage: HashMap<BufferId, Box<[u8]>>,
        images: HashMap<ImageId, u64>,
        pub log: Arc<Mutex<BackendLog>>,
        pub fail_allocations: bool,
    }

    impl HostBackend {
        pub fn new() -> (Self, Arc<Mutex<BackendLog>>) {
            let log = Arc::new(Mutex::new(BackendLog::default()));
            (
                Self {
                    next_id: 1,
                    storage: HashMap::new(),
                    images: HashMap::new(),
                    log: Arc::clone(&log),
                    fail_allocations: false,
                },
                log,
            )
        }

        fn next(&mut self) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }
    }

    impl MemoryBackend for HostBackend {
        fn create_buffer(&mut self, request: &BufferRequest<'_>) -> Result<RawBuffer> {
            if self.fail_allocations {
                return Err(GpuError::AllocationFailed("out of device memory".to_string()));
            }

            let id = BufferId(self.next());
            let mut storage = vec![0u8; request.size as usize].into_boxed_slice();
            let mapped = if request.memory.mappable() {
                NonNull::new(storage.as_mut_ptr()).map(MappedPtr::new)
            } else {
                None
            };
            self.storage.insert(id, storage);
            self.log.lock().created.push(id);

            Ok(RawBuffer {
                id,
                handle: vk::Buffer::from_raw(id.0),
                size: request.size,
                mapped,
            })
        }

        fn destroy_buffer(&mut self, id: BufferId) -> Result<()> {
            self.storage
                .remove(&id)
                .ok_or(GpuError::UntrackedBuffer(id.0))?;
            self.log.lock().destroyed.push(id);
            Ok(())
        }

        fn create_image(&mut self, request: &ImageRequest) -> Result<RawImage> {
            let id = ImageId(self.next());
            let size = u64::from(request.extent.width) * u64::from(request.extent.height) * 4;
            self.images.insert(id, size);
            Ok(RawImage {
                id,
                handle: vk::Image::from_raw(id.0),
                format: request.format,
                extent: vk::Extent3D {
                    width: request.extent.width,
                    height: request.extent.height,
                    depth: 1,
                },
                size,
            })
        }

        fn destroy_image(&mut self, id: ImageId) -> Result<()> {
            self.images
                .remove(&id)
                .ok_or(GpuError::UntrackedImage(id.0))?;
            self.log.lock().destroyed_images.push(id);
            Ok(())
        }

        fn shutdown(&mut self) {
            self.storage.clear();
            self.images.clear();
        }
    }
}
