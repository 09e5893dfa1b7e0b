//! GPU context management.

use crate::allocator::GpuAllocator;
use crate::buffer::StagingBuffer;
use crate::capabilities::DeviceInfo;
use crate::config::GpuConfig;
use crate::device::{
    available_devices_report, create_logical_device, enumerate_devices, find_depth_format,
    required_device_extensions, select_device,
};
use crate::error::{GpuError, Result};
use crate::instance::{check_instance_version, create_instance, DebugMessenger};
use crate::memory::MemoryManager;
use crate::memory_type::MemoryTypes;
use crate::queue::{GraphicsQueue, Queues, TransferQueue};
use crate::queue_family::QueueFamilyIndices;
use crate::surface::SurfaceContext;
use crate::sync::{FenceWaiter, Synchronization};
use crate::upload::Uploader;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::c_char;
use std::sync::Arc;

/// Instance-level objects. Dropped after everything created from the device.
struct InstanceContext {
    // Entry must be kept alive for the lifetime of the instance
    entry: ash::Entry,
    instance: ash::Instance,
    messenger: Option<DebugMessenger>,
    surface: Option<SurfaceContext>,
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            if let Some(surface) = &self.surface {
                surface.destroy();
            }
            if let Some(messenger) = &self.messenger {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Everything created from the logical device.
struct DeviceResources {
    queues: Queues,
    sync: Arc<Synchronization>,
    memory: Arc<MemoryManager>,
    uploader: Arc<Uploader>,
    depth_format: vk::Format,
}

/// Main GPU context holding Vulkan resources.
///
/// Replaces any global device or memory state: every component reachable
/// from here was created by this context and is torn down with it.
pub struct GpuContext {
    config: GpuConfig,
    device_info: DeviceInfo,
    device: Arc<ash::Device>,
    queue_families: QueueFamilyIndices,
    queues: Queues,
    sync: Arc<Synchronization>,
    memory: Arc<MemoryManager>,
    uploader: Arc<Uploader>,
    can_set_line_width: bool,
    depth_format: vk::Format,
    // Declared last so it is dropped after the device.
    instance: InstanceContext,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.device_info.handle
    }

    /// Description of the selected adapter.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn queue_families(&self) -> &QueueFamilyIndices {
        &self.queue_families
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    pub fn graphics_queue(&self) -> &GraphicsQueue {
        &self.queues.graphics
    }

    pub fn transfer_queue(&self) -> &Arc<TransferQueue> {
        &self.queues.transfer
    }

    /// The shared in-flight fence batch.
    pub fn synchronization(&self) -> &Arc<Synchronization> {
        &self.sync
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// The staged transfer path used for device-local buffers.
    pub fn uploader(&self) -> &Arc<Uploader> {
        &self.uploader
    }

    /// The surface, when built for a window.
    pub fn surface(&self) -> Option<&SurfaceContext> {
        self.instance.surface.as_ref()
    }

    /// Wide lines were enabled on the device.
    pub fn can_set_line_width(&self) -> bool {
        self.can_set_line_width
    }

    /// Depth attachment format chosen for this device.
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Begin `frame`, releasing resources scheduled for deletion the last time
    /// it was current. Call once per frame before recording.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn init_frame(&self, frame: usize) -> Result<()> {
        self.memory.init_frame(frame)
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }

        if let Err(e) = self.sync.wait_fences() {
            tracing::error!("Failed to wait for pending fences: {e}");
        }
        if let Err(e) = self.memory.free_all() {
            tracing::error!("Failed to free deferred resources: {e}");
        }
        if let Err(e) = self.uploader.destroy(&self.memory) {
            tracing::error!("Failed to destroy staging buffer: {e}");
        }

        unsafe {
            self.queues.destroy();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.memory.shutdown();

            self.device.destroy_device(None);
        }
    }
}

/// Builder for creating a GPU context.
#[derive(Default)]
pub struct GpuContextBuilder {
    config: GpuConfig,
}

impl GpuContextBuilder {
    /// Create a new builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from an existing configuration.
    pub fn with_config(config: GpuConfig) -> Self {
        Self { config }
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.config.validation = enable;
        self
    }

    /// Set the number of frames in flight.
    pub fn frames_in_flight(mut self, frames: usize) -> Self {
        self.config.frames_in_flight = frames;
        self
    }

    /// Build a context without a surface.
    pub fn build(self) -> Result<GpuContext> {
        self.create(&[], |_, _| Ok(None))
    }

    /// Build a context that can present to `window`.
    pub fn build_with_window<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let extensions = ash_window::enumerate_required_extensions(display.as_raw())?;

        self.create(extensions, |entry, instance| unsafe {
            SurfaceContext::from_window(entry, instance, window).map(Some)
        })
    }

    fn create<F>(self, window_extensions: &[*const c_char], make_surface: F) -> Result<GpuContext>
    where
        F: FnOnce(&ash::Entry, &ash::Instance) -> Result<Option<SurfaceContext>>,
    {
        let config = self.config;
        config.validate()?;

        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;
        unsafe { check_instance_version(&entry) }?;

        let instance = unsafe {
            create_instance(&entry, &config.app_name, config.validation, window_extensions)
        }?;

        let messenger = if config.validation {
            match unsafe { DebugMessenger::new(&entry, &instance) } {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    tracing::warn!("Failed to create debug messenger: {e}");
                    None
                }
            }
        } else {
            None
        };

        // From here on the instance is destroyed on every error path.
        let mut instance = InstanceContext {
            entry,
            instance,
            messenger,
            surface: None,
        };
        instance.surface = make_surface(&instance.entry, &instance.instance)?;

        let devices = unsafe { enumerate_devices(&instance.instance) }?;
        let (device_info, queue_families) =
            unsafe { select_device(&instance.instance, &devices, instance.surface.as_ref()) }
                .inspect_err(|e| {
                    if let GpuError::NoSuitableDevice { report } = e {
                        tracing::error!("{report}");
                    }
                })?;

        tracing::info!("Selected GPU: {}", device_info.summary());

        let logical = unsafe {
            create_logical_device(
                &instance.instance,
                &device_info,
                &queue_families,
                instance.surface.is_some(),
            )
        }
        .inspect_err(|_| {
            let required = required_device_extensions(instance.surface.is_some());
            let required: Vec<&str> = required.iter().filter_map(|e| e.to_str().ok()).collect();
            tracing::error!("{}", available_devices_report(&devices, &required));
        })?;
        let can_set_line_width = logical.can_set_line_width();
        let device = Arc::new(logical.device);

        let created = unsafe {
            create_resources(&instance, &device, &device_info, &queue_families, &config)
        };
        let resources = match created {
            Ok(resources) => resources,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(GpuContext {
            config,
            device_info,
            device,
            queue_families,
            queues: resources.queues,
            sync: resources.sync,
            memory: resources.memory,
            uploader: resources.uploader,
            can_set_line_width,
            depth_format: resources.depth_format,
            instance,
        })
    }
}

/// Create queues, allocator, memory manager and the staging path.
///
/// # Safety
/// `device` must have been created from `instance` for `device_info`.
unsafe fn create_resources(
    instance: &InstanceContext,
    device: &Arc<ash::Device>,
    device_info: &DeviceInfo,
    queue_families: &QueueFamilyIndices,
    config: &GpuConfig,
) -> Result<DeviceResources> {
    let depth_format = find_depth_format(
        &instance.instance,
        device_info.handle,
        config.prefer_24bit_depth,
    )?;

    let memory_properties = instance
        .instance
        .get_physical_device_memory_properties(device_info.handle);
    let memory_types = MemoryTypes::classify(&memory_properties)?;

    let queues = Queues::new(device, queue_families, config.command_buffer_batch)?;

    let built = (|| -> Result<_> {
        let allocator =
            GpuAllocator::new(&instance.instance, Arc::clone(device), device_info.handle)?;
        let memory = Arc::new(MemoryManager::new(
            Box::new(allocator),
            memory_types,
            config.frames_in_flight,
        ));

        let waiter: Arc<dyn FenceWaiter> = Arc::clone(device) as Arc<dyn FenceWaiter>;
        let sync = Arc::new(Synchronization::new(waiter, config.fence_batch_capacity));

        let staging = match StagingBuffer::new(&memory, config.staging_buffer_size) {
            Ok(staging) => staging,
            Err(e) => {
                memory.shutdown();
                return Err(e);
            }
        };
        let uploader = Arc::new(Uploader::new(
            staging,
            Arc::clone(&queues.transfer),
            Arc::clone(&sync),
        ));
        memory.set_staged_transfer(uploader.clone())?;

        Ok((sync, memory, uploader))
    })();

    match built {
        Ok((sync, memory, uploader)) => {
            tracing::debug!(
                frames = config.frames_in_flight,
                staging = config.staging_buffer_size,
                ?depth_format,
                "GPU resources ready"
            );
            Ok(DeviceResources {
                queues,
                sync,
                memory,
                uploader,
                depth_format,
            })
        }
        Err(e) => {
            queues.destroy();
            Err(e)
        }
    }
}
