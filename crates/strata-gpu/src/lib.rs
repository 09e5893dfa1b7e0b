//! Vulkan frame-resource and command-submission layer.
//!
//! This crate provides:
//! - Vulkan instance and device selection with queue family resolution
//! - Recyclable command buffers and a bounded in-flight fence batch
//! - Memory type classification and allocation via gpu-allocator
//! - Growable buffers with a frame-indexed deferred-free ring
//! - Staged uploads for device-local memory

pub mod allocator;
pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod context;
pub mod deferred;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod memory_type;
pub mod queue;
pub mod queue_family;
pub mod surface;
pub mod sync;
pub mod upload;

pub use allocator::{BufferId, GpuAllocator, ImageId, ImageRequest, MemoryBackend, RawImage};
pub use buffer::{Buffer, StagingBuffer};
pub use capabilities::{DeviceInfo, GpuVendor};
pub use command::{CommandBuffer, CommandDevice, CommandPool};
pub use config::GpuConfig;
pub use context::{GpuContext, GpuContextBuilder};
pub use error::{GpuError, Result};
pub use memory::{MemoryManager, MemoryStats};
pub use memory_type::{MemoryCategory, MemoryKind, MemoryType, MemoryTypes};
pub use queue::{GraphicsQueue, Queue, Queues, RecordTarget, TransferQueue};
pub use queue_family::QueueFamilyIndices;
pub use surface::{SurfaceContext, SurfaceProperties};
pub use sync::{create_fence, create_semaphore, FenceWaiter, Synchronization};
pub use upload::{StagedTransfer, Uploader};
