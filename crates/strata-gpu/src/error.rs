//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader is too old.
    #[error("Vulkan 1.2 not supported, loader only has {0}")]
    VulkanVersion(String),

    /// No enumerated GPU meets the minimum requirements.
    #[error("No suitable GPU found:{report}")]
    NoSuitableDevice {
        /// Per-device diagnostic dump.
        report: String,
    },

    /// A queue family role could not be resolved.
    #[error("Unable to find queue family with {0} support")]
    MissingQueueFamily(&'static str),

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A buffer id was freed that the memory manager is not tracking.
    #[error("Trying to free buffer {0:#x} which is not tracked")]
    UntrackedBuffer(u64),

    /// An image id was freed that the memory manager is not tracking.
    #[error("Trying to free image {0:#x} which is not tracked")]
    UntrackedImage(u64),

    /// Frame index outside the frame ring.
    #[error("Frame index {frame} out of bounds for {frames} frames in flight")]
    FrameOutOfRange {
        /// Requested frame.
        frame: usize,
        /// Ring size.
        frames: usize,
    },

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
