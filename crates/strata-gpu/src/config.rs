//! Context configuration.

use crate::error::{GpuError, Result};

/// Default size of the upload staging buffer (64 MiB).
pub const DEFAULT_STAGING_BUFFER_SIZE: u64 = 64 * 1024 * 1024;

/// Default number of fences batched before an eager wait.
pub const DEFAULT_FENCE_BATCH_CAPACITY: usize = 50;

/// Default number of command buffers allocated at once by a pool.
pub const DEFAULT_COMMAND_BUFFER_BATCH: u32 = 10;

/// Configuration for a [`GpuContext`](crate::GpuContext).
#[derive(Debug, Clone)]
pub struct GpuConfig {
    /// Application name reported to the driver.
    pub app_name: String,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Number of frames kept in flight. Sets the size of the deferred-free ring.
    pub frames_in_flight: usize,
    /// Capacity of the upload staging buffer in bytes.
    pub staging_buffer_size: u64,
    /// Fences accumulated before `Synchronization` forces a wait.
    pub fence_batch_capacity: usize,
    /// Command buffers allocated per pool refill.
    pub command_buffer_batch: u32,
    /// Prefer 24-bit depth formats (faster on Nvidia) over 32-bit float.
    pub prefer_24bit_depth: bool,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            app_name: "Strata".to_string(),
            validation: cfg!(debug_assertions),
            frames_in_flight: 2,
            staging_buffer_size: DEFAULT_STAGING_BUFFER_SIZE,
            fence_batch_capacity: DEFAULT_FENCE_BATCH_CAPACITY,
            command_buffer_batch: DEFAULT_COMMAND_BUFFER_BATCH,
            prefer_24bit_depth: true,
        }
    }
}

impl GpuConfig {
    /// Create a new config with the given application name.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the staging buffer capacity.
    pub fn with_staging_buffer_size(mut self, size: u64) -> Self {
        self.staging_buffer_size = size;
        self
    }

    /// Set the fence batch capacity.
    pub fn with_fence_batch_capacity(mut self, capacity: usize) -> Self {
        self.fence_batch_capacity = capacity;
        self
    }

    /// Set how many command buffers a pool allocates per refill.
    pub fn with_command_buffer_batch(mut self, count: u32) -> Self {
        self.command_buffer_batch = count;
        self
    }

    /// Choose between 24-bit and 32-bit float depth formats.
    pub fn with_24bit_depth(mut self, prefer: bool) -> Self {
        self.prefer_24bit_depth = prefer;
        self
    }

    /// Reject values the rest of the crate cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(GpuError::InvalidConfig(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.fence_batch_capacity == 0 {
            return Err(GpuError::InvalidConfig(
                "fence_batch_capacity must be at least 1".to_string(),
            ));
        }
        if self.command_buffer_batch == 0 {
            return Err(GpuError::InvalidConfig(
                "command_buffer_batch must be at least 1".to_string(),
            ));
        }
        if self.staging_buffer_size == 0 {
            return Err(GpuError::InvalidConfig(
                "staging_buffer_size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GpuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.staging_buffer_size, 64 * 1024 * 1024);
        assert_eq!(config.fence_batch_capacity, 50);
        assert_eq!(config.command_buffer_batch, 10);
    }

    #[test]
    fn zero_frames_rejected() {
        let config = GpuConfig::new("test").with_frames_in_flight(0);
        assert!(matches!(config.validate(), Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn builder_methods_apply() {
        let config = GpuConfig::new("probe")
            .with_validation(false)
            .with_frames_in_flight(3)
            .with_staging_buffer_size(1024)
            .with_24bit_depth(false);

        assert_eq!(config.app_name, "probe");
        assert!(!config.validation);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.staging_buffer_size, 1024);
        assert!(!config.prefer_24bit_depth);
    }
}
