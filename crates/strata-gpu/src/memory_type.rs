//! Memory type classification.
//!
//! Every device memory type is sorted into one of two roles: GPU memory
//! (preferably pure device-local) and host memory (preferably host-visible and
//! coherent). Each resolved type knows how buffers in it are created and
//! whether data can be copied in through a persistent mapping or has to go
//! through the staged-transfer path.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;

/// Coarse accounting category for tracked memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryCategory {
    DeviceLocal,
    HostLocal,
}

/// How a resolved memory type was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Pure device-local memory. Not host-visible; written through staging.
    DeviceLocal,
    /// Device-local, host-visible and coherent (resizable BAR / unified memory).
    DeviceMappable,
    /// Exactly host-visible and coherent.
    HostCoherent,
    /// Host-visible and coherent with extra property bits.
    HostFallback,
}

impl MemoryKind {
    /// Whether buffers of this kind carry a persistent CPU mapping.
    pub fn is_mappable(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }

    pub fn category(self) -> MemoryCategory {
        match self {
            Self::DeviceLocal | Self::DeviceMappable => MemoryCategory::DeviceLocal,
            Self::HostCoherent | Self::HostFallback => MemoryCategory::HostLocal,
        }
    }
}

/// A resolved device memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub kind: MemoryKind,
    /// Index into the device's memory types.
    pub type_index: u32,
    /// Heap backing this type.
    pub heap_index: u32,
    /// Property flags reported by the driver.
    pub property_flags: vk::MemoryPropertyFlags,
    /// Size of the backing heap in bytes.
    pub heap_size: u64,
}

impl MemoryType {
    pub fn category(&self) -> MemoryCategory {
        self.kind.category()
    }

    pub fn mappable(&self) -> bool {
        self.kind.is_mappable()
    }

    /// Properties a buffer of this type must be allocated with.
    pub fn required_properties(&self) -> vk::MemoryPropertyFlags {
        match self.kind {
            MemoryKind::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryKind::DeviceMappable => {
                vk::MemoryPropertyFlags::DEVICE_LOCAL
                    | vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryKind::HostCoherent | MemoryKind::HostFallback => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    /// Allocator location matching this type.
    pub fn location(&self) -> MemoryLocation {
        match self.kind {
            MemoryKind::DeviceLocal => MemoryLocation::GpuOnly,
            MemoryKind::DeviceMappable | MemoryKind::HostCoherent | MemoryKind::HostFallback => {
                MemoryLocation::CpuToGpu
            }
        }
    }

    /// Buffer usage for this type. Buffers are always usable as copy source and
    /// destination so they can be resized and staged.
    pub fn buffer_usage(&self, usage: vk::BufferUsageFlags) -> vk::BufferUsageFlags {
        usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
    }
}

/// The GPU and host memory types chosen for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypes {
    gpu: MemoryType,
    host: MemoryType,
}

fn resolved(
    props: &vk::PhysicalDeviceMemoryProperties,
    index: usize,
    kind: MemoryKind,
) -> MemoryType {
    let memory_type = props.memory_types[index];
    let heap = props.memory_heaps[memory_type.heap_index as usize];
    MemoryType {
        kind,
        type_index: index as u32,
        heap_index: memory_type.heap_index,
        property_flags: memory_type.property_flags,
        heap_size: heap.size,
    }
}

impl MemoryTypes {
    /// Classify the device's memory types.
    ///
    /// Exact flag matches are taken first. Roles still empty after that pass
    /// accept broader matches, and without any device-local type the GPU role
    /// aliases host memory.
    pub fn classify(props: &vk::PhysicalDeviceMemoryProperties) -> Result<Self> {
        let count = (props.memory_type_count as usize).min(props.memory_types.len());
        let host_coherent =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        // Mapped writes are never flushed, so a mappable GPU type must be coherent.
        let device_mappable = vk::MemoryPropertyFlags::DEVICE_LOCAL | host_coherent;

        let mut gpu = None;
        let mut host = None;

        for i in 0..count {
            let flags = props.memory_types[i].property_flags;

            if gpu.is_none() && flags == vk::MemoryPropertyFlags::DEVICE_LOCAL {
                gpu = Some(resolved(props, i, MemoryKind::DeviceLocal));
            }
            if host.is_none() && flags == host_coherent {
                host = Some(resolved(props, i, MemoryKind::HostCoherent));
            }
        }

        if gpu.is_none() || host.is_none() {
            for i in 0..count {
                let flags = props.memory_types[i].property_flags;

                if gpu.is_none() && flags.contains(device_mappable) {
                    gpu = Some(resolved(props, i, MemoryKind::DeviceMappable));
                }
                if host.is_none() && flags.contains(host_coherent) {
                    host = Some(resolved(props, i, MemoryKind::HostFallback));
                }
            }
        }

        // A non-coherent device-local type is still usable through staging.
        if gpu.is_none() {
            gpu = (0..count)
                .find(|&i| {
                    props.memory_types[i]
                        .property_flags
                        .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
                })
                .map(|i| resolved(props, i, MemoryKind::DeviceLocal));
        }

        let host = host.ok_or_else(|| GpuError::NoSuitableDevice {
            report: "\n\tNo host-visible coherent memory type".to_string(),
        })?;

        let gpu = gpu.unwrap_or_else(|| {
            tracing::warn!("No device-local memory type, using host memory for GPU buffers");
            host
        });

        tracing::debug!(
            gpu = ?gpu.kind,
            gpu_type = gpu.type_index,
            host = ?host.kind,
            host_type = host.type_index,
            "Classified memory types"
        );

        Ok(Self { gpu, host })
    }

    /// Memory for GPU-resident buffers.
    pub fn gpu(&self) -> MemoryType {
        self.gpu
    }

    /// Host-visible memory for staging and CPU-written buffers.
    pub fn host(&self) -> MemoryType {
        self.host
    }

    /// GPU memory aliases host memory (no device-local type was found).
    pub fn unified(&self) -> bool {
        self.gpu == self.host
    }
}

#[cfg(test)]
impl MemoryTypes {
    pub(crate) fn from_parts(gpu: MemoryType, host: MemoryType) -> Self {
        Self { gpu, host }
    }
}

#[cfg(test)]
pub(crate) fn test_memory_type(kind: MemoryKind) -> MemoryType {
    MemoryType {
        kind,
        type_index: 0,
        heap_index: 0,
        property_flags: match kind {
            MemoryKind::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            _ => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        },
        heap_size: 256 * 1024 * 1024,
    }
}
