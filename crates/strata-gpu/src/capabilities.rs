//! Physical device description.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            // 0x1022 is the AMD CPU id some APU drivers report
            0x1002 | 0x1022 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }

    /// Short display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nvidia => "Nvidia",
            Self::Amd => "AMD",
            Self::Intel => "Intel",
            Self::Apple => "Apple",
            Self::Other(_) => "undef",
        }
    }
}

/// Format a version packed with the standard Vulkan layout.
pub fn decode_api_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

/// Decode a driver version, whose packing differs per vendor.
///
/// Unknown vendors (and AMD, which follows the Vulkan layout) use
/// `major.minor.patch`.
pub fn decode_driver_version(vendor: GpuVendor, version: u32) -> String {
    match vendor {
        GpuVendor::Nvidia => format!(
            "{}.{}.{}.{}",
            (version >> 22) & 0x3FF,
            (version >> 14) & 0xFF,
            (version >> 6) & 0xFF,
            version & 0x3F
        ),
        // Windows Intel drivers use a 18.14 split; other platforms report Mesa versions.
        GpuVendor::Intel if cfg!(target_os = "windows") => {
            format!("{}.{}", version >> 14, version & 0x3FFF)
        }
        _ => decode_api_version(version),
    }
}

/// Optional device features the context may enable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub multi_draw_indirect: bool,
    pub shader_draw_parameters: bool,
    pub wide_lines: bool,
    pub sampler_anisotropy: bool,
    pub logic_op: bool,
}

/// Immutable description of one enumerated adapter.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Physical device handle
    pub handle: vk::PhysicalDevice,
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Raw PCI vendor id
    pub vendor_id: u32,
    /// Device name
    pub device_name: String,
    /// Discrete, integrated, ...
    pub device_type: vk::PhysicalDeviceType,
    /// Supported Vulkan version, decoded
    pub api_version: String,
    /// Driver version, decoded with the vendor's scheme
    pub driver_version: String,
    /// Optional feature support
    pub features: DeviceFeatures,
    /// Device-local heap size in bytes
    pub device_local_memory: u64,
    /// Supported device extensions
    pub available_extensions: HashSet<String>,
}

impl DeviceInfo {
    /// Query a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid, and the instance must
    /// have been created for Vulkan 1.1 or newer.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let mut features11 = vk::PhysicalDeviceVulkan11Features::default();
        let base = {
            let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut features11);
            instance.get_physical_device_features2(physical_device, &mut features2);
            features2.features
        };

        let features = DeviceFeatures {
            multi_draw_indirect: base.multi_draw_indirect == vk::TRUE,
            shader_draw_parameters: features11.shader_draw_parameters == vk::TRUE,
            wide_lines: base.wide_lines == vk::TRUE,
            sampler_anisotropy: base.sampler_anisotropy == vk::TRUE,
            logic_op: base.logic_op == vk::TRUE,
        };

        let device_local_memory: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);

        Self {
            handle: physical_device,
            vendor,
            vendor_id: properties.vendor_id,
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            device_type: properties.device_type,
            api_version: decode_api_version(properties.api_version),
            driver_version: decode_driver_version(vendor, properties.driver_version),
            features,
            device_local_memory,
            available_extensions,
        }
    }

    /// Indirect multi-draw needs both the core feature and shader draw parameters.
    pub fn draw_indirect_supported(&self) -> bool {
        self.features.multi_draw_indirect && self.features.shader_draw_parameters
    }

    /// Required extensions this device lacks.
    pub fn unsupported_extensions<'a, I>(&self, required: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        required
            .into_iter()
            .filter(|ext| !self.available_extensions.contains(*ext))
            .map(String::from)
            .collect()
    }

    /// Get a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "{} ({}) - Vulkan {} - driver {} - {} MB VRAM",
            self.device_name,
            self.vendor.name(),
            self.api_version,
            self.driver_version,
            self.device_local_memory / (1024 * 1024),
        )
    }
}

#[cfg(test)]
pub(crate) fn test_device(name: &str, device_type: vk::PhysicalDeviceType) -> DeviceInfo {
    DeviceInfo {
        handle: vk::PhysicalDevice::null(),
        vendor: GpuVendor::Other(0),
        vendor_id: 0,
        device_name: name.to_string(),
        device_type,
        api_version: "1.3.0".to_string(),
        driver_version: "1.0.0".to_string(),
        features: DeviceFeatures::default(),
        device_local_memory: 0,
        available_extensions: HashSet::new(),
    }
}
