//! Physical device selection and logical device creation.

use crate::capabilities::{DeviceFeatures, DeviceInfo};
use crate::error::{GpuError, Result};
use crate::queue_family::{resolve_queue_families, QueueFamilyIndices};
use crate::surface::SurfaceContext;
use ash::vk;
use std::ffi::{c_char, CStr};
use std::fmt::Write as _;

/// Device extensions required for the given mode.
pub fn required_device_extensions(with_surface: bool) -> Vec<&'static CStr> {
    if with_surface {
        vec![ash::khr::swapchain::NAME]
    } else {
        vec![]
    }
}

fn extension_names(extensions: &[&'static CStr]) -> Vec<&'static str> {
    extensions.iter().filter_map(|ext| ext.to_str().ok()).collect()
}

/// Describe every adapter.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn enumerate_devices(instance: &ash::Instance) -> Result<Vec<DeviceInfo>> {
    let devices = instance
        .enumerate_physical_devices()?
        .into_iter()
        .map(|device| DeviceInfo::query(instance, device))
        .collect();
    Ok(devices)
}

/// Resolve queue roles for `device`. Without a surface every graphics-capable
/// family counts as present-capable.
///
/// # Safety
/// The instance must be valid and own the device.
pub unsafe fn queue_families_for(
    instance: &ash::Instance,
    device: &DeviceInfo,
    surface: Option<&SurfaceContext>,
) -> Result<QueueFamilyIndices> {
    let families = instance.get_physical_device_queue_family_properties(device.handle);
    resolve_queue_families(&families, |family| match surface {
        Some(surface) => surface.present_support(device.handle, family),
        None => Ok(families[family as usize]
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS)),
    })
}

/// Queue families for `device` if it meets every requirement.
///
/// # Safety
/// The instance must be valid and own the device.
pub unsafe fn check_device_suitable(
    instance: &ash::Instance,
    device: &DeviceInfo,
    surface: Option<&SurfaceContext>,
) -> Result<Option<QueueFamilyIndices>> {
    let indices = match queue_families_for(instance, device, surface) {
        Ok(indices) if indices.is_suitable() => indices,
        Ok(_) => return Ok(None),
        Err(GpuError::MissingQueueFamily(role)) => {
            tracing::debug!("{}: no {role} queue family", device.device_name);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let required = required_device_extensions(surface.is_some());
    let missing = device.unsupported_extensions(extension_names(&required));
    if !missing.is_empty() {
        tracing::debug!("{}: missing extensions {missing:?}", device.device_name);
        return Ok(None);
    }

    if let Some(surface) = surface {
        if !surface.properties(device.handle)?.is_adequate() {
            tracing::debug!("{}: inadequate swapchain support", device.device_name);
            return Ok(None);
        }
    }

    Ok(Some(indices))
}

fn pick_index(candidates: &[DeviceInfo]) -> Option<usize> {
    let of_type = |device_type: vk::PhysicalDeviceType| {
        candidates.iter().position(|d| d.device_type == device_type)
    };
    of_type(vk::PhysicalDeviceType::DISCRETE_GPU)
        .or_else(|| of_type(vk::PhysicalDeviceType::INTEGRATED_GPU))
        .or_else(|| (!candidates.is_empty()).then_some(0))
}

/// Pick the first discrete GPU, else the first integrated GPU, else the first
/// remaining device.
pub fn pick_device(candidates: &[DeviceInfo]) -> Option<&DeviceInfo> {
    pick_index(candidates).map(|i| &candidates[i])
}

/// Diagnostic dump of every enumerated device and the required extensions it lacks.
pub fn available_devices_report(devices: &[DeviceInfo], required: &[&str]) -> String {
    let mut report = String::from("\n");

    if devices.is_empty() {
        report.push_str("\tNo available device found");
    }

    for device in devices {
        let _ = writeln!(report, "\tDevice: {}", device.device_name);
        let _ = writeln!(report, "\t\tVulkan Version: {}", device.api_version);

        let unsupported = device.unsupported_extensions(required.iter().copied());
        if unsupported.is_empty() {
            let _ = writeln!(report, "\t\tAll required extensions are supported");
        } else {
            let _ = writeln!(report, "\t\tUnsupported extension: {unsupported:?}");
        }
    }

    report
}

/// Select the device to use.
///
/// # Safety
/// The instance must be valid and own every device in `devices`.
pub unsafe fn select_device(
    instance: &ash::Instance,
    devices: &[DeviceInfo],
    surface: Option<&SurfaceContext>,
) -> Result<(DeviceInfo, QueueFamilyIndices)> {
    let mut suitable = Vec::new();
    let mut indices = Vec::new();
    for device in devices {
        if let Some(found) = check_device_suitable(instance, device, surface)? {
            suitable.push(device.clone());
            indices.push(found);
        }
    }

    let Some(picked) = pick_index(&suitable) else {
        let required = required_device_extensions(surface.is_some());
        return Err(GpuError::NoSuitableDevice {
            report: available_devices_report(devices, &extension_names(&required)),
        });
    };

    Ok((suitable.swap_remove(picked), indices[picked]))
}

/// Features to enable on the logical device, given what the adapter supports.
pub fn enabled_features(supported: &DeviceFeatures) -> DeviceFeatures {
    let draw_indirect = supported.multi_draw_indirect && supported.shader_draw_parameters;
    DeviceFeatures {
        multi_draw_indirect: draw_indirect,
        shader_draw_parameters: draw_indirect,
        wide_lines: supported.wide_lines,
        sampler_anisotropy: supported.sampler_anisotropy,
        logic_op: supported.logic_op,
    }
}

/// A created logical device and the optional features that were turned on.
pub struct LogicalDevice {
    pub device: ash::Device,
    pub features: DeviceFeatures,
}

impl LogicalDevice {
    /// Line width other than 1.0 may be set.
    pub fn can_set_line_width(&self) -> bool {
        self.features.wide_lines
    }
}

/// Create the logical device with one queue per distinct family.
///
/// # Safety
/// The instance must be valid and own the physical device.
pub unsafe fn create_logical_device(
    instance: &ash::Instance,
    device: &DeviceInfo,
    indices: &QueueFamilyIndices,
    with_surface: bool,
) -> Result<LogicalDevice> {
    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = indices
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extensions = required_device_extensions(with_surface);
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let enabled = enabled_features(&device.features);
    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(enabled.sampler_anisotropy)
        .logic_op(enabled.logic_op)
        .multi_draw_indirect(enabled.multi_draw_indirect)
        .wide_lines(enabled.wide_lines);
    let mut vulkan_1_1_features = vk::PhysicalDeviceVulkan11Features::default()
        .shader_draw_parameters(enabled.shader_draw_parameters);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features)
        .push_next(&mut vulkan_1_1_features);

    let logical = instance
        .create_device(device.handle, &device_create_info, None)
        .map_err(GpuError::from)?;

    tracing::debug!(features = ?enabled, "Created logical device");
    Ok(LogicalDevice {
        device: logical,
        features: enabled,
    })
}

/// Depth formats to try, in order.
pub fn depth_format_candidates(prefer_24bit: bool) -> &'static [vk::Format] {
    if prefer_24bit {
        &[
            vk::Format::D24_UNORM_S8_UINT,
            vk::Format::X8_D24_UNORM_PACK32,
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
        ]
    } else {
        &[vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT]
    }
}

fn first_supported<F>(candidates: &[vk::Format], mut optimal_features: F) -> Option<vk::Format>
where
    F: FnMut(vk::Format) -> vk::FormatFeatureFlags,
{
    candidates.iter().copied().find(|&format| {
        optimal_features(format).contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

/// First depth format usable as an optimal-tiling depth attachment.
///
/// # Safety
/// The instance must be valid and own the physical device.
pub unsafe fn find_depth_format(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    prefer_24bit: bool,
) -> Result<vk::Format> {
    first_supported(depth_format_candidates(prefer_24bit), |format| {
        instance
            .get_physical_device_format_properties(physical_device, format)
            .optimal_tiling_features
    })
    .ok_or_else(|| GpuError::Other("Failed to find supported depth format".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::test_device;

    #[test]
    fn pick_prefers_discrete_then_integrated() {
        let devices = vec![
            test_device("cpu", vk::PhysicalDeviceType::CPU),
            test_device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            test_device("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(pick_device(&devices).unwrap().device_name, "dgpu");
        assert_eq!(pick_device(&devices[..2]).unwrap().device_name, "igpu");
        assert_eq!(pick_device(&devices[..1]).unwrap().device_name, "cpu");
        assert!(pick_device(&[]).is_none());
    }

    #[test]
    fn report_lists_every_device() {
        let mut ok = test_device("Good GPU", vk::PhysicalDeviceType::DISCRETE_GPU);
        ok.available_extensions
            .insert("VK_KHR_swapchain".to_string());
        let bad = test_device("Old GPU", vk::PhysicalDeviceType::INTEGRATED_GPU);

        let report = available_devices_report(&[ok, bad], &["VK_KHR_swapchain"]);

        assert!(report.starts_with('\n'));
        assert!(report.contains("\tDevice: Good GPU\n\t\tVulkan Version: 1.3.0\n\t\tAll required extensions are supported\n"));
        assert!(report.contains("\tDevice: Old GPU\n"));
        assert!(report.contains("Unsupported extension: [\"VK_KHR_swapchain\"]"));
    }

    #[test]
    fn report_without_devices() {
        assert_eq!(
            available_devices_report(&[], &[]),
            "\n\tNo available device found"
        );
    }

    #[test]
    fn draw_indirect_is_all_or_nothing() {
        let supported = DeviceFeatures {
            multi_draw_indirect: true,
            shader_draw_parameters: false,
            wide_lines: true,
            sampler_anisotropy: true,
            logic_op: false,
        };
        let enabled = enabled_features(&supported);

        assert!(!enabled.multi_draw_indirect);
        assert!(!enabled.shader_draw_parameters);
        assert!(enabled.wide_lines);
        assert!(enabled.sampler_anisotropy);
        assert!(!enabled.logic_op);
    }

    #[test]
    fn depth_format_order() {
        let supports_d32 = |format: vk::Format| {
            if format == vk::Format::D32_SFLOAT || format == vk::Format::D32_SFLOAT_S8_UINT {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::empty()
            }
        };
        assert_eq!(
            first_supported(depth_format_candidates(true), supports_d32),
            Some(vk::Format::D32_SFLOAT)
        );

        let supports_all = |_: vk::Format| vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        assert_eq!(
            first_supported(depth_format_candidates(true), supports_all),
            Some(vk::Format::D24_UNORM_S8_UINT)
        );
        assert_eq!(
            first_supported(depth_format_candidates(false), supports_all),
            Some(vk::Format::D32_SFLOAT)
        );
        assert_eq!(
            first_supported(depth_format_candidates(false), |_| {
                vk::FormatFeatureFlags::empty()
            }),
            None
        );
    }
}
