//! Queue family role resolution.

use crate::error::{GpuError, Result};
use ash::vk;

const IGNORED: u32 = vk::QUEUE_FAMILY_IGNORED;

/// Queue family indices for each role.
///
/// Unresolved roles hold `vk::QUEUE_FAMILY_IGNORED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
    pub compute: u32,
}

impl Default for QueueFamilyIndices {
    fn default() -> Self {
        Self {
            graphics: IGNORED,
            present: IGNORED,
            transfer: IGNORED,
            compute: IGNORED,
        }
    }
}

impl QueueFamilyIndices {
    /// Every role has a family.
    pub fn is_complete(&self) -> bool {
        self.graphics != IGNORED
            && self.present != IGNORED
            && self.transfer != IGNORED
            && self.compute != IGNORED
    }

    /// Graphics and present are resolved; the minimum for a usable device.
    pub fn is_suitable(&self) -> bool {
        self.graphics != IGNORED && self.present != IGNORED
    }

    /// Distinct resolved family indices, in role order.
    pub fn unique(&self) -> Vec<u32> {
        let mut unique = Vec::with_capacity(4);
        for family in [self.graphics, self.present, self.transfer, self.compute] {
            if family != IGNORED && !unique.contains(&family) {
                unique.push(family);
            }
        }
        unique
    }
}

fn supports(family: &vk::QueueFamilyProperties, flags: vk::QueueFlags) -> bool {
    family.queue_flags.intersects(flags)
}

// Graphics and compute queues implicitly support transfer operations.
fn supports_transfer(family: &vk::QueueFamilyProperties) -> bool {
    supports(
        family,
        vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
}

/// Assign graphics, present, transfer and compute roles to queue families.
///
/// `present_support` answers whether a family can present to the target
/// surface.
pub fn resolve_queue_families<F>(
    families: &[vk::QueueFamilyProperties],
    mut present_support: F,
) -> Result<QueueFamilyIndices>
where
    F: FnMut(u32) -> Result<bool>,
{
    let mut indices = QueueFamilyIndices::default();

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;

        if supports(family, vk::QueueFlags::GRAPHICS) {
            indices.graphics = i;
            if present_support(i)? {
                indices.present = i;
            }
        } else if supports(family, vk::QueueFlags::COMPUTE) {
            indices.compute = i;
        } else if supports(family, vk::QueueFlags::TRANSFER) {
            indices.transfer = i;
        }

        if indices.present == IGNORED && present_support(i)? {
            indices.present = i;
        }

        if indices.is_complete() {
            break;
        }
    }

    // Some drivers only report present support when asked outside the role pass.
    if indices.present == IGNORED {
        for i in 0..families.len() as u32 {
            if present_support(i)? {
                indices.present = i;
                break;
            }
        }
    }

    if indices.present == IGNORED && indices.compute != IGNORED {
        tracing::warn!("Using compute queue family as present fallback");
        indices.present = indices.compute;
    }

    if indices.transfer == IGNORED {
        indices.transfer = fallback_transfer_family(families, indices.compute)
            .ok_or(GpuError::MissingQueueFamily("transfer"))?;
    }

    if indices.compute == IGNORED {
        indices.compute = families
            .iter()
            .position(|family| supports(family, vk::QueueFlags::COMPUTE))
            .map(|i| i as u32)
            .ok_or(GpuError::MissingQueueFamily("compute"))?;
    }

    if indices.graphics == IGNORED {
        return Err(GpuError::MissingQueueFamily("graphics"));
    }
    if indices.present == IGNORED {
        return Err(GpuError::MissingQueueFamily("present"));
    }

    Ok(indices)
}

/// Pick a transfer-capable family when no dedicated one exists, preferring a
/// non-graphics family that is not already the compute family.
fn fallback_transfer_family(families: &[vk::QueueFamilyProperties], compute: u32) -> Option<u32> {
    let mut any = None;
    let mut non_graphics = None;

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if !supports_transfer(family) {
            continue;
        }
        any.get_or_insert(i);

        if !supports(family, vk::QueueFlags::GRAPHICS) {
            if i != compute {
                return Some(i);
            }
            non_graphics.get_or_insert(i);
        }
    }

    non_graphics.or(any)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn all_flags() -> vk::QueueFlags {
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER
    }

    #[test]
    fn single_universal_family() {
        let families = [family(all_flags())];
        let indices = resolve_queue_families(&families, |_| Ok(true)).unwrap();

        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.present, 0);
        assert_eq!(indices.transfer, 0);
        assert_eq!(indices.compute, 0);
        assert_eq!(indices.unique(), vec![0]);
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(all_flags()),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING),
        ];
        let indices = resolve_queue_families(&families, |i| Ok(i == 0)).unwrap();

        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.present, 0);
        assert_eq!(indices.compute, 1);
        assert_eq!(indices.transfer, 2);
        assert!(indices.is_complete());
        assert_eq!(indices.unique(), vec![0, 2, 1]);
    }

    #[test]
    fn transfer_fallback_avoids_graphics_and_compute() {
        let families = [
            family(all_flags()),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let indices = resolve_queue_families(&families, |i| Ok(i == 0)).unwrap();

        // The pass keeps the last dedicated compute family.
        assert_eq!(indices.compute, 2);
        assert_eq!(indices.transfer, 1);
    }

    #[test]
    fn transfer_fallback_shares_compute_when_nothing_else() {
        let families = [
            family(all_flags()),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        let indices = resolve_queue_families(&families, |i| Ok(i == 0)).unwrap();

        assert_eq!(indices.compute, 1);
        assert_eq!(indices.transfer, 1);
    }

    #[test]
    fn present_found_on_non_graphics_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
        ];
        let indices = resolve_queue_families(&families, |i| Ok(i == 1)).unwrap();

        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.present, 1);
    }

    #[test]
    fn present_falls_back_to_compute() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
        ];
        let indices = resolve_queue_families(&families, |_| Ok(false)).unwrap();

        assert_eq!(indices.present, indices.compute);
        assert!(indices.is_suitable());
    }

    #[test]
    fn missing_graphics_is_an_error() {
        let families = [family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let result = resolve_queue_families(&families, |_| Ok(true));

        assert!(matches!(result, Err(GpuError::MissingQueueFamily("graphics"))));
    }

    #[test]
    fn missing_present_is_an_error() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let result = resolve_queue_families(&families, |_| Ok(false));

        assert!(matches!(result, Err(GpuError::MissingQueueFamily("present"))));
    }

    #[test]
    fn missing_compute_is_an_error() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let result = resolve_queue_families(&families, |_| Ok(true));

        assert!(matches!(result, Err(GpuError::MissingQueueFamily("compute"))));
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(all_flags())];
        let result = resolve_queue_families(&families, |_| {
            Err(GpuError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
        });

        assert!(matches!(result, Err(GpuError::Vulkan(_))));
    }
}
