// Device memory selection
//
// One allocation per resource, no sub-allocation. The memory type is the
// first one allowed by the resource and carrying every requested flag.

use ash::vk;

use super::DeviceContext;
use crate::error::{RendererError, Result, VkResultExt};

/// Find the first memory type whose bit is set in `type_bits` and whose
/// property flags contain all of `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let allowed = type_bits & (1 << i) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(RendererError::NoMatchingMemoryType { type_bits, properties })
}

/// Allocate a dedicated block for the given requirements.
pub fn allocate_memory(
    ctx: &DeviceContext,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index =
        find_memory_type(&ctx.memory_properties, requirements.memory_type_bits, properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe { ctx.device.allocate_memory(&alloc_info, None) }.stage("allocate device memory")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_first_superset_type() {
        let p = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST,
            HOST | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        assert_eq!(find_memory_type(&p, 0b1111, HOST).unwrap(), 2);
        assert_eq!(
            find_memory_type(&p, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_type_bits() {
        let p = props(&[HOST, HOST | vk::MemoryPropertyFlags::HOST_CACHED]);
        assert_eq!(find_memory_type(&p, 0b10, HOST).unwrap(), 1);
    }

    #[test]
    fn selected_type_always_contains_request() {
        let p = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            HOST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | HOST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);
        let requests = [
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | HOST,
            vk::MemoryPropertyFlags::HOST_CACHED,
        ];
        for request in requests {
            let index = find_memory_type(&p, u32::MAX, request).unwrap();
            assert!(p.memory_types[index as usize].property_flags.contains(request));
        }
    }

    #[test]
    fn partial_match_is_rejected() {
        let p = props(&[vk::MemoryPropertyFlags::HOST_VISIBLE, vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&p, 0b11, HOST).unwrap_err();
        assert!(matches!(err, RendererError::NoMatchingMemoryType { type_bits: 0b11, .. }));
    }
}
