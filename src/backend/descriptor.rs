// Descriptor set layouts and pools
//
// Pools are sized for one set per swapchain image per usage category. Sets
// are never freed one by one; destroying the pool reclaims them all.

use ash::vk;
use std::sync::Arc;

use super::DeviceContext;
use crate::error::{Result, VkResultExt};

pub fn layout_binding(
    binding: u32,
    descriptor_type: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(descriptor_type)
        .descriptor_count(1)
        .stage_flags(stages)
        .build()
}

pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    ctx: Arc<DeviceContext>,
}

impl DescriptorSetLayout {
    pub fn new(ctx: &Arc<DeviceContext>, bindings: &[vk::DescriptorSetLayoutBinding]) -> Result<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        let layout = unsafe { ctx.device.create_descriptor_set_layout(&create_info, None) }
            .stage("create descriptor set layout")?;
        Ok(Self {
            layout,
            ctx: ctx.clone(),
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_descriptor_set_layout(self.layout, None) };
    }
}

/// Pool sizes for `sets_per_category` sets of each descriptor type in
/// `categories`. Repeated types are merged.
pub fn pool_sizes(sets_per_category: u32, categories: &[vk::DescriptorType]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for &ty in categories {
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += sets_per_category,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: sets_per_category,
            }),
        }
    }
    sizes
}

pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    ctx: Arc<DeviceContext>,
}

impl DescriptorPool {
    pub fn new(ctx: &Arc<DeviceContext>, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes)
            .max_sets(max_sets);
        let pool = unsafe { ctx.device.create_descriptor_pool(&create_info, None) }.stage("create descriptor pool")?;
        Ok(Self {
            pool,
            ctx: ctx.clone(),
        })
    }

    /// One set per entry of `layouts`.
    pub fn allocate(&self, layouts: &[vk::DescriptorSetLayout]) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);
        unsafe { self.ctx.device.allocate_descriptor_sets(&alloc_info) }.stage("allocate descriptor sets")
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_descriptor_pool(self.pool, None) };
    }
}

pub fn write_uniform_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    range: vk::DeviceSize,
) {
    let buffer_info = [vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range,
    }];
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(&buffer_info)
        .build();
    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

pub fn write_combined_image_sampler(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let image_info = [vk::DescriptorImageInfo {
        sampler,
        image_view: view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }];
    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(&image_info)
        .build();
    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_set_per_image_per_category() {
        let sizes = pool_sizes(
            3,
            &[vk::DescriptorType::UNIFORM_BUFFER, vk::DescriptorType::COMBINED_IMAGE_SAMPLER],
        );
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 3);
        assert_eq!(sizes[1].descriptor_count, 3);
    }

    #[test]
    fn repeated_categories_merge() {
        let sampler = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
        let sizes = pool_sizes(2, &[sampler, sampler, sampler]);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].descriptor_count, 6);
    }

    #[test]
    fn layout_binding_has_single_descriptor() {
        let binding = layout_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(binding.binding, 1);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }
}
