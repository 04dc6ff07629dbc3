// Images, views, samplers and layout transitions
//
// Each image owns one dedicated memory block and one view. Only the two
// transitions needed for texture uploads are supported; anything else is
// rejected before a command buffer is touched.

use ash::vk;
use std::path::PathBuf;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::memory::allocate_memory;
use super::DeviceContext;
use crate::error::{RendererError, Result, VkResultExt};

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

fn full_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// 2D view over the first mip level and layer.
pub fn create_image_view(
    ctx: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(full_range(aspect));

    unsafe { ctx.device.create_image_view(&create_info, None) }.stage("create image view")
}

/// Device-local 2D image with its memory and view.
pub struct GpuImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    ctx: Arc<DeviceContext>,
}

impl GpuImage {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let device = &ctx.device;
        let image = unsafe { device.create_image(&image_info, None) }.stage("create image")?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match allocate_memory(ctx, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe { device.bind_image_memory(image, memory, 0) }
            .stage("bind image memory")
            .and_then(|_| create_image_view(ctx, image, format, aspect_for(format)));
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            image,
            memory,
            view,
            format,
            extent,
            ctx: ctx.clone(),
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_image_view(self.view, None);
            self.ctx.device.destroy_image(self.image, None);
            self.ctx.device.free_memory(self.memory, None);
        }
    }
}

/// Access masks and stages for one supported layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn transition_barrier(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<TransitionBarrier> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(TransitionBarrier {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => {
            Ok(TransitionBarrier {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            })
        }
        _ => Err(RendererError::UnsupportedTransition { old, new }),
    }
}

/// Move `image` from `old` to `new` with a blocking one-shot barrier.
pub fn transition_image_layout(
    ctx: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let barrier = transition_barrier(old, new)?;

    let image_barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(full_range(aspect_for(format)))
        .build();

    ctx.one_shot(|device, cmd| unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            barrier.src_stage,
            barrier.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[image_barrier],
        );
    })
}

/// Copy a tightly packed buffer into an image in `TRANSFER_DST_OPTIMAL`.
pub fn copy_buffer_to_image(ctx: &DeviceContext, buffer: &GpuBuffer, image: &GpuImage) -> Result<()> {
    let extent = image.extent();
    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: aspect_for(image.format()),
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .build();

    ctx.one_shot(|device, cmd| unsafe {
        device.cmd_copy_buffer_to_image(
            cmd,
            buffer.handle(),
            image.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    })
}

pub struct Sampler {
    sampler: vk::Sampler,
    ctx: Arc<DeviceContext>,
}

impl Sampler {
    /// Linear, repeating, max anisotropy. For material textures.
    pub fn texture(ctx: &Arc<DeviceContext>) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(ctx.max_sampler_anisotropy())
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_op(vk::CompareOp::ALWAYS)
            .max_lod(1.0);
        Self::create(ctx, &create_info)
    }

    /// Nearest filtering, clamped. For reading render targets in a later pass.
    pub fn attachment(ctx: &Arc<DeviceContext>) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .mip_lod_bias(0.0)
            .max_anisotropy(1.0)
            .min_lod(0.0)
            .max_lod(1.0)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
        Self::create(ctx, &create_info)
    }

    fn create(ctx: &Arc<DeviceContext>, create_info: &vk::SamplerCreateInfo) -> Result<Self> {
        let sampler = unsafe { ctx.device.create_sampler(create_info, None) }.stage("create sampler")?;
        Ok(Self {
            sampler,
            ctx: ctx.clone(),
        })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_sampler(self.sampler, None) };
    }
}

/// Sampled RGBA8 texture.
pub struct Texture {
    pub image: GpuImage,
    pub sampler: Sampler,
}

impl Texture {
    pub const FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

    /// Upload tightly packed RGBA8 pixels and leave the image shader-readable.
    pub fn from_rgba(ctx: &Arc<DeviceContext>, width: u32, height: u32, pixels: &[u8]) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected || expected == 0 {
            return Err(RendererError::Asset {
                path: PathBuf::new(),
                reason: format!("{}x{} RGBA texture needs {} bytes, got {}", width, height, expected, pixels.len()),
            });
        }

        let staging = GpuBuffer::staging(ctx, pixels)?;
        let image = GpuImage::new(
            ctx,
            vk::Extent2D { width, height },
            Self::FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;

        transition_image_layout(
            ctx,
            image.handle(),
            Self::FORMAT,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        copy_buffer_to_image(ctx, &staging, &image)?;
        transition_image_layout(
            ctx,
            image.handle(),
            Self::FORMAT,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        log::debug!("Uploaded {}x{} texture", width, height);

        Ok(Self {
            image,
            sampler: Sampler::texture(ctx)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_transitions_are_supported() {
        let to_dst = transition_barrier(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL).unwrap();
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);

        let to_read = transition_barrier(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(to_read.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn other_transitions_are_rejected() {
        let pairs = [
            (vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::UNDEFINED),
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::UNDEFINED),
            (vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        ];
        for (old, new) in pairs {
            let err = transition_barrier(old, new).unwrap_err();
            assert!(matches!(err, RendererError::UnsupportedTransition { old: o, new: n } if o == old && n == new));
        }
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(aspect_for(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(aspect_for(vk::Format::R16G16B16A16_SFLOAT), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn texture_upload_walks_both_transitions() {
        let ctx = DeviceContext::headless("texture-test", false).unwrap();
        let texture = Texture::from_rgba(&ctx, 2, 2, &[255u8; 16]).unwrap();
        assert_eq!(texture.image.extent(), vk::Extent2D { width: 2, height: 2 });

        let err = transition_image_layout(
            &ctx,
            texture.image.handle(),
            Texture::FORMAT,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::UNDEFINED,
        )
        .unwrap_err();
        assert!(matches!(err, RendererError::UnsupportedTransition { .. }));
    }
}
