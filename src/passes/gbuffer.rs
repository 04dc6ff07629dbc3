// G-buffer - offscreen multi-target framebuffer
//
// Four attachments in fixed order: position, normal, albedo, depth. Each is
// its own device-local image and memory, created SAMPLED so the resolve pass
// can read it.

use ash::vk;
use std::sync::Arc;

use crate::backend::image::GpuImage;
use crate::backend::pipeline::{Framebuffer, RenderPass};
use crate::backend::DeviceContext;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentRole {
    Position,
    Normal,
    Albedo,
    Depth,
}

impl AttachmentRole {
    pub const ALL: [Self; 4] = [Self::Position, Self::Normal, Self::Albedo, Self::Depth];

    pub fn format(self) -> vk::Format {
        match self {
            Self::Position => vk::Format::R32G32B32A32_SFLOAT,
            Self::Normal => vk::Format::R16G16B16A16_SFLOAT,
            Self::Albedo => vk::Format::R8G8B8A8_UNORM,
            Self::Depth => vk::Format::D32_SFLOAT,
        }
    }

    pub fn is_depth(self) -> bool {
        self == Self::Depth
    }

    pub fn usage(self) -> vk::ImageUsageFlags {
        let target = if self.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        };
        target | vk::ImageUsageFlags::SAMPLED
    }

    fn final_layout(self) -> vk::ImageLayout {
        if self.is_depth() {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
    }

    pub fn clear_value(self) -> vk::ClearValue {
        if self.is_depth() {
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            }
        } else {
            vk::ClearValue {
                color: vk::ClearColorValue { float32: [0.0; 4] },
            }
        }
    }
}

pub const COLOR_ATTACHMENT_COUNT: u32 = 3;

pub fn attachment_descriptions() -> [vk::AttachmentDescription; 4] {
    AttachmentRole::ALL.map(|role| {
        vk::AttachmentDescription::builder()
            .format(role.format())
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(role.final_layout())
            .build()
    })
}

/// Barrier pair around the single subpass. On entry, the previous frame's
/// resolve sampling and depth writes finish before the targets are cleared.
/// On exit, color writes are visible to the resolve pass's fragment shader.
pub fn subpass_dependencies() -> [vk::SubpassDependency; 2] {
    [
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS)
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build(),
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build(),
    ]
}

pub fn create_render_pass(ctx: &Arc<DeviceContext>) -> Result<RenderPass> {
    RenderPass::new(ctx, &attachment_descriptions(), true, &subpass_dependencies())
}

pub struct Attachment {
    pub role: AttachmentRole,
    pub image: GpuImage,
}

/// Offscreen targets with their render pass and framebuffer. Field order is
/// drop order: framebuffer, then images, then the render pass.
pub struct GBuffer {
    framebuffer: Framebuffer,
    attachments: Vec<Attachment>,
    render_pass: RenderPass,
}

impl GBuffer {
    pub fn new(ctx: &Arc<DeviceContext>, extent: vk::Extent2D) -> Result<Self> {
        let render_pass = create_render_pass(ctx)?;

        let attachments = AttachmentRole::ALL
            .iter()
            .map(|&role| {
                Ok(Attachment {
                    role,
                    image: GpuImage::new(ctx, extent, role.format(), role.usage())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let views: Vec<vk::ImageView> = attachments.iter().map(|a| a.image.view()).collect();
        let framebuffer = Framebuffer::new(ctx, &render_pass, &views, extent)?;

        log::info!(
            "Created G-buffer {}x{} with {} attachments and {} subpass dependencies",
            extent.width,
            extent.height,
            attachments.len(),
            render_pass.dependencies().len()
        );
        for attachment in &attachments {
            log::debug!("  {:?}: {:?}", attachment.role, attachment.image.format());
        }

        Ok(Self {
            framebuffer,
            attachments,
            render_pass,
        })
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Views of the color attachments, in shader binding order.
    pub fn color_views(&self) -> impl Iterator<Item = vk::ImageView> + '_ {
        self.attachments()
            .iter()
            .filter(|a| !a.role.is_depth())
            .map(|a| a.image.view())
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn clear_values() -> [vk::ClearValue; 4] {
        AttachmentRole::ALL.map(AttachmentRole::clear_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachments_in_fixed_order() {
        let formats: Vec<_> = attachment_descriptions().iter().map(|a| a.format).collect();
        assert_eq!(
            formats,
            vec![
                vk::Format::R32G32B32A32_SFLOAT,
                vk::Format::R16G16B16A16_SFLOAT,
                vk::Format::R8G8B8A8_UNORM,
                vk::Format::D32_SFLOAT,
            ]
        );
    }

    #[test]
    fn every_attachment_is_cleared_stored_and_sampled() {
        for (desc, role) in attachment_descriptions().iter().zip(AttachmentRole::ALL) {
            assert_eq!(desc.load_op, vk::AttachmentLoadOp::CLEAR);
            assert_eq!(desc.store_op, vk::AttachmentStoreOp::STORE);
            assert!(role.usage().contains(vk::ImageUsageFlags::SAMPLED));
        }
        assert_eq!(
            attachment_descriptions()[3].final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            attachment_descriptions()[0].final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn dependencies_form_by_region_pair() {
        let deps = subpass_dependencies();
        assert_eq!(deps.len(), 2);
        assert!(deps.iter().all(|d| d.dependency_flags == vk::DependencyFlags::BY_REGION));

        assert_eq!(deps[0].src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(deps[0].dst_subpass, 0);
        assert!(deps[0].dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));

        assert_eq!(deps[1].src_subpass, 0);
        assert_eq!(deps[1].dst_subpass, vk::SUBPASS_EXTERNAL);
    }

    #[test]
    fn resolve_sampling_is_ordered_after_geometry_writes() {
        let [enter, exit] = subpass_dependencies();

        assert_eq!(exit.src_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(exit.dst_stage_mask, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(exit.dst_access_mask, vk::AccessFlags::SHADER_READ);

        // Next frame's clear waits for the previous resolve to stop sampling
        assert!(enter.src_stage_mask.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(enter.src_access_mask.contains(vk::AccessFlags::SHADER_READ));
        assert!(enter.dst_stage_mask.contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
        assert!(enter.dst_access_mask.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }

    #[test]
    fn depth_clears_to_far_plane() {
        let clears = GBuffer::clear_values();
        assert_eq!(unsafe { clears[3].depth_stencil.depth }, 1.0);
        assert_eq!(unsafe { clears[0].color.float32 }, [0.0; 4]);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn gbuffer_builds_four_targets() {
        let ctx = DeviceContext::headless("gbuffer-test", false).unwrap();
        let extent = vk::Extent2D { width: 1280, height: 720 };
        let gbuffer = GBuffer::new(&ctx, extent).unwrap();
        assert_eq!(gbuffer.framebuffer().extent(), extent);

        let formats: Vec<_> = gbuffer.attachments().iter().map(|a| a.image.format()).collect();
        assert_eq!(formats, AttachmentRole::ALL.map(AttachmentRole::format).to_vec());
        assert_eq!(gbuffer.render_pass().attachment_formats(), formats.as_slice());
        assert_eq!(gbuffer.render_pass().color_attachment_count(), COLOR_ATTACHMENT_COUNT);
        assert_eq!(gbuffer.render_pass().dependencies().len(), 2);
        assert!(gbuffer
            .render_pass()
            .dependencies()
            .iter()
            .all(|d| d.dependency_flags.contains(vk::DependencyFlags::BY_REGION)));
        assert_eq!(gbuffer.color_views().count(), 3);
    }
}
