// Render passes, framebuffers and graphics pipelines
//
// The graphics pipeline defines how vertices are processed and rasterized.
// Shared fixed-function state: dynamic viewport/scissor, back-face culling
// with clockwise front faces, one opaque blend state per color output.

use ash::vk;
use std::sync::Arc;

use super::shader::ShaderModule;
use super::DeviceContext;
use crate::assets::mesh::Vertex;
use crate::error::{RendererError, Result, VkResultExt};

pub struct RenderPass {
    render_pass: vk::RenderPass,
    attachment_formats: Vec<vk::Format>,
    color_attachment_count: u32,
    dependencies: Vec<vk::SubpassDependency>,
    ctx: Arc<DeviceContext>,
}

impl RenderPass {
    /// Single-subpass render pass. Color references must come first in
    /// `attachments`, the optional depth attachment last.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        attachments: &[vk::AttachmentDescription],
        has_depth: bool,
        dependencies: &[vk::SubpassDependency],
    ) -> Result<Self> {
        let color_count = attachments.len() - usize::from(has_depth);
        let color_refs: Vec<_> = (0..color_count as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: color_count as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if has_depth {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(&subpasses)
            .dependencies(dependencies);

        let render_pass =
            unsafe { ctx.device.create_render_pass(&render_pass_info, None) }.stage("create render pass")?;

        Ok(Self {
            render_pass,
            attachment_formats: attachments.iter().map(|a| a.format).collect(),
            color_attachment_count: color_count as u32,
            dependencies: dependencies.to_vec(),
            ctx: ctx.clone(),
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn attachment_formats(&self) -> &[vk::Format] {
        &self.attachment_formats
    }

    pub fn color_attachment_count(&self) -> u32 {
        self.color_attachment_count
    }

    pub fn dependencies(&self) -> &[vk::SubpassDependency] {
        &self.dependencies
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_render_pass(self.render_pass, None) };
    }
}

/// Swapchain color attachment, cleared and left ready to present.
pub fn present_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build()
}

/// Render pass writing straight to a swapchain image.
pub fn create_present_render_pass(ctx: &Arc<DeviceContext>, format: vk::Format) -> Result<RenderPass> {
    // Wait for the presentation engine to release the image
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    RenderPass::new(ctx, &[present_attachment(format)], false, &[dependency])
}

pub struct Framebuffer {
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    ctx: Arc<DeviceContext>,
}

impl Framebuffer {
    /// `views` must match the render pass attachments one to one.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        render_pass: &RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let expected = render_pass.attachment_formats().len();
        if views.len() != expected {
            return Err(RendererError::FramebufferMismatch {
                expected,
                actual: views.len(),
            });
        }

        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass.handle())
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer =
            unsafe { ctx.device.create_framebuffer(&framebuffer_info, None) }.stage("create framebuffer")?;

        Ok(Self {
            framebuffer,
            extent,
            ctx: ctx.clone(),
        })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_framebuffer(self.framebuffer, None) };
    }
}

/// One framebuffer per swapchain view.
pub fn create_swapchain_framebuffers(
    ctx: &Arc<DeviceContext>,
    render_pass: &RenderPass,
    views: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<Vec<Framebuffer>> {
    views
        .iter()
        .map(|&view| Framebuffer::new(ctx, render_pass, &[view], extent))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexInput {
    /// Geometry generated in the vertex shader from the vertex index.
    None,
    /// Interleaved [`Vertex`] stream at binding 0.
    Mesh,
}

pub struct PipelineDesc<'a> {
    pub vertex_shader: &'a ShaderModule,
    pub fragment_shader: &'a ShaderModule,
    pub vertex_input: VertexInput,
    pub topology: vk::PrimitiveTopology,
    pub depth_test: bool,
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    pub push_constant_ranges: &'a [vk::PushConstantRange],
}

/// Opaque write of every channel, one per color output.
pub fn blend_attachments(count: u32) -> Vec<vk::PipelineColorBlendAttachmentState> {
    (0..count)
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
                .build()
        })
        .collect()
}

pub fn rasterization_state() -> vk::PipelineRasterizationStateCreateInfo {
    vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false)
        .build()
}

pub fn depth_stencil_state(depth_test: bool) -> vk::PipelineDepthStencilStateCreateInfo {
    vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(depth_test)
        .depth_write_enable(depth_test)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false)
        .build()
}

/// Pipeline plus its layout.
pub struct GraphicsPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    ctx: Arc<DeviceContext>,
}

impl GraphicsPipeline {
    pub fn new(ctx: &Arc<DeviceContext>, render_pass: &RenderPass, desc: &PipelineDesc) -> Result<Self> {
        let entry_point = c"main";

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(desc.vertex_shader.handle())
                .name(entry_point)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(desc.fragment_shader.handle())
                .name(entry_point)
                .build(),
        ];

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input_info = match desc.vertex_input {
            VertexInput::None => vk::PipelineVertexInputStateCreateInfo::builder(),
            VertexInput::Mesh => vk::PipelineVertexInputStateCreateInfo::builder()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes),
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are set at record time
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = rasterization_state();

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = depth_stencil_state(desc.depth_test);

        let color_blend_attachments = blend_attachments(render_pass.color_attachment_count());
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(desc.set_layouts)
            .push_constant_ranges(desc.push_constant_ranges);

        let layout = unsafe { ctx.device.create_pipeline_layout(&layout_info, None) }
            .stage("create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass.handle())
            .subpass(0)
            .build();

        let pipelines = unsafe {
            ctx.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { ctx.device.destroy_pipeline_layout(layout, None) };
                return Err(RendererError::vulkan("create graphics pipeline", e));
            }
        };

        Ok(Self {
            pipeline,
            layout,
            ctx: ctx.clone(),
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_pipeline(self.pipeline, None);
            self.ctx.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Full-extent viewport and scissor, recorded as dynamic state.
pub fn set_viewport_and_scissor(device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    unsafe {
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_opaque_blend_state_per_output() {
        let states = blend_attachments(3);
        assert_eq!(states.len(), 3);
        assert!(states.iter().all(|s| s.blend_enable == vk::FALSE));
        assert!(states.iter().all(|s| s.color_write_mask == vk::ColorComponentFlags::RGBA));
    }

    #[test]
    fn culls_back_faces_clockwise_front() {
        let raster = rasterization_state();
        assert_eq!(raster.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(raster.front_face, vk::FrontFace::CLOCKWISE);
    }

    #[test]
    fn depth_state_follows_flag() {
        let on = depth_stencil_state(true);
        assert_eq!(on.depth_test_enable, vk::TRUE);
        assert_eq!(on.depth_write_enable, vk::TRUE);
        assert_eq!(on.depth_compare_op, vk::CompareOp::LESS);
        let off = depth_stencil_state(false);
        assert_eq!(off.depth_test_enable, vk::FALSE);
        assert_eq!(off.depth_write_enable, vk::FALSE);
    }

    #[test]
    fn present_attachment_ends_in_present_layout() {
        let attachment = present_attachment(vk::Format::B8G8R8A8_SRGB);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
