// Screen-quad pass
//
// Draws a full-screen triangle strip straight into the swapchain image,
// sampling one texture (set 1, binding 1) and the per-frame globals
// (set 0, binding 0).

use ash::vk;
use std::sync::Arc;

use super::{globals_layout_bindings, FramePass, PassSettings, PerImageUniforms, SCREEN_QUAD_VERTICES};
use crate::assets::{AssetLoader, DecodedImage};
use crate::backend::descriptor::{
    layout_binding, pool_sizes, write_combined_image_sampler, write_uniform_buffer, DescriptorPool,
    DescriptorSetLayout,
};
use crate::backend::device::CommandBuffers;
use crate::backend::frame::FrameTimes;
use crate::backend::image::Texture;
use crate::backend::pipeline::{
    create_present_render_pass, create_swapchain_framebuffers, set_viewport_and_scissor, Framebuffer,
    GraphicsPipeline, PipelineDesc, RenderPass, VertexInput,
};
use crate::backend::shader::ShaderModule;
use crate::backend::{DeviceContext, Swapchain};
use crate::error::{RendererError, Result, VkResultExt};

/// Everything sized to the current swapchain. Field order is drop order.
struct Targets {
    command_buffers: CommandBuffers,
    uniform_sets: Vec<vk::DescriptorSet>,
    texture_sets: Vec<vk::DescriptorSet>,
    _pool: DescriptorPool,
    uniforms: PerImageUniforms,
    pipeline: GraphicsPipeline,
    framebuffers: Vec<Framebuffer>,
    render_pass: RenderPass,
}

pub struct ScreenQuadPass {
    targets: Option<Targets>,
    texture: Texture,
    texture_layout: DescriptorSetLayout,
    globals_layout: DescriptorSetLayout,
    vertex_shader: ShaderModule,
    fragment_shader: ShaderModule,
    clear_color: [f32; 4],
    ctx: Arc<DeviceContext>,
}

impl ScreenQuadPass {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        swapchain: &Swapchain,
        settings: &PassSettings,
        assets: &mut AssetLoader,
    ) -> Result<Self> {
        let image = match &settings.texture {
            Some(path) => assets.image(path)?,
            None => Arc::new(DecodedImage::solid_color([255; 4])),
        };
        let texture = Texture::from_rgba(ctx, image.width, image.height, &image.pixels)?;

        let texture_bindings = [layout_binding(
            1,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ShaderStageFlags::FRAGMENT,
        )];

        let mut pass = Self {
            targets: None,
            texture,
            texture_layout: DescriptorSetLayout::new(ctx, &texture_bindings)?,
            globals_layout: DescriptorSetLayout::new(ctx, &globals_layout_bindings())?,
            vertex_shader: settings.shaders.load(ctx, "fullscreen.vert")?,
            fragment_shader: settings.shaders.load(ctx, "screen_quad.frag")?,
            clear_color: settings.clear_color,
            ctx: ctx.clone(),
        };
        pass.recreate_resources(swapchain)?;
        Ok(pass)
    }

    fn build_targets(&self, swapchain: &Swapchain) -> Result<Targets> {
        let ctx = &self.ctx;
        let image_count = swapchain.image_count();

        let render_pass = create_present_render_pass(ctx, swapchain.format())?;
        let framebuffers = create_swapchain_framebuffers(ctx, &render_pass, swapchain.views(), swapchain.extent())?;

        let set_layouts = [self.globals_layout.handle(), self.texture_layout.handle()];
        let pipeline = GraphicsPipeline::new(
            ctx,
            &render_pass,
            &PipelineDesc {
                vertex_shader: &self.vertex_shader,
                fragment_shader: &self.fragment_shader,
                vertex_input: VertexInput::None,
                topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
                depth_test: false,
                set_layouts: &set_layouts,
                push_constant_ranges: &[],
            },
        )?;

        let uniforms = PerImageUniforms::new(ctx, image_count)?;

        let sizes = pool_sizes(
            image_count as u32,
            &[vk::DescriptorType::UNIFORM_BUFFER, vk::DescriptorType::COMBINED_IMAGE_SAMPLER],
        );
        let pool = DescriptorPool::new(ctx, &sizes, 2 * image_count as u32)?;
        let uniform_sets = pool.allocate(&vec![self.globals_layout.handle(); image_count])?;
        let texture_sets = pool.allocate(&vec![self.texture_layout.handle(); image_count])?;

        for (i, (&uniform_set, &texture_set)) in uniform_sets.iter().zip(&texture_sets).enumerate() {
            let buffer = uniforms.buffer(i).ok_or(RendererError::ResourcesReleased)?;
            write_uniform_buffer(&ctx.device, uniform_set, 0, buffer.handle(), PerImageUniforms::SIZE);
            write_combined_image_sampler(
                &ctx.device,
                texture_set,
                1,
                self.texture.image.view(),
                self.texture.sampler.handle(),
            );
        }

        let command_buffers = ctx.allocate_primary(image_count as u32)?;

        let targets = Targets {
            command_buffers,
            uniform_sets,
            texture_sets,
            _pool: pool,
            uniforms,
            pipeline,
            framebuffers,
            render_pass,
        };
        for i in 0..image_count {
            self.record(&targets, i)?;
        }
        Ok(targets)
    }

    fn record(&self, targets: &Targets, index: usize) -> Result<()> {
        let device = &self.ctx.device;
        let cmd = targets
            .command_buffers
            .get(index)
            .ok_or(RendererError::ResourcesReleased)?;
        let framebuffer = &targets.framebuffers[index];
        let extent = framebuffer.extent();

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(targets.render_pass.handle())
            .framebuffer(framebuffer.handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let sets = [targets.uniform_sets[index], targets.texture_sets[index]];

        unsafe {
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())
                .stage("begin screen-quad command buffer")?;
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, targets.pipeline.handle());
            set_viewport_and_scissor(device, cmd, extent);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                targets.pipeline.layout(),
                0,
                &sets,
                &[],
            );
            device.cmd_draw(cmd, SCREEN_QUAD_VERTICES, 1, 0, 0);
            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .stage("end screen-quad command buffer")
        }
    }
}

impl FramePass for ScreenQuadPass {
    fn command_buffer(&self, image_index: u32) -> Result<vk::CommandBuffer> {
        self.targets
            .as_ref()
            .and_then(|t| t.command_buffers.get(image_index as usize))
            .ok_or(RendererError::ResourcesReleased)
    }

    fn wait_stage(&self) -> vk::PipelineStageFlags {
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
    }

    fn update_frame(&mut self, image_index: u32, times: &FrameTimes) -> Result<()> {
        let targets = self.targets.as_ref().ok_or(RendererError::ResourcesReleased)?;
        targets.uniforms.write(image_index, times)
    }

    fn free_resources(&mut self) {
        self.targets = None;
    }

    fn recreate_resources(&mut self, swapchain: &Swapchain) -> Result<()> {
        self.targets = Some(self.build_targets(swapchain)?);
        log::info!(
            "Screen-quad pass ready: {} framebuffers at {}x{}",
            swapchain.image_count(),
            swapchain.extent().width,
            swapchain.extent().height
        );
        Ok(())
    }
}
