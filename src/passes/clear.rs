// Clear-only pass
//
// No render pass, no pipeline: each swapchain image gets a pre-recorded
// command buffer that clears it with a transfer command.

use ash::vk;
use std::sync::Arc;

use super::{FramePass, PassSettings};
use crate::backend::device::CommandBuffers;
use crate::backend::frame::FrameTimes;
use crate::backend::{DeviceContext, Swapchain};
use crate::error::{RendererError, Result, VkResultExt};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

fn layout_barrier(
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
        .build()
}

pub struct ClearPass {
    clear_color: [f32; 4],
    command_buffers: Option<CommandBuffers>,
    ctx: Arc<DeviceContext>,
}

impl ClearPass {
    pub fn new(ctx: &Arc<DeviceContext>, swapchain: &Swapchain, settings: &PassSettings) -> Result<Self> {
        let mut pass = Self {
            clear_color: settings.clear_color,
            command_buffers: None,
            ctx: ctx.clone(),
        };
        pass.recreate_resources(swapchain)?;
        Ok(pass)
    }

    fn record(&self, cmd: vk::CommandBuffer, image: vk::Image) -> Result<()> {
        let device = &self.ctx.device;
        let clear_color = vk::ClearColorValue {
            float32: self.clear_color,
        };

        unsafe {
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())
                .stage("begin clear command buffer")?;

            // Previous contents are irrelevant, so UNDEFINED covers both a
            // fresh image and one coming back from presentation
            let to_transfer = layout_barrier(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color,
                &[COLOR_RANGE],
            );

            let to_present = layout_barrier(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::empty(),
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );

            device.end_command_buffer(cmd).stage("end clear command buffer")
        }
    }
}

impl FramePass for ClearPass {
    fn command_buffer(&self, image_index: u32) -> Result<vk::CommandBuffer> {
        self.command_buffers
            .as_ref()
            .and_then(|buffers| buffers.get(image_index as usize))
            .ok_or(RendererError::ResourcesReleased)
    }

    fn wait_stage(&self) -> vk::PipelineStageFlags {
        vk::PipelineStageFlags::TRANSFER
    }

    fn update_frame(&mut self, _image_index: u32, _times: &FrameTimes) -> Result<()> {
        Ok(())
    }

    fn free_resources(&mut self) {
        self.command_buffers = None;
    }

    fn recreate_resources(&mut self, swapchain: &Swapchain) -> Result<()> {
        let buffers = self.ctx.allocate_primary(swapchain.image_count() as u32)?;
        for (&cmd, &image) in buffers.as_slice().iter().zip(swapchain.images()) {
            self.record(cmd, image)?;
        }
        log::info!("Recorded {} clear command buffers", buffers.len());
        self.command_buffers = Some(buffers);
        Ok(())
    }
}
