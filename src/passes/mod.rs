// Render passes
//
// A closed set of pass variants behind one enum. Each variant owns the
// objects that depend on the swapchain (framebuffers, pipelines, command
// buffers, descriptor sets) and can release and rebuild them on resize.

pub mod clear;
pub mod deferred;
pub mod gbuffer;
pub mod screen_quad;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::assets::AssetLoader;
use crate::backend::buffer::GpuBuffer;
use crate::backend::descriptor::layout_binding;
use crate::backend::frame::FrameTimes;
use crate::backend::shader::ShaderDir;
use crate::backend::{DeviceContext, Swapchain};
use crate::error::{RendererError, Result};

pub use clear::ClearPass;
pub use deferred::DeferredPass;
pub use screen_quad::ScreenQuadPass;

/// What the frame engine needs from a pass.
pub trait FramePass {
    /// Pre-recorded command buffer for a swapchain image.
    fn command_buffer(&self, image_index: u32) -> Result<vk::CommandBuffer>;

    /// Stage that waits on the image-available semaphore.
    fn wait_stage(&self) -> vk::PipelineStageFlags;

    /// Write per-frame data for the slot tied to `image_index`.
    fn update_frame(&mut self, image_index: u32, times: &FrameTimes) -> Result<()>;

    /// Drop everything sized to the swapchain. The device must be idle.
    fn free_resources(&mut self);

    /// Rebuild after the swapchain changed.
    fn recreate_resources(&mut self, swapchain: &Swapchain) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Clear,
    ScreenQuad,
    #[default]
    Deferred,
}

/// Inputs shared by every pass variant.
#[derive(Debug, Clone)]
pub struct PassSettings {
    pub clear_color: [f32; 4],
    pub shaders: ShaderDir,
    pub texture: Option<PathBuf>,
    pub model: Option<PathBuf>,
}

pub enum Pass {
    Clear(ClearPass),
    ScreenQuad(ScreenQuadPass),
    Deferred(DeferredPass),
}

impl Pass {
    pub fn new(
        kind: PassKind,
        ctx: &Arc<DeviceContext>,
        swapchain: &Swapchain,
        settings: &PassSettings,
        assets: &mut AssetLoader,
    ) -> Result<Self> {
        log::info!("Building {:?} pass", kind);
        Ok(match kind {
            PassKind::Clear => Self::Clear(ClearPass::new(ctx, swapchain, settings)?),
            PassKind::ScreenQuad => Self::ScreenQuad(ScreenQuadPass::new(ctx, swapchain, settings, assets)?),
            PassKind::Deferred => Self::Deferred(DeferredPass::new(ctx, swapchain, settings, assets)?),
        })
    }

    fn inner(&self) -> &dyn FramePass {
        match self {
            Self::Clear(pass) => pass,
            Self::ScreenQuad(pass) => pass,
            Self::Deferred(pass) => pass,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn FramePass {
        match self {
            Self::Clear(pass) => pass,
            Self::ScreenQuad(pass) => pass,
            Self::Deferred(pass) => pass,
        }
    }
}

impl FramePass for Pass {
    fn command_buffer(&self, image_index: u32) -> Result<vk::CommandBuffer> {
        self.inner().command_buffer(image_index)
    }

    fn wait_stage(&self) -> vk::PipelineStageFlags {
        self.inner().wait_stage()
    }

    fn update_frame(&mut self, image_index: u32, times: &FrameTimes) -> Result<()> {
        self.inner_mut().update_frame(image_index, times)
    }

    fn free_resources(&mut self) {
        self.inner_mut().free_resources()
    }

    fn recreate_resources(&mut self, swapchain: &Swapchain) -> Result<()> {
        self.inner_mut().recreate_resources(swapchain)
    }
}

/// Per-frame shader globals, set 0 binding 0. Times in milliseconds.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GlobalShaderVars {
    pub total_elapsed_time: f32,
    pub frame_time: f32,
}

impl From<&FrameTimes> for GlobalShaderVars {
    fn from(times: &FrameTimes) -> Self {
        Self {
            total_elapsed_time: times.elapsed_ms,
            frame_time: times.delta_ms,
        }
    }
}

/// Set 0 layout: the globals uniform, visible to every graphics stage.
pub fn globals_layout_bindings() -> [vk::DescriptorSetLayoutBinding; 1] {
    [layout_binding(
        0,
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::ShaderStageFlags::ALL_GRAPHICS,
    )]
}

/// One host-visible globals buffer per swapchain image, indexed by image
/// index so a buffer is never rewritten while its image is in flight.
pub struct PerImageUniforms {
    buffers: Vec<GpuBuffer>,
}

impl PerImageUniforms {
    pub const SIZE: vk::DeviceSize = std::mem::size_of::<GlobalShaderVars>() as vk::DeviceSize;

    pub fn new(ctx: &Arc<DeviceContext>, image_count: usize) -> Result<Self> {
        let buffers = (0..image_count)
            .map(|_| GpuBuffer::host_visible(ctx, Self::SIZE, vk::BufferUsageFlags::UNIFORM_BUFFER))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { buffers })
    }

    pub fn buffer(&self, image_index: usize) -> Option<&GpuBuffer> {
        self.buffers.get(image_index)
    }

    pub fn write(&self, image_index: u32, times: &FrameTimes) -> Result<()> {
        let buffer = self
            .buffers
            .get(image_index as usize)
            .ok_or(RendererError::ResourcesReleased)?;
        buffer.write(&[GlobalShaderVars::from(times)])
    }
}

/// Full-screen triangle strip drawn from `gl_VertexIndex`.
pub const SCREEN_QUAD_VERTICES: u32 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        pass: PassKind,
    }

    #[test]
    fn pass_kind_parses_snake_case() {
        let w: Wrapper = toml::from_str("pass = \"screen_quad\"").unwrap();
        assert_eq!(w.pass, PassKind::ScreenQuad);
        let w: Wrapper = toml::from_str("pass = \"clear\"").unwrap();
        assert_eq!(w.pass, PassKind::Clear);
        assert!(toml::from_str::<Wrapper>("pass = \"forward\"").is_err());
    }

    #[test]
    fn globals_are_two_floats_in_ms() {
        assert_eq!(PerImageUniforms::SIZE, 8);
        let vars = GlobalShaderVars::from(&FrameTimes {
            elapsed_ms: 1500.0,
            delta_ms: 16.5,
        });
        assert_eq!(vars.total_elapsed_time, 1500.0);
        assert_eq!(vars.frame_time, 16.5);
    }

    #[test]
    fn globals_binding_is_set0_binding0() {
        let [binding] = globals_layout_bindings();
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::ALL_GRAPHICS);
    }
}
