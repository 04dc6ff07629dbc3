// Deferred pass
//
// Geometry goes into the G-buffer first, then a full-screen resolve pass
// samples position/normal/albedo and writes the swapchain image. Both render
// passes are recorded into the same command buffer; the G-buffer's subpass
// dependencies order the hand-off.
//
// Each mesh binds its diffuse texture at set 1. Meshes without one, or whose
// texture failed to load, bind a white fallback and get the procedural
// checker instead.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::gbuffer::{GBuffer, COLOR_ATTACHMENT_COUNT};
use super::{globals_layout_bindings, FramePass, PassSettings, PerImageUniforms, SCREEN_QUAD_VERTICES};
use crate::assets::cache::normalize_path;
use crate::assets::{AssetCache, AssetLoader, DecodedImage, MeshData};
use crate::backend::buffer::GpuBuffer;
use crate::backend::descriptor::{
    layout_binding, pool_sizes, write_combined_image_sampler, write_uniform_buffer, DescriptorPool,
    DescriptorSetLayout,
};
use crate::backend::device::CommandBuffers;
use crate::backend::frame::FrameTimes;
use crate::backend::image::{Sampler, Texture};
use crate::backend::pipeline::{
    create_present_render_pass, create_swapchain_framebuffers, set_viewport_and_scissor, Framebuffer,
    GraphicsPipeline, PipelineDesc, RenderPass, VertexInput,
};
use crate::backend::shader::ShaderModule;
use crate::backend::{DeviceContext, Swapchain};
use crate::error::{RendererError, Result, VkResultExt};

/// Geometry push constants: camera for the vertex stage, material flags for
/// the fragment stage. `material.x` is 1 when set 1 holds a real diffuse map.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GeometryPush {
    view_proj: Mat4,
    material: [u32; 4],
}

const GEOMETRY_PUSH_SIZE: u32 = std::mem::size_of::<GeometryPush>() as u32;

/// Camera looking at the origin from a fixed point. Y is flipped so world up
/// lands at the top of the framebuffer.
pub fn view_projection(extent: vk::Extent2D) -> Mat4 {
    let aspect = extent.width as f32 / extent.height.max(1) as f32;
    let mut projection = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 100.0);
    projection.y_axis.y *= -1.0;
    let view = Mat4::look_at_rh(Vec3::new(2.0, 2.0, 3.0), Vec3::ZERO, Vec3::Y);
    projection * view
}

/// Meshes wind counter-clockwise outward. The flipped projection mirrors
/// them on screen, so each triangle is uploaded reversed to stay front
/// facing under the clockwise front face.
fn gpu_index_order(indices: &[u32]) -> Vec<u32> {
    indices
        .chunks_exact(3)
        .flat_map(|tri| [tri[0], tri[2], tri[1]])
        .collect()
}

/// Distinct diffuse textures in first-use order, plus each mesh's index into
/// that list. Paths are compared after normalisation.
fn material_slots<'a, I>(textures: I) -> (Vec<PathBuf>, Vec<Option<usize>>)
where
    I: IntoIterator<Item = Option<&'a Path>>,
{
    let mut unique: Vec<PathBuf> = Vec::new();
    let slots: Vec<Option<usize>> = textures
        .into_iter()
        .map(|texture| {
            let key = normalize_path(texture?);
            Some(match unique.iter().position(|p| *p == key) {
                Some(slot) => slot,
                None => {
                    unique.push(key);
                    unique.len() - 1
                }
            })
        })
        .collect();
    (unique, slots)
}

/// Set 1 of the geometry pipeline: the mesh's diffuse texture.
fn material_bindings() -> [vk::DescriptorSetLayoutBinding; 1] {
    [layout_binding(
        0,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::ShaderStageFlags::FRAGMENT,
    )]
}

/// Set 1 of the resolve pipeline: one sampler per G-buffer color target.
fn gbuffer_sampler_bindings() -> Vec<vk::DescriptorSetLayoutBinding> {
    (0..COLOR_ATTACHMENT_COUNT)
        .map(|binding| {
            layout_binding(
                binding,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
        })
        .collect()
}

struct GpuMesh {
    vertices: GpuBuffer,
    indices: GpuBuffer,
    index_count: u32,
    material_set: vk::DescriptorSet,
    textured: bool,
}

impl GpuMesh {
    fn upload(
        ctx: &Arc<DeviceContext>,
        mesh: &MeshData,
        material_set: vk::DescriptorSet,
        textured: bool,
    ) -> Result<Self> {
        let indices = gpu_index_order(&mesh.indices);
        Ok(Self {
            vertices: GpuBuffer::device_local_with_data(ctx, vk::BufferUsageFlags::VERTEX_BUFFER, &mesh.vertices)?,
            indices: GpuBuffer::device_local_with_data(ctx, vk::BufferUsageFlags::INDEX_BUFFER, &indices)?,
            index_count: indices.len() as u32,
            material_set,
            textured,
        })
    }
}

/// Swapchain-sized state. Field order is drop order.
struct Targets {
    command_buffers: CommandBuffers,
    uniform_sets: Vec<vk::DescriptorSet>,
    gbuffer_sets: Vec<vk::DescriptorSet>,
    _pool: DescriptorPool,
    uniforms: PerImageUniforms,
    resolve_pipeline: GraphicsPipeline,
    framebuffers: Vec<Framebuffer>,
    resolve_pass: RenderPass,
    geometry_pipeline: GraphicsPipeline,
    gbuffer: GBuffer,
}

/// Field order is drop order: descriptor sets go with their pool before the
/// textures and layouts they reference.
pub struct DeferredPass {
    targets: Option<Targets>,
    meshes: Vec<GpuMesh>,
    _material_pool: DescriptorPool,
    _textures: AssetCache<Texture>,
    _fallback_texture: Texture,
    sampler: Sampler,
    gbuffer_layout: DescriptorSetLayout,
    material_layout: DescriptorSetLayout,
    globals_layout: DescriptorSetLayout,
    geometry_vert: ShaderModule,
    geometry_frag: ShaderModule,
    resolve_vert: ShaderModule,
    resolve_frag: ShaderModule,
    clear_color: [f32; 4],
    ctx: Arc<DeviceContext>,
}

impl DeferredPass {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        swapchain: &Swapchain,
        settings: &PassSettings,
        assets: &mut AssetLoader,
    ) -> Result<Self> {
        let loaded = match &settings.model {
            Some(path) => assets.meshes(path)?,
            None => Arc::new(vec![MeshData::cube()]),
        };
        let mesh_data: Vec<&MeshData> = loaded.iter().filter(|mesh| !mesh.indices.is_empty()).collect();

        let (texture_paths, slots) = material_slots(mesh_data.iter().map(|mesh| mesh.diffuse_texture.as_deref()));
        let mut textures: AssetCache<Texture> = AssetCache::new();
        for path in &texture_paths {
            let upload = |p: &Path| {
                let image = assets.image(p)?;
                Texture::from_rgba(ctx, image.width, image.height, &image.pixels)
            };
            if let Err(e) = textures.get_or_load(path, upload) {
                log::warn!("Diffuse texture {:?} unavailable, using the checker: {}", path, e);
            }
        }
        let white = DecodedImage::solid_color([255; 4]);
        let fallback_texture = Texture::from_rgba(ctx, white.width, white.height, &white.pixels)?;

        // One set per distinct texture, plus the fallback
        let material_layout = DescriptorSetLayout::new(ctx, &material_bindings())?;
        let set_count = texture_paths.len() as u32 + 1;
        let material_pool = DescriptorPool::new(
            ctx,
            &pool_sizes(set_count, &[vk::DescriptorType::COMBINED_IMAGE_SAMPLER]),
            set_count,
        )?;
        let material_sets = material_pool.allocate(&vec![material_layout.handle(); set_count as usize])?;
        let fallback_set = material_sets[texture_paths.len()];
        write_combined_image_sampler(
            &ctx.device,
            fallback_set,
            0,
            fallback_texture.image.view(),
            fallback_texture.sampler.handle(),
        );
        let mut slot_sets: Vec<Option<vk::DescriptorSet>> = Vec::with_capacity(texture_paths.len());
        for (path, &set) in texture_paths.iter().zip(&material_sets) {
            let texture = textures.get(path);
            if let Some(texture) = &texture {
                write_combined_image_sampler(&ctx.device, set, 0, texture.image.view(), texture.sampler.handle());
            }
            slot_sets.push(texture.map(|_| set));
        }

        let meshes = mesh_data
            .iter()
            .zip(&slots)
            .map(|(mesh, slot)| match slot.and_then(|i| slot_sets[i]) {
                Some(set) => GpuMesh::upload(ctx, mesh, set, true),
                None => GpuMesh::upload(ctx, mesh, fallback_set, false),
            })
            .collect::<Result<Vec<_>>>()?;
        if textures.is_empty() {
            log::info!("Uploaded {} meshes for the deferred pass, untextured", meshes.len());
        } else {
            log::info!(
                "Uploaded {} meshes for the deferred pass with {} diffuse textures",
                meshes.len(),
                textures.len()
            );
        }

        let mut pass = Self {
            targets: None,
            meshes,
            _material_pool: material_pool,
            _textures: textures,
            _fallback_texture: fallback_texture,
            sampler: Sampler::attachment(ctx)?,
            gbuffer_layout: DescriptorSetLayout::new(ctx, &gbuffer_sampler_bindings())?,
            material_layout,
            globals_layout: DescriptorSetLayout::new(ctx, &globals_layout_bindings())?,
            geometry_vert: settings.shaders.load(ctx, "gbuffer.vert")?,
            geometry_frag: settings.shaders.load(ctx, "gbuffer.frag")?,
            resolve_vert: settings.shaders.load(ctx, "fullscreen.vert")?,
            resolve_frag: settings.shaders.load(ctx, "deferred_resolve.frag")?,
            clear_color: settings.clear_color,
            ctx: ctx.clone(),
        };
        pass.recreate_resources(swapchain)?;
        Ok(pass)
    }

    fn build_targets(&self, swapchain: &Swapchain) -> Result<Targets> {
        let ctx = &self.ctx;
        let image_count = swapchain.image_count();
        let extent = swapchain.extent();

        let gbuffer = GBuffer::new(ctx, extent)?;

        let push_constants = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(GEOMETRY_PUSH_SIZE)
            .build()];
        let geometry_layouts = [self.globals_layout.handle(), self.material_layout.handle()];
        let geometry_pipeline = GraphicsPipeline::new(
            ctx,
            gbuffer.render_pass(),
            &PipelineDesc {
                vertex_shader: &self.geometry_vert,
                fragment_shader: &self.geometry_frag,
                vertex_input: VertexInput::Mesh,
                topology: vk::PrimitiveTopology::TRIANGLE_LIST,
                depth_test: true,
                set_layouts: &geometry_layouts,
                push_constant_ranges: &push_constants,
            },
        )?;

        let resolve_pass = create_present_render_pass(ctx, swapchain.format())?;
        let framebuffers = create_swapchain_framebuffers(ctx, &resolve_pass, swapchain.views(), extent)?;
        let resolve_layouts = [self.globals_layout.handle(), self.gbuffer_layout.handle()];
        let resolve_pipeline = GraphicsPipeline::new(
            ctx,
            &resolve_pass,
            &PipelineDesc {
                vertex_shader: &self.resolve_vert,
                fragment_shader: &self.resolve_frag,
                vertex_input: VertexInput::None,
                topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
                depth_test: false,
                set_layouts: &resolve_layouts,
                push_constant_ranges: &[],
            },
        )?;

        let uniforms = PerImageUniforms::new(ctx, image_count)?;

        // The sampler category needs one descriptor per G-buffer color target
        let mut sizes = pool_sizes(image_count as u32, &[vk::DescriptorType::UNIFORM_BUFFER]);
        sizes.extend(pool_sizes(
            image_count as u32 * COLOR_ATTACHMENT_COUNT,
            &[vk::DescriptorType::COMBINED_IMAGE_SAMPLER],
        ));
        let pool = DescriptorPool::new(ctx, &sizes, 2 * image_count as u32)?;
        let uniform_sets = pool.allocate(&vec![self.globals_layout.handle(); image_count])?;
        let gbuffer_sets = pool.allocate(&vec![self.gbuffer_layout.handle(); image_count])?;

        for (i, (&uniform_set, &gbuffer_set)) in uniform_sets.iter().zip(&gbuffer_sets).enumerate() {
            let buffer = uniforms.buffer(i).ok_or(RendererError::ResourcesReleased)?;
            write_uniform_buffer(&ctx.device, uniform_set, 0, buffer.handle(), PerImageUniforms::SIZE);
            for (binding, view) in gbuffer.color_views().enumerate() {
                write_combined_image_sampler(&ctx.device, gbuffer_set, binding as u32, view, self.sampler.handle());
            }
        }

        let command_buffers = ctx.allocate_primary(image_count as u32)?;

        let targets = Targets {
            command_buffers,
            uniform_sets,
            gbuffer_sets,
            _pool: pool,
            uniforms,
            resolve_pipeline,
            framebuffers,
            resolve_pass,
            geometry_pipeline,
            gbuffer,
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
        let gbuffer_framebuffer = targets.gbuffer.framebuffer();
        let resolve_framebuffer = &targets.framebuffers[index];
        let extent = gbuffer_framebuffer.extent();

        let gbuffer_clears = GBuffer::clear_values();
        let gbuffer_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(targets.gbuffer.render_pass().handle())
            .framebuffer(gbuffer_framebuffer.handle())
            .render_area(full_area(extent))
            .clear_values(&gbuffer_clears);

        let resolve_clears = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let resolve_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(targets.resolve_pass.handle())
            .framebuffer(resolve_framebuffer.handle())
            .render_area(full_area(resolve_framebuffer.extent()))
            .clear_values(&resolve_clears);

        let view_proj = view_projection(extent);
        let resolve_sets = [targets.uniform_sets[index], targets.gbuffer_sets[index]];

        unsafe {
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())
                .stage("begin deferred command buffer")?;

            device.cmd_begin_render_pass(cmd, &gbuffer_begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, targets.geometry_pipeline.handle());
            set_viewport_and_scissor(device, cmd, extent);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                targets.geometry_pipeline.layout(),
                0,
                &[targets.uniform_sets[index]],
                &[],
            );
            for mesh in &self.meshes {
                let push = GeometryPush {
                    view_proj,
                    material: [mesh.textured as u32, 0, 0, 0],
                };
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    targets.geometry_pipeline.layout(),
                    1,
                    &[mesh.material_set],
                    &[],
                );
                device.cmd_push_constants(
                    cmd,
                    targets.geometry_pipeline.layout(),
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push),
                );
                device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertices.handle()], &[0]);
                device.cmd_bind_index_buffer(cmd, mesh.indices.handle(), 0, vk::IndexType::UINT32);
                device.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
            }
            device.cmd_end_render_pass(cmd);

            device.cmd_begin_render_pass(cmd, &resolve_begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, targets.resolve_pipeline.handle());
            set_viewport_and_scissor(device, cmd, resolve_framebuffer.extent());
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                targets.resolve_pipeline.layout(),
                0,
                &resolve_sets,
                &[],
            );
            device.cmd_draw(cmd, SCREEN_QUAD_VERTICES, 1, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .stage("end deferred command buffer")
        }
    }
}

fn full_area(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

impl FramePass for DeferredPass {
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
            "Deferred pass ready: G-buffer and {} resolve framebuffers at {}x{}",
            swapchain.image_count(),
            swapchain.extent().width,
            swapchain.extent().height
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_samples_three_color_targets() {
        let bindings = gbuffer_sampler_bindings();
        assert_eq!(bindings.len(), 3);
        for (i, b) in bindings.iter().enumerate() {
            assert_eq!(b.binding, i as u32);
            assert_eq!(b.descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
            assert_eq!(b.stage_flags, vk::ShaderStageFlags::FRAGMENT);
        }
    }

    fn to_ndc(m: Mat4, p: Vec3) -> glam::Vec2 {
        let clip = m * p.extend(1.0);
        assert!(clip.w > 0.0);
        clip.truncate().truncate() / clip.w
    }

    #[test]
    fn view_projection_keeps_origin_in_clip_volume() {
        let m = view_projection(vk::Extent2D { width: 1280, height: 720 });
        let clip = m * glam::Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(clip.w > 0.0);
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn world_up_is_framebuffer_up() {
        let m = view_projection(vk::Extent2D { width: 1280, height: 720 });
        // Framebuffer y grows downwards, so "above the origin" is negative NDC y
        assert!(to_ndc(m, Vec3::new(0.0, 0.5, 0.0)).y < 0.0);
        assert!(to_ndc(m, Vec3::new(0.0, -0.5, 0.0)).y > 0.0);
    }

    #[test]
    fn uploaded_cube_faces_camera_with_clockwise_winding() {
        let m = view_projection(vk::Extent2D { width: 1280, height: 720 });
        let eye = Vec3::new(2.0, 2.0, 3.0);
        let cube = MeshData::cube();
        let uploaded = gpu_index_order(&cube.indices);
        assert_eq!(uploaded.len(), cube.indices.len());

        let mut visible = 0;
        for tri in uploaded.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| cube.vertices[i as usize]);
            let facing_camera = a.normal.dot(eye - a.position) > 0.0;

            let [pa, pb, pc] = [a, b, c].map(|v| to_ndc(m, v.position));
            // Positive in y-down framebuffer space means clockwise on screen
            let clockwise = (pb - pa).perp_dot(pc - pa) > 0.0;
            assert_eq!(clockwise, facing_camera);
            visible += facing_camera as usize;
        }
        // +X, +Y and +Z faces, two triangles each
        assert_eq!(visible, 6);
    }

    #[test]
    fn zero_height_does_not_divide_by_zero() {
        let m = view_projection(vk::Extent2D { width: 800, height: 0 });
        assert!(m.is_finite());
    }

    #[test]
    fn material_slots_share_equivalent_paths() {
        let paths = [
            Some(Path::new("textures/wood.png")),
            None,
            Some(Path::new("textures/./wood.png")),
            Some(Path::new("textures/stone.png")),
        ];
        let (unique, slots) = material_slots(paths);

        assert_eq!(unique, vec![PathBuf::from("textures/wood.png"), PathBuf::from("textures/stone.png")]);
        assert_eq!(slots, vec![Some(0), None, Some(0), Some(1)]);
    }

    #[test]
    fn untextured_meshes_need_no_material_slots() {
        let cube = MeshData::cube();
        let (unique, slots) = material_slots([cube.diffuse_texture.as_deref()]);
        assert!(unique.is_empty());
        assert_eq!(slots, vec![None]);
    }

    #[test]
    fn geometry_push_carries_camera_then_material() {
        assert_eq!(GEOMETRY_PUSH_SIZE, 80);
        let push = GeometryPush {
            view_proj: Mat4::IDENTITY,
            material: [1, 0, 0, 0],
        };
        let bytes = bytemuck::bytes_of(&push);
        assert_eq!(&bytes[64..68], &1u32.to_ne_bytes());
        assert_eq!(material_bindings()[0].descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn diffuse_textures_upload_once_per_path() {
        let ctx = DeviceContext::headless("material-test", false).unwrap();
        let mut assets = AssetLoader::default();
        let path = std::env::temp_dir().join(format!("deferred-vk-{}-diffuse.png", std::process::id()));
        image::RgbaImage::from_pixel(4, 4, image::Rgba([200, 10, 10, 255])).save(&path).unwrap();

        let mut textures: AssetCache<Texture> = AssetCache::new();
        for _ in 0..2 {
            textures
                .get_or_load(&path, |p| {
                    let image = assets.image(p)?;
                    Texture::from_rgba(&ctx, image.width, image.height, &image.pixels)
                })
                .unwrap();
        }
        assert_eq!(textures.len(), 1);
        assert_eq!(textures.get(&path).unwrap().image.extent().width, 4);
        std::fs::remove_file(&path).unwrap();
    }
}
