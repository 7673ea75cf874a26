//! Textured mesh scene.
//!
//! Renders a spinning cube whose texture has a compute-generated mip chain.
//! The texture reaches the fragment shader one of two ways:
//!
//! - [`BindingMode::Direct`]: a CPU descriptor is staged into the frame's
//!   region of the shader-visible ring every frame and bound as a table.
//! - [`BindingMode::Bindless`]: the texture sits in a persistent bindless slot
//!   written once at setup; the slot index travels in root constants.

use bytemuck::{Pod, Zeroable};
use gpuframe_graphics::{
    BufferDescriptor, BufferUsage, ColorTarget, CpuDescriptor, CullMode, DepthTarget,
    GraphicsContext, GraphicsError, GraphicsPipelineDescriptor, IndexFormat, MipmapGenerator,
    PersistentAllocation, PipelineHandle, ResourceHandle, ResourceState, TextureDescriptor,
    TextureFormat, TextureUsage, ViewDesc,
};

use crate::camera::OrbitCamera;
use crate::settings::SceneSettings;
use crate::texture::checkerboard;
use crate::{mesh, shaders};

/// Format of the scene's depth buffer.
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Uniforms {
    mvp: [[f32; 4]; 4],
}

/// How the fragment shader finds its texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingMode {
    /// Per-frame descriptor table staged through the ring.
    Direct,
    /// Persistent bindless slot.
    Bindless,
}

impl BindingMode {
    /// The other mode.
    pub fn toggled(self) -> Self {
        match self {
            Self::Direct => Self::Bindless,
            Self::Bindless => Self::Direct,
        }
    }
}

/// GPU resources and state of the textured mesh scene.
pub struct TexturedMeshScene {
    pipeline: PipelineHandle,
    vertex_buffer: ResourceHandle,
    index_buffer: ResourceHandle,
    index_count: u32,
    texture: ResourceHandle,
    depth: ResourceHandle,
    direct_descriptor: CpuDescriptor,
    bindless_slot: PersistentAllocation,
    camera: OrbitCamera,
    spin_speed: f32,
    mode: BindingMode,
}

impl TexturedMeshScene {
    /// Create the scene's resources and record their initialization.
    ///
    /// Must be called while the context has an open command list (before the
    /// first `begin_frame`, or inside a frame). Mipmap generation drains the
    /// GPU before returning.
    pub fn new(ctx: &mut GraphicsContext, settings: &SceneSettings) -> Result<Self, GraphicsError> {
        let shaders = shaders::textured_mesh()?;
        let color_format = ctx.back_buffer_descriptor().format;
        let pipeline = ctx.create_graphics_pipeline(
            GraphicsPipelineDescriptor::new(mesh::vertex_layout(), color_format)
                .with_label("textured_mesh")
                .with_depth(DEPTH_FORMAT)
                .with_cull_mode(CullMode::Back),
            &shaders,
        )?;

        let (vertices, indices) = mesh::cube();
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let vertex_buffer = ctx.create_buffer(
            BufferDescriptor::new(
                vertex_bytes.len() as u64,
                BufferUsage::VERTEX | BufferUsage::COPY_DST,
            )
            .with_label("cube_vertices"),
            ResourceState::COPY_DEST,
        )?;
        ctx.upload_buffer_data(vertex_buffer, 0, &vertices)?;

        let index_buffer = ctx.create_buffer(
            BufferDescriptor::new(
                std::mem::size_of_val(indices.as_slice()) as u64,
                BufferUsage::INDEX | BufferUsage::COPY_DST,
            )
            .with_label("cube_indices"),
            ResourceState::COPY_DEST,
        )?;
        ctx.upload_buffer_data(index_buffer, 0, &indices)?;

        let size = settings.texture_size;
        let texture = ctx.create_texture(
            TextureDescriptor::new_2d(
                size,
                size,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED | TextureUsage::STORAGE | TextureUsage::COPY_DST,
            )
            .with_full_mip_chain()
            .with_label("checkerboard"),
            ResourceState::COPY_DEST,
        )?;
        ctx.upload_texture_data(texture, 0, &checkerboard(size, (size / 8).max(1)))?;

        let mut mipmaps = MipmapGenerator::new(ctx)?;
        mipmaps.generate(ctx, texture)?;
        mipmaps.finish(ctx)?;

        let direct_descriptor = ctx.create_descriptor(texture, ViewDesc::texture())?;
        let bindless_slot = ctx.allocate_persistent(1)?;
        ctx.write_persistent(bindless_slot.slot(), texture, ViewDesc::texture())?;

        let depth = create_depth(ctx)?;

        log::info!(
            "Textured mesh scene ready: {} indices, {}x{} texture, bindless slot {}",
            indices.len(),
            size,
            size,
            bindless_slot.slot()
        );

        Ok(Self {
            pipeline,
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            texture,
            depth,
            direct_descriptor,
            bindless_slot,
            camera: OrbitCamera::default(),
            spin_speed: settings.spin_speed,
            mode: if settings.bindless {
                BindingMode::Bindless
            } else {
                BindingMode::Direct
            },
        })
    }

    /// Current binding mode.
    pub fn mode(&self) -> BindingMode {
        self.mode
    }

    /// Switch to `mode` from the next frame on.
    pub fn set_mode(&mut self, mode: BindingMode) {
        if mode != self.mode {
            log::info!("Binding mode: {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }

    /// The camera.
    pub fn camera(&self) -> &OrbitCamera {
        &self.camera
    }

    /// Recreate the depth buffer after the back buffers were resized.
    pub fn resize(&mut self, ctx: &mut GraphicsContext) -> Result<(), GraphicsError> {
        let depth = create_depth(ctx)?;
        ctx.release_resource(std::mem::replace(&mut self.depth, depth))
    }

    /// Render one frame. Returns the fence value the frame signals.
    ///
    /// On error the frame is aborted before the error is returned.
    pub fn render(&mut self, ctx: &mut GraphicsContext, dt: f32) -> Result<u64, GraphicsError> {
        ctx.begin_frame()?;
        self.submit_frame(ctx, dt)
    }

    /// Record into the open frame and end it, aborting the frame if either
    /// step fails.
    fn submit_frame(&mut self, ctx: &mut GraphicsContext, dt: f32) -> Result<u64, GraphicsError> {
        match self.record(ctx, dt).and_then(|()| ctx.end_frame()) {
            Ok(value) => Ok(value),
            Err(e) => {
                log::error!("Frame aborted: {}", e);
                if ctx.frames().in_frame() {
                    ctx.abort_frame();
                }
                Err(e)
            }
        }
    }

    fn record(&mut self, ctx: &mut GraphicsContext, dt: f32) -> Result<(), GraphicsError> {
        self.camera.orbit(dt * self.spin_speed);
        let aspect = ctx.frame_width() as f32 / ctx.frame_height() as f32;
        let uniforms = Uniforms {
            mvp: self.camera.view_projection(aspect).to_cols_array_2d(),
        };
        let constants = ctx.upload_ring_mut().upload(&[uniforms])?;

        ctx.set_pipeline(self.pipeline)?;
        ctx.set_vertex_buffer(0, self.vertex_buffer, 0)?;
        ctx.set_index_buffer(self.index_buffer, 0, IndexFormat::Uint16)?;
        ctx.set_constant_buffer(&constants)?;
        ctx.transition(self.texture, ResourceState::PIXEL_SHADER_RESOURCE)?;

        match self.mode {
            BindingMode::Direct => {
                let table = ctx.stage_descriptors(&[self.direct_descriptor])?;
                ctx.bind_descriptor_table(table.index())?;
                ctx.set_constants(&[0, 0])?;
            }
            BindingMode::Bindless => {
                ctx.set_constants(&[1, self.bindless_slot.slot()])?;
            }
        }

        let target = ctx.back_buffer();
        ctx.begin_rendering(
            &[ColorTarget::clear(target, CLEAR_COLOR)],
            Some(DepthTarget {
                handle: self.depth,
                clear: Some(1.0),
            }),
        )?;
        ctx.draw_indexed(self.index_count, 1, 0, 0, 0)?;
        ctx.end_rendering()
    }
}

fn create_depth(ctx: &mut GraphicsContext) -> Result<ResourceHandle, GraphicsError> {
    ctx.create_texture(
        TextureDescriptor::new_2d(
            ctx.frame_width(),
            ctx.frame_height(),
            DEPTH_FORMAT,
            TextureUsage::RENDER_ATTACHMENT,
        )
        .with_label("scene_depth"),
        ResourceState::DEPTH_WRITE,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gpuframe_graphics::{BackendKind, ContextConfig, DummyBackend};

    use super::*;

    fn dummy_context() -> (GraphicsContext, Arc<DummyBackend>) {
        let config = ContextConfig::new()
            .with_backend(BackendKind::Dummy)
            .with_size(64, 48);
        let backend = Arc::new(DummyBackend::default());
        let ctx = GraphicsContext::with_backend(config, backend.clone()).unwrap();
        (ctx, backend)
    }

    fn settings() -> SceneSettings {
        SceneSettings {
            texture_size: 64,
            ..SceneSettings::default()
        }
    }

    #[test]
    fn test_setup_generates_mipmaps() {
        let (mut ctx, backend) = dummy_context();
        let _scene = TexturedMeshScene::new(&mut ctx, &settings()).unwrap();
        // 64x64 has 7 levels
        assert_eq!(backend.stats().dispatches, 6);
        assert_eq!(backend.stats().buffer_copies, 2);
        assert_eq!(backend.stats().texture_copies, 1);
    }

    #[test]
    fn test_both_binding_modes_draw() {
        let (mut ctx, backend) = dummy_context();
        let mut scene = TexturedMeshScene::new(&mut ctx, &settings()).unwrap();
        for _ in 0..3 {
            scene.render(&mut ctx, 1.0 / 60.0).unwrap();
        }
        scene.set_mode(scene.mode().toggled());
        assert_eq!(scene.mode(), BindingMode::Bindless);
        for _ in 0..3 {
            scene.render(&mut ctx, 1.0 / 60.0).unwrap();
        }
        assert_eq!(backend.stats().draws, 6);
        assert_eq!(ctx.frames().frame_count(), 6);
    }

    #[test]
    fn test_failed_submit_aborts_frame() {
        let (mut ctx, backend) = dummy_context();
        let mut scene = TexturedMeshScene::new(&mut ctx, &settings()).unwrap();
        scene.render(&mut ctx, 0.0).unwrap();

        ctx.begin_frame().unwrap();
        backend.lose_device();
        let result = scene.submit_frame(&mut ctx, 0.0);
        assert!(matches!(result, Err(GraphicsError::DeviceLost)));
        assert!(!ctx.frames().in_frame());
    }

    #[test]
    fn test_resize_recreates_depth() {
        let (mut ctx, _backend) = dummy_context();
        let mut scene = TexturedMeshScene::new(&mut ctx, &settings()).unwrap();
        scene.render(&mut ctx, 0.0).unwrap();
        ctx.resize(32, 32).unwrap();
        scene.resize(&mut ctx).unwrap();
        scene.render(&mut ctx, 0.0).unwrap();
    }
}
