//! Compute-based mipmap generation.
//!
//! [`MipmapGenerator`] fills every mip level of a texture from level 0 with a
//! 2x2 box filter, one compute dispatch per level pair.
//!
//! # Usage
//!
//! The generator is a scoped value bracketing a mandatory GPU drain:
//!
//! ```ignore
//! ctx.upload_texture_data(texture, 0, &pixels)?;
//!
//! let mut mipmaps = MipmapGenerator::new(&mut ctx)?;
//! mipmaps.generate(&mut ctx, texture)?;
//! mipmaps.finish(&mut ctx)?;   // submits and waits; scratch state released
//!
//! ctx.transition(texture, ResourceState::PIXEL_SHADER_RESOURCE)?;
//! ```
//!
//! # Per-Level Work
//!
//! ```text
//! level L (sampled view) ──► 8x8 workgroups ──► level L+1 (storage view)
//!                                │
//!                      UAV barrier before the next level reads L+1
//! ```
//!
//! The source and destination views are staged into the frame's descriptor
//! ring as a two-entry table: the source at `table_base`, the destination at
//! `table_base + 1`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::GraphicsContext;
use crate::descriptors::{CpuDescriptor, ViewDesc};
use crate::error::GraphicsError;
use crate::pipeline::{ComputePipelineDescriptor, PipelineHandle, ShaderBytecode, ShaderStage};
use crate::resources::ResourceHandle;
use crate::types::{ResourceState, TextureFormat, TextureUsage};

/// Workgroup edge length of the downsample kernel.
pub const WORKGROUP_SIZE: u32 = 8;

const KERNEL_TEMPLATE: &str = r#"
struct Constants {
    table_base: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
    dst_size: vec2<u32>,
}

var<push_constant> constants: Constants;

@group(0) @binding(0) var src_mips: binding_array<texture_2d<f32>>;
@group(0) @binding(1) var dst_mips: binding_array<texture_storage_2d<{FORMAT}, write> >;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= constants.dst_size.x || id.y >= constants.dst_size.y) {
        return;
    }

    let src_index = constants.table_base;
    let src_size = vec2<i32>(textureDimensions(src_mips[src_index]));
    let max_coord = src_size - vec2<i32>(1, 1);
    let base = vec2<i32>(id.xy) * 2;

    var sum = textureLoad(src_mips[src_index], min(base, max_coord), 0);
    sum += textureLoad(src_mips[src_index], min(base + vec2<i32>(1, 0), max_coord), 0);
    sum += textureLoad(src_mips[src_index], min(base + vec2<i32>(0, 1), max_coord), 0);
    sum += textureLoad(src_mips[src_index], min(base + vec2<i32>(1, 1), max_coord), 0);

    textureStore(dst_mips[constants.table_base + 1u], vec2<i32>(id.xy), sum * 0.25);
}
"#;

/// WGSL source of the downsample kernel for a storage format.
pub fn kernel_source(format: TextureFormat) -> Result<String, GraphicsError> {
    let name = format.wgsl_storage_format().ok_or_else(|| {
        GraphicsError::InvalidParameter(format!(
            "{:?} cannot be written from compute shaders",
            format
        ))
    })?;
    Ok(KERNEL_TEMPLATE.replace("{FORMAT}", name))
}

/// Generates mip chains with a compute pass.
pub struct MipmapGenerator {
    pipelines: HashMap<TextureFormat, PipelineHandle>,
    scratch: CpuDescriptor,
    orphans: Arc<Mutex<Vec<PipelineHandle>>>,
    dispatches: u32,
    finished: bool,
}

impl MipmapGenerator {
    /// Build the kernel for `Rgba8Unorm` and reserve scratch descriptors.
    ///
    /// Kernels for other formats are built on first use.
    pub fn new(ctx: &mut GraphicsContext) -> Result<Self, GraphicsError> {
        let scratch = ctx.allocate_descriptors(2)?;
        let mut generator = Self {
            pipelines: HashMap::new(),
            scratch,
            orphans: ctx.orphaned_pipelines(),
            dispatches: 0,
            finished: false,
        };
        generator.pipeline(ctx, TextureFormat::Rgba8Unorm)?;
        Ok(generator)
    }

    /// Record the commands that fill levels `1..mip_level_count` of `texture`.
    ///
    /// The texture is left in `UNORDERED_ACCESS`. Returns the number of
    /// dispatches recorded.
    pub fn generate(
        &mut self,
        ctx: &mut GraphicsContext,
        texture: ResourceHandle,
    ) -> Result<u32, GraphicsError> {
        profile_scope!("mipmap_generate");
        if !ctx.is_recording() {
            return Err(GraphicsError::FrameState(
                "mipmap generation needs an open command list".to_string(),
            ));
        }
        let desc = ctx
            .resources()
            .desc(texture)?
            .as_texture()
            .cloned()
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("{:?} is not a texture", texture))
            })?;

        let required = TextureUsage::SAMPLED | TextureUsage::STORAGE;
        if !desc.usage.contains(required) {
            return Err(GraphicsError::InvalidParameter(format!(
                "mipmap generation needs SAMPLED | STORAGE usage, {:?} has {:?}",
                desc.label, desc.usage
            )));
        }
        if desc.mip_level_count <= 1 {
            return Ok(0);
        }

        let pipeline = self.pipeline(ctx, desc.format)?;
        ctx.transition(texture, ResourceState::UNORDERED_ACCESS)?;
        ctx.set_pipeline(pipeline)?;

        let sources = [self.scratch, self.scratch.offset(1)];
        let mut dispatches = 0;
        for level in 0..desc.mip_level_count - 1 {
            ctx.write_descriptor(sources[0], texture, ViewDesc::texture_mip(level))?;
            ctx.write_descriptor(sources[1], texture, ViewDesc::storage(level + 1))?;
            let table = ctx.stage_descriptors(&sources)?;
            ctx.bind_descriptor_table(table.index())?;

            if level > 0 {
                ctx.uav_barrier(texture)?;
            }

            let dst = desc.size.mip_level(level + 1);
            ctx.set_constants(&[dst.width, dst.height])?;
            ctx.dispatch(
                dst.width.div_ceil(WORKGROUP_SIZE),
                dst.height.div_ceil(WORKGROUP_SIZE),
                1,
            )?;
            dispatches += 1;
        }

        log::debug!(
            "Mipmaps: {} dispatches for {:?} ({}x{}, {} levels)",
            dispatches,
            desc.label,
            desc.size.width,
            desc.size.height,
            desc.mip_level_count
        );
        self.dispatches += dispatches;
        Ok(dispatches)
    }

    /// Submit, wait for the GPU, then release the kernels.
    ///
    /// Every kernel is released even if an earlier step fails; the first
    /// error is returned.
    pub fn finish(mut self, ctx: &mut GraphicsContext) -> Result<(), GraphicsError> {
        self.finished = true;
        let mut result = ctx.finish_gpu_commands();
        for (format, handle) in self.pipelines.drain() {
            if let Err(e) = ctx.release_pipeline(handle) {
                log::error!("Failed to release {:?} mip kernel: {}", format, e);
                result = result.and(Err(e));
            }
        }
        result
    }

    /// Dispatches recorded by this generator.
    pub fn dispatch_count(&self) -> u32 {
        self.dispatches
    }

    fn pipeline(
        &mut self,
        ctx: &mut GraphicsContext,
        format: TextureFormat,
    ) -> Result<PipelineHandle, GraphicsError> {
        if let Some(&handle) = self.pipelines.get(&format) {
            return Ok(handle);
        }
        let source = kernel_source(format)?;
        let shader = ShaderBytecode::compile_wgsl(ShaderStage::Compute, &source, "main")?;
        let handle = ctx.create_compute_pipeline(
            ComputePipelineDescriptor::new(format!("mipmap_{:?}", format)),
            &shader,
        )?;
        self.pipelines.insert(format, handle);
        Ok(handle)
    }
}

impl Drop for MipmapGenerator {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!(
            "MipmapGenerator dropped without finish(); {} dispatches may still be unsubmitted",
            self.dispatches
        );
        self.orphans
            .lock()
            .extend(self.pipelines.drain().map(|(_, handle)| handle));
    }
}

impl std::fmt::Debug for MipmapGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MipmapGenerator")
            .field("formats", &self.pipelines.keys().collect::<Vec<_>>())
            .field("dispatches", &self.dispatches)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::config::ContextConfig;
    use crate::types::TextureDescriptor;

    fn context(backend: Arc<DummyBackend>) -> GraphicsContext {
        GraphicsContext::with_backend(ContextConfig::new().with_size(64, 64), backend).unwrap()
    }

    fn mip_texture(ctx: &mut GraphicsContext, size: u32) -> ResourceHandle {
        ctx.create_texture(
            TextureDescriptor::new_2d(
                size,
                size,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED | TextureUsage::STORAGE | TextureUsage::COPY_DST,
            )
            .with_full_mip_chain(),
            ResourceState::COPY_DEST,
        )
        .unwrap()
    }

    #[test]
    fn test_kernel_compiles() {
        let source = kernel_source(TextureFormat::Rgba8Unorm).unwrap();
        assert!(source.contains("rgba8unorm"));
        ShaderBytecode::compile_wgsl(ShaderStage::Compute, &source, "main").unwrap();
    }

    #[test]
    fn test_unsupported_format() {
        assert!(kernel_source(TextureFormat::Bgra8UnormSrgb).is_err());
    }

    #[test]
    fn test_dispatch_count_and_sizes() {
        let backend = Arc::new(DummyBackend::default());
        let mut ctx = context(backend.clone());
        let texture = mip_texture(&mut ctx, 64);

        let mut generator = MipmapGenerator::new(&mut ctx).unwrap();
        assert_eq!(generator.generate(&mut ctx, texture).unwrap(), 6);

        let dispatches: Vec<_> = ctx
            .commands()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                crate::commands::GpuCommand::Dispatch { x, y, z } => Some((*x, *y, *z)),
                _ => None,
            })
            .collect();
        assert_eq!(
            dispatches,
            vec![(4, 4, 1), (2, 2, 1), (1, 1, 1), (1, 1, 1), (1, 1, 1), (1, 1, 1)]
        );
        assert_eq!(
            ctx.resources().state(texture).unwrap(),
            ResourceState::UNORDERED_ACCESS
        );

        generator.finish(&mut ctx).unwrap();
        assert_eq!(backend.stats().dispatches, 6);
        // five UAV barriers between six levels
        assert_eq!(backend.stats().uav_barriers, 5);
    }

    #[test]
    fn test_requires_storage_usage() {
        let backend = Arc::new(DummyBackend::default());
        let mut ctx = context(backend);
        let texture = ctx
            .create_texture(
                TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED)
                    .with_full_mip_chain(),
                ResourceState::COMMON,
            )
            .unwrap();

        let mut generator = MipmapGenerator::new(&mut ctx).unwrap();
        assert!(generator.generate(&mut ctx, texture).is_err());
        generator.finish(&mut ctx).unwrap();
    }

    #[test]
    fn test_finish_releases_every_kernel_on_error() {
        let backend = Arc::new(DummyBackend::default());
        let mut ctx = context(backend);

        let mut generator = MipmapGenerator::new(&mut ctx).unwrap();
        let stale = generator.pipelines[&TextureFormat::Rgba8Unorm];
        ctx.release_pipeline(stale).unwrap();

        let mut other = MipmapGenerator::new(&mut ctx).unwrap();
        let live = other.pipelines.remove(&TextureFormat::Rgba8Unorm).unwrap();
        other.finish(&mut ctx).unwrap();
        generator.pipelines.insert(TextureFormat::R32Float, live);
        assert_eq!(ctx.pipelines().len(), 1);

        assert!(matches!(
            generator.finish(&mut ctx),
            Err(GraphicsError::InvalidHandle)
        ));
        assert_eq!(ctx.pipelines().len(), 0);
    }

    #[test]
    fn test_drop_without_finish_releases_pipeline() {
        let backend = Arc::new(DummyBackend::default());
        let mut ctx = context(backend);
        let generator = MipmapGenerator::new(&mut ctx).unwrap();
        assert_eq!(ctx.pipelines().len(), 1);
        drop(generator);

        ctx.begin_frame().unwrap();
        assert_eq!(ctx.pipelines().len(), 0);
        assert_eq!(ctx.pipelines().pending_destruction_count(), 1);
        ctx.end_frame().unwrap();
    }
}
