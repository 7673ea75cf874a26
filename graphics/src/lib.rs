//! # gpuframe Graphics
//!
//! GPU frame and resource orchestration: the layer between a renderer and a
//! native graphics API that keeps CPU and GPU work in step.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`GraphicsContext`] - Explicit owner of everything below, drives frames
//! - [`ResourceTable`] - Generation-checked handles with tracked resource states
//! - [`descriptors`] - CPU pool, per-frame shader-visible ring, bindless table
//! - [`UploadRing`] - Per-frame linear CPU-to-GPU memory
//! - [`FrameOrchestrator`] - N frames in flight on a monotonic fence
//! - [`BarrierBatcher`] - Coalesced, batched state transitions
//! - [`PipelineCache`] - Pipelines from SPIR-V behind handles
//! - [`MipmapGenerator`] - Compute-based mip chain generation
//! - Multiple backend support: Vulkan and Dummy (a simulated queue for testing)
//!
//! ## Example
//!
//! ```ignore
//! use gpuframe_graphics::{ContextConfig, GraphicsContext, ColorTarget};
//!
//! let mut ctx = GraphicsContext::new(ContextConfig::default())?;
//! ctx.begin_frame()?;
//! let target = ctx.back_buffer();
//! ctx.begin_rendering(&[ColorTarget::clear(target, [0.0, 0.0, 0.0, 1.0])], None)?;
//! // Bind a pipeline, buffers and descriptors, draw...
//! ctx.end_rendering()?;
//! ctx.end_frame()?;
//! ```

#[macro_use]
pub mod profiling;

pub mod backend;
pub mod barriers;
pub mod commands;
pub mod config;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod mipmap;
pub mod pipeline;
pub mod present;
pub mod resources;
pub mod timing;
pub mod types;

// Re-export main types for convenience
pub use backend::dummy::DummyBackend;
pub use backend::{GpuBackend, create_backend, has_gpu_backend};
pub use barriers::BarrierBatcher;
pub use commands::{CommandList, GpuCommand};
pub use config::{BackendKind, ContextConfig, GpuCompletion};
pub use context::{ColorTarget, DepthTarget, GraphicsContext};
pub use descriptors::{CpuDescriptor, GpuDescriptor, PersistentAllocation, ViewDesc};
pub use error::GraphicsError;
pub use frame::{Fence, FenceStatus, FrameOrchestrator, FrameState};
pub use mipmap::MipmapGenerator;
pub use pipeline::{
    ComputePipelineDescriptor, CullMode, GraphicsPipelineDescriptor, PipelineCache, PipelineHandle,
    ShaderBytecode, ShaderStage, VertexFormat, VertexLayout,
};
pub use present::{HeadlessPresenter, Presenter};
pub use resources::{ResourceHandle, ResourceTable, UploadAllocation, UploadRing};
pub use timing::{FrameTimer, FrameTimingSummary};
pub use types::{
    BufferDescriptor, BufferUsage, Extent3d, IndexFormat, ResourceState, TextureDescriptor,
    TextureFormat, TextureUsage,
};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the graphics subsystem.
///
/// Logs the version and which native backends were compiled in.
pub fn init() {
    log::info!(
        "gpuframe graphics v{} initialized (native backend: {})",
        VERSION,
        has_gpu_backend()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend::default();
        assert!(backend.name() == "Dummy");
    }

    #[test]
    fn test_context_on_dummy_backend() {
        let config = ContextConfig::new().with_backend(BackendKind::Dummy);
        let ctx = GraphicsContext::new(config).unwrap();
        assert_eq!(ctx.backend().name(), "Dummy");
    }
}
