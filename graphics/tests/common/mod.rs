//! Common utilities for integration tests.
//!
//! This module provides shared test infrastructure that can be reused
//! across different backend implementations.

use std::sync::Arc;

use gpuframe_graphics::{
    BackendKind, ContextConfig, DummyBackend, GpuBackend, GpuCompletion, GraphicsContext,
    ResourceHandle, ResourceState, TextureDescriptor, TextureFormat, TextureUsage,
};

/// Route `log` output to the test harness. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Available GPU backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Dummy backend with work completing on submission.
    Dummy,
    /// Dummy backend whose work completes only when the test says so.
    DummyManual,
    /// Vulkan backend (native via ash).
    Vulkan,
}

impl Backend {
    /// Check if this backend is compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Dummy | Backend::DummyManual => true,
            Backend::Vulkan => gpuframe_graphics::has_gpu_backend(),
        }
    }

    /// Configuration selecting this backend.
    pub fn config(self) -> ContextConfig {
        let config = ContextConfig::new().with_size(64, 64).with_validation(false);
        match self {
            Backend::Dummy => config.with_backend(BackendKind::Dummy),
            Backend::DummyManual => config
                .with_backend(BackendKind::Dummy)
                .with_gpu_completion(GpuCompletion::Manual),
            Backend::Vulkan => config.with_backend(BackendKind::Vulkan),
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// A graphics context plus, for dummy backends, a handle to drive the GPU.
pub struct TestContext {
    pub ctx: GraphicsContext,
    pub dummy: Option<Arc<DummyBackend>>,
}

impl TestContext {
    /// Create a context on `backend`, or `None` if it cannot be created here
    /// (for example no Vulkan device on the machine).
    pub fn new(backend: Backend) -> Option<Self> {
        Self::with_config(backend, backend.config())
    }

    /// Create a context on `backend` with a custom configuration.
    pub fn with_config(backend: Backend, config: ContextConfig) -> Option<Self> {
        init_logging();
        if !backend.is_available() {
            return None;
        }
        match backend {
            Backend::Dummy | Backend::DummyManual => {
                let dummy = Arc::new(DummyBackend::new(config.gpu_completion));
                let gpu: Arc<dyn GpuBackend> = dummy.clone();
                let ctx = GraphicsContext::with_backend(config, gpu).ok()?;
                Some(Self {
                    ctx,
                    dummy: Some(dummy),
                })
            }
            Backend::Vulkan => match GraphicsContext::new(config) {
                Ok(ctx) => Some(Self { ctx, dummy: None }),
                Err(e) => {
                    eprintln!("Vulkan context unavailable: {}", e);
                    None
                }
            },
        }
    }

    /// Complete every submission on a manual dummy backend. No-op otherwise.
    pub fn complete_all(&self) {
        if let Some(dummy) = &self.dummy {
            dummy.complete_all();
        }
    }
}

// ============================================================================
// Resource Helpers
// ============================================================================

/// Create a texture usable as a mipmap generation target.
pub fn create_mipmapped_texture(
    ctx: &mut GraphicsContext,
    size: u32,
    mip_levels: u32,
) -> ResourceHandle {
    let desc = TextureDescriptor::new_2d(
        size,
        size,
        TextureFormat::Rgba8Unorm,
        TextureUsage::SAMPLED | TextureUsage::STORAGE | TextureUsage::COPY_DST,
    )
    .with_mip_levels(mip_levels)
    .with_label("mipmapped");
    ctx.create_texture(desc, ResourceState::COPY_DEST)
        .expect("texture creation failed")
}

/// Generate an RGBA8 checkerboard of `size`x`size` texels with 8-texel cells.
pub fn generate_checkerboard(size: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let white = ((x / 8) + (y / 8)) % 2 == 0;
            let value = if white { 255 } else { 32 };
            data.extend_from_slice(&[value, value, value, 255]);
        }
    }
    data
}
