//! GPU backend abstraction layer.
//!
//! The orchestration layer never talks to a graphics API directly. Everything
//! native goes through the [`GpuBackend`] trait, which owns a single queue and
//! its monotonically increasing completion counter.
//!
//! # Available Backends
//!
//! - `dummy` (always built): a simulated GPU queue for tests and headless runs.
//!   Submissions complete immediately or when the test driver says so.
//! - `vulkan-backend`: native Vulkan using ash, gpu-allocator and timeline
//!   semaphores.
//!
//! # Native Objects
//!
//! | Type | Owns |
//! |------|------|
//! | [`GpuResource`] | A buffer or texture and its memory |
//! | [`GpuView`] | A view of one resource (sampled, storage or buffer range) |
//! | [`GpuDescriptorHeap`] | A CPU-only or shader-visible array of views |
//! | [`GpuPipeline`] | A compiled graphics or compute pipeline |
//!
//! Native objects are destroyed when their last `Arc` is dropped. The
//! orchestration layer keeps them alive until the GPU is done with them
//! (see [`crate::deferred`]).

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::commands::CommandList;
use crate::config::{BackendKind, ContextConfig};
use crate::error::GraphicsError;
use crate::pipeline::{PipelineDescriptor, ShaderBytecode};
use crate::types::{BufferDescriptor, TextureDescriptor};

/// A native buffer or texture.
#[allow(clippy::large_enum_variant)]
pub enum GpuResource {
    /// Dummy backend resource (CPU-side storage only).
    Dummy(dummy::DummyResource),
    /// Vulkan backend resource.
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanResource),
}

impl std::fmt::Debug for GpuResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(resource) => f.debug_tuple("GpuResource::Dummy").field(resource).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(resource) => f
                .debug_tuple("GpuResource::Vulkan")
                .field(resource)
                .finish(),
        }
    }
}

static_assertions::assert_impl_all!(GpuResource: Send, Sync);

/// What a [`GpuView`] exposes of its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Sampled (read-only) view of a mip range of a texture.
    Sampled {
        /// First visible mip level.
        base_mip: u32,
        /// Number of visible mip levels.
        mip_count: u32,
    },
    /// Storage (unordered access) view of a single mip level of a texture.
    Storage {
        /// The mip level.
        mip_level: u32,
    },
    /// Byte range of a buffer.
    Buffer {
        /// Offset in bytes.
        offset: u64,
        /// Size in bytes.
        size: u64,
    },
}

/// A view of a resource, storable in a descriptor heap.
pub struct GpuView {
    // Dropped before the resource it views.
    #[allow(dead_code)]
    native: NativeView,
    resource: Arc<GpuResource>,
    kind: ViewKind,
}

pub(crate) enum NativeView {
    Dummy,
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanView),
}

impl GpuView {
    pub(crate) fn new(resource: Arc<GpuResource>, kind: ViewKind, native: NativeView) -> Self {
        Self {
            native,
            resource,
            kind,
        }
    }

    /// The viewed resource.
    pub fn resource(&self) -> &Arc<GpuResource> {
        &self.resource
    }

    /// The view kind.
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    #[cfg(feature = "vulkan-backend")]
    pub(crate) fn native(&self) -> &NativeView {
        &self.native
    }
}

impl std::fmt::Debug for GpuView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuView")
            .field("resource", &self.resource)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// An array of views: either CPU-only staging storage or the shader-visible heap.
///
/// Heaps keep every stored view alive, so a view (and its resource) lives at
/// least as long as any slot still refers to it.
pub struct GpuDescriptorHeap {
    shader_visible: bool,
    entries: Mutex<Vec<Option<Arc<GpuView>>>>,
    #[allow(dead_code)]
    native: NativeHeap,
}

pub(crate) enum NativeHeap {
    Cpu,
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanHeap),
}

impl GpuDescriptorHeap {
    pub(crate) fn new(capacity: u32, shader_visible: bool, native: NativeHeap) -> Self {
        Self {
            shader_visible,
            entries: Mutex::new(vec![None; capacity as usize]),
            native,
        }
    }

    /// Number of descriptor slots.
    pub fn capacity(&self) -> u32 {
        self.entries.lock().len() as u32
    }

    /// Whether shaders can index this heap.
    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }

    /// The view stored at `index`, if any.
    pub fn view(&self, index: u32) -> Option<Arc<GpuView>> {
        self.entries.lock().get(index as usize).cloned().flatten()
    }

    /// Number of slots holding a view.
    pub fn occupied(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.is_some()).count()
    }

    pub(crate) fn store(&self, index: u32, view: Arc<GpuView>) -> Result<(), GraphicsError> {
        let mut entries = self.entries.lock();
        let capacity = entries.len();
        let slot = entries.get_mut(index as usize).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!(
                "descriptor index {index} out of range ({capacity})"
            ))
        })?;
        *slot = Some(view);
        Ok(())
    }

    /// Views in `[index, index + count)`; missing entries are an error.
    pub(crate) fn range(&self, index: u32, count: u32) -> Result<Vec<Arc<GpuView>>, GraphicsError> {
        let entries = self.entries.lock();
        (index..index + count)
            .map(|i| {
                entries.get(i as usize).cloned().flatten().ok_or_else(|| {
                    GraphicsError::InvalidParameter(format!("descriptor {i} was never written"))
                })
            })
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().iter_mut().for_each(|e| *e = None);
    }

    #[cfg(feature = "vulkan-backend")]
    pub(crate) fn native(&self) -> &NativeHeap {
        &self.native
    }
}

impl std::fmt::Debug for GpuDescriptorHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDescriptorHeap")
            .field("shader_visible", &self.shader_visible)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// Pipeline bind point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Rasterization pipeline.
    Graphics,
    /// Compute pipeline.
    Compute,
}

/// A compiled pipeline state object.
pub struct GpuPipeline {
    kind: PipelineKind,
    #[allow(dead_code)]
    native: NativePipeline,
}

pub(crate) enum NativePipeline {
    Dummy,
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanPipeline),
}

impl GpuPipeline {
    pub(crate) fn new(kind: PipelineKind, native: NativePipeline) -> Self {
        Self { kind, native }
    }

    /// The pipeline's bind point.
    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    #[cfg(feature = "vulkan-backend")]
    pub(crate) fn native(&self) -> &NativePipeline {
        &self.native
    }
}

impl std::fmt::Debug for GpuPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuPipeline")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(GpuView: Send, Sync);
static_assertions::assert_impl_all!(GpuDescriptorHeap: Send, Sync);
static_assertions::assert_impl_all!(GpuPipeline: Send, Sync);

/// Fixed device limits the orchestration layer sizes itself against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendLimits {
    /// Minimum alignment of constant-buffer offsets.
    pub min_constant_alignment: u64,
    /// Maximum bytes of push constants.
    pub max_push_constant_bytes: u32,
    /// Maximum descriptors in the shader-visible heap.
    pub max_shader_visible_descriptors: u32,
}

/// GPU backend trait for abstracting different GPU APIs.
///
/// A backend owns one queue. Every [`submit`](Self::submit) signals a value on
/// the queue's completion counter once the GPU has executed the command list.
/// Values are strictly increasing, so waiting for value `v` also waits for
/// every earlier submission.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Device limits.
    fn limits(&self) -> BackendLimits;

    /// Create a buffer resource.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuResource, GraphicsError>;

    /// Create a texture resource.
    fn create_texture(&self, descriptor: &TextureDescriptor)
    -> Result<GpuResource, GraphicsError>;

    /// Write bytes into a host-visible buffer.
    fn write_buffer(
        &self,
        buffer: &GpuResource,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError>;

    /// Read bytes back from a buffer.
    fn read_buffer(
        &self,
        buffer: &GpuResource,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError>;

    /// GPU virtual address of the start of a buffer.
    fn buffer_gpu_address(&self, buffer: &GpuResource) -> Result<u64, GraphicsError>;

    /// Create a view of a resource.
    fn create_view(
        &self,
        resource: &Arc<GpuResource>,
        kind: ViewKind,
    ) -> Result<GpuView, GraphicsError>;

    /// Create a descriptor heap.
    ///
    /// At most one shader-visible heap may exist at a time.
    fn create_descriptor_heap(
        &self,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<GpuDescriptorHeap, GraphicsError>;

    /// Store a view in a heap slot.
    fn write_descriptor(
        &self,
        heap: &GpuDescriptorHeap,
        index: u32,
        view: &Arc<GpuView>,
    ) -> Result<(), GraphicsError>;

    /// Copy `count` descriptors between heaps.
    fn copy_descriptors(
        &self,
        src: &GpuDescriptorHeap,
        src_index: u32,
        dst: &GpuDescriptorHeap,
        dst_index: u32,
        count: u32,
    ) -> Result<(), GraphicsError>;

    /// Create a pipeline from validated bytecode.
    fn create_pipeline(
        &self,
        descriptor: &PipelineDescriptor,
        shaders: &[ShaderBytecode],
    ) -> Result<GpuPipeline, GraphicsError>;

    /// Submit a command list recorded for frame slot `slot`.
    ///
    /// The queue's completion counter reaches `signal_value` once the GPU has
    /// executed every command in the list.
    fn submit(
        &self,
        commands: &CommandList,
        slot: usize,
        signal_value: u64,
    ) -> Result<(), GraphicsError>;

    /// Last value the GPU has confirmed.
    fn completed_value(&self) -> Result<u64, GraphicsError>;

    /// Block until the completion counter reaches `value`.
    fn wait_value(&self, value: u64) -> Result<(), GraphicsError>;

    /// Block until every submission has completed.
    fn wait_idle(&self) -> Result<(), GraphicsError>;
}

/// Creates the backend selected by the configuration.
///
/// [`BackendKind::Auto`] tries Vulkan first and falls back to the dummy backend.
pub fn create_backend(config: &ContextConfig) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    match config.backend {
        BackendKind::Dummy => {
            log::info!("Using dummy backend");
            Ok(Arc::new(dummy::DummyBackend::new(config.gpu_completion)))
        }
        BackendKind::Vulkan => create_vulkan(config),
        BackendKind::Auto => {
            #[cfg(feature = "vulkan-backend")]
            {
                match vulkan::VulkanBackend::new(config.validation) {
                    Ok(backend) => {
                        log::info!("Using Vulkan backend (ash)");
                        return Ok(Arc::new(backend));
                    }
                    Err(e) => {
                        log::warn!("Failed to create Vulkan backend: {}", e);
                    }
                }
            }

            log::info!("Using dummy backend");
            Ok(Arc::new(dummy::DummyBackend::new(config.gpu_completion)))
        }
    }
}

#[cfg(feature = "vulkan-backend")]
fn create_vulkan(config: &ContextConfig) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    let backend = vulkan::VulkanBackend::new(config.validation)?;
    log::info!("Using Vulkan backend (ash)");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "vulkan-backend"))]
fn create_vulkan(_config: &ContextConfig) -> Result<Arc<dyn GpuBackend>, GraphicsError> {
    Err(GraphicsError::InitializationFailed(
        "built without the vulkan-backend feature".to_string(),
    ))
}

/// Check if a real GPU backend is compiled in.
pub fn has_gpu_backend() -> bool {
    cfg!(feature = "vulkan-backend")
}
