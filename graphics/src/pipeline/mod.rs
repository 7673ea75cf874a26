//! Pipeline state objects.
//!
//! The [`PipelineCache`] turns a [`PipelineDescriptor`] plus SPIR-V blobs into
//! a compiled pipeline and hands out a [`PipelineHandle`] for it. Pipelines are
//! created once at init and are immutable afterwards.
//!
//! # Lifecycle
//!
//! ```text
//! create_graphics / create_compute
//!   │  validate bytecode      -> ShaderLoadError
//!   │  validate descriptor    -> PipelineCreationError
//!   │  dedupe identical input -> same handle, refcount + 1
//!   ▼
//! set_current(handle)         records SetPipeline (required before draws)
//!   │
//!   ▼
//! release(handle, tag)        refcount - 1; at zero the handle dies and the
//!                             native pipeline waits for fence `tag`
//! ```
//!
//! The cache does not remember which pipeline is bound. Every draw sequence
//! must call [`PipelineCache::set_current`] itself.

mod descriptor;
mod shader;

pub use descriptor::{
    ComputePipelineDescriptor, CullMode, DepthState, GraphicsPipelineDescriptor,
    PipelineDescriptor, VertexAttribute, VertexBufferLayout, VertexFormat, VertexLayout,
};
pub use shader::{SPIRV_MAGIC, ShaderBytecode, ShaderStage};

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::backend::{GpuBackend, GpuPipeline};
use crate::commands::{CommandList, GpuCommand};
use crate::deferred::DeferredQueue;
use crate::error::GraphicsError;

/// Opaque handle to a cached pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    index: u32,
    generation: u32,
}

impl PipelineHandle {
    /// Slot index (for debugging).
    pub fn index(&self) -> u32 {
        self.index
    }
}

struct PipelineRecord {
    pipeline: Arc<GpuPipeline>,
    descriptor: PipelineDescriptor,
    shaders: Vec<ShaderBytecode>,
    key: u64,
    refs: u32,
}

#[derive(Default)]
struct PipelineSlot {
    generation: u32,
    record: Option<PipelineRecord>,
}

/// Cache of compiled pipelines behind generation-checked handles.
#[derive(Default)]
pub struct PipelineCache {
    slots: Vec<PipelineSlot>,
    free: Vec<u32>,
    lookup: HashMap<u64, Vec<PipelineHandle>>,
    deferred: DeferredQueue<Arc<GpuPipeline>>,
    compiled: u64,
}

impl PipelineCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reuse) a graphics pipeline.
    pub fn create_graphics(
        &mut self,
        backend: &dyn GpuBackend,
        descriptor: GraphicsPipelineDescriptor,
        shaders: &[ShaderBytecode],
    ) -> Result<PipelineHandle, GraphicsError> {
        self.create(backend, PipelineDescriptor::Graphics(descriptor), shaders)
    }

    /// Create (or reuse) a compute pipeline.
    pub fn create_compute(
        &mut self,
        backend: &dyn GpuBackend,
        descriptor: ComputePipelineDescriptor,
        shader: &ShaderBytecode,
    ) -> Result<PipelineHandle, GraphicsError> {
        self.create(
            backend,
            PipelineDescriptor::Compute(descriptor),
            std::slice::from_ref(shader),
        )
    }

    /// Create (or reuse) a pipeline of either kind.
    pub fn create(
        &mut self,
        backend: &dyn GpuBackend,
        descriptor: PipelineDescriptor,
        shaders: &[ShaderBytecode],
    ) -> Result<PipelineHandle, GraphicsError> {
        if shaders.is_empty() {
            return Err(GraphicsError::ShaderLoadError(
                "no shader bytecode supplied".to_string(),
            ));
        }
        descriptor.validate()?;

        let key = cache_key(&descriptor, shaders);
        if let Some(handle) = self.find(key, &descriptor, shaders) {
            if let Some(record) = self.record_mut(handle) {
                record.refs += 1;
            }
            log::trace!(
                "Reusing pipeline {:?} for {:?}",
                handle,
                descriptor.label()
            );
            return Ok(handle);
        }

        let pipeline = backend.create_pipeline(&descriptor, shaders)?;
        self.compiled += 1;
        log::debug!("Created pipeline {:?}", descriptor.label());

        let record = PipelineRecord {
            pipeline: Arc::new(pipeline),
            descriptor,
            shaders: shaders.to_vec(),
            key,
            refs: 1,
        };

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(PipelineSlot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.record = Some(record);
        let handle = PipelineHandle {
            index,
            generation: slot.generation,
        };
        self.lookup.entry(key).or_default().push(handle);
        Ok(handle)
    }

    /// Native pipeline behind a handle.
    pub fn get(&self, handle: PipelineHandle) -> Result<&Arc<GpuPipeline>, GraphicsError> {
        self.record(handle)
            .map(|r| &r.pipeline)
            .ok_or(GraphicsError::InvalidHandle)
    }

    /// Descriptor the pipeline was created from.
    pub fn descriptor(&self, handle: PipelineHandle) -> Result<&PipelineDescriptor, GraphicsError> {
        self.record(handle)
            .map(|r| &r.descriptor)
            .ok_or(GraphicsError::InvalidHandle)
    }

    /// Record a pipeline bind.
    pub fn set_current(
        &self,
        handle: PipelineHandle,
        commands: &mut CommandList,
    ) -> Result<(), GraphicsError> {
        let pipeline = self.get(handle)?;
        commands.push(GpuCommand::SetPipeline(Arc::clone(pipeline)));
        Ok(())
    }

    /// Drop one reference to a pipeline.
    ///
    /// When the last reference goes the handle becomes invalid immediately and
    /// the native pipeline is destroyed once fence value `tag` is reached.
    pub fn release(&mut self, handle: PipelineHandle, tag: u64) -> Result<(), GraphicsError> {
        let record = self.record_mut(handle).ok_or(GraphicsError::InvalidHandle)?;
        record.refs -= 1;
        if record.refs > 0 {
            return Ok(());
        }

        let slot = &mut self.slots[handle.index as usize];
        let Some(record) = slot.record.take() else {
            return Err(GraphicsError::InvalidHandle);
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        if let Some(handles) = self.lookup.get_mut(&record.key) {
            handles.retain(|h| *h != handle);
            if handles.is_empty() {
                self.lookup.remove(&record.key);
            }
        }

        log::trace!("Releasing pipeline {:?} after fence {}", handle, tag);
        self.deferred.push(tag, record.pipeline);
        Ok(())
    }

    /// Destroy released pipelines whose fence value has been reached.
    pub fn collect_garbage(&mut self, completed: u64) -> usize {
        self.deferred.collect(completed).len()
    }

    /// Destroy every released pipeline. Only valid once the GPU is idle.
    pub fn flush_all(&mut self) -> usize {
        self.deferred.flush_all().len()
    }

    /// Release every live pipeline immediately. Only valid once the GPU is idle.
    pub fn clear(&mut self) {
        self.flush_all();
        for slot in &mut self.slots {
            if slot.record.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.lookup.clear();
    }

    /// Number of live pipelines.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }

    /// Returns true if no pipeline is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pipelines the backend actually compiled.
    pub fn compiled_count(&self) -> u64 {
        self.compiled
    }

    /// Released pipelines still waiting for the GPU.
    pub fn pending_destruction_count(&self) -> usize {
        self.deferred.len()
    }

    fn find(
        &self,
        key: u64,
        descriptor: &PipelineDescriptor,
        shaders: &[ShaderBytecode],
    ) -> Option<PipelineHandle> {
        self.lookup.get(&key)?.iter().copied().find(|h| {
            self.record(*h)
                .is_some_and(|r| r.descriptor == *descriptor && r.shaders == shaders)
        })
    }

    fn record(&self, handle: PipelineHandle) -> Option<&PipelineRecord> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.as_ref()
    }

    fn record_mut(&mut self, handle: PipelineHandle) -> Option<&mut PipelineRecord> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.as_mut()
    }
}

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCache")
            .field("live", &self.len())
            .field("compiled", &self.compiled)
            .field("pending_destruction", &self.deferred.len())
            .finish()
    }
}

fn cache_key(descriptor: &PipelineDescriptor, shaders: &[ShaderBytecode]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    descriptor.hash(&mut hasher);
    shaders.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::types::TextureFormat;

    fn vertex_shader() -> ShaderBytecode {
        ShaderBytecode::from_words(ShaderStage::Vertex, vec![SPIRV_MAGIC, 1], "vs_main").unwrap()
    }

    fn fragment_shader() -> ShaderBytecode {
        ShaderBytecode::from_words(ShaderStage::Fragment, vec![SPIRV_MAGIC, 2], "fs_main")
            .unwrap()
    }

    fn descriptor() -> GraphicsPipelineDescriptor {
        GraphicsPipelineDescriptor::new(
            VertexLayout::new()
                .with_buffer(12)
                .with_attribute(0, VertexFormat::Float3, 0, 0),
            TextureFormat::Rgba8Unorm,
        )
    }

    #[test]
    fn test_create_and_dedupe() {
        let backend = DummyBackend::default();
        let mut cache = PipelineCache::new();
        let shaders = [vertex_shader(), fragment_shader()];

        let a = cache.create_graphics(&backend, descriptor(), &shaders).unwrap();
        let b = cache.create_graphics(&backend, descriptor(), &shaders).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.compiled_count(), 1);
        assert_eq!(cache.len(), 1);

        let c = cache
            .create_graphics(&backend, descriptor().with_label("other"), &shaders)
            .unwrap();
        assert_ne!(a, c);
        assert_eq!(cache.compiled_count(), 2);
    }

    #[test]
    fn test_release_is_deferred_and_refcounted() {
        let backend = DummyBackend::default();
        let mut cache = PipelineCache::new();
        let shaders = [vertex_shader()];

        let a = cache.create_graphics(&backend, descriptor(), &shaders).unwrap();
        let b = cache.create_graphics(&backend, descriptor(), &shaders).unwrap();

        cache.release(a, 3).unwrap();
        assert!(cache.get(b).is_ok());

        cache.release(b, 3).unwrap();
        assert!(matches!(cache.get(a), Err(GraphicsError::InvalidHandle)));
        assert_eq!(cache.pending_destruction_count(), 1);
        assert_eq!(cache.collect_garbage(2), 0);
        assert_eq!(cache.collect_garbage(3), 1);
        assert!(cache.release(a, 4).is_err());
    }

    #[test]
    fn test_missing_bytecode() {
        let backend = DummyBackend::default();
        let mut cache = PipelineCache::new();
        let result = cache.create_graphics(&backend, descriptor(), &[]);
        assert!(matches!(result, Err(GraphicsError::ShaderLoadError(_))));
    }

    #[test]
    fn test_device_rejection() {
        let backend = DummyBackend::default();
        let mut cache = PipelineCache::new();
        let result = cache.create_graphics(&backend, descriptor(), &[fragment_shader()]);
        assert!(matches!(result, Err(GraphicsError::PipelineCreationError(_))));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_current_records_bind() {
        let backend = DummyBackend::default();
        let mut cache = PipelineCache::new();
        let handle = cache
            .create_graphics(&backend, descriptor(), &[vertex_shader()])
            .unwrap();

        let mut commands = CommandList::new();
        cache.set_current(handle, &mut commands).unwrap();
        assert!(matches!(
            commands.iter().next(),
            Some(GpuCommand::SetPipeline(_))
        ));
    }
}
