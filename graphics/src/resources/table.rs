//! Resource table: stable handles over native GPU resources.
//!
//! Every buffer and texture the orchestration layer manages is reached through
//! a [`ResourceHandle`], a generation-checked index into the table. The table
//! owns the native object and the resource's current [`ResourceState`].
//!
//! ```text
//! ResourceHandle { index: 3, generation: 7 }
//!        │
//!        ▼
//! slots[3] ─ generation 7 ─ ResourceRecord { native, state, desc }
//! ```
//!
//! Releasing a handle bumps the slot generation at once, so any copy of the
//! handle fails with [`GraphicsError::InvalidHandle`] from then on. The native
//! object is parked in a [`DeferredQueue`] until the fence value of the frame
//! that released it has been reached.
//!
//! The native object behind a handle may be swapped with
//! [`ResourceTable::replace_native`] (back buffers after a resize). Identity
//! and tracked state survive the swap.

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuResource};
use crate::deferred::DeferredQueue;
use crate::error::GraphicsError;
use crate::types::{BufferDescriptor, ResourceState, TextureDescriptor};

/// Opaque, stable identifier of a buffer or texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    index: u32,
    generation: u32,
}

impl ResourceHandle {
    /// Slot index (for debugging).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation (for debugging).
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

static_assertions::assert_impl_all!(ResourceHandle: Send, Sync);

/// What a resource was created as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceDesc {
    /// A buffer.
    Buffer(BufferDescriptor),
    /// A texture.
    Texture(TextureDescriptor),
}

impl ResourceDesc {
    /// The buffer descriptor, if this is a buffer.
    pub fn as_buffer(&self) -> Option<&BufferDescriptor> {
        match self {
            Self::Buffer(desc) => Some(desc),
            Self::Texture(_) => None,
        }
    }

    /// The texture descriptor, if this is a texture.
    pub fn as_texture(&self) -> Option<&TextureDescriptor> {
        match self {
            Self::Texture(desc) => Some(desc),
            Self::Buffer(_) => None,
        }
    }

    /// Debug label.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Buffer(desc) => desc.label.as_deref(),
            Self::Texture(desc) => desc.label.as_deref(),
        }
    }
}

impl From<BufferDescriptor> for ResourceDesc {
    fn from(desc: BufferDescriptor) -> Self {
        Self::Buffer(desc)
    }
}

impl From<TextureDescriptor> for ResourceDesc {
    fn from(desc: TextureDescriptor) -> Self {
        Self::Texture(desc)
    }
}

/// Everything the table knows about one live resource.
#[derive(Debug)]
struct ResourceRecord {
    native: Arc<GpuResource>,
    state: ResourceState,
    desc: ResourceDesc,
}

#[derive(Debug, Default)]
struct ResourceSlot {
    generation: u32,
    record: Option<ResourceRecord>,
}

/// Arena of resource records keyed by generation-checked handles.
#[derive(Debug, Default)]
pub struct ResourceTable {
    slots: Vec<ResourceSlot>,
    free: Vec<u32>,
    deferred: DeferredQueue<Arc<GpuResource>>,
    live: usize,
}

impl ResourceTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a native resource and register it in `initial_state`.
    ///
    /// Fails with whatever the backend reports, typically
    /// [`GraphicsError::AllocationError`] when device memory is exhausted.
    pub fn create(
        &mut self,
        backend: &dyn GpuBackend,
        desc: impl Into<ResourceDesc>,
        initial_state: ResourceState,
    ) -> Result<ResourceHandle, GraphicsError> {
        let desc = desc.into();
        let native = match &desc {
            ResourceDesc::Buffer(d) => backend.create_buffer(d)?,
            ResourceDesc::Texture(d) => backend.create_texture(d)?,
        };
        let handle = self.register(Arc::new(native), desc, initial_state);
        log::trace!("ResourceTable: created {:?} in {:?}", handle, initial_state);
        Ok(handle)
    }

    /// Register a native resource created elsewhere.
    pub fn register(
        &mut self,
        native: Arc<GpuResource>,
        desc: ResourceDesc,
        state: ResourceState,
    ) -> ResourceHandle {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(ResourceSlot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.record = Some(ResourceRecord {
            native,
            state,
            desc,
        });
        self.live += 1;

        ResourceHandle {
            index,
            generation: slot.generation,
        }
    }

    /// Native resource behind a handle.
    pub fn get(&self, handle: ResourceHandle) -> Result<&Arc<GpuResource>, GraphicsError> {
        self.record(handle).map(|r| &r.native)
    }

    /// Currently recorded state.
    pub fn state(&self, handle: ResourceHandle) -> Result<ResourceState, GraphicsError> {
        self.record(handle).map(|r| r.state)
    }

    /// Overwrite the recorded state. Only the barrier batcher does this.
    pub(crate) fn set_state(
        &mut self,
        handle: ResourceHandle,
        state: ResourceState,
    ) -> Result<(), GraphicsError> {
        self.record_mut(handle)?.state = state;
        Ok(())
    }

    /// Descriptor the resource was created with.
    pub fn desc(&self, handle: ResourceHandle) -> Result<&ResourceDesc, GraphicsError> {
        self.record(handle).map(|r| &r.desc)
    }

    /// Returns true if the handle refers to a live resource.
    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.record(handle).is_ok()
    }

    /// Invalidate a handle and defer destruction of its native resource
    /// until fence value `tag` is reached.
    pub fn release(&mut self, handle: ResourceHandle, tag: u64) -> Result<(), GraphicsError> {
        self.record(handle)?;

        let slot = &mut self.slots[handle.index as usize];
        let record = slot.record.take().ok_or(GraphicsError::InvalidHandle)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;

        log::trace!(
            "ResourceTable: released {:?} ({:?}), destroying after fence {}",
            handle,
            record.desc.label(),
            tag
        );
        self.deferred.push(tag, record.native);
        Ok(())
    }

    /// Swap the native resource behind a handle, keeping identity and state.
    ///
    /// The previous native object is destroyed after fence value `tag`.
    pub fn replace_native(
        &mut self,
        handle: ResourceHandle,
        native: Arc<GpuResource>,
        desc: ResourceDesc,
        tag: u64,
    ) -> Result<(), GraphicsError> {
        let record = self.record_mut(handle)?;
        let old = std::mem::replace(&mut record.native, native);
        record.desc = desc;
        self.deferred.push(tag, old);
        Ok(())
    }

    /// Destroy released natives whose fence value has been reached.
    ///
    /// Returns the number of natives destroyed.
    pub fn collect_garbage(&mut self, completed: u64) -> usize {
        let destroyed = self.deferred.collect(completed);
        if !destroyed.is_empty() {
            log::trace!(
                "ResourceTable: destroying {} resources (fence {})",
                destroyed.len(),
                completed
            );
        }
        destroyed.len()
    }

    /// Destroy every released native. Only valid once the GPU is idle.
    pub fn flush_all(&mut self) -> usize {
        self.deferred.flush_all().len()
    }

    /// Drop every record, live or released. Only valid once the GPU is idle.
    pub fn clear(&mut self) {
        self.flush_all();
        for slot in &mut self.slots {
            if slot.record.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.live = 0;
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Released natives still waiting for the GPU.
    pub fn pending_destruction_count(&self) -> usize {
        self.deferred.len()
    }

    fn record(&self, handle: ResourceHandle) -> Result<&ResourceRecord, GraphicsError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
            .ok_or(GraphicsError::InvalidHandle)
    }

    fn record_mut(&mut self, handle: ResourceHandle) -> Result<&mut ResourceRecord, GraphicsError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_mut())
            .ok_or(GraphicsError::InvalidHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::types::{BufferUsage, TextureFormat, TextureUsage};

    fn buffer_desc(size: u64) -> BufferDescriptor {
        BufferDescriptor::new(size, BufferUsage::VERTEX | BufferUsage::COPY_DST)
    }

    #[test]
    fn test_create_get_release() {
        let backend = DummyBackend::default();
        let mut table = ResourceTable::new();

        let handle = table
            .create(&backend, buffer_desc(1024), ResourceState::COPY_DEST)
            .unwrap();
        assert!(table.get(handle).is_ok());
        assert_eq!(table.state(handle).unwrap(), ResourceState::COPY_DEST);
        assert_eq!(table.live_count(), 1);

        table.release(handle, 1).unwrap();
        assert!(matches!(table.get(handle), Err(GraphicsError::InvalidHandle)));
        assert!(matches!(
            table.release(handle, 1),
            Err(GraphicsError::InvalidHandle)
        ));
        assert_eq!(table.live_count(), 0);
    }

    #[test]
    fn test_destruction_waits_for_fence() {
        let backend = DummyBackend::default();
        let mut table = ResourceTable::new();

        let handle = table
            .create(&backend, buffer_desc(64), ResourceState::COMMON)
            .unwrap();
        table.release(handle, 5).unwrap();
        assert_eq!(backend.live_resources(), 1);

        assert_eq!(table.collect_garbage(4), 0);
        assert_eq!(backend.live_resources(), 1);
        assert_eq!(table.collect_garbage(5), 1);
        assert_eq!(backend.live_resources(), 0);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let backend = DummyBackend::default();
        let mut table = ResourceTable::new();

        let first = table
            .create(&backend, buffer_desc(16), ResourceState::COMMON)
            .unwrap();
        table.release(first, 0).unwrap();
        let second = table
            .create(&backend, buffer_desc(16), ResourceState::COMMON)
            .unwrap();

        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert!(table.get(first).is_err());
        assert!(table.get(second).is_ok());
    }

    #[test]
    fn test_replace_native_keeps_identity() {
        let backend = DummyBackend::default();
        let mut table = ResourceTable::new();
        let desc = TextureDescriptor::new_2d(
            4,
            4,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT,
        );

        let handle = table
            .create(&backend, desc.clone(), ResourceState::PRESENT)
            .unwrap();
        let bigger = TextureDescriptor::new_2d(
            8,
            8,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT,
        );
        let native = Arc::new(backend.create_texture(&bigger).unwrap());

        table
            .replace_native(handle, Arc::clone(&native), bigger.clone().into(), 2)
            .unwrap();
        assert!(Arc::ptr_eq(table.get(handle).unwrap(), &native));
        assert_eq!(table.state(handle).unwrap(), ResourceState::PRESENT);
        assert_eq!(table.desc(handle).unwrap().as_texture(), Some(&bigger));
        assert_eq!(table.pending_destruction_count(), 1);
    }

    #[test]
    fn test_allocation_failure_surfaces() {
        let backend = DummyBackend::default().with_memory_budget(512);
        let mut table = ResourceTable::new();
        let result = table.create(&backend, buffer_desc(1024), ResourceState::COMMON);
        assert!(matches!(result, Err(GraphicsError::AllocationError(_))));
        assert_eq!(table.live_count(), 0);
    }
}
