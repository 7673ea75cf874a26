//! Descriptor allocation.
//!
//! Three allocators share the work of getting views in front of shaders:
//!
//! | Allocator | Heap | Lifetime |
//! |-----------|------|----------|
//! | [`CpuDescriptorPool`] | CPU-only | until context teardown (monotonic) |
//! | [`DescriptorRing`] | shader-visible, front | one frame slot |
//! | [`BindlessTable`] | shader-visible, back | whole context |
//!
//! The shader-visible heap is laid out as
//!
//! ```text
//! 0                 per_frame          2*per_frame        ring_total       ring_total+bindless
//! ├── ring slot 0 ──┼── ring slot 1 ──┼── ... ───────────┼── bindless table ──┤
//! ```
//!
//! On the direct path, views are written into CPU descriptors, staged into the
//! ring with [`DescriptorRing::copy_to_shader_visible`] and bound as a table.
//! On the bindless path, views are written once into persistent slots and
//! shaders index the heap with the slot number.

mod bindless;
mod cpu_pool;
mod ring;

pub use bindless::{BindlessTable, PersistentAllocation};
pub use cpu_pool::{CpuDescriptor, CpuDescriptorPool};
pub use ring::{DescriptorRing, GpuDescriptor};

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuDescriptorHeap};
use crate::config::ContextConfig;
use crate::error::GraphicsError;

/// How to view a resource when writing a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDesc {
    /// Sampled view of a texture mip range (`None` means all remaining levels).
    ShaderResource {
        /// First mip level.
        base_mip: u32,
        /// Number of mip levels.
        mip_count: Option<u32>,
    },
    /// Storage view of a single texture mip level.
    UnorderedAccess {
        /// The mip level.
        mip_level: u32,
    },
    /// Byte range of a buffer (`None` size means to the end).
    Buffer {
        /// Offset in bytes.
        offset: u64,
        /// Size in bytes.
        size: Option<u64>,
    },
}

impl ViewDesc {
    /// Sampled view of every mip level.
    pub fn texture() -> Self {
        Self::ShaderResource {
            base_mip: 0,
            mip_count: None,
        }
    }

    /// Sampled view of a single mip level.
    pub fn texture_mip(level: u32) -> Self {
        Self::ShaderResource {
            base_mip: level,
            mip_count: Some(1),
        }
    }

    /// Storage view of a mip level.
    pub fn storage(level: u32) -> Self {
        Self::UnorderedAccess { mip_level: level }
    }

    /// View of a whole buffer.
    pub fn buffer() -> Self {
        Self::Buffer {
            offset: 0,
            size: None,
        }
    }
}

/// The three descriptor allocators and the heaps behind them.
pub struct DescriptorAllocators {
    /// CPU-visible staging pool.
    pub cpu: CpuDescriptorPool,
    /// Per-frame shader-visible ring.
    pub ring: DescriptorRing,
    /// Persistent bindless table.
    pub bindless: BindlessTable,
    shader_visible: Arc<GpuDescriptorHeap>,
}

impl DescriptorAllocators {
    /// Create the heaps and allocators sized by the configuration.
    pub fn new(backend: &dyn GpuBackend, config: &ContextConfig) -> Result<Self, GraphicsError> {
        let heap_size = config.shader_visible_heap_size()?;
        let limit = backend.limits().max_shader_visible_descriptors;
        if heap_size > limit {
            return Err(GraphicsError::InitializationFailed(format!(
                "shader-visible heap of {} descriptors exceeds device limit {}",
                heap_size, limit
            )));
        }

        let cpu = CpuDescriptorPool::new(backend, config.cpu_descriptor_capacity)?;
        let shader_visible = Arc::new(backend.create_descriptor_heap(heap_size, true)?);
        let ring = DescriptorRing::new(
            Arc::clone(&shader_visible),
            config.ring_descriptors_per_frame,
            config.frames_in_flight,
        );
        let bindless = BindlessTable::new(
            Arc::clone(&shader_visible),
            ring.total_size(),
            config.bindless_capacity,
        );

        log::info!(
            "Descriptor heaps: {} CPU, {} shader-visible ({} ring + {} bindless)",
            config.cpu_descriptor_capacity,
            heap_size,
            ring.total_size(),
            config.bindless_capacity
        );

        Ok(Self {
            cpu,
            ring,
            bindless,
            shader_visible,
        })
    }

    /// The shader-visible heap shared by the ring and the bindless table.
    pub fn shader_visible_heap(&self) -> &Arc<GpuDescriptorHeap> {
        &self.shader_visible
    }
}

impl std::fmt::Debug for DescriptorAllocators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorAllocators")
            .field("cpu", &self.cpu)
            .field("ring", &self.ring)
            .field("bindless", &self.bindless)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ViewKind;
    use crate::backend::dummy::DummyBackend;
    use crate::types::{TextureDescriptor, TextureFormat, TextureUsage};

    fn allocators(backend: &DummyBackend) -> DescriptorAllocators {
        let config = ContextConfig::new()
            .with_cpu_descriptor_capacity(8)
            .with_ring_descriptors_per_frame(4)
            .with_bindless_capacity(3);
        DescriptorAllocators::new(backend, &config).unwrap()
    }

    fn view(backend: &DummyBackend) -> Arc<crate::backend::GpuView> {
        let texture = backend
            .create_texture(&TextureDescriptor::new_2d(
                4,
                4,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED,
            ))
            .unwrap();
        let kind = ViewKind::Sampled {
            base_mip: 0,
            mip_count: 1,
        };
        Arc::new(backend.create_view(&Arc::new(texture), kind).unwrap())
    }

    #[test]
    fn test_heap_layout() {
        let backend = DummyBackend::default();
        let descriptors = allocators(&backend);
        assert_eq!(descriptors.shader_visible_heap().capacity(), 11);
        assert_eq!(descriptors.ring.total_size(), 8);
        assert_eq!(descriptors.bindless.base(), 8);
    }

    #[test]
    fn test_ring_staging_per_frame() {
        let backend = DummyBackend::default();
        let mut descriptors = allocators(&backend);
        let v = view(&backend);

        let cpu = descriptors.cpu.allocate(2).unwrap();
        descriptors.cpu.write(&backend, cpu, &v).unwrap();
        descriptors.cpu.write(&backend, cpu.offset(1), &v).unwrap();
        let sources = [cpu, cpu.offset(1)];

        let first = descriptors
            .ring
            .copy_to_shader_visible(&backend, &descriptors.cpu, &sources)
            .unwrap();
        let second = descriptors
            .ring
            .copy_to_shader_visible(&backend, &descriptors.cpu, &sources)
            .unwrap();
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 2);
        assert!(descriptors.shader_visible_heap().view(3).is_some());
        assert!(matches!(
            descriptors
                .ring
                .copy_to_shader_visible(&backend, &descriptors.cpu, &sources[..1]),
            Err(GraphicsError::DescriptorPoolExhausted)
        ));

        descriptors.ring.begin_frame(1);
        let third = descriptors
            .ring
            .copy_to_shader_visible(&backend, &descriptors.cpu, &sources)
            .unwrap();
        assert_eq!(third.index(), 4);
    }

    #[test]
    fn test_bindless_exhaustion() {
        let backend = DummyBackend::default();
        let mut descriptors = allocators(&backend);
        let v = view(&backend);

        let a = descriptors.bindless.allocate_persistent(2).unwrap();
        assert_eq!(a.slot(), 8);
        assert_eq!(a.slot_at(1), 9);
        descriptors
            .bindless
            .write_persistent(&backend, a.slot_at(1), &v)
            .unwrap();
        assert!(descriptors.shader_visible_heap().view(9).is_some());

        assert!(matches!(
            descriptors.bindless.allocate_persistent(2),
            Err(GraphicsError::BindlessTableExhausted)
        ));
        assert!(
            descriptors
                .bindless
                .write_persistent(&backend, 10, &v)
                .is_err()
        );
    }

    #[test]
    fn test_bindless_huge_request_rejected() {
        let backend = DummyBackend::default();
        let mut descriptors = allocators(&backend);

        let first = descriptors.bindless.allocate_persistent(1).unwrap();
        assert_eq!(first.slot(), 8);
        assert!(matches!(
            descriptors.bindless.allocate_persistent(u32::MAX),
            Err(GraphicsError::BindlessTableExhausted)
        ));
        // The failed request reserved nothing.
        let second = descriptors.bindless.allocate_persistent(2).unwrap();
        assert_eq!(second.slot(), 9);
    }

    #[test]
    fn test_overflowing_heap_config_rejected() {
        let backend = DummyBackend::default();
        let config = ContextConfig::new()
            .with_ring_descriptors_per_frame(u32::MAX / 2)
            .with_bindless_capacity(u32::MAX / 2);
        assert!(matches!(
            DescriptorAllocators::new(&backend, &config),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }
}
