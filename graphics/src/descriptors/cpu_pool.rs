//! CPU-visible descriptor pool.

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuDescriptorHeap, GpuView};
use crate::error::GraphicsError;

/// Address of a descriptor in the CPU-visible pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptor {
    index: u32,
}

impl CpuDescriptor {
    /// Slot index in the pool.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The descriptor `n` slots after this one.
    pub fn offset(&self, n: u32) -> Self {
        Self {
            index: self.index + n,
        }
    }
}

/// Monotonic bump allocator over a CPU-only descriptor heap.
///
/// Descriptors are never freed individually; the pool is only reset as a
/// whole when the context is torn down.
pub struct CpuDescriptorPool {
    heap: GpuDescriptorHeap,
    next: u32,
}

impl CpuDescriptorPool {
    /// Create a pool of `capacity` descriptors.
    pub fn new(backend: &dyn GpuBackend, capacity: u32) -> Result<Self, GraphicsError> {
        let heap = backend.create_descriptor_heap(capacity, false)?;
        Ok(Self { heap, next: 0 })
    }

    /// Reserve `n` consecutive descriptors and return the first.
    pub fn allocate(&mut self, n: u32) -> Result<CpuDescriptor, GraphicsError> {
        let end = self.next.checked_add(n);
        if end.is_none_or(|end| end > self.capacity()) {
            log::error!(
                "CPU descriptor pool exhausted: {} requested, {} of {} used",
                n,
                self.next,
                self.capacity()
            );
            return Err(GraphicsError::DescriptorPoolExhausted);
        }
        let base = CpuDescriptor { index: self.next };
        self.next += n;
        Ok(base)
    }

    /// Store a view in an allocated descriptor.
    pub fn write(
        &self,
        backend: &dyn GpuBackend,
        descriptor: CpuDescriptor,
        view: &Arc<GpuView>,
    ) -> Result<(), GraphicsError> {
        if descriptor.index >= self.next {
            return Err(GraphicsError::InvalidParameter(format!(
                "CPU descriptor {} was never allocated",
                descriptor.index
            )));
        }
        backend.write_descriptor(&self.heap, descriptor.index, view)
    }

    /// Forget every allocation. Only valid at full re-initialization.
    pub fn reset(&mut self) {
        self.next = 0;
        self.heap.clear();
    }

    /// Descriptors handed out so far.
    pub fn used(&self) -> u32 {
        self.next
    }

    /// Total descriptors in the pool.
    pub fn capacity(&self) -> u32 {
        self.heap.capacity()
    }

    pub(crate) fn heap(&self) -> &GpuDescriptorHeap {
        &self.heap
    }
}

impl std::fmt::Debug for CpuDescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDescriptorPool")
            .field("used", &self.next)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    #[test]
    fn test_monotonic_allocation() {
        let backend = DummyBackend::default();
        let mut pool = CpuDescriptorPool::new(&backend, 10).unwrap();

        let a = pool.allocate(3).unwrap();
        let b = pool.allocate(5).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 3);
        assert_eq!(pool.used(), 8);

        assert!(matches!(
            pool.allocate(3),
            Err(GraphicsError::DescriptorPoolExhausted)
        ));
        assert_eq!(pool.allocate(2).unwrap().index(), 8);
        assert!(pool.allocate(1).is_err());

        pool.reset();
        assert_eq!(pool.allocate(10).unwrap().index(), 0);
    }

    #[test]
    fn test_offset() {
        let base = CpuDescriptor { index: 4 };
        assert_eq!(base.offset(2).index(), 6);
    }
}
