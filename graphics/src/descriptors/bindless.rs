//! Persistent bindless descriptor table.

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuDescriptorHeap, GpuView};
use crate::error::GraphicsError;

/// A range of permanently reserved bindless slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PersistentAllocation {
    slot: u32,
    count: u32,
}

impl PersistentAllocation {
    /// First slot. This is the value shaders index the heap with.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Number of slots.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The `i`-th slot of the range.
    pub fn slot_at(&self, i: u32) -> u32 {
        debug_assert!(i < self.count, "slot {i} out of range {}", self.count);
        self.slot + i
    }
}

/// Always-resident table at the end of the shader-visible heap.
///
/// Slots are never reclaimed: once allocated, a slot refers to the same
/// resource for the lifetime of the context.
pub struct BindlessTable {
    heap: Arc<GpuDescriptorHeap>,
    base: u32,
    capacity: u32,
    next: u32,
}

impl BindlessTable {
    /// Create a table over `heap[base .. base + capacity)`.
    pub fn new(heap: Arc<GpuDescriptorHeap>, base: u32, capacity: u32) -> Self {
        debug_assert!(base as usize + capacity as usize <= heap.capacity() as usize);
        Self {
            heap,
            base,
            capacity,
            next: 0,
        }
    }

    /// Reserve `n` consecutive slots for the rest of the context's life.
    pub fn allocate_persistent(&mut self, n: u32) -> Result<PersistentAllocation, GraphicsError> {
        let end = self.next.checked_add(n);
        if end.is_none_or(|end| end > self.capacity) {
            log::error!(
                "Bindless table exhausted: {} requested, {} of {} used",
                n,
                self.next,
                self.capacity
            );
            return Err(GraphicsError::BindlessTableExhausted);
        }
        let allocation = PersistentAllocation {
            slot: self.base + self.next,
            count: n,
        };
        self.next += n;
        log::debug!(
            "Bindless table: reserved slots {}..{}",
            allocation.slot,
            allocation.slot + n
        );
        Ok(allocation)
    }

    /// Point a reserved slot at a view.
    pub fn write_persistent(
        &self,
        backend: &dyn GpuBackend,
        slot: u32,
        view: &Arc<GpuView>,
    ) -> Result<(), GraphicsError> {
        if slot < self.base || slot >= self.base + self.next {
            return Err(GraphicsError::InvalidParameter(format!(
                "bindless slot {} was never allocated",
                slot
            )));
        }
        backend.write_descriptor(&self.heap, slot, view)
    }

    /// First heap slot of the table.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Slots reserved so far.
    pub fn used(&self) -> u32 {
        self.next
    }

    /// Total slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl std::fmt::Debug for BindlessTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindlessTable")
            .field("base", &self.base)
            .field("used", &self.next)
            .field("capacity", &self.capacity)
            .finish()
    }
}
