//! Shader-visible descriptor ring for the non-bindless path.

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuDescriptorHeap};
use crate::error::GraphicsError;

use super::{CpuDescriptor, CpuDescriptorPool};

/// Address of a descriptor in the shader-visible heap.
///
/// The index is what a descriptor table is bound with and what shaders add
/// their local offsets to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptor {
    index: u32,
}

impl GpuDescriptor {
    pub(crate) fn new(index: u32) -> Self {
        Self { index }
    }

    /// Slot index in the shader-visible heap.
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Per-frame regions at the start of the shader-visible heap.
///
/// Each frame slot owns `per_frame` descriptors. Staged tables are carved
/// linearly from the current slot's region and the region is recycled when the
/// slot is, so staging never touches descriptors a frame in flight still reads.
pub struct DescriptorRing {
    heap: Arc<GpuDescriptorHeap>,
    per_frame: u32,
    frames: usize,
    current_slot: usize,
    used: u32,
}

impl DescriptorRing {
    /// Create a ring over `heap[0 .. per_frame * frames)`.
    pub fn new(heap: Arc<GpuDescriptorHeap>, per_frame: u32, frames: usize) -> Self {
        debug_assert!(per_frame as usize * frames <= heap.capacity() as usize);
        Self {
            heap,
            per_frame,
            frames,
            current_slot: 0,
            used: 0,
        }
    }

    /// Switch to `slot`'s region. Only once the slot's fence is reached.
    pub fn begin_frame(&mut self, slot: usize) {
        debug_assert!(slot < self.frames, "invalid frame slot {slot}");
        self.current_slot = slot;
        self.used = 0;
    }

    /// Copy CPU descriptors into a contiguous range of the current region.
    ///
    /// Returns the first shader-visible slot of the range.
    pub fn copy_to_shader_visible(
        &mut self,
        backend: &dyn GpuBackend,
        pool: &CpuDescriptorPool,
        sources: &[CpuDescriptor],
    ) -> Result<GpuDescriptor, GraphicsError> {
        let n = u32::try_from(sources.len()).ok();
        let end = n.and_then(|n| self.used.checked_add(n));
        let (Some(n), Some(end)) = (n, end.filter(|&end| end <= self.per_frame)) else {
            log::error!(
                "Descriptor ring exhausted: {} requested, {} of {} used (slot {})",
                sources.len(),
                self.used,
                self.per_frame,
                self.current_slot
            );
            return Err(GraphicsError::DescriptorPoolExhausted);
        };

        let base = self.region_base() + self.used;
        for (slot, source) in (base..base + n).zip(sources) {
            backend.copy_descriptors(pool.heap(), source.index(), &self.heap, slot, 1)?;
        }
        self.used = end;
        Ok(GpuDescriptor::new(base))
    }

    /// First heap slot of the current region.
    pub fn region_base(&self) -> u32 {
        self.current_slot as u32 * self.per_frame
    }

    /// Descriptors staged in the current region.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Descriptors left in the current region.
    pub fn remaining(&self) -> u32 {
        self.per_frame - self.used
    }

    /// Heap slots covered by all regions.
    pub fn total_size(&self) -> u32 {
        self.per_frame * self.frames as u32
    }
}

impl std::fmt::Debug for DescriptorRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorRing")
            .field("per_frame", &self.per_frame)
            .field("frames", &self.frames)
            .field("current_slot", &self.current_slot)
            .field("used", &self.used)
            .finish()
    }
}
