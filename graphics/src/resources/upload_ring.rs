//! Upload ring for per-frame CPU-to-GPU data.
//!
//! The upload ring is one host-visible buffer split into a fixed region per
//! frame slot. During recording the current slot's region is bump-allocated
//! for constant buffers, dynamic vertex data and staging copies. When the
//! frame orchestrator reclaims a slot (after its fence is confirmed) the
//! region's write offset goes back to zero.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬────────┐
//! │  slot 0      │  slot 1      │  slot 2      │ window │
//! │ ███████░░░░░ │ ████░░░░░░░░ │ ░░░░░░░░░░░░ │        │
//! └──────────────┴──────────────┴──────────────┴────────┘
//!   region_size    region_size    region_size    CONSTANT_BUFFER_WINDOW
//! ```
//!
//! Regions never grow. Running out of space in a frame is reported as
//! [`GraphicsError::UploadRegionExhausted`] and is a configuration error:
//! size the region for the worst frame.
//!
//! # Example
//!
//! ```ignore
//! let alloc = ctx.upload_ring_mut().upload(&[camera_uniforms])?;
//! ctx.set_constant_buffer(&alloc)?;
//! ```

use std::sync::Arc;

use crate::backend::{GpuBackend, GpuResource};
use crate::error::GraphicsError;
use crate::types::{BufferDescriptor, BufferUsage};

/// Bytes past the last region kept so a constant-buffer binding starting
/// anywhere in a region stays inside the buffer.
pub const CONSTANT_BUFFER_WINDOW: u64 = 4096;

/// A sub-allocation of the current frame's upload region.
///
/// Only valid until the owning frame slot is recycled. Writing through a stale
/// allocation fails with [`GraphicsError::InvalidHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadAllocation {
    epoch: u64,
    offset: u64,
    size: u64,
    gpu_address: u64,
}

impl UploadAllocation {
    /// Byte offset into the upload buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the allocation in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// GPU virtual address of the first byte.
    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }
}

/// Per-frame linear allocator over a host-visible buffer.
pub struct UploadRing {
    backend: Arc<dyn GpuBackend>,
    buffer: Arc<GpuResource>,
    base_address: u64,
    region_size: u64,
    alignment: u64,
    frames: usize,
    current_slot: usize,
    write_offset: u64,
    epoch: u64,
}

impl UploadRing {
    /// Default alignment for allocations (256 bytes).
    ///
    /// This matches the typical minimum constant buffer offset alignment
    /// required by most GPUs.
    pub const DEFAULT_ALIGNMENT: u64 = 256;

    /// Create an upload ring with `frames` regions of `region_size` bytes.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        region_size: u64,
        frames: usize,
        alignment: u64,
    ) -> Result<Self, GraphicsError> {
        if !alignment.is_power_of_two() {
            return Err(GraphicsError::InvalidParameter(format!(
                "alignment must be a power of 2, got {alignment}"
            )));
        }
        if region_size == 0 || frames == 0 {
            return Err(GraphicsError::InvalidParameter(
                "upload region size cannot be zero".to_string(),
            ));
        }

        // Keep every region start aligned.
        let total = checked_align_up(region_size, alignment)
            .and_then(|region| Some((region, region.checked_mul(frames as u64)?)))
            .and_then(|(region, all)| Some((region, all.checked_add(CONSTANT_BUFFER_WINDOW)?)));
        let Some((region_size, total)) = total else {
            return Err(GraphicsError::InvalidParameter(format!(
                "{frames} upload regions of {region_size} bytes overflow the address space"
            )));
        };
        let descriptor = BufferDescriptor::new(
            total,
            BufferUsage::UPLOAD | BufferUsage::UNIFORM | BufferUsage::COPY_SRC,
        )
        .with_label("upload_ring");

        let buffer = Arc::new(backend.create_buffer(&descriptor)?);
        let base_address = backend.buffer_gpu_address(&buffer)?;

        log::info!(
            "Upload ring: {} regions of {} bytes (alignment {})",
            frames,
            region_size,
            alignment
        );

        Ok(Self {
            backend,
            buffer,
            base_address,
            region_size,
            alignment,
            frames,
            current_slot: 0,
            write_offset: 0,
            epoch: 0,
        })
    }

    /// Switch to `slot`'s region and forget everything allocated from it.
    ///
    /// Must only be called once the GPU is done with the slot's previous frame.
    pub fn begin_frame(&mut self, slot: usize) {
        debug_assert!(slot < self.frames, "invalid frame slot {slot}");
        self.current_slot = slot;
        self.write_offset = 0;
        self.epoch += 1;
    }

    /// Allocate room for `count` values of `T`.
    pub fn allocate<T: bytemuck::Pod>(
        &mut self,
        count: usize,
    ) -> Result<UploadAllocation, GraphicsError> {
        let size = count
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|bytes| u64::try_from(bytes).ok())
            .ok_or_else(|| {
                log::error!(
                    "Upload region exhausted: {} values of {} bytes requested",
                    count,
                    std::mem::size_of::<T>()
                );
                GraphicsError::UploadRegionExhausted
            })?;
        self.allocate_bytes(size, std::mem::align_of::<T>() as u64)
    }

    /// Allocate `size` bytes aligned to at least the configured alignment.
    pub fn allocate_bytes(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> Result<UploadAllocation, GraphicsError> {
        debug_assert!(alignment.is_power_of_two(), "alignment must be power of 2");
        let alignment = alignment.max(self.alignment);

        let offset = if size == 0 {
            self.write_offset
        } else {
            let span = checked_align_up(self.write_offset, alignment)
                .and_then(|aligned| Some((aligned, aligned.checked_add(size)?)))
                .filter(|&(_, end)| end <= self.region_size);
            let Some((aligned, end)) = span else {
                log::error!(
                    "Upload region exhausted: {} bytes requested, {} of {} used (slot {})",
                    size,
                    self.write_offset,
                    self.region_size,
                    self.current_slot
                );
                return Err(GraphicsError::UploadRegionExhausted);
            };
            self.write_offset = end;
            aligned
        };

        Ok(UploadAllocation {
            epoch: self.epoch,
            offset: self.region_start() + offset,
            size,
            gpu_address: self.frame_base_address() + offset,
        })
    }

    /// Copy `data` into an allocation.
    pub fn write<T: bytemuck::Pod>(
        &self,
        allocation: &UploadAllocation,
        data: &[T],
    ) -> Result<(), GraphicsError> {
        if allocation.epoch != self.epoch {
            log::error!("Write through an upload allocation from a recycled frame");
            return Err(GraphicsError::InvalidHandle);
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > allocation.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} bytes do not fit an upload allocation of {}",
                bytes.len(),
                allocation.size
            )));
        }
        self.backend
            .write_buffer(&self.buffer, allocation.offset, bytes)
    }

    /// Allocate and fill in one step.
    pub fn upload<T: bytemuck::Pod>(
        &mut self,
        data: &[T],
    ) -> Result<UploadAllocation, GraphicsError> {
        let allocation = self.allocate::<T>(data.len())?;
        self.write(&allocation, data)?;
        Ok(allocation)
    }

    /// The upload buffer.
    pub fn buffer(&self) -> &Arc<GpuResource> {
        &self.buffer
    }

    /// GPU address of the current slot's region.
    pub fn frame_base_address(&self) -> u64 {
        self.base_address + self.region_start()
    }

    /// Bytes consumed in the current region (including padding).
    pub fn used(&self) -> u64 {
        self.write_offset
    }

    /// Bytes left in the current region.
    pub fn remaining(&self) -> u64 {
        self.region_size - self.write_offset
    }

    /// Returns true if `size` bytes can still be allocated this frame.
    pub fn fits(&self, size: u64) -> bool {
        size == 0
            || align_up(self.write_offset, self.alignment)
                .checked_add(size)
                .is_some_and(|end| end <= self.region_size)
    }

    /// Size of one region.
    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Allocation alignment.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// The slot whose region is being allocated from.
    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    fn region_start(&self) -> u64 {
        self.current_slot as u64 * self.region_size
    }
}

impl std::fmt::Debug for UploadRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRing")
            .field("region_size", &self.region_size)
            .field("frames", &self.frames)
            .field("current_slot", &self.current_slot)
            .field("write_offset", &self.write_offset)
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// Align a value up to the given alignment.
#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// [`align_up`] returning `None` instead of overflowing.
pub(crate) fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn create_ring(region: u64, alignment: u64) -> (Arc<DummyBackend>, UploadRing) {
        let backend = Arc::new(DummyBackend::default());
        let ring = UploadRing::new(backend.clone(), region, 2, alignment).unwrap();
        (backend, ring)
    }

    #[test]
    fn test_allocation_alignment() {
        let (_backend, mut ring) = create_ring(1024, 64);

        let a = ring.allocate_bytes(100, 1).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(ring.used(), 100);

        let b = ring.allocate_bytes(50, 1).unwrap();
        assert_eq!(b.offset(), 128);
        assert_eq!(b.gpu_address(), ring.frame_base_address() + 128);
    }

    #[test]
    fn test_exhaustion() {
        let (_backend, mut ring) = create_ring(512, 64);
        ring.allocate_bytes(400, 1).unwrap();
        assert!(!ring.fits(200));
        assert!(ring.fits(64));
        assert!(matches!(
            ring.allocate_bytes(200, 1),
            Err(GraphicsError::UploadRegionExhausted)
        ));
        // 448 + 64 == 512 still fits
        assert_eq!(ring.allocate_bytes(64, 1).unwrap().offset(), 448);
        assert!(ring.allocate_bytes(1, 1).is_err());
    }

    #[test]
    fn test_huge_requests_are_exhaustion_not_overflow() {
        let (_backend, mut ring) = create_ring(65536, 256);
        ring.allocate_bytes(100, 4).unwrap();
        assert!(!ring.fits(u64::MAX - 100));
        assert!(matches!(
            ring.allocate_bytes(u64::MAX - 100, 4),
            Err(GraphicsError::UploadRegionExhausted)
        ));
        assert!(matches!(
            ring.allocate::<u64>(usize::MAX / 4),
            Err(GraphicsError::UploadRegionExhausted)
        ));
        // The failed requests left the region untouched.
        assert_eq!(ring.used(), 100);
        assert_eq!(ring.allocate_bytes(16, 4).unwrap().offset(), 256);
    }

    #[test]
    fn test_oversized_ring_rejected() {
        let backend = Arc::new(DummyBackend::default());
        let result = UploadRing::new(backend, u64::MAX / 2, 3, 256);
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
    }

    #[test]
    fn test_regions_are_disjoint() {
        let (_backend, mut ring) = create_ring(256, 256);
        let first = ring.allocate::<u32>(4).unwrap();
        ring.begin_frame(1);
        let second = ring.allocate::<u32>(4).unwrap();
        assert_eq!(first.offset(), 0);
        assert_eq!(second.offset(), 256);
        assert_eq!(second.gpu_address() - first.gpu_address(), 256);
    }

    #[test]
    fn test_write_and_stale_allocation() {
        let (backend, mut ring) = create_ring(256, 256);
        let alloc = ring.upload(&[1u32, 2, 3]).unwrap();
        let bytes = backend
            .read_buffer(ring.buffer(), alloc.offset(), alloc.size())
            .unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[1, 2, 3]));

        ring.begin_frame(1);
        assert!(matches!(
            ring.write(&alloc, &[4u32]),
            Err(GraphicsError::InvalidHandle)
        ));
    }

    #[test]
    fn test_zero_allocation() {
        let (_backend, mut ring) = create_ring(256, 64);
        let alloc = ring.allocate::<u64>(0).unwrap();
        assert_eq!(alloc.size(), 0);
        assert_eq!(ring.used(), 0);
    }

    #[test]
    fn test_invalid_alignment() {
        let backend = Arc::new(DummyBackend::default());
        assert!(UploadRing::new(backend, 512, 2, 100).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(100, 64), 128);
    }
}
