//! GPU memory allocator integration using gpu-allocator.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;

use crate::error::GraphicsError;

/// Create a memory allocator for the Vulkan device.
///
/// Buffer device addresses are enabled: every buffer exposes a GPU virtual
/// address for constant-buffer and upload-ring bookkeeping.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> Result<Allocator, GraphicsError> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: true,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
    })
}

/// Allocate memory for `requirements` from the shared allocator.
pub fn allocate(
    allocator: &Mutex<Option<Allocator>>,
    name: &str,
    requirements: vk::MemoryRequirements,
    location: MemoryLocation,
    linear: bool,
) -> Result<Allocation, GraphicsError> {
    let mut guard = allocator.lock();
    let allocator = guard
        .as_mut()
        .ok_or_else(|| GraphicsError::AllocationError("allocator already destroyed".to_string()))?;
    allocator
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .map_err(|e| GraphicsError::AllocationError(format!("{name}: {e}")))
}

/// Return an allocation to the shared allocator.
pub fn free(allocator: &Mutex<Option<Allocator>>, allocation: Allocation) {
    let mut guard = allocator.lock();
    let Some(allocator) = guard.as_mut() else {
        return;
    };
    if let Err(e) = allocator.free(allocation) {
        log::warn!("Failed to free GPU allocation: {}", e);
    }
}
