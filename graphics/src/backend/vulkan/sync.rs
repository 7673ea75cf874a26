//! Timeline semaphore backing the queue's completion counter.

use ash::vk;

use crate::error::GraphicsError;

use super::map_vk_error;

/// Create a timeline semaphore starting at zero.
pub fn create_timeline_semaphore(device: &ash::Device) -> Result<vk::Semaphore, GraphicsError> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

    unsafe { device.create_semaphore(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create timeline semaphore: {:?}", e))
    })
}

/// Current counter value.
pub fn counter_value(device: &ash::Device, semaphore: vk::Semaphore) -> Result<u64, GraphicsError> {
    unsafe { device.get_semaphore_counter_value(semaphore) }.map_err(map_vk_error)
}

/// Block until the counter reaches `value`.
pub fn wait(device: &ash::Device, semaphore: vk::Semaphore, value: u64) -> Result<(), GraphicsError> {
    let semaphores = [semaphore];
    let values = [value];
    let wait_info = vk::SemaphoreWaitInfo::default()
        .semaphores(&semaphores)
        .values(&values);

    unsafe { device.wait_semaphores(&wait_info, u64::MAX) }.map_err(map_vk_error)
}
