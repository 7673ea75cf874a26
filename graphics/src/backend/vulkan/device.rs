//! Vulkan physical and logical device management.

use std::ffi::CStr;

use ash::vk;

use crate::error::GraphicsError;

use super::instance::REQUIRED_API_VERSION;

/// Upper bound on the shader-visible heap regardless of what the driver allows.
const MAX_BINDLESS_DESCRIPTORS: u32 = 1 << 20;

/// What the orchestration layer needs to know about the chosen GPU.
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub name: String,
    pub min_uniform_alignment: u64,
    pub max_push_constants_size: u32,
    pub max_bindless_descriptors: u32,
}

/// Select the best physical device that supports the required feature set.
///
/// Prefers discrete GPUs over integrated GPUs.
pub fn select_physical_device(instance: &ash::Instance) -> Result<DeviceCaps, GraphicsError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(GraphicsError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, DeviceCaps)> = None;

    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if properties.api_version < REQUIRED_API_VERSION {
            log::info!("Skipping GPU {:?}: Vulkan 1.3 not supported", device_name);
            continue;
        }
        if let Err(missing) = check_features(instance, device) {
            log::info!("Skipping GPU {:?}: missing {}", device_name, missing);
            continue;
        }
        let Some(queue_family) = find_queue_family(instance, device) else {
            log::info!("Skipping GPU {:?}: no graphics+compute queue", device_name);
            continue;
        };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        let caps = DeviceCaps {
            physical_device: device,
            queue_family,
            name: device_name,
            min_uniform_alignment: properties.limits.min_uniform_buffer_offset_alignment,
            max_push_constants_size: properties.limits.max_push_constants_size,
            max_bindless_descriptors: bindless_limit(instance, device),
        };

        if best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
            best = Some((score, caps));
        }
    }

    best.map(|(_, caps)| caps)
        .ok_or_else(|| GraphicsError::InitializationFailed("No suitable GPU found".to_string()))
}

/// Returns the name of the first missing feature, if any.
fn check_features(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Result<(), &'static str> {
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_13 = vk::PhysicalDeviceVulkan13Features::default();
    {
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12)
            .push_next(&mut vulkan_13);
        unsafe { instance.get_physical_device_features2(device, &mut features) };
    }

    let required = [
        (vulkan_12.timeline_semaphore, "timelineSemaphore"),
        (vulkan_12.buffer_device_address, "bufferDeviceAddress"),
        (vulkan_12.descriptor_indexing, "descriptorIndexing"),
        (vulkan_12.runtime_descriptor_array, "runtimeDescriptorArray"),
        (
            vulkan_12.descriptor_binding_partially_bound,
            "descriptorBindingPartiallyBound",
        ),
        (
            vulkan_12.descriptor_binding_sampled_image_update_after_bind,
            "descriptorBindingSampledImageUpdateAfterBind",
        ),
        (
            vulkan_12.descriptor_binding_storage_image_update_after_bind,
            "descriptorBindingStorageImageUpdateAfterBind",
        ),
        (
            vulkan_12.descriptor_binding_storage_buffer_update_after_bind,
            "descriptorBindingStorageBufferUpdateAfterBind",
        ),
        (vulkan_13.dynamic_rendering, "dynamicRendering"),
        (vulkan_13.synchronization2, "synchronization2"),
    ];

    match required.iter().find(|(supported, _)| *supported == vk::FALSE) {
        Some((_, name)) => Err(name),
        None => Ok(()),
    }
}

fn bindless_limit(instance: &ash::Instance, device: vk::PhysicalDevice) -> u32 {
    let mut vulkan_12 = vk::PhysicalDeviceVulkan12Properties::default();
    {
        let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut vulkan_12);
        unsafe { instance.get_physical_device_properties2(device, &mut properties) };
    }
    vulkan_12
        .max_descriptor_set_update_after_bind_sampled_images
        .min(vulkan_12.max_descriptor_set_update_after_bind_storage_images)
        .min(vulkan_12.max_descriptor_set_update_after_bind_storage_buffers)
        .min(MAX_BINDLESS_DESCRIPTORS)
}

/// Find a queue family that supports both graphics and compute.
fn find_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<u32> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    queue_families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|index| index as u32)
}

/// Create a logical device with the bindless and timeline feature set enabled.
pub fn create_logical_device(
    instance: &ash::Instance,
    caps: &DeviceCaps,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(caps.queue_family)
        .queue_priorities(&queue_priorities)];

    let features = vk::PhysicalDeviceFeatures::default();

    let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .descriptor_binding_storage_image_update_after_bind(true)
        .descriptor_binding_storage_buffer_update_after_bind(true);

    let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_features(&features)
        .push_next(&mut vulkan_12_features)
        .push_next(&mut vulkan_13_features);

    unsafe { instance.create_device(caps.physical_device, &create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
    })
}
