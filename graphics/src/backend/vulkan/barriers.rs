//! Barrier batch encoding.
//!
//! A [`BarrierBatch`] becomes exactly one `vkCmdPipelineBarrier2`: one image
//! or buffer barrier per transition, plus a single global memory barrier if
//! any unordered-access barriers were requested.

use ash::vk;

use crate::commands::BarrierBatch;
use crate::error::GraphicsError;

use super::ResourceKind;
use super::conversion::stage_access;

/// Record `batch` into `cmd`.
pub fn record_barriers(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    batch: &BarrierBatch,
) -> Result<(), GraphicsError> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut image_barriers = Vec::new();
    let mut buffer_barriers = Vec::new();

    for transition in &batch.transitions {
        let resource = super::vulkan_resource(&transition.resource)?;
        let (src_stage, src_access) = stage_access(transition.before);
        let (dst_stage, dst_access) = stage_access(transition.after);

        match resource.kind() {
            ResourceKind::Buffer(buffer) => {
                buffer_barriers.push(
                    vk::BufferMemoryBarrier2::default()
                        .src_stage_mask(src_stage)
                        .src_access_mask(src_access)
                        .dst_stage_mask(dst_stage)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(buffer.raw)
                        .offset(0)
                        .size(vk::WHOLE_SIZE),
                );
            }
            ResourceKind::Image(image) => {
                let old_layout = if image.take_uninitialized() {
                    vk::ImageLayout::UNDEFINED
                } else {
                    image.layout(transition.before)
                };
                image_barriers.push(
                    vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(src_stage)
                        .src_access_mask(src_access)
                        .dst_stage_mask(dst_stage)
                        .dst_access_mask(dst_access)
                        .old_layout(old_layout)
                        .new_layout(image.layout(transition.after))
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(image.raw)
                        .subresource_range(image.full_range()),
                );
            }
        }
    }

    let shader_stages = vk::PipelineStageFlags2::VERTEX_SHADER
        | vk::PipelineStageFlags2::FRAGMENT_SHADER
        | vk::PipelineStageFlags2::COMPUTE_SHADER;
    let memory_barriers: Vec<vk::MemoryBarrier2> = if batch.uav_barriers.is_empty() {
        Vec::new()
    } else {
        vec![
            vk::MemoryBarrier2::default()
                .src_stage_mask(shader_stages)
                .src_access_mask(vk::AccessFlags2::SHADER_STORAGE_WRITE)
                .dst_stage_mask(shader_stages)
                .dst_access_mask(
                    vk::AccessFlags2::SHADER_STORAGE_READ
                        | vk::AccessFlags2::SHADER_SAMPLED_READ
                        | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                ),
        ]
    };

    let dependency_info = vk::DependencyInfo::default()
        .memory_barriers(&memory_barriers)
        .buffer_memory_barriers(&buffer_barriers)
        .image_memory_barriers(&image_barriers);

    log::trace!(
        "Vulkan barriers: {} image, {} buffer, {} memory",
        image_barriers.len(),
        buffer_barriers.len(),
        memory_barriers.len()
    );

    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    Ok(())
}
