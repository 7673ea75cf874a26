//! Command pool management and command list encoding.
//!
//! Each frame slot owns one primary command buffer. At submission the slot's
//! [`CommandList`] is translated into that buffer in one pass by
//! [`Encoder`].

use std::sync::Arc;

use ash::vk;

use crate::backend::{GpuPipeline, NativePipeline};
use crate::commands::{CommandList, GpuCommand};
use crate::error::GraphicsError;
use crate::types::{ResourceState, ScissorRect, Viewport};

use super::barriers::record_barriers;
use super::conversion::convert_index_format;
use super::pipeline::{ALL_STAGES, USER_CONSTANT_OFFSET, VulkanPipeline};
use super::{DeviceShared, map_vk_error, vulkan_resource};

/// Create a command pool whose buffers can be reset individually.
pub fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
) -> Result<vk::CommandPool, GraphicsError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create command pool: {:?}", e))
    })
}

/// Allocate one primary command buffer.
pub fn allocate_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer, GraphicsError> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }.map_err(map_vk_error)?;
    buffers.first().copied().ok_or_else(|| {
        GraphicsError::AllocationError("no command buffer allocated".to_string())
    })
}

/// Translates a [`CommandList`] into a Vulkan command buffer.
pub struct Encoder<'a> {
    shared: &'a DeviceShared,
    cmd: vk::CommandBuffer,
    current: Option<Arc<GpuPipeline>>,
    rendering: bool,
}

impl<'a> Encoder<'a> {
    pub fn new(shared: &'a DeviceShared, cmd: vk::CommandBuffer) -> Self {
        Self {
            shared,
            cmd,
            current: None,
            rendering: false,
        }
    }

    /// Record every command of `list`. The command buffer must be in the
    /// recording state.
    pub fn encode(&mut self, list: &CommandList) -> Result<(), GraphicsError> {
        for command in list {
            self.encode_one(command)?;
        }
        if self.rendering {
            log::warn!("Command list ended inside a rendering scope; closing it");
            unsafe { self.shared.device.cmd_end_rendering(self.cmd) };
            self.rendering = false;
        }
        Ok(())
    }

    fn encode_one(&mut self, command: &GpuCommand) -> Result<(), GraphicsError> {
        let shared = self.shared;
        let device = &shared.device;
        let cmd = self.cmd;

        match command {
            GpuCommand::Barriers(batch) => record_barriers(device, cmd, batch)?,
            GpuCommand::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let region = vk::BufferCopy::default()
                    .src_offset(*src_offset)
                    .dst_offset(*dst_offset)
                    .size(*size);
                let src = vulkan_resource(src)?.buffer()?;
                let dst = vulkan_resource(dst)?.buffer()?;
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            }
            GpuCommand::CopyBufferToTexture {
                src,
                src_offset,
                bytes_per_row: _,
                dst,
                mip_level,
                extent,
            } => {
                let src = vulkan_resource(src)?.buffer()?;
                let image = vulkan_resource(dst)?.image()?;
                let layout = self.prepare_image(image, ResourceState::COPY_DEST);
                // Row length 0 means tightly packed.
                let region = vk::BufferImageCopy::default()
                    .buffer_offset(*src_offset)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: image.aspect(),
                        mip_level: *mip_level,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: extent.depth.max(1),
                    });
                unsafe { device.cmd_copy_buffer_to_image(cmd, src, image.raw, layout, &[region]) };
            }
            GpuCommand::SetPipeline(pipeline) => {
                let native = vulkan_pipeline(pipeline)?;
                unsafe {
                    device.cmd_bind_pipeline(cmd, native.bind_point(), native.raw());
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        native.bind_point(),
                        native.model().layout(),
                        0,
                        &[native.model().set()],
                        &[],
                    );
                }
                self.current = Some(Arc::clone(pipeline));
            }
            GpuCommand::BindDescriptorTable { base } => {
                let layout = self.layout("bind a descriptor table")?;
                unsafe {
                    device.cmd_push_constants(cmd, layout, ALL_STAGES, 0, &base.to_ne_bytes())
                };
            }
            GpuCommand::SetConstants { data } => {
                let layout = self.layout("set root constants")?;
                let bytes: &[u8] = bytemuck::cast_slice(data);
                unsafe {
                    device.cmd_push_constants(cmd, layout, ALL_STAGES, USER_CONSTANT_OFFSET, bytes)
                };
            }
            GpuCommand::SetConstantBuffer {
                buffer,
                offset,
                size: _,
            } => {
                let layout = self.layout("bind a constant buffer")?;
                let set = vulkan_resource(buffer)?.uniform_set(*offset)?;
                let dynamic_offset = u32::try_from(*offset).map_err(|_| {
                    GraphicsError::InvalidParameter(format!(
                        "constant buffer offset {offset} exceeds 32 bits"
                    ))
                })?;
                for bind_point in [
                    vk::PipelineBindPoint::GRAPHICS,
                    vk::PipelineBindPoint::COMPUTE,
                ] {
                    unsafe {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            bind_point,
                            layout,
                            1,
                            &[set],
                            &[dynamic_offset],
                        )
                    };
                }
            }
            GpuCommand::SetVertexBuffer {
                slot,
                buffer,
                offset,
            } => {
                let buffer = vulkan_resource(buffer)?.buffer()?;
                unsafe { device.cmd_bind_vertex_buffers(cmd, *slot, &[buffer], &[*offset]) };
            }
            GpuCommand::SetIndexBuffer {
                buffer,
                offset,
                format,
            } => {
                let buffer = vulkan_resource(buffer)?.buffer()?;
                unsafe {
                    device.cmd_bind_index_buffer(
                        cmd,
                        buffer,
                        *offset,
                        convert_index_format(*format),
                    )
                };
            }
            GpuCommand::BeginRendering {
                color,
                depth,
                extent,
            } => {
                let mut color_attachments = Vec::with_capacity(color.len());
                for attachment in color {
                    let image = vulkan_resource(&attachment.texture)?.image()?;
                    let layout = self.prepare_image(image, ResourceState::RENDER_TARGET);
                    let (load_op, clear_value) = match attachment.clear {
                        Some(rgba) => (
                            vk::AttachmentLoadOp::CLEAR,
                            vk::ClearValue {
                                color: vk::ClearColorValue { float32: rgba },
                            },
                        ),
                        None => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
                    };
                    color_attachments.push(
                        vk::RenderingAttachmentInfo::default()
                            .image_view(image.attachment_view()?)
                            .image_layout(layout)
                            .load_op(load_op)
                            .store_op(vk::AttachmentStoreOp::STORE)
                            .clear_value(clear_value),
                    );
                }

                let depth_attachment = match depth {
                    Some(attachment) => {
                        let image = vulkan_resource(&attachment.texture)?.image()?;
                        let layout = self.prepare_image(image, ResourceState::DEPTH_WRITE);
                        let (load_op, clear_value) = match attachment.clear {
                            Some(depth) => (
                                vk::AttachmentLoadOp::CLEAR,
                                vk::ClearValue {
                                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                                },
                            ),
                            None => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
                        };
                        Some(
                            vk::RenderingAttachmentInfo::default()
                                .image_view(image.attachment_view()?)
                                .image_layout(layout)
                                .load_op(load_op)
                                .store_op(vk::AttachmentStoreOp::STORE)
                                .clear_value(clear_value),
                        )
                    }
                    None => None,
                };

                let render_area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: vk::Extent2D {
                        width: extent.width,
                        height: extent.height,
                    },
                };
                let mut rendering_info = vk::RenderingInfo::default()
                    .render_area(render_area)
                    .layer_count(1)
                    .color_attachments(&color_attachments);
                if let Some(depth_attachment) = depth_attachment.as_ref() {
                    rendering_info = rendering_info.depth_attachment(depth_attachment);
                }

                unsafe { device.cmd_begin_rendering(cmd, &rendering_info) };
                self.rendering = true;
            }
            GpuCommand::EndRendering => {
                if self.rendering {
                    unsafe { device.cmd_end_rendering(cmd) };
                    self.rendering = false;
                }
            }
            GpuCommand::SetViewport(viewport) => {
                unsafe { device.cmd_set_viewport(cmd, 0, &[flipped_viewport(viewport)]) };
            }
            GpuCommand::SetScissor(scissor) => {
                unsafe { device.cmd_set_scissor(cmd, 0, &[convert_scissor(scissor)]) };
            }
            GpuCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => unsafe {
                device.cmd_draw(
                    cmd,
                    *vertex_count,
                    *instance_count,
                    *first_vertex,
                    *first_instance,
                )
            },
            GpuCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => unsafe {
                device.cmd_draw_indexed(
                    cmd,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                )
            },
            GpuCommand::Dispatch { x, y, z } => unsafe { device.cmd_dispatch(cmd, *x, *y, *z) },
        }
        Ok(())
    }

    /// Layout of an image about to be used in `state`.
    ///
    /// The first use of an image that was never transitioned moves it out of
    /// `UNDEFINED` first.
    fn prepare_image(&self, image: &super::VulkanImage, state: ResourceState) -> vk::ImageLayout {
        let layout = image.layout(state);
        if image.take_uninitialized() {
            let (stage, access) = super::conversion::stage_access(state);
            let barrier = vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                .dst_stage_mask(stage)
                .dst_access_mask(access)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.raw)
                .subresource_range(image.full_range());
            let barriers = [barrier];
            let dependency_info = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe {
                self.shared
                    .device
                    .cmd_pipeline_barrier2(self.cmd, &dependency_info)
            };
        }
        layout
    }

    fn layout(&self, what: &str) -> Result<vk::PipelineLayout, GraphicsError> {
        let pipeline = self.current.as_ref().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("cannot {what} before binding a pipeline"))
        })?;
        Ok(vulkan_pipeline(pipeline)?.model().layout())
    }
}

fn vulkan_pipeline(pipeline: &GpuPipeline) -> Result<&VulkanPipeline, GraphicsError> {
    match pipeline.native() {
        NativePipeline::Vulkan(native) => Ok(native),
        _ => Err(GraphicsError::InvalidParameter(
            "pipeline was not created by the Vulkan backend".to_string(),
        )),
    }
}

/// Vulkan's clip space has Y pointing down; a negative-height viewport
/// restores the Y-up convention shaders are written for.
fn flipped_viewport(viewport: &Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.y + viewport.height,
        width: viewport.width,
        height: -viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

fn convert_scissor(scissor: &ScissorRect) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: scissor.x,
            y: scissor.y,
        },
        extent: vk::Extent2D {
            width: scissor.width,
            height: scissor.height,
        },
    }
}
