//! The shared binding model and pipeline creation.
//!
//! Every pipeline uses the same layout, so switching pipelines never
//! invalidates bound descriptor sets or push constants:
//!
//! | Slot | Contents |
//! |------|----------|
//! | set 0, binding 0 | `binding_array<texture_2d<f32>>` (sampled views) |
//! | set 0, binding 1 | `binding_array<texture_storage_2d<..>>` (storage views) |
//! | set 0, binding 2 | `binding_array<StorageBuffer>` (buffer views) |
//! | set 0, binding 3 | immutable linear sampler |
//! | set 1, binding 0 | dynamic uniform buffer (the bound constant buffer) |
//! | push constants 0..16 | descriptor table base (word 0) |
//! | push constants 16..128 | user root constants |
//!
//! Set 0 is the shader-visible heap: descriptor index `i` of the heap is
//! array element `i` of whichever binding matches the view kind.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::backend::{GpuResource, GpuView, NativeView, PipelineKind, ViewKind};
use crate::error::GraphicsError;
use crate::pipeline::{PipelineDescriptor, ShaderBytecode, ShaderStage};

use super::conversion::{convert_cull_mode, convert_texture_format, convert_vertex_format};
use super::{DeviceShared, map_vk_error};

/// Total push constant bytes in the pipeline layout.
pub const PUSH_CONSTANT_BYTES: u32 = 128;

/// Push constant offset of the first user constant.
pub const USER_CONSTANT_OFFSET: u32 = 16;

const SAMPLED_BINDING: u32 = 0;
const STORAGE_IMAGE_BINDING: u32 = 1;
const STORAGE_BUFFER_BINDING: u32 = 2;
const SAMPLER_BINDING: u32 = 3;

/// Shader stages that see every binding.
pub const ALL_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw()
        | vk::ShaderStageFlags::FRAGMENT.as_raw()
        | vk::ShaderStageFlags::COMPUTE.as_raw(),
);

/// The bindless descriptor set and the pipeline layout built around it.
pub struct BindingModel {
    shared: Arc<DeviceShared>,
    capacity: u32,
    sampler: vk::Sampler,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    layout: vk::PipelineLayout,
    // Descriptor set updates need external synchronization.
    write_lock: Mutex<()>,
}

impl BindingModel {
    /// Build the heap set with `capacity` entries per binding.
    pub fn new(shared: Arc<DeviceShared>, capacity: u32) -> Result<Self, GraphicsError> {
        let device = &shared.device;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }.map_err(map_vk_error)?;

        let samplers = [sampler];
        let bindings = [
            array_binding(SAMPLED_BINDING, vk::DescriptorType::SAMPLED_IMAGE, capacity),
            array_binding(STORAGE_IMAGE_BINDING, vk::DescriptorType::STORAGE_IMAGE, capacity),
            array_binding(STORAGE_BUFFER_BINDING, vk::DescriptorType::STORAGE_BUFFER, capacity),
            vk::DescriptorSetLayoutBinding::default()
                .binding(SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(ALL_STAGES)
                .immutable_samplers(&samplers),
        ];
        let bindless = vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::PARTIALLY_BOUND;
        let binding_flags = [
            bindless,
            bindless,
            bindless,
            vk::DescriptorBindingFlags::empty(),
        ];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);

        // Partially built objects are destroyed by Drop, so fill them in one
        // at a time on a null-initialized model.
        let mut model = Self {
            shared: Arc::clone(&shared),
            capacity,
            sampler,
            set_layout: vk::DescriptorSetLayout::null(),
            pool: vk::DescriptorPool::null(),
            set: vk::DescriptorSet::null(),
            layout: vk::PipelineLayout::null(),
            write_lock: Mutex::new(()),
        };

        model.set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(map_vk_error)?;

        let pool_sizes = [
            pool_size(vk::DescriptorType::SAMPLED_IMAGE, capacity),
            pool_size(vk::DescriptorType::STORAGE_IMAGE, capacity),
            pool_size(vk::DescriptorType::STORAGE_BUFFER, capacity),
            pool_size(vk::DescriptorType::SAMPLER, 1),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        model.pool =
            unsafe { device.create_descriptor_pool(&pool_info, None) }.map_err(|e| {
                GraphicsError::AllocationError(format!(
                    "Failed to create bindless descriptor pool: {:?}",
                    e
                ))
            })?;

        let set_layouts = [model.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(model.pool)
            .set_layouts(&set_layouts);
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }.map_err(map_vk_error)?;
        model.set = sets.first().copied().ok_or_else(|| {
            GraphicsError::AllocationError("no bindless descriptor set allocated".to_string())
        })?;

        let pipeline_set_layouts = [model.set_layout, shared.uniform_layout];
        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(ALL_STAGES)
            .offset(0)
            .size(PUSH_CONSTANT_BYTES)];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&pipeline_set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        model.layout = unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
            .map_err(map_vk_error)?;

        log::debug!("Vulkan bindless set created ({} entries per binding)", capacity);
        Ok(model)
    }

    /// Entries per binding.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The heap descriptor set.
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// The layout shared by every pipeline.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Write `view` into heap entry `index`.
    pub fn write(&self, index: u32, view: &GpuView) -> Result<(), GraphicsError> {
        if index >= self.capacity {
            return Err(GraphicsError::InvalidParameter(format!(
                "descriptor index {index} out of range ({})",
                self.capacity
            )));
        }
        let NativeView::Vulkan(native) = view.native() else {
            return Err(GraphicsError::InvalidParameter(
                "view was not created by the Vulkan backend".to_string(),
            ));
        };
        let GpuResource::Vulkan(resource) = view.resource().as_ref() else {
            return Err(GraphicsError::InvalidParameter(
                "view of a non-Vulkan resource".to_string(),
            ));
        };

        let _guard = self.write_lock.lock();
        let device = &self.shared.device;
        match view.kind() {
            ViewKind::Sampled { .. } | ViewKind::Storage { .. } => {
                let (binding, ty, layout) = match view.kind() {
                    ViewKind::Sampled { .. } => (
                        SAMPLED_BINDING,
                        vk::DescriptorType::SAMPLED_IMAGE,
                        resource.shader_read_layout(),
                    ),
                    _ => (
                        STORAGE_IMAGE_BINDING,
                        vk::DescriptorType::STORAGE_IMAGE,
                        vk::ImageLayout::GENERAL,
                    ),
                };
                let image_info = [vk::DescriptorImageInfo::default()
                    .image_view(native.image_view())
                    .image_layout(layout)];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(binding)
                    .dst_array_element(index)
                    .descriptor_type(ty)
                    .image_info(&image_info);
                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
            ViewKind::Buffer { offset, size } => {
                let buffer_info = [vk::DescriptorBufferInfo::default()
                    .buffer(resource.buffer()?)
                    .offset(offset)
                    .range(size)];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(STORAGE_BUFFER_BINDING)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&buffer_info);
                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
        }
        Ok(())
    }
}

impl Drop for BindingModel {
    fn drop(&mut self) {
        let device = &self.shared.device;
        // Pipelines referencing the layout hold an Arc to the model, so the
        // layout is unused by the time this runs.
        unsafe {
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_sampler(self.sampler, None);
        }
    }
}

fn array_binding(
    binding: u32,
    ty: vk::DescriptorType,
    count: u32,
) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding::default()
        .binding(binding)
        .descriptor_type(ty)
        .descriptor_count(count)
        .stage_flags(ALL_STAGES)
}

fn pool_size(ty: vk::DescriptorType, count: u32) -> vk::DescriptorPoolSize {
    vk::DescriptorPoolSize {
        ty,
        descriptor_count: count,
    }
}

/// A compiled pipeline and the binding model it was built against.
pub struct VulkanPipeline {
    model: Arc<BindingModel>,
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

impl VulkanPipeline {
    /// Native pipeline handle.
    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Graphics or compute.
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    /// The binding model (and so the layout) the pipeline uses.
    pub fn model(&self) -> &BindingModel {
        &self.model
    }
}

impl Drop for VulkanPipeline {
    fn drop(&mut self) {
        unsafe { self.model.shared.device.destroy_pipeline(self.pipeline, None) };
    }
}

impl std::fmt::Debug for VulkanPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanPipeline")
            .field("pipeline", &self.pipeline)
            .field("bind_point", &self.bind_point)
            .finish()
    }
}

/// Shader modules destroyed when the builder goes out of scope.
struct ShaderModules<'a> {
    device: &'a ash::Device,
    modules: Vec<(ShaderStage, vk::ShaderModule, CString)>,
}

impl<'a> ShaderModules<'a> {
    fn new(device: &'a ash::Device, shaders: &[ShaderBytecode]) -> Result<Self, GraphicsError> {
        let mut modules = Self {
            device,
            modules: Vec::with_capacity(shaders.len()),
        };
        for shader in shaders {
            let entry = CString::new(shader.entry_point()).map_err(|e| {
                GraphicsError::ShaderLoadError(format!(
                    "Invalid entry point name (contains null byte): {}",
                    e
                ))
            })?;
            let create_info = vk::ShaderModuleCreateInfo::default().code(shader.words());
            let module = unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| {
                GraphicsError::ShaderLoadError(format!("Failed to create shader module: {:?}", e))
            })?;
            modules.modules.push((shader.stage(), module, entry));
        }
        Ok(modules)
    }

    fn stage_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'_>> {
        self.modules
            .iter()
            .map(|(stage, module, entry)| {
                let flags = match stage {
                    ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
                    ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
                    ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
                };
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(flags)
                    .module(*module)
                    .name(entry)
            })
            .collect()
    }

    fn has(&self, stage: ShaderStage) -> bool {
        self.modules.iter().any(|(s, _, _)| *s == stage)
    }
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for (_, module, _) in self.modules.drain(..) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }
}

/// Create a pipeline against `model`'s layout.
pub fn create_pipeline(
    model: &Arc<BindingModel>,
    descriptor: &PipelineDescriptor,
    shaders: &[ShaderBytecode],
) -> Result<(PipelineKind, VulkanPipeline), GraphicsError> {
    let device = &model.shared.device;
    let modules = ShaderModules::new(device, shaders)?;
    let stages = modules.stage_infos();

    let (kind, bind_point, pipeline) = match descriptor {
        PipelineDescriptor::Compute(_) => {
            if !modules.has(ShaderStage::Compute) {
                return Err(GraphicsError::PipelineCreationError(
                    "compute pipeline needs a compute shader".to_string(),
                ));
            }
            let stage = stages
                .iter()
                .find(|s| s.stage == vk::ShaderStageFlags::COMPUTE)
                .copied()
                .ok_or_else(|| {
                    GraphicsError::PipelineCreationError("missing compute stage".to_string())
                })?;
            let create_info = vk::ComputePipelineCreateInfo::default()
                .stage(stage)
                .layout(model.layout);
            let pipelines = unsafe {
                device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
            }
            .map_err(|(_, e)| {
                GraphicsError::PipelineCreationError(format!(
                    "Failed to create compute pipeline: {:?}",
                    e
                ))
            })?;
            (
                PipelineKind::Compute,
                vk::PipelineBindPoint::COMPUTE,
                pipelines[0],
            )
        }
        PipelineDescriptor::Graphics(desc) => {
            if !modules.has(ShaderStage::Vertex) {
                return Err(GraphicsError::PipelineCreationError(
                    "graphics pipeline needs a vertex shader".to_string(),
                ));
            }

            let binding_descriptions: Vec<vk::VertexInputBindingDescription> = desc
                .vertex_layout
                .buffers
                .iter()
                .enumerate()
                .map(|(i, buffer)| {
                    vk::VertexInputBindingDescription::default()
                        .binding(i as u32)
                        .stride(buffer.stride)
                        .input_rate(vk::VertexInputRate::VERTEX)
                })
                .collect();

            let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
                .vertex_layout
                .attributes
                .iter()
                .map(|attr| {
                    vk::VertexInputAttributeDescription::default()
                        .location(attr.location)
                        .binding(attr.buffer_slot)
                        .format(convert_vertex_format(attr.format))
                        .offset(attr.offset)
                })
                .collect();

            let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&binding_descriptions)
                .vertex_attribute_descriptions(&attribute_descriptions);

            let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

            let viewport_state = vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1);

            // The encoder flips the viewport to y-up, where front faces wind
            // counter-clockwise.
            let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(vk::PolygonMode::FILL)
                .line_width(1.0)
                .cull_mode(convert_cull_mode(desc.cull_mode))
                .front_face(vk::FrontFace::COUNTER_CLOCKWISE);

            let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1);

            let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(desc.depth.is_some())
                .depth_write_enable(desc.depth.is_some_and(|d| d.write_enabled))
                .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);

            let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
                .color_formats
                .iter()
                .map(|_| {
                    vk::PipelineColorBlendAttachmentState::default()
                        .color_write_mask(vk::ColorComponentFlags::RGBA)
                        .blend_enable(false)
                })
                .collect();
            let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
                .attachments(&color_blend_attachments);

            let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
            let dynamic_state =
                vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

            let color_attachment_formats: Vec<vk::Format> = desc
                .color_formats
                .iter()
                .map(|f| convert_texture_format(*f))
                .collect();
            let depth_attachment_format = desc
                .depth
                .map(|d| convert_texture_format(d.format))
                .unwrap_or(vk::Format::UNDEFINED);
            let stencil_attachment_format = match desc.depth {
                Some(d) if d.format.has_stencil() => depth_attachment_format,
                _ => vk::Format::UNDEFINED,
            };
            let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
                .color_attachment_formats(&color_attachment_formats)
                .depth_attachment_format(depth_attachment_format)
                .stencil_attachment_format(stencil_attachment_format);

            let create_info = vk::GraphicsPipelineCreateInfo::default()
                .stages(&stages)
                .vertex_input_state(&vertex_input_state)
                .input_assembly_state(&input_assembly_state)
                .viewport_state(&viewport_state)
                .rasterization_state(&rasterization_state)
                .multisample_state(&multisample_state)
                .depth_stencil_state(&depth_stencil_state)
                .color_blend_state(&color_blend_state)
                .dynamic_state(&dynamic_state)
                .layout(model.layout)
                .push_next(&mut rendering_info);

            let pipelines = unsafe {
                device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
            }
            .map_err(|(_, e)| {
                GraphicsError::PipelineCreationError(format!(
                    "Failed to create graphics pipeline: {:?}",
                    e
                ))
            })?;
            (
                PipelineKind::Graphics,
                vk::PipelineBindPoint::GRAPHICS,
                pipelines[0],
            )
        }
    };

    super::debug::set_object_name(
        model.shared.debug_utils.as_ref(),
        pipeline,
        descriptor.label(),
    );

    Ok((
        kind,
        VulkanPipeline {
            model: Arc::clone(model),
            pipeline,
            bind_point,
        },
    ))
}
