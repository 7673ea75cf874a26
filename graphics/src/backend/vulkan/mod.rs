//! Native Vulkan backend implementation using ash.
//!
//! The backend drives one graphics+compute queue and exposes it through
//! [`GpuBackend`]:
//!
//! - A timeline semaphore is the queue's completion counter. Every submission
//!   signals the value the frame orchestrator hands it.
//! - Each frame slot owns one command buffer. The backend-neutral
//!   [`CommandList`] is encoded into it at submission.
//! - Memory comes from gpu-allocator. `UPLOAD` buffers live in host-visible
//!   memory and stay mapped; everything else is device-local.
//! - The shader-visible descriptor heap is a single update-after-bind
//!   descriptor set (see the `pipeline` module for the binding model). CPU-only
//!   heaps have no native object at all: they only hold views until they are
//!   copied into the shader-visible heap.
//!
//! # Requirements
//!
//! Vulkan 1.3 with dynamic rendering, synchronization2, timeline semaphores,
//! buffer device addresses and descriptor indexing. Devices missing any of
//! these are skipped during selection.
//!
//! # Object Lifetime
//!
//! All native objects share a reference-counted `DeviceShared` holding the
//! device, the allocator and the instance. The device is destroyed when the
//! backend and the last resource, view or pipeline referencing it are gone.

mod allocator;
mod barriers;
mod command;
pub(crate) mod conversion;
mod debug;
mod device;
mod instance;
mod pipeline;
mod sync;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;

use crate::commands::CommandList;
use crate::error::GraphicsError;
use crate::pipeline::{PipelineDescriptor, ShaderBytecode};
use crate::resources::CONSTANT_BUFFER_WINDOW;
use crate::types::{BufferDescriptor, ResourceState, TextureDescriptor, TextureFormat, TextureUsage};

use super::{
    BackendLimits, GpuBackend, GpuDescriptorHeap, GpuPipeline, GpuResource, GpuView, NativeHeap,
    NativePipeline, NativeView, ViewKind,
};

pub use pipeline::VulkanPipeline;

use self::command::Encoder;
use self::conversion::{
    aspect_mask, convert_buffer_usage, convert_texture_format, convert_texture_usage,
};
use self::device::DeviceCaps;
use self::instance::InstanceBundle;
use self::pipeline::{BindingModel, PUSH_CONSTANT_BYTES, USER_CONSTANT_OFFSET};

/// Dynamic uniform-buffer descriptor sets available at once (one per
/// constant-buffer-capable buffer that has been bound).
const UNIFORM_SET_CAPACITY: u32 = 256;

/// Map a Vulkan error to a graphics error.
pub(crate) fn map_vk_error(result: vk::Result) -> GraphicsError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY
        | vk::Result::ERROR_FRAGMENTED_POOL => {
            GraphicsError::AllocationError(format!("Vulkan: {:?}", result))
        }
        other => GraphicsError::InvalidParameter(format!("Vulkan call failed: {:?}", other)),
    }
}

// ============================================================================
// Shared device state
// ============================================================================

/// Device-level objects every native object needs for its own destruction.
pub(crate) struct DeviceShared {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils_instance: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    device: ash::Device,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    allocator: Mutex<Option<Allocator>>,
    uniform_layout: vk::DescriptorSetLayout,
    uniform_pool: Mutex<vk::DescriptorPool>,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // The allocator frees its memory blocks through the device.
            self.allocator.get_mut().take();

            self.device
                .destroy_descriptor_pool(*self.uniform_pool.get_mut(), None);
            self.device
                .destroy_descriptor_set_layout(self.uniform_layout, None);
            self.device.destroy_device(None);

            if let (Some(debug_utils), Some(messenger)) =
                (&self.debug_utils_instance, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
        log::debug!("Vulkan device destroyed");
    }
}

fn destroy_instance(bundle: &InstanceBundle) {
    unsafe {
        if let (Some(debug_utils), Some(messenger)) = (&bundle.debug_utils, bundle.debug_messenger)
        {
            debug_utils.destroy_debug_utils_messenger(messenger, None);
        }
        bundle.instance.destroy_instance(None);
    }
}

fn create_uniform_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout, GraphicsError> {
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
        .descriptor_count(1)
        .stage_flags(pipeline::ALL_STAGES)];
    let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    unsafe { device.create_descriptor_set_layout(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to create constant buffer layout: {:?}",
            e
        ))
    })
}

fn create_uniform_pool(device: &ash::Device) -> Result<vk::DescriptorPool, GraphicsError> {
    let pool_sizes = [vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        descriptor_count: UNIFORM_SET_CAPACITY,
    }];
    let create_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(UNIFORM_SET_CAPACITY)
        .pool_sizes(&pool_sizes);
    unsafe { device.create_descriptor_pool(&create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to create constant buffer pool: {:?}",
            e
        ))
    })
}

// ============================================================================
// Resources
// ============================================================================

/// A buffer or image and its memory.
pub struct VulkanResource {
    shared: Arc<DeviceShared>,
    kind: ResourceKind,
    allocation: Mutex<Option<Allocation>>,
    uniform_set: Mutex<Option<vk::DescriptorSet>>,
}

pub(crate) enum ResourceKind {
    Buffer(VulkanBuffer),
    Image(VulkanImage),
}

pub(crate) struct VulkanBuffer {
    pub(crate) raw: vk::Buffer,
    size: u64,
    host_visible: bool,
    uniform: bool,
}

pub(crate) struct VulkanImage {
    pub(crate) raw: vk::Image,
    format: TextureFormat,
    mip_levels: u32,
    storage: bool,
    attachment_view: vk::ImageView,
    initialized: AtomicBool,
}

impl VulkanImage {
    /// Layout the image is in while in `state`.
    pub(crate) fn layout(&self, state: ResourceState) -> vk::ImageLayout {
        conversion::image_layout(state, self.storage, self.format.is_depth_stencil())
    }

    pub(crate) fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_mask(self.format)
    }

    pub(crate) fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        }
    }

    /// Returns true exactly once: the first time the image is used on the
    /// GPU (in submission order), while its contents are still undefined.
    pub(crate) fn take_uninitialized(&self) -> bool {
        !self.initialized.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn attachment_view(&self) -> Result<vk::ImageView, GraphicsError> {
        if self.attachment_view == vk::ImageView::null() {
            return Err(GraphicsError::InvalidParameter(
                "texture was not created with RENDER_ATTACHMENT usage".to_string(),
            ));
        }
        Ok(self.attachment_view)
    }
}

impl VulkanResource {
    fn new(shared: Arc<DeviceShared>, kind: ResourceKind) -> Self {
        Self {
            shared,
            kind,
            allocation: Mutex::new(None),
            uniform_set: Mutex::new(None),
        }
    }

    pub(crate) fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// The native buffer, or an error for images.
    pub(crate) fn buffer(&self) -> Result<vk::Buffer, GraphicsError> {
        match &self.kind {
            ResourceKind::Buffer(buffer) => Ok(buffer.raw),
            ResourceKind::Image(_) => Err(GraphicsError::InvalidParameter(
                "resource is not a buffer".to_string(),
            )),
        }
    }

    /// The native image, or an error for buffers.
    pub(crate) fn image(&self) -> Result<&VulkanImage, GraphicsError> {
        match &self.kind {
            ResourceKind::Image(image) => Ok(image),
            ResourceKind::Buffer(_) => Err(GraphicsError::InvalidParameter(
                "resource is not a texture".to_string(),
            )),
        }
    }

    /// Layout sampled descriptors of this resource are written with.
    pub(crate) fn shader_read_layout(&self) -> vk::ImageLayout {
        match &self.kind {
            ResourceKind::Image(image) => image.layout(ResourceState::PIXEL_SHADER_RESOURCE),
            ResourceKind::Buffer(_) => vk::ImageLayout::GENERAL,
        }
    }

    /// Dynamic uniform-buffer set for binding this buffer at `offset`.
    ///
    /// The set covers a [`CONSTANT_BUFFER_WINDOW`] range (or the whole buffer
    /// if smaller) and is allocated on first use.
    pub(crate) fn uniform_set(&self, offset: u64) -> Result<vk::DescriptorSet, GraphicsError> {
        let ResourceKind::Buffer(buffer) = &self.kind else {
            return Err(GraphicsError::InvalidParameter(
                "constant buffer must be a buffer".to_string(),
            ));
        };
        if !buffer.uniform {
            return Err(GraphicsError::InvalidParameter(
                "buffer was not created with UNIFORM usage".to_string(),
            ));
        }
        let range = CONSTANT_BUFFER_WINDOW.min(buffer.size);
        if offset + range > buffer.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "constant buffer window at {} overruns buffer of {} bytes",
                offset, buffer.size
            )));
        }

        let mut slot = self.uniform_set.lock();
        if let Some(set) = *slot {
            return Ok(set);
        }

        let device = &self.shared.device;
        let set_layouts = [self.shared.uniform_layout];
        let set = {
            let pool = self.shared.uniform_pool.lock();
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(*pool)
                .set_layouts(&set_layouts);
            let sets =
                unsafe { device.allocate_descriptor_sets(&alloc_info) }.map_err(map_vk_error)?;
            sets.first().copied().ok_or_else(|| {
                GraphicsError::AllocationError("no constant buffer set allocated".to_string())
            })?
        };

        let buffer_info = [vk::DescriptorBufferInfo::default()
            .buffer(buffer.raw)
            .offset(0)
            .range(range)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
            .buffer_info(&buffer_info);
        unsafe { device.update_descriptor_sets(&[write], &[]) };

        *slot = Some(set);
        Ok(set)
    }

    fn check_range(&self, offset: u64, size: u64) -> Result<&VulkanBuffer, GraphicsError> {
        let ResourceKind::Buffer(buffer) = &self.kind else {
            return Err(GraphicsError::InvalidParameter(
                "resource is not a buffer".to_string(),
            ));
        };
        if offset.checked_add(size).is_none_or(|end| end > buffer.size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "range {}..{} exceeds buffer size {}",
                offset,
                offset.saturating_add(size),
                buffer.size
            )));
        }
        if !buffer.host_visible {
            return Err(GraphicsError::InvalidParameter(
                "buffer is not host visible (create it with UPLOAD usage)".to_string(),
            ));
        }
        Ok(buffer)
    }
}

impl Drop for VulkanResource {
    fn drop(&mut self) {
        let device = &self.shared.device;
        if let Some(set) = self.uniform_set.get_mut().take() {
            let pool = self.shared.uniform_pool.lock();
            if let Err(e) = unsafe { device.free_descriptor_sets(*pool, &[set]) } {
                log::warn!("Failed to free constant buffer set: {:?}", e);
            }
        }
        unsafe {
            match &self.kind {
                ResourceKind::Buffer(buffer) => device.destroy_buffer(buffer.raw, None),
                ResourceKind::Image(image) => {
                    if image.attachment_view != vk::ImageView::null() {
                        device.destroy_image_view(image.attachment_view, None);
                    }
                    device.destroy_image(image.raw, None);
                }
            }
        }
        if let Some(allocation) = self.allocation.get_mut().take() {
            allocator::free(&self.shared.allocator, allocation);
        }
    }
}

impl std::fmt::Debug for VulkanResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ResourceKind::Buffer(buffer) => f
                .debug_struct("VulkanBuffer")
                .field("buffer", &buffer.raw)
                .field("size", &buffer.size)
                .field("host_visible", &buffer.host_visible)
                .finish(),
            ResourceKind::Image(image) => f
                .debug_struct("VulkanImage")
                .field("image", &image.raw)
                .field("format", &image.format)
                .field("mip_levels", &image.mip_levels)
                .finish(),
        }
    }
}

pub(crate) fn vulkan_resource(resource: &GpuResource) -> Result<&VulkanResource, GraphicsError> {
    match resource {
        GpuResource::Vulkan(resource) => Ok(resource),
        _ => Err(GraphicsError::InvalidParameter(
            "resource was not created by the Vulkan backend".to_string(),
        )),
    }
}

/// An image view (or nothing, for buffer ranges).
pub struct VulkanView {
    shared: Arc<DeviceShared>,
    image_view: vk::ImageView,
}

impl VulkanView {
    /// The native image view; null for buffer views.
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }
}

impl Drop for VulkanView {
    fn drop(&mut self) {
        if self.image_view != vk::ImageView::null() {
            unsafe { self.shared.device.destroy_image_view(self.image_view, None) };
        }
    }
}

/// The native side of the shader-visible heap.
pub struct VulkanHeap {
    model: Arc<BindingModel>,
}

// ============================================================================
// Backend
// ============================================================================

struct SubmitState {
    pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    /// Last value signaled by each slot's command buffer.
    slot_values: Vec<u64>,
    last_signaled: u64,
}

/// Vulkan-based GPU backend using ash.
///
/// This backend provides native Vulkan access with:
/// - Optional validation layers
/// - gpu-allocator for memory management
/// - Dynamic rendering and synchronization2
/// - A timeline semaphore as the completion counter
pub struct VulkanBackend {
    shared: Arc<DeviceShared>,
    caps: DeviceCaps,
    queue: vk::Queue,
    timeline: vk::Semaphore,
    submit: Mutex<SubmitState>,
    bindless: Mutex<Weak<BindingModel>>,
}

impl VulkanBackend {
    /// Create a new Vulkan backend.
    pub fn new(validation: bool) -> Result<Self, GraphicsError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan library: {}", e))
        })?;

        let bundle = instance::create_instance(&entry, validation)?;

        let caps = match device::select_physical_device(&bundle.instance) {
            Ok(caps) => caps,
            Err(e) => {
                destroy_instance(&bundle);
                return Err(e);
            }
        };
        let device = match device::create_logical_device(&bundle.instance, &caps) {
            Ok(device) => device,
            Err(e) => {
                destroy_instance(&bundle);
                return Err(e);
            }
        };

        let debug_utils = bundle
            .debug_utils
            .as_ref()
            .map(|_| ash::ext::debug_utils::Device::new(&bundle.instance, &device));

        // From here on DeviceShared's Drop tears down whatever was created.
        let mut shared = DeviceShared {
            _entry: entry,
            instance: bundle.instance,
            debug_utils_instance: bundle.debug_utils,
            debug_messenger: bundle.debug_messenger,
            device,
            debug_utils,
            allocator: Mutex::new(None),
            uniform_layout: vk::DescriptorSetLayout::null(),
            uniform_pool: Mutex::new(vk::DescriptorPool::null()),
        };

        *shared.allocator.get_mut() = Some(allocator::create_allocator(
            &shared.instance,
            caps.physical_device,
            shared.device.clone(),
        )?);
        shared.uniform_layout = create_uniform_layout(&shared.device)?;
        *shared.uniform_pool.get_mut() = create_uniform_pool(&shared.device)?;
        let shared = Arc::new(shared);

        let queue = unsafe { shared.device.get_device_queue(caps.queue_family, 0) };
        let timeline = sync::create_timeline_semaphore(&shared.device)?;
        let pool = match command::create_command_pool(&shared.device, caps.queue_family) {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { shared.device.destroy_semaphore(timeline, None) };
                return Err(e);
            }
        };

        log::info!("Vulkan backend initialized on {}", caps.name);

        Ok(Self {
            shared,
            caps,
            queue,
            timeline,
            submit: Mutex::new(SubmitState {
                pool,
                command_buffers: Vec::new(),
                slot_values: Vec::new(),
                last_signaled: 0,
            }),
            bindless: Mutex::new(Weak::new()),
        })
    }

    /// Name of the selected GPU.
    pub fn device_name(&self) -> &str {
        &self.caps.name
    }

    fn create_image_view(
        &self,
        image: &VulkanImage,
        base_mip: u32,
        mip_count: u32,
        sampled: bool,
    ) -> Result<vk::ImageView, GraphicsError> {
        // Sampled depth views read the depth plane only.
        let aspect = if sampled && image.format.is_depth_stencil() {
            vk::ImageAspectFlags::DEPTH
        } else {
            image.aspect()
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image.raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert_texture_format(image.format))
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: base_mip,
                level_count: mip_count,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.shared.device.create_image_view(&view_info, None) }.map_err(|e| {
            GraphicsError::AllocationError(format!("Failed to create image view: {:?}", e))
        })
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let device = &self.shared.device;
        unsafe {
            let _ = device.device_wait_idle();
            // Destroying the pool frees its command buffers.
            device.destroy_command_pool(self.submit.get_mut().pool, None);
            device.destroy_semaphore(self.timeline, None);
        }
    }
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("device", &self.caps.name)
            .field("queue_family", &self.caps.queue_family)
            .finish_non_exhaustive()
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn limits(&self) -> BackendLimits {
        BackendLimits {
            min_constant_alignment: self.caps.min_uniform_alignment.max(1),
            max_push_constant_bytes: self.caps.max_push_constants_size.min(PUSH_CONSTANT_BYTES)
                - USER_CONSTANT_OFFSET,
            max_shader_visible_descriptors: self.caps.max_bindless_descriptors,
        }
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuResource, GraphicsError> {
        log::trace!(
            "VulkanBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }

        let device = &self.shared.device;
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { device.create_buffer(&buffer_info, None) }.map_err(map_vk_error)?;

        let host_visible = descriptor.is_host_visible();
        let mut resource = VulkanResource::new(
            Arc::clone(&self.shared),
            ResourceKind::Buffer(VulkanBuffer {
                raw,
                size: descriptor.size,
                host_visible,
                uniform: descriptor.usage.contains(crate::types::BufferUsage::UNIFORM),
            }),
        );

        let requirements = unsafe { device.get_buffer_memory_requirements(raw) };
        let location = if host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = allocator::allocate(
            &self.shared.allocator,
            descriptor.label.as_deref().unwrap_or("buffer"),
            requirements,
            location,
            true,
        )?;
        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        *resource.allocation.get_mut() = Some(allocation);
        unsafe { device.bind_buffer_memory(raw, memory, offset) }.map_err(map_vk_error)?;

        debug::set_object_name(
            self.shared.debug_utils.as_ref(),
            raw,
            descriptor.label.as_deref(),
        );
        Ok(GpuResource::Vulkan(resource))
    }

    fn create_texture(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<GpuResource, GraphicsError> {
        log::trace!(
            "VulkanBackend: creating texture {:?} ({}x{}, {} mips, {:?})",
            descriptor.label,
            descriptor.size.width,
            descriptor.size.height,
            descriptor.mip_level_count,
            descriptor.format
        );
        if descriptor.size.width == 0 || descriptor.size.height == 0 {
            return Err(GraphicsError::InvalidParameter(
                "texture dimensions cannot be zero".to_string(),
            ));
        }
        if descriptor.mip_level_count == 0
            || descriptor.mip_level_count > descriptor.size.max_mip_levels()
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "invalid mip level count {} for {}x{}",
                descriptor.mip_level_count, descriptor.size.width, descriptor.size.height
            )));
        }

        let device = &self.shared.device;
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert_texture_format(descriptor.format))
            .extent(vk::Extent3D {
                width: descriptor.size.width,
                height: descriptor.size.height,
                depth: 1,
            })
            .mip_levels(descriptor.mip_level_count)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_texture_usage(descriptor.usage, descriptor.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { device.create_image(&image_info, None) }.map_err(map_vk_error)?;

        let mut resource = VulkanResource::new(
            Arc::clone(&self.shared),
            ResourceKind::Image(VulkanImage {
                raw,
                format: descriptor.format,
                mip_levels: descriptor.mip_level_count,
                storage: descriptor.usage.contains(TextureUsage::STORAGE),
                attachment_view: vk::ImageView::null(),
                initialized: AtomicBool::new(false),
            }),
        );

        let requirements = unsafe { device.get_image_memory_requirements(raw) };
        let allocation = allocator::allocate(
            &self.shared.allocator,
            descriptor.label.as_deref().unwrap_or("texture"),
            requirements,
            MemoryLocation::GpuOnly,
            false,
        )?;
        let (memory, offset) = unsafe { (allocation.memory(), allocation.offset()) };
        *resource.allocation.get_mut() = Some(allocation);
        unsafe { device.bind_image_memory(raw, memory, offset) }.map_err(map_vk_error)?;

        if descriptor.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            let view = match &resource.kind {
                ResourceKind::Image(image) => self.create_image_view(image, 0, 1, false)?,
                ResourceKind::Buffer(_) => vk::ImageView::null(),
            };
            if let ResourceKind::Image(image) = &mut resource.kind {
                image.attachment_view = view;
            }
        }

        debug::set_object_name(
            self.shared.debug_utils.as_ref(),
            raw,
            descriptor.label.as_deref(),
        );
        Ok(GpuResource::Vulkan(resource))
    }

    fn write_buffer(
        &self,
        buffer: &GpuResource,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        let resource = vulkan_resource(buffer)?;
        resource.check_range(offset, data.len() as u64)?;
        let mut allocation = resource.allocation.lock();
        let mapped = allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| GraphicsError::InvalidParameter("buffer is not mapped".to_string()))?;
        let start = offset as usize;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &GpuResource,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        let resource = vulkan_resource(buffer)?;
        resource.check_range(offset, size)?;
        let allocation = resource.allocation.lock();
        let mapped = allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or_else(|| GraphicsError::InvalidParameter("buffer is not mapped".to_string()))?;
        Ok(mapped[offset as usize..(offset + size) as usize].to_vec())
    }

    fn buffer_gpu_address(&self, buffer: &GpuResource) -> Result<u64, GraphicsError> {
        let raw = vulkan_resource(buffer)?.buffer()?;
        let info = vk::BufferDeviceAddressInfo::default().buffer(raw);
        Ok(unsafe { self.shared.device.get_buffer_device_address(&info) })
    }

    fn create_view(
        &self,
        resource: &Arc<GpuResource>,
        kind: ViewKind,
    ) -> Result<GpuView, GraphicsError> {
        let inner = vulkan_resource(resource)?;
        let image_view = match (kind, &inner.kind) {
            (ViewKind::Buffer { offset, size }, ResourceKind::Buffer(buffer)) => {
                if offset.checked_add(size).is_none_or(|end| end > buffer.size) {
                    return Err(GraphicsError::InvalidParameter(format!(
                        "buffer view {}..{} exceeds buffer size {}",
                        offset,
                        offset.saturating_add(size),
                        buffer.size
                    )));
                }
                vk::ImageView::null()
            }
            (
                ViewKind::Sampled {
                    base_mip,
                    mip_count,
                },
                ResourceKind::Image(image),
            ) => {
                if mip_count == 0 || base_mip + mip_count > image.mip_levels {
                    return Err(GraphicsError::InvalidParameter(format!(
                        "mips {}..{} out of range ({} levels)",
                        base_mip,
                        base_mip + mip_count,
                        image.mip_levels
                    )));
                }
                self.create_image_view(image, base_mip, mip_count, true)?
            }
            (ViewKind::Storage { mip_level }, ResourceKind::Image(image)) => {
                if !image.storage {
                    return Err(GraphicsError::InvalidParameter(
                        "storage view of a texture without STORAGE usage".to_string(),
                    ));
                }
                if mip_level >= image.mip_levels {
                    return Err(GraphicsError::InvalidParameter(format!(
                        "mip {} out of range ({} levels)",
                        mip_level, image.mip_levels
                    )));
                }
                self.create_image_view(image, mip_level, 1, false)?
            }
            (ViewKind::Buffer { .. }, ResourceKind::Image(_)) => {
                return Err(GraphicsError::InvalidParameter(
                    "buffer view of a texture".to_string(),
                ));
            }
            (_, ResourceKind::Buffer(_)) => {
                return Err(GraphicsError::InvalidParameter(
                    "texture view of a buffer".to_string(),
                ));
            }
        };

        log::trace!("VulkanBackend: creating view {:?}", kind);
        Ok(GpuView::new(
            Arc::clone(resource),
            kind,
            NativeView::Vulkan(VulkanView {
                shared: Arc::clone(&self.shared),
                image_view,
            }),
        ))
    }

    fn create_descriptor_heap(
        &self,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<GpuDescriptorHeap, GraphicsError> {
        log::trace!(
            "VulkanBackend: creating descriptor heap (capacity: {}, shader visible: {})",
            capacity,
            shader_visible
        );
        if !shader_visible {
            return Ok(GpuDescriptorHeap::new(capacity, false, NativeHeap::Cpu));
        }

        if capacity > self.caps.max_bindless_descriptors {
            return Err(GraphicsError::AllocationError(format!(
                "shader-visible heap of {} exceeds the device limit of {}",
                capacity, self.caps.max_bindless_descriptors
            )));
        }

        let mut current = self.bindless.lock();
        if current.strong_count() > 0 {
            return Err(GraphicsError::InvalidParameter(
                "a shader-visible descriptor heap already exists".to_string(),
            ));
        }
        let model = Arc::new(BindingModel::new(Arc::clone(&self.shared), capacity)?);
        *current = Arc::downgrade(&model);

        Ok(GpuDescriptorHeap::new(
            capacity,
            true,
            NativeHeap::Vulkan(VulkanHeap { model }),
        ))
    }

    fn write_descriptor(
        &self,
        heap: &GpuDescriptorHeap,
        index: u32,
        view: &Arc<GpuView>,
    ) -> Result<(), GraphicsError> {
        if let NativeHeap::Vulkan(native) = heap.native() {
            native.model.write(index, view)?;
        }
        heap.store(index, Arc::clone(view))
    }

    fn copy_descriptors(
        &self,
        src: &GpuDescriptorHeap,
        src_index: u32,
        dst: &GpuDescriptorHeap,
        dst_index: u32,
        count: u32,
    ) -> Result<(), GraphicsError> {
        let views = src.range(src_index, count)?;
        for (i, view) in views.iter().enumerate() {
            self.write_descriptor(dst, dst_index + i as u32, view)?;
        }
        Ok(())
    }

    fn create_pipeline(
        &self,
        descriptor: &PipelineDescriptor,
        shaders: &[ShaderBytecode],
    ) -> Result<GpuPipeline, GraphicsError> {
        let model = self.bindless.lock().upgrade().ok_or_else(|| {
            GraphicsError::PipelineCreationError(
                "pipelines need the shader-visible descriptor heap to exist".to_string(),
            )
        })?;
        let (kind, native) = pipeline::create_pipeline(&model, descriptor, shaders)?;
        log::debug!(
            "VulkanBackend: created {:?} pipeline {:?}",
            kind,
            descriptor.label()
        );
        Ok(GpuPipeline::new(kind, NativePipeline::Vulkan(native)))
    }

    fn submit(
        &self,
        commands: &CommandList,
        slot: usize,
        signal_value: u64,
    ) -> Result<(), GraphicsError> {
        profile_scope!("vulkan_submit");

        let device = &self.shared.device;
        let mut state = self.submit.lock();
        if signal_value <= state.last_signaled {
            return Err(GraphicsError::InvalidParameter(format!(
                "signal value {} does not advance past {}",
                signal_value, state.last_signaled
            )));
        }

        while state.command_buffers.len() <= slot {
            let cmd = command::allocate_command_buffer(device, state.pool)?;
            state.command_buffers.push(cmd);
            state.slot_values.push(0);
        }
        let cmd = state.command_buffers[slot];

        // The slot's buffer may only be reset once its last submission retired.
        let previous = state.slot_values[slot];
        if previous > 0 {
            sync::wait(device, self.timeline, previous)?;
        }

        unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
            .map_err(map_vk_error)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }.map_err(map_vk_error)?;
        let encoded = Encoder::new(&self.shared, cmd).encode(commands);
        unsafe { device.end_command_buffer(cmd) }.map_err(map_vk_error)?;
        encoded?;

        let command_buffer_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.timeline)
            .value(signal_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffer_infos)
            .signal_semaphore_infos(&signal_infos);
        unsafe { device.queue_submit2(self.queue, &[submit_info], vk::Fence::null()) }
            .map_err(map_vk_error)?;

        log::trace!(
            "VulkanBackend: submitted {} commands for slot {} (signal {})",
            commands.len(),
            slot,
            signal_value
        );
        state.slot_values[slot] = signal_value;
        state.last_signaled = signal_value;
        Ok(())
    }

    fn completed_value(&self) -> Result<u64, GraphicsError> {
        sync::counter_value(&self.shared.device, self.timeline)
    }

    fn wait_value(&self, value: u64) -> Result<(), GraphicsError> {
        let last_signaled = self.submit.lock().last_signaled;
        if value > last_signaled {
            return Err(GraphicsError::InvalidParameter(format!(
                "waiting for value {} that was never submitted (last {})",
                value, last_signaled
            )));
        }
        sync::wait(&self.shared.device, self.timeline, value)
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        let last_signaled = self.submit.lock().last_signaled;
        self.wait_value(last_signaled)
    }
}

static_assertions::assert_impl_all!(VulkanBackend: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferUsage;

    /// Returns None (and the test passes vacuously) on machines without a
    /// suitable GPU.
    fn try_backend() -> Option<VulkanBackend> {
        match VulkanBackend::new(false) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("Skipping Vulkan test: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_upload_buffer_round_trip() {
        let Some(backend) = try_backend() else {
            return;
        };
        let desc = BufferDescriptor::new(256, BufferUsage::UPLOAD | BufferUsage::UNIFORM);
        let buffer = backend.create_buffer(&desc).unwrap();
        backend.write_buffer(&buffer, 16, &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.read_buffer(&buffer, 16, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_ne!(backend.buffer_gpu_address(&buffer).unwrap(), 0);
    }

    #[test]
    fn test_empty_submission_signals() {
        let Some(backend) = try_backend() else {
            return;
        };
        backend.submit(&CommandList::new(), 0, 1).unwrap();
        backend.wait_value(1).unwrap();
        assert!(backend.completed_value().unwrap() >= 1);
        assert!(backend.submit(&CommandList::new(), 1, 1).is_err());
    }

    #[test]
    fn test_single_shader_visible_heap() {
        let Some(backend) = try_backend() else {
            return;
        };
        let heap = backend.create_descriptor_heap(64, true).unwrap();
        assert!(backend.create_descriptor_heap(64, true).is_err());
        drop(heap);
        assert!(backend.create_descriptor_heap(64, true).is_ok());
    }
}
