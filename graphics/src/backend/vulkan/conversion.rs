//! Type conversions between orchestration types and Vulkan types.

use ash::vk;

use crate::pipeline::{CullMode, VertexFormat};
use crate::types::{BufferUsage, IndexFormat, ResourceState, TextureFormat, TextureUsage};

/// Convert BufferUsage flags to Vulkan buffer usage flags.
///
/// Every buffer gets `SHADER_DEVICE_ADDRESS` so it can report a GPU address.
pub fn convert_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut result = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

    if usage.contains(BufferUsage::VERTEX) {
        result |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        result |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        result |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        result |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        result |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        result |= vk::BufferUsageFlags::TRANSFER_DST;
    }

    // UPLOAD selects host-visible memory, it has no usage bit.
    result
}

/// Convert TextureFormat to Vulkan format.
pub fn convert_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Convert TextureUsage flags to Vulkan image usage flags.
///
/// The format is needed to determine whether RENDER_ATTACHMENT should map to
/// COLOR_ATTACHMENT or DEPTH_STENCIL_ATTACHMENT.
pub fn convert_texture_usage(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    let mut result = vk::ImageUsageFlags::empty();

    if usage.contains(TextureUsage::COPY_SRC) {
        result |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        result |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::SAMPLED) {
        result |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        result |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.is_depth_stencil() {
            result |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            result |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }

    result
}

/// Aspect mask covering every plane of a format.
pub fn aspect_mask(format: TextureFormat) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth_stencil() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Convert a vertex attribute format.
pub fn convert_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Uint => vk::Format::R32_UINT,
        VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
    }
}

/// Convert a cull mode.
pub fn convert_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

/// Convert an index format.
pub fn convert_index_format(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::Uint16 => vk::IndexType::UINT16,
        IndexFormat::Uint32 => vk::IndexType::UINT32,
    }
}

/// Image layout for a resource state.
///
/// Textures that can be written from shaders stay in `GENERAL` for every
/// shader-visible state, so their bindless descriptors can be written once
/// with a fixed layout. `PRESENT` maps to `TRANSFER_SRC_OPTIMAL`: the
/// presenter reads back buffers with copies.
pub fn image_layout(state: ResourceState, storage: bool, depth: bool) -> vk::ImageLayout {
    let shader_read = ResourceState::SHADER_RESOURCE | ResourceState::PIXEL_SHADER_RESOURCE;

    if state.is_empty() || state.contains(ResourceState::UNORDERED_ACCESS) {
        return vk::ImageLayout::GENERAL;
    }
    if shader_read.contains(state) {
        return if storage {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };
    }
    if state == ResourceState::RENDER_TARGET {
        return vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    }
    if state == ResourceState::DEPTH_WRITE {
        return vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
    }
    if depth && (state | shader_read).contains(ResourceState::DEPTH_READ) {
        return vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
    }
    if state == ResourceState::COPY_DEST {
        return vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    }
    if state == ResourceState::COPY_SOURCE || state == ResourceState::PRESENT {
        return vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
    }
    // Mixed read states
    vk::ImageLayout::GENERAL
}

/// Pipeline stages and memory accesses touched by a resource state.
pub fn stage_access(state: ResourceState) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    use vk::{AccessFlags2 as A, PipelineStageFlags2 as S};

    if state.is_empty() {
        return (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE);
    }

    let all_shaders = S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER;
    let mut stages = S::empty();
    let mut access = A::empty();

    for flag in state.iter() {
        let (s, a) = match flag {
            ResourceState::VERTEX_BUFFER => (S::VERTEX_ATTRIBUTE_INPUT, A::VERTEX_ATTRIBUTE_READ),
            ResourceState::INDEX_BUFFER => (S::INDEX_INPUT, A::INDEX_READ),
            ResourceState::CONSTANT_BUFFER => (all_shaders, A::UNIFORM_READ),
            ResourceState::RENDER_TARGET => (
                S::COLOR_ATTACHMENT_OUTPUT,
                A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            ),
            ResourceState::UNORDERED_ACCESS => (
                all_shaders,
                A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
            ),
            ResourceState::DEPTH_WRITE => (
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
                A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            ResourceState::DEPTH_READ => (
                S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
                A::DEPTH_STENCIL_ATTACHMENT_READ,
            ),
            ResourceState::SHADER_RESOURCE => (
                S::VERTEX_SHADER | S::COMPUTE_SHADER,
                A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
            ),
            ResourceState::PIXEL_SHADER_RESOURCE => (
                S::FRAGMENT_SHADER,
                A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ,
            ),
            ResourceState::COPY_DEST => (S::COPY, A::TRANSFER_WRITE),
            ResourceState::COPY_SOURCE | ResourceState::PRESENT => (S::COPY, A::TRANSFER_READ),
            _ => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE),
        };
        stages |= s;
        access |= a;
    }

    (stages, access)
}
