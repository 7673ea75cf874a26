//! Pipeline descriptors.
//!
//! A descriptor captures everything the pipeline cache needs besides bytecode:
//! the vertex layout, attachment formats and the little fixed-function state
//! the orchestration layer exposes. All pipelines share one binding model
//! (a descriptor table into the shader-visible heap, one constant buffer and
//! root constants), so descriptors carry no per-pipeline binding layout.

use crate::error::GraphicsError;
use crate::types::TextureFormat;

/// Format of a vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// Two 32-bit floats.
    Float2,
    /// Three 32-bit floats.
    Float3,
    /// Four 32-bit floats.
    Float4,
    /// Single 32-bit unsigned integer.
    Uint,
    /// Four 8-bit unsigned integers (normalized to 0.0-1.0).
    Unorm8x4,
}

impl VertexFormat {
    /// Get the size in bytes of this format.
    pub fn size(&self) -> u32 {
        match self {
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
            Self::Uint | Self::Unorm8x4 => 4,
        }
    }
}

/// A single vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location.
    pub location: u32,
    /// Attribute format.
    pub format: VertexFormat,
    /// Byte offset within the vertex.
    pub offset: u32,
    /// Vertex buffer slot the attribute reads from.
    pub buffer_slot: u32,
}

/// Layout of one vertex buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    /// Bytes between consecutive vertices.
    pub stride: u32,
}

/// Vertex input layout across buffer slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    /// Buffer slots, indexed by slot number.
    pub buffers: Vec<VertexBufferLayout>,
    /// Attributes.
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Create an empty layout (vertices generated in the shader).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer slot.
    pub fn with_buffer(mut self, stride: u32) -> Self {
        self.buffers.push(VertexBufferLayout { stride });
        self
    }

    /// Add an attribute.
    pub fn with_attribute(
        mut self,
        location: u32,
        format: VertexFormat,
        offset: u32,
        buffer_slot: u32,
    ) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset,
            buffer_slot,
        });
        self
    }

    fn validate(&self) -> Result<(), GraphicsError> {
        for (i, attribute) in self.attributes.iter().enumerate() {
            let buffer = self
                .buffers
                .get(attribute.buffer_slot as usize)
                .ok_or_else(|| {
                    GraphicsError::PipelineCreationError(format!(
                        "attribute at location {} reads missing buffer slot {}",
                        attribute.location, attribute.buffer_slot
                    ))
                })?;
            if attribute.offset + attribute.format.size() > buffer.stride {
                return Err(GraphicsError::PipelineCreationError(format!(
                    "attribute at location {} overruns stride {}",
                    attribute.location, buffer.stride
                )));
            }
            if self.attributes[..i]
                .iter()
                .any(|other| other.location == attribute.location)
            {
                return Err(GraphicsError::PipelineCreationError(format!(
                    "duplicate vertex attribute location {}",
                    attribute.location
                )));
            }
        }
        Ok(())
    }
}

/// Face culling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    /// No culling.
    #[default]
    None,
    /// Cull front faces.
    Front,
    /// Cull back faces.
    Back,
}

/// Depth test configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    /// Depth attachment format.
    pub format: TextureFormat,
    /// Whether depth is written.
    pub write_enabled: bool,
}

/// Descriptor for a graphics pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineDescriptor {
    /// Debug label.
    pub label: Option<String>,
    /// Vertex input layout.
    pub vertex_layout: VertexLayout,
    /// Color attachment formats.
    pub color_formats: Vec<TextureFormat>,
    /// Depth attachment, if any.
    pub depth: Option<DepthState>,
    /// Face culling.
    pub cull_mode: CullMode,
}

impl GraphicsPipelineDescriptor {
    /// Create a descriptor rendering to one color target.
    pub fn new(vertex_layout: VertexLayout, color_format: TextureFormat) -> Self {
        Self {
            label: None,
            vertex_layout,
            color_formats: vec![color_format],
            depth: None,
            cull_mode: CullMode::None,
        }
    }

    /// Set the debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Enable a depth attachment with depth writes.
    pub fn with_depth(mut self, format: TextureFormat) -> Self {
        self.depth = Some(DepthState {
            format,
            write_enabled: true,
        });
        self
    }

    /// Set the cull mode.
    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }
}

/// Descriptor for a compute pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ComputePipelineDescriptor {
    /// Debug label.
    pub label: Option<String>,
}

impl ComputePipelineDescriptor {
    /// Create a labeled compute descriptor.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }
}

/// Either kind of pipeline descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PipelineDescriptor {
    /// Graphics pipeline.
    Graphics(GraphicsPipelineDescriptor),
    /// Compute pipeline.
    Compute(ComputePipelineDescriptor),
}

impl PipelineDescriptor {
    /// Debug label.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Graphics(d) => d.label.as_deref(),
            Self::Compute(d) => d.label.as_deref(),
        }
    }

    /// Check formats and layout before asking the backend.
    pub fn validate(&self) -> Result<(), GraphicsError> {
        let Self::Graphics(desc) = self else {
            return Ok(());
        };

        if desc.color_formats.is_empty() && desc.depth.is_none() {
            return Err(GraphicsError::PipelineCreationError(
                "graphics pipeline has no attachments".to_string(),
            ));
        }
        if let Some(format) = desc.color_formats.iter().find(|f| f.is_depth_stencil()) {
            return Err(GraphicsError::PipelineCreationError(format!(
                "{:?} cannot be used as a color target",
                format
            )));
        }
        if let Some(depth) = &desc.depth
            && !depth.format.is_depth_stencil()
        {
            return Err(GraphicsError::PipelineCreationError(format!(
                "{:?} cannot be used as a depth target",
                depth.format
            )));
        }
        desc.vertex_layout.validate()
    }
}
