//! Context configuration.
//!
//! Every capacity in the orchestration layer is fixed when the
//! [`GraphicsContext`](crate::GraphicsContext) is created: upload regions,
//! descriptor pools and the bindless table never grow. Size them for the
//! worst frame you expect.
//!
//! The configuration can be built in code:
//!
//! ```ignore
//! let config = ContextConfig::new()
//!     .with_backend(BackendKind::Dummy)
//!     .with_frames_in_flight(3)
//!     .with_upload_region_size(4 * 1024 * 1024);
//! ```
//!
//! or deserialized from TOML (missing keys keep their defaults):
//!
//! ```toml
//! backend = "vulkan"
//! frames_in_flight = 2
//! upload_region_size = 1048576
//! bindless_capacity = 4096
//! ```

use serde::Deserialize;

use crate::error::GraphicsError;
use crate::resources::{CONSTANT_BUFFER_WINDOW, checked_align_up};
use crate::types::TextureFormat;

/// Which GPU backend to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native Vulkan if available, falling back to the dummy backend.
    #[default]
    Auto,
    /// Simulated GPU for tests and headless runs.
    Dummy,
    /// Native Vulkan via ash.
    Vulkan,
}

/// When the dummy backend completes submitted work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuCompletion {
    /// Work completes as soon as it is submitted.
    #[default]
    Immediate,
    /// Work completes only when the test driver says so.
    Manual,
}

/// Configuration for a [`GraphicsContext`](crate::GraphicsContext).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Backend selection.
    pub backend: BackendKind,
    /// Number of frame slots (at least 2).
    pub frames_in_flight: usize,
    /// Bytes of upload memory per frame slot.
    pub upload_region_size: u64,
    /// Alignment of every upload allocation (power of two).
    pub upload_alignment: u64,
    /// Capacity of the CPU-visible descriptor pool.
    pub cpu_descriptor_capacity: u32,
    /// Shader-visible ring descriptors available to each frame.
    pub ring_descriptors_per_frame: u32,
    /// Capacity of the persistent bindless table.
    pub bindless_capacity: u32,
    /// Number of back buffers owned by the presenter.
    pub back_buffer_count: usize,
    /// Back buffer width in pixels.
    pub width: u32,
    /// Back buffer height in pixels.
    pub height: u32,
    /// Back buffer format.
    pub back_buffer_format: TextureFormat,
    /// Enable API validation where the backend supports it.
    pub validation: bool,
    /// Completion policy of the dummy backend.
    pub gpu_completion: GpuCompletion,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            frames_in_flight: 2,
            upload_region_size: 1024 * 1024,
            upload_alignment: 256,
            cpu_descriptor_capacity: 1024,
            ring_descriptors_per_frame: 256,
            bindless_capacity: 1024,
            back_buffer_count: 2,
            width: 1280,
            height: 720,
            back_buffer_format: TextureFormat::Rgba8Unorm,
            validation: cfg!(debug_assertions),
            gpu_completion: GpuCompletion::Immediate,
        }
    }
}

impl ContextConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, GraphicsError> {
        let config: Self = toml_from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the backend.
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the number of frame slots.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the per-frame upload region size in bytes.
    pub fn with_upload_region_size(mut self, size: u64) -> Self {
        self.upload_region_size = size;
        self
    }

    /// Set the upload allocation alignment.
    pub fn with_upload_alignment(mut self, alignment: u64) -> Self {
        self.upload_alignment = alignment;
        self
    }

    /// Set the CPU descriptor pool capacity.
    pub fn with_cpu_descriptor_capacity(mut self, capacity: u32) -> Self {
        self.cpu_descriptor_capacity = capacity;
        self
    }

    /// Set the per-frame shader-visible ring capacity.
    pub fn with_ring_descriptors_per_frame(mut self, capacity: u32) -> Self {
        self.ring_descriptors_per_frame = capacity;
        self
    }

    /// Set the bindless table capacity.
    pub fn with_bindless_capacity(mut self, capacity: u32) -> Self {
        self.bindless_capacity = capacity;
        self
    }

    /// Set the back buffer size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable validation.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Set the dummy backend completion policy.
    pub fn with_gpu_completion(mut self, completion: GpuCompletion) -> Self {
        self.gpu_completion = completion;
        self
    }

    /// Total descriptors in the shader-visible heap (ring regions plus bindless table).
    pub fn shader_visible_heap_size(&self) -> Result<u32, GraphicsError> {
        u32::try_from(self.frames_in_flight)
            .ok()
            .and_then(|frames| self.ring_descriptors_per_frame.checked_mul(frames))
            .and_then(|ring| ring.checked_add(self.bindless_capacity))
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!(
                    "shader-visible heap of {} x {} ring + {} bindless descriptors overflows",
                    self.frames_in_flight, self.ring_descriptors_per_frame, self.bindless_capacity
                ))
            })
    }

    /// Bytes of the upload buffer: every aligned region plus the constant
    /// buffer window.
    pub fn upload_buffer_size(&self) -> Result<u64, GraphicsError> {
        checked_align_up(self.upload_region_size, self.upload_alignment)
            .and_then(|region| region.checked_mul(self.frames_in_flight as u64))
            .and_then(|total| total.checked_add(CONSTANT_BUFFER_WINDOW))
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!(
                    "{} upload regions of {} bytes overflow",
                    self.frames_in_flight, self.upload_region_size
                ))
            })
    }

    /// Check the configuration for values the layer cannot work with.
    pub fn validate(&self) -> Result<(), GraphicsError> {
        if self.frames_in_flight < 2 {
            return Err(GraphicsError::InvalidParameter(format!(
                "frames_in_flight must be at least 2, got {}",
                self.frames_in_flight
            )));
        }
        if self.upload_region_size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "upload_region_size cannot be zero".to_string(),
            ));
        }
        if !self.upload_alignment.is_power_of_two() {
            return Err(GraphicsError::InvalidParameter(format!(
                "upload_alignment must be a power of 2, got {}",
                self.upload_alignment
            )));
        }
        if self.cpu_descriptor_capacity == 0
            || self.ring_descriptors_per_frame == 0
            || self.bindless_capacity == 0
        {
            return Err(GraphicsError::InvalidParameter(
                "descriptor capacities cannot be zero".to_string(),
            ));
        }
        if self.back_buffer_count == 0 || self.width == 0 || self.height == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "invalid back buffer configuration: {} x {}x{}",
                self.back_buffer_count, self.width, self.height
            )));
        }
        self.shader_visible_heap_size()?;
        self.upload_buffer_size()?;
        if self.back_buffer_format.is_depth_stencil() {
            return Err(GraphicsError::InvalidParameter(format!(
                "back buffer format {:?} is a depth format",
                self.back_buffer_format
            )));
        }
        Ok(())
    }
}

fn toml_from_str(text: &str) -> Result<ContextConfig, GraphicsError> {
    toml::from_str(text)
        .map_err(|e| GraphicsError::InvalidParameter(format!("failed to parse config: {e}")))
}
