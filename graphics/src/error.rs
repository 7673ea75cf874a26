//! Graphics error types.

use std::fmt;

/// Errors that can occur in the orchestration layer.
///
/// Exhaustion and creation failures are surfaced synchronously and are never
/// retried internally: without freeing capacity a retry cannot succeed, so
/// pools are expected to be sized generously in [`ContextConfig`].
///
/// [`ContextConfig`]: crate::ContextConfig
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// Device memory or heap capacity is exhausted.
    AllocationError(String),
    /// The handle was released or never existed.
    InvalidHandle,
    /// The CPU descriptor pool or a frame's shader-visible ring region is full.
    DescriptorPoolExhausted,
    /// The persistent bindless table is full.
    BindlessTableExhausted,
    /// The current frame's upload region cannot fit the request.
    UploadRegionExhausted,
    /// Shader bytecode is missing or corrupt.
    ShaderLoadError(String),
    /// The device rejected a pipeline description.
    PipelineCreationError(String),
    /// The GPU device was lost. Unrecoverable.
    DeviceLost,
    /// Failed to initialize the graphics system.
    InitializationFailed(String),
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// A frame operation was called out of order.
    FrameState(String),
}

impl GraphicsError {
    /// Returns true if the error leaves the device unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationError(msg) => write!(f, "allocation failed: {msg}"),
            Self::InvalidHandle => write!(f, "invalid or released handle"),
            Self::DescriptorPoolExhausted => write!(f, "descriptor pool exhausted"),
            Self::BindlessTableExhausted => write!(f, "bindless descriptor table exhausted"),
            Self::UploadRegionExhausted => write!(f, "upload region exhausted for this frame"),
            Self::ShaderLoadError(msg) => write!(f, "shader load failed: {msg}"),
            Self::PipelineCreationError(msg) => write!(f, "pipeline creation failed: {msg}"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::InitializationFailed(msg) => write!(f, "initialization failed: {msg}"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::FrameState(msg) => write!(f, "frame state error: {msg}"),
        }
    }
}

impl std::error::Error for GraphicsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphicsError::UploadRegionExhausted;
        assert_eq!(err.to_string(), "upload region exhausted for this frame");

        let err = GraphicsError::ShaderLoadError("bad magic".to_string());
        assert_eq!(err.to_string(), "shader load failed: bad magic");
    }

    #[test]
    fn test_only_device_lost_is_fatal() {
        assert!(GraphicsError::DeviceLost.is_fatal());
        assert!(!GraphicsError::InvalidHandle.is_fatal());
        assert!(!GraphicsError::BindlessTableExhausted.is_fatal());
    }
}
