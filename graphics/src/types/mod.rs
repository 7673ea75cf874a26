//! Common types and descriptors for GPU resources.
//!
//! Format enums, usage flags, resource states and the descriptor structs
//! used throughout the orchestration layer.

mod buffer;
mod common;
mod state;
mod texture;

pub use buffer::{BufferDescriptor, BufferUsage};
pub use common::{Extent3d, IndexFormat, ScissorRect, Viewport};
pub use state::ResourceState;
pub use texture::{TextureDescriptor, TextureFormat, TextureUsage};
