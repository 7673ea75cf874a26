//! # gpuframe Demos
//!
//! Demo scenes driving the gpuframe orchestration layer.
//!
//! ## Available Demos
//!
//! - `textured_mesh_demo` - A spinning textured cube with generated mipmaps,
//!   drawn through either staged descriptor tables or the bindless table

pub mod camera;
pub mod mesh;
pub mod scene;
pub mod settings;
pub mod shaders;
pub mod texture;

pub use camera::OrbitCamera;
pub use scene::{BindingMode, TexturedMeshScene};
pub use settings::{DemoSettings, SceneSettings};

/// Demos library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
