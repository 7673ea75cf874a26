//! WGSL sources for the demo scenes.

use gpuframe_graphics::{GraphicsError, ShaderBytecode, ShaderStage};

/// Textured mesh shader.
///
/// The vertex stage reads the MVP matrix from the frame's constant buffer.
/// The fragment stage picks its texture from the shader-visible heap, either
/// at the bound table base or at a persistent bindless slot.
pub const TEXTURED_MESH_WGSL: &str = r#"
struct Uniforms {
    mvp: mat4x4<f32>,
}

struct Constants {
    table_base: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
    bindless: u32,
    texture_index: u32,
}

var<push_constant> constants: Constants;

@group(0) @binding(0) var textures: binding_array<texture_2d<f32>>;
@group(0) @binding(3) var linear_sampler: sampler;
@group(1) @binding(0) var<uniform> uniforms: Uniforms;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = uniforms.mvp * vec4<f32>(position, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    var index = constants.table_base;
    if (constants.bindless != 0u) {
        index = constants.texture_index;
    }
    return textureSample(textures[index], linear_sampler, in.uv);
}
"#;

/// Compile the textured mesh vertex and fragment stages.
pub fn textured_mesh() -> Result<[ShaderBytecode; 2], GraphicsError> {
    Ok([
        ShaderBytecode::compile_wgsl(ShaderStage::Vertex, TEXTURED_MESH_WGSL, "vs_main")?,
        ShaderBytecode::compile_wgsl(ShaderStage::Fragment, TEXTURED_MESH_WGSL, "fs_main")?,
    ])
}
