//! Procedural cube mesh.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use gpuframe_graphics::{VertexFormat, VertexLayout};

/// Vertex with a position and a texture coordinate.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

/// Size of one [`Vertex`] in bytes.
pub const VERTEX_STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;

/// Layout matching [`Vertex`]: position at location 0, uv at location 1.
pub fn vertex_layout() -> VertexLayout {
    VertexLayout::new()
        .with_buffer(VERTEX_STRIDE)
        .with_attribute(0, VertexFormat::Float3, 0, 0)
        .with_attribute(1, VertexFormat::Float2, 12, 0)
}

/// A unit cube centered on the origin.
///
/// Each face has its own four vertices so it carries the full texture.
/// Triangles wind counter-clockwise seen from outside.
pub fn cube() -> (Vec<Vertex>, Vec<u16>) {
    // (normal, u axis, v axis) with u x v == normal
    let faces = [
        (Vec3::X, Vec3::NEG_Z, Vec3::Y),
        (Vec3::NEG_X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_Y, Vec3::X, Vec3::Z),
        (Vec3::Z, Vec3::X, Vec3::Y),
        (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
    ];
    let corners = [
        (-1.0, -1.0, [0.0, 1.0]),
        (1.0, -1.0, [1.0, 1.0]),
        (1.0, 1.0, [1.0, 0.0]),
        (-1.0, 1.0, [0.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = vertices.len() as u16;
        for (su, sv, uv) in corners {
            let position = (normal + u * su + v * sv) * 0.5;
            vertices.push(Vertex {
                position: position.to_array(),
                uv,
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}
