//! Backend-neutral command recording.
//!
//! A [`CommandList`] is a flat list of [`GpuCommand`]s recorded for one frame
//! slot. Commands hold `Arc`s to the native objects they touch, so everything
//! a submitted list references stays alive until the list itself is reset.
//!
//! Backends translate the list at submission time: the dummy backend simulates
//! it, the Vulkan backend encodes it into the slot's command buffer.

use std::sync::Arc;

use crate::backend::{GpuPipeline, GpuResource};
use crate::types::{Extent3d, IndexFormat, ResourceState, ScissorRect, Viewport};

/// One recorded state transition.
#[derive(Debug, Clone)]
pub struct Transition {
    /// The resource being transitioned.
    pub resource: Arc<GpuResource>,
    /// State the resource is in when the barrier executes.
    pub before: ResourceState,
    /// State the resource is in afterwards.
    pub after: ResourceState,
}

/// A group of barriers submitted together.
#[derive(Debug, Clone, Default)]
pub struct BarrierBatch {
    /// State transitions.
    pub transitions: Vec<Transition>,
    /// Resources that need their unordered-access writes made visible.
    pub uav_barriers: Vec<Arc<GpuResource>>,
}

impl BarrierBatch {
    /// Returns true if the batch contains no barriers.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.uav_barriers.is_empty()
    }
}

/// A color attachment for dynamic rendering.
#[derive(Debug, Clone)]
pub struct ColorAttachment {
    /// The render target texture (mip 0 is rendered to).
    pub texture: Arc<GpuResource>,
    /// Clear color, or `None` to load existing contents.
    pub clear: Option<[f32; 4]>,
}

/// A depth attachment for dynamic rendering.
#[derive(Debug, Clone)]
pub struct DepthAttachment {
    /// The depth texture.
    pub texture: Arc<GpuResource>,
    /// Clear depth, or `None` to load existing contents.
    pub clear: Option<f32>,
}

/// A single recorded GPU command.
#[derive(Debug, Clone)]
pub enum GpuCommand {
    /// Execute a batch of barriers.
    Barriers(BarrierBatch),
    /// Copy bytes between buffers.
    CopyBuffer {
        src: Arc<GpuResource>,
        src_offset: u64,
        dst: Arc<GpuResource>,
        dst_offset: u64,
        size: u64,
    },
    /// Copy tightly packed texels from a buffer into one texture mip level.
    CopyBufferToTexture {
        src: Arc<GpuResource>,
        src_offset: u64,
        bytes_per_row: u32,
        dst: Arc<GpuResource>,
        mip_level: u32,
        extent: Extent3d,
    },
    /// Bind a pipeline.
    SetPipeline(Arc<GpuPipeline>),
    /// Point shaders at a contiguous range of the shader-visible heap.
    BindDescriptorTable {
        /// First heap slot of the table.
        base: u32,
    },
    /// Set root (push) constants.
    SetConstants {
        /// 32-bit constant words.
        data: Vec<u32>,
    },
    /// Bind a constant buffer by address.
    SetConstantBuffer {
        buffer: Arc<GpuResource>,
        offset: u64,
        size: u64,
    },
    /// Bind a vertex buffer.
    SetVertexBuffer {
        slot: u32,
        buffer: Arc<GpuResource>,
        offset: u64,
    },
    /// Bind an index buffer.
    SetIndexBuffer {
        buffer: Arc<GpuResource>,
        offset: u64,
        format: IndexFormat,
    },
    /// Begin rendering into attachments.
    BeginRendering {
        color: Vec<ColorAttachment>,
        depth: Option<DepthAttachment>,
        extent: Extent3d,
    },
    /// End the current rendering scope.
    EndRendering,
    /// Set the viewport.
    SetViewport(Viewport),
    /// Set the scissor rectangle.
    SetScissor(ScissorRect),
    /// Non-indexed draw.
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    /// Indexed draw.
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    /// Compute dispatch.
    Dispatch { x: u32, y: u32, z: u32 },
}

/// Commands recorded for one frame slot.
#[derive(Debug, Default)]
pub struct CommandList {
    commands: Vec<GpuCommand>,
}

impl CommandList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command.
    pub fn push(&mut self, command: GpuCommand) {
        self.commands.push(command);
    }

    /// Number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop all commands (and the references they hold).
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Iterate over the recorded commands.
    pub fn iter(&self) -> std::slice::Iter<'_, GpuCommand> {
        self.commands.iter()
    }

    /// Number of recorded dispatches.
    pub fn dispatch_count(&self) -> usize {
        self.count(|c| matches!(c, GpuCommand::Dispatch { .. }))
    }

    /// Number of recorded draws (indexed and non-indexed).
    pub fn draw_count(&self) -> usize {
        self.count(|c| matches!(c, GpuCommand::Draw { .. } | GpuCommand::DrawIndexed { .. }))
    }

    /// Number of recorded barrier batches.
    pub fn barrier_batch_count(&self) -> usize {
        self.count(|c| matches!(c, GpuCommand::Barriers(_)))
    }

    fn count(&self, predicate: impl Fn(&GpuCommand) -> bool) -> usize {
        self.commands.iter().filter(|c| predicate(c)).count()
    }
}

impl<'a> IntoIterator for &'a CommandList {
    type Item = &'a GpuCommand;
    type IntoIter = std::slice::Iter<'a, GpuCommand>;

    fn into_iter(self) -> Self::IntoIter {
        self.commands.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let mut list = CommandList::new();
        list.push(GpuCommand::Dispatch { x: 1, y: 1, z: 1 });
        list.push(GpuCommand::Barriers(BarrierBatch::default()));
        list.push(GpuCommand::Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        });
        list.push(GpuCommand::DrawIndexed {
            index_count: 6,
            instance_count: 1,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        });

        assert_eq!(list.len(), 4);
        assert_eq!(list.dispatch_count(), 1);
        assert_eq!(list.draw_count(), 2);
        assert_eq!(list.barrier_batch_count(), 1);

        list.clear();
        assert!(list.is_empty());
    }
}
