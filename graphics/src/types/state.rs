//! Pipeline-visible resource states.

use bitflags::bitflags;

bitflags! {
    /// The access pattern a resource is currently prepared for.
    ///
    /// The Resource Table records one state per resource. Moving to a
    /// different state requires a transition, which the Barrier Batcher
    /// records and flushes. Read-only states may be combined; write states
    /// are exclusive.
    ///
    /// [`COMMON`](Self::COMMON) is the empty set and is the state of freshly
    /// created resources that do not request anything else.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        /// Read as vertex input.
        const VERTEX_BUFFER = 1 << 0;
        /// Read as a constant (uniform) buffer.
        const CONSTANT_BUFFER = 1 << 1;
        /// Read as an index buffer.
        const INDEX_BUFFER = 1 << 2;
        /// Written as a color attachment.
        const RENDER_TARGET = 1 << 3;
        /// Read and written from shaders without ordering guarantees.
        const UNORDERED_ACCESS = 1 << 4;
        /// Written as a depth attachment.
        const DEPTH_WRITE = 1 << 5;
        /// Read as a depth attachment.
        const DEPTH_READ = 1 << 6;
        /// Read from non-pixel shader stages.
        const SHADER_RESOURCE = 1 << 7;
        /// Read from the pixel shader stage.
        const PIXEL_SHADER_RESOURCE = 1 << 8;
        /// Destination of a copy.
        const COPY_DEST = 1 << 9;
        /// Source of a copy.
        const COPY_SOURCE = 1 << 10;
        /// Handed to the presentation engine.
        const PRESENT = 1 << 11;
    }
}

impl ResourceState {
    /// Initial state for resources that do not request a specific one.
    pub const COMMON: Self = Self::empty();

    /// All states that only read the resource.
    pub const READ_ONLY: Self = Self::VERTEX_BUFFER
        .union(Self::CONSTANT_BUFFER)
        .union(Self::INDEX_BUFFER)
        .union(Self::DEPTH_READ)
        .union(Self::SHADER_RESOURCE)
        .union(Self::PIXEL_SHADER_RESOURCE)
        .union(Self::COPY_SOURCE)
        .union(Self::PRESENT);

    /// Returns true if the state allows GPU writes.
    pub fn is_write(self) -> bool {
        !Self::READ_ONLY.contains(self)
    }
}

impl Default for ResourceState {
    fn default() -> Self {
        Self::COMMON
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_is_empty() {
        assert!(ResourceState::COMMON.is_empty());
        assert_eq!(ResourceState::default(), ResourceState::COMMON);
    }

    #[test]
    fn test_write_states() {
        assert!(ResourceState::COPY_DEST.is_write());
        assert!(ResourceState::UNORDERED_ACCESS.is_write());
        assert!(!ResourceState::VERTEX_BUFFER.is_write());
        assert!(
            !(ResourceState::SHADER_RESOURCE | ResourceState::PIXEL_SHADER_RESOURCE).is_write()
        );
    }
}
