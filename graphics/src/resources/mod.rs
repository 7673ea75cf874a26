//! GPU resource ownership.
//!
//! - [`ResourceTable`] maps stable handles to native buffers and textures and
//!   tracks their pipeline state.
//! - [`UploadRing`] hands out per-frame CPU-writable memory.

mod table;
mod upload_ring;

pub use table::{ResourceDesc, ResourceHandle, ResourceTable};
pub(crate) use upload_ring::checked_align_up;
pub use upload_ring::{CONSTANT_BUFFER_WINDOW, UploadAllocation, UploadRing};
