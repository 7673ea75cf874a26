//! Presentation of finished frames.
//!
//! The orchestration layer renders into back buffers that live in the
//! [`ResourceTable`] like any other texture, so barriers and views treat them
//! uniformly. A [`Presenter`] owns those handles and decides which one is
//! current.
//!
//! # Overview
//!
//! - [`Presenter`] - The presentation collaborator the context drives
//! - [`HeadlessPresenter`] - Off-screen back buffers, rotated on every present
//!
//! Back buffers are registered in the `PRESENT` state. A frame transitions the
//! current one to `RENDER_TARGET`, draws, and
//! [`GraphicsContext::end_frame`](crate::GraphicsContext::end_frame) moves it
//! back to `PRESENT` before submitting.
//!
//! # Resizing
//!
//! ```ignore
//! ctx.resize(1920, 1080)?;
//! // Same handles, new natives. The old natives are destroyed once the
//! // GPU is done with the frames that used them.
//! ```

use std::sync::Arc;

use crate::backend::GpuBackend;
use crate::error::GraphicsError;
use crate::resources::{ResourceDesc, ResourceHandle, ResourceTable};
use crate::types::{ResourceState, TextureDescriptor, TextureFormat, TextureUsage};

/// Presentation collaborator.
///
/// Implementations own a set of back-buffer handles in a [`ResourceTable`].
pub trait Presenter: Send {
    /// Handle of the back buffer the current frame renders into.
    fn current_back_buffer(&self) -> ResourceHandle;

    /// Descriptor of the back buffers.
    fn back_buffer_descriptor(&self) -> &TextureDescriptor;

    /// Number of back buffers.
    fn back_buffer_count(&self) -> usize;

    /// Hand the current back buffer to the display and move to the next one.
    fn present(&mut self) -> Result<(), GraphicsError>;

    /// Recreate the back buffers at a new size.
    ///
    /// Handles stay the same. Old natives are destroyed after fence value `tag`.
    fn resize(
        &mut self,
        backend: &dyn GpuBackend,
        table: &mut ResourceTable,
        width: u32,
        height: u32,
        tag: u64,
    ) -> Result<(), GraphicsError>;

    /// Release every back buffer.
    fn release(&mut self, table: &mut ResourceTable, tag: u64);
}

/// Off-screen presenter used for headless runs and tests.
pub struct HeadlessPresenter {
    handles: Vec<ResourceHandle>,
    descriptor: TextureDescriptor,
    current: usize,
    presented: u64,
}

impl HeadlessPresenter {
    /// Create `count` back buffers of the given size and format.
    pub fn new(
        backend: &dyn GpuBackend,
        table: &mut ResourceTable,
        count: usize,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Self, GraphicsError> {
        if count == 0 {
            return Err(GraphicsError::InvalidParameter(
                "back buffer count cannot be zero".to_string(),
            ));
        }

        let descriptor = Self::descriptor(width, height, format);
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            let native = Arc::new(backend.create_texture(&descriptor)?);
            handles.push(table.register(
                native,
                ResourceDesc::Texture(descriptor.clone()),
                ResourceState::PRESENT,
            ));
        }

        log::info!(
            "Headless presenter: {} back buffers, {}x{} {:?}",
            count,
            width,
            height,
            format
        );

        Ok(Self {
            handles,
            descriptor,
            current: 0,
            presented: 0,
        })
    }

    /// Number of frames presented so far.
    pub fn presented_count(&self) -> u64 {
        self.presented
    }

    /// Every back-buffer handle, in rotation order.
    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    fn descriptor(width: u32, height: u32, format: TextureFormat) -> TextureDescriptor {
        TextureDescriptor::new_2d(
            width,
            height,
            format,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
        )
        .with_label("back_buffer")
    }
}

impl Presenter for HeadlessPresenter {
    fn current_back_buffer(&self) -> ResourceHandle {
        self.handles[self.current]
    }

    fn back_buffer_descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    fn back_buffer_count(&self) -> usize {
        self.handles.len()
    }

    fn present(&mut self) -> Result<(), GraphicsError> {
        log::trace!("HeadlessPresenter: present back buffer {}", self.current);
        self.current = (self.current + 1) % self.handles.len();
        self.presented += 1;
        Ok(())
    }

    fn resize(
        &mut self,
        backend: &dyn GpuBackend,
        table: &mut ResourceTable,
        width: u32,
        height: u32,
        tag: u64,
    ) -> Result<(), GraphicsError> {
        if width == 0 || height == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "cannot resize back buffers to {width}x{height}"
            )));
        }
        if width == self.descriptor.size.width && height == self.descriptor.size.height {
            return Ok(());
        }

        // All new natives exist before any handle is switched over, so a
        // failed allocation leaves every back buffer at the old size.
        let descriptor = Self::descriptor(width, height, self.descriptor.format);
        let natives = self
            .handles
            .iter()
            .map(|_| backend.create_texture(&descriptor).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        for (&handle, native) in self.handles.iter().zip(natives) {
            table.replace_native(handle, native, ResourceDesc::Texture(descriptor.clone()), tag)?;
        }

        log::info!(
            "Back buffers resized: {}x{} -> {}x{}",
            self.descriptor.size.width,
            self.descriptor.size.height,
            width,
            height
        );
        self.descriptor = descriptor;
        Ok(())
    }

    fn release(&mut self, table: &mut ResourceTable, tag: u64) {
        for handle in self.handles.drain(..) {
            if let Err(e) = table.release(handle, tag) {
                log::warn!("Back buffer {:?} already released: {}", handle, e);
            }
        }
        self.current = 0;
    }
}

impl std::fmt::Debug for HeadlessPresenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessPresenter")
            .field("back_buffers", &self.handles.len())
            .field("current", &self.current)
            .field("size", &self.descriptor.size)
            .field("format", &self.descriptor.format)
            .finish()
    }
}

static_assertions::assert_impl_all!(HeadlessPresenter: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    fn presenter(backend: &DummyBackend, table: &mut ResourceTable) -> HeadlessPresenter {
        HeadlessPresenter::new(backend, table, 3, 64, 32, TextureFormat::Bgra8Unorm).unwrap()
    }

    #[test]
    fn test_back_buffers_registered_in_present_state() {
        let backend = DummyBackend::default();
        let mut table = ResourceTable::new();
        let presenter = presenter(&backend, &mut table);

        assert_eq!(presenter.back_buffer_count(), 3);
        assert_eq!(table.live_count(), 3);
        for &handle in presenter.handles() {
            assert_eq!(table.state(handle).unwrap(), ResourceState::PRESENT);
        }
    }

    #[test]
    fn test_present_rotates() {
        let backend = DummyBackend::default();
        let mut table = ResourceTable::new();
        let mut presenter = presenter(&backend, &mut table);
        let first = presenter.current_back_buffer();

        for _ in 0..3 {
            presenter.present().unwrap();
        }
        assert_eq!(presenter.current_back_buffer(), first);
        assert_eq!(presenter.presented_count(), 3);
    }

    #[test]
    fn test_resize_keeps_handles() {
        let backend = DummyBackend::default();
        let mut table = ResourceTable::new();
        let mut presenter = presenter(&backend, &mut table);
        let handles = presenter.handles().to_vec();

        presenter
            .resize(&backend, &mut table, 128, 128, 1)
            .unwrap();
        assert_eq!(presenter.handles(), handles.as_slice());
        assert_eq!(presenter.back_buffer_descriptor().size.width, 128);
        assert_eq!(table.pending_destruction_count(), 3);
        let desc = table.desc(handles[0]).unwrap().as_texture().unwrap();
        assert_eq!(desc.size.height, 128);

        assert!(presenter.resize(&backend, &mut table, 0, 10, 1).is_err());
    }

    #[test]
    fn test_failed_resize_keeps_old_size() {
        let backend = DummyBackend::default().with_memory_budget(100_000);
        let mut table = ResourceTable::new();
        let mut presenter = presenter(&backend, &mut table);
        let live_bytes = backend.live_bytes();

        // room for one 128x128 back buffer but not three
        assert!(matches!(
            presenter.resize(&backend, &mut table, 128, 128, 1),
            Err(GraphicsError::AllocationError(_))
        ));
        assert_eq!(presenter.back_buffer_descriptor().size.width, 64);
        for &handle in presenter.handles() {
            let desc = table.desc(handle).unwrap().as_texture().unwrap();
            assert_eq!((desc.size.width, desc.size.height), (64, 32));
        }
        assert_eq!(table.pending_destruction_count(), 0);
        assert_eq!(backend.live_bytes(), live_bytes);
    }

    #[test]
    fn test_release() {
        let backend = DummyBackend::default();
        let mut table = ResourceTable::new();
        let mut presenter = presenter(&backend, &mut table);
        presenter.release(&mut table, 0);
        assert_eq!(table.live_count(), 0);
    }
}
