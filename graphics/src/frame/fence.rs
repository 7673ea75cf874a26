//! CPU-GPU synchronization on the queue's completion counter.

use std::sync::Arc;

use crate::backend::GpuBackend;
use crate::error::GraphicsError;

/// Status of a fence value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The GPU has not reached the value yet.
    Pending,
    /// The GPU has reached the value (the work is complete).
    Reached,
}

/// View of the queue's monotonically increasing completion counter.
///
/// Every submission signals a value one higher than the previous one. A value
/// that has been reached stays reached, so "is frame N done" is a single
/// comparison against [`completed_value`](Self::completed_value).
///
/// # Example
///
/// ```ignore
/// let target = frames.slot_fence_value(slot);
/// if fence.status(target)? == FenceStatus::Pending {
///     fence.wait(target)?;
/// }
/// ```
#[derive(Clone)]
pub struct Fence {
    backend: Arc<dyn GpuBackend>,
}

impl Fence {
    /// Create a fence over a backend's queue.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self { backend }
    }

    /// Last value the GPU has confirmed.
    pub fn completed_value(&self) -> Result<u64, GraphicsError> {
        self.backend.completed_value()
    }

    /// Check a value without blocking.
    pub fn status(&self, value: u64) -> Result<FenceStatus, GraphicsError> {
        if self.completed_value()? >= value {
            Ok(FenceStatus::Reached)
        } else {
            Ok(FenceStatus::Pending)
        }
    }

    /// Returns true if the GPU has reached `value`.
    pub fn is_reached(&self, value: u64) -> Result<bool, GraphicsError> {
        Ok(self.status(value)? == FenceStatus::Reached)
    }

    /// Block until the GPU reaches `value`.
    ///
    /// Returns immediately if it already has.
    pub fn wait(&self, value: u64) -> Result<(), GraphicsError> {
        if self.is_reached(value)? {
            return Ok(());
        }
        profile_scope!("fence_wait");
        log::trace!("Waiting for fence value {}", value);
        self.backend.wait_value(value)
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("backend", &self.backend.name())
            .field("completed", &self.backend.completed_value().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::commands::CommandList;

    #[test]
    fn test_status() {
        let backend = Arc::new(DummyBackend::manual());
        let fence = Fence::new(backend.clone());
        assert_eq!(fence.status(0).unwrap(), FenceStatus::Reached);

        backend.submit(&CommandList::new(), 0, 1).unwrap();
        assert_eq!(fence.status(1).unwrap(), FenceStatus::Pending);
        backend.complete_all();
        assert_eq!(fence.status(1).unwrap(), FenceStatus::Reached);
    }

    #[test]
    fn test_wait_from_other_thread() {
        let backend = Arc::new(DummyBackend::manual());
        let fence = Fence::new(backend.clone());
        backend.submit(&CommandList::new(), 0, 1).unwrap();

        let gpu = backend.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            gpu.complete_all();
        });

        fence.wait(1).unwrap();
        assert!(fence.is_reached(1).unwrap());
        handle.join().unwrap();
    }
}
