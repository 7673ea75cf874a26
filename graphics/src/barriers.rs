//! Barrier batching.
//!
//! Resource state transitions are requested one at a time while recording but
//! flushed to the GPU as a single batched command right before the draw,
//! dispatch or copy that depends on them.
//!
//! ```text
//! request_transition(a, COPY_DEST -> SHADER_RESOURCE)   queued
//! request_transition(b, COMMON -> RENDER_TARGET)        queued
//! request_transition(a, SHADER_RESOURCE)                no-op (already there)
//! flush()                                               one Barriers command, 2 transitions
//! ```
//!
//! The recorded state in the [`ResourceTable`] is updated when the transition
//! is requested, so later requests in the same batch chain from it. Repeated
//! requests for one handle collapse into a single record that keeps the first
//! `before` and the last `after`; a record that ends where it started is
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::GpuResource;
use crate::commands::{BarrierBatch, CommandList, GpuCommand, Transition};
use crate::error::GraphicsError;
use crate::resources::{ResourceHandle, ResourceTable};
use crate::types::ResourceState;

/// A queued state transition.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    /// The transitioned resource.
    pub handle: ResourceHandle,
    /// State before the transition.
    pub before: ResourceState,
    /// State after the transition.
    pub after: ResourceState,
    resource: Arc<GpuResource>,
}

/// Accumulates transitions and emits them as batched barrier commands.
#[derive(Debug, Default)]
pub struct BarrierBatcher {
    pending: Vec<TransitionRecord>,
    index: HashMap<ResourceHandle, usize>,
    uav: Vec<(ResourceHandle, Arc<GpuResource>)>,
    /// Transitions already flushed into the open frame, for rollback.
    committed: Vec<(ResourceHandle, ResourceState)>,
    batches_flushed: u64,
    transitions_flushed: u64,
}

impl BarrierBatcher {
    /// Create an empty batcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that `handle` be in `new_state` before the next GPU operation.
    ///
    /// Returns `true` if a transition is pending for the handle afterwards.
    pub fn request_transition(
        &mut self,
        table: &mut ResourceTable,
        handle: ResourceHandle,
        new_state: ResourceState,
    ) -> Result<bool, GraphicsError> {
        let current = table.state(handle)?;
        if current == new_state {
            return Ok(self.index.contains_key(&handle));
        }

        let pending = match self.index.get(&handle).copied() {
            Some(i) => {
                self.pending[i].after = new_state;
                if self.pending[i].before == new_state {
                    self.remove(i);
                    false
                } else {
                    true
                }
            }
            None => {
                let resource = Arc::clone(table.get(handle)?);
                self.index.insert(handle, self.pending.len());
                self.pending.push(TransitionRecord {
                    handle,
                    before: current,
                    after: new_state,
                    resource,
                });
                true
            }
        };

        table.set_state(handle, new_state)?;
        log::trace!(
            "Barrier: {:?} {:?} -> {:?}",
            handle,
            current,
            new_state
        );
        Ok(pending)
    }

    /// Request a write-after-write barrier for an unordered-access resource.
    pub fn request_uav_barrier(
        &mut self,
        table: &ResourceTable,
        handle: ResourceHandle,
    ) -> Result<(), GraphicsError> {
        let resource = table.get(handle)?;
        if !self.uav.iter().any(|(h, _)| *h == handle) {
            self.uav.push((handle, Arc::clone(resource)));
        }
        Ok(())
    }

    /// Emit every queued barrier as one command and clear the queue.
    ///
    /// Returns the number of transitions emitted. Nothing is recorded when
    /// the queue is empty.
    pub fn flush(&mut self, commands: &mut CommandList) -> usize {
        if self.pending.is_empty() && self.uav.is_empty() {
            return 0;
        }

        let count = self.pending.len();
        let mut batch = BarrierBatch::default();
        for record in self.pending.drain(..) {
            self.committed.push((record.handle, record.before));
            batch.transitions.push(Transition {
                resource: record.resource,
                before: record.before,
                after: record.after,
            });
        }
        batch.uav_barriers = self.uav.drain(..).map(|(_, r)| r).collect();
        self.index.clear();

        log::trace!(
            "Barrier: flushing {} transitions, {} UAV barriers",
            count,
            batch.uav_barriers.len()
        );
        commands.push(GpuCommand::Barriers(batch));
        self.batches_flushed += 1;
        self.transitions_flushed += count as u64;
        count
    }

    /// Forget rollback information once the frame's commands are submitted.
    pub fn commit(&mut self) {
        self.committed.clear();
    }

    /// Drop queued barriers and restore the states recorded before this frame
    /// started transitioning them.
    pub fn discard(&mut self, table: &mut ResourceTable) {
        let pending: Vec<_> = self
            .pending
            .drain(..)
            .map(|r| (r.handle, r.before))
            .collect();
        self.index.clear();
        self.uav.clear();

        for (handle, before) in pending.into_iter().rev().chain(self.committed.drain(..).rev()) {
            // Handles released during the frame have nothing to restore.
            let _ = table.set_state(handle, before);
        }
    }

    /// Queued transitions.
    pub fn pending(&self) -> &[TransitionRecord] {
        &self.pending
    }

    /// Queued UAV barriers.
    pub fn pending_uav_barriers(&self) -> usize {
        self.uav.len()
    }

    /// Barrier commands emitted so far.
    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed
    }

    /// Transitions emitted so far.
    pub fn transitions_flushed(&self) -> u64 {
        self.transitions_flushed
    }

    fn remove(&mut self, i: usize) {
        let record = self.pending.swap_remove(i);
        self.index.remove(&record.handle);
        if let Some(moved) = self.pending.get(i) {
            self.index.insert(moved.handle, i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::types::{BufferDescriptor, BufferUsage};

    fn setup() -> (DummyBackend, ResourceTable) {
        (DummyBackend::default(), ResourceTable::new())
    }

    fn buffer(backend: &DummyBackend, table: &mut ResourceTable, state: ResourceState) -> ResourceHandle {
        table
            .create(
                backend,
                BufferDescriptor::new(256, BufferUsage::VERTEX | BufferUsage::COPY_DST),
                state,
            )
            .unwrap()
    }

    #[test]
    fn test_same_state_is_noop() {
        let (backend, mut table) = setup();
        let mut batcher = BarrierBatcher::new();
        let h = buffer(&backend, &mut table, ResourceState::COPY_DEST);

        assert!(
            !batcher
                .request_transition(&mut table, h, ResourceState::COPY_DEST)
                .unwrap()
        );
        assert!(batcher.pending().is_empty());

        let mut commands = CommandList::new();
        assert_eq!(batcher.flush(&mut commands), 0);
        assert!(commands.is_empty());
    }

    #[test]
    fn test_repeated_request_enqueues_once() {
        let (backend, mut table) = setup();
        let mut batcher = BarrierBatcher::new();
        let h = buffer(&backend, &mut table, ResourceState::COPY_DEST);

        batcher
            .request_transition(&mut table, h, ResourceState::VERTEX_BUFFER)
            .unwrap();
        batcher
            .request_transition(&mut table, h, ResourceState::VERTEX_BUFFER)
            .unwrap();
        assert_eq!(batcher.pending().len(), 1);
        assert_eq!(table.state(h).unwrap(), ResourceState::VERTEX_BUFFER);
    }

    #[test]
    fn test_chained_requests_coalesce() {
        let (backend, mut table) = setup();
        let mut batcher = BarrierBatcher::new();
        let a = buffer(&backend, &mut table, ResourceState::COPY_DEST);
        let b = buffer(&backend, &mut table, ResourceState::COMMON);

        batcher
            .request_transition(&mut table, a, ResourceState::SHADER_RESOURCE)
            .unwrap();
        batcher
            .request_transition(&mut table, b, ResourceState::COPY_DEST)
            .unwrap();
        batcher
            .request_transition(&mut table, a, ResourceState::VERTEX_BUFFER)
            .unwrap();

        let record = &batcher.pending()[0];
        assert_eq!(record.before, ResourceState::COPY_DEST);
        assert_eq!(record.after, ResourceState::VERTEX_BUFFER);

        // Back to where it started: the record disappears.
        assert!(
            !batcher
                .request_transition(&mut table, a, ResourceState::COPY_DEST)
                .unwrap()
        );
        assert_eq!(batcher.pending().len(), 1);
        assert_eq!(batcher.pending()[0].handle, b);
    }

    #[test]
    fn test_flush_emits_single_batch() {
        let (backend, mut table) = setup();
        let mut batcher = BarrierBatcher::new();
        let a = buffer(&backend, &mut table, ResourceState::COPY_DEST);
        let b = buffer(&backend, &mut table, ResourceState::COPY_DEST);

        batcher
            .request_transition(&mut table, a, ResourceState::VERTEX_BUFFER)
            .unwrap();
        batcher
            .request_transition(&mut table, b, ResourceState::INDEX_BUFFER)
            .unwrap();
        batcher.request_uav_barrier(&table, a).unwrap();

        let mut commands = CommandList::new();
        assert_eq!(batcher.flush(&mut commands), 2);
        assert_eq!(commands.barrier_batch_count(), 1);
        match commands.iter().next() {
            Some(GpuCommand::Barriers(batch)) => {
                assert_eq!(batch.transitions.len(), 2);
                assert_eq!(batch.uav_barriers.len(), 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(batcher.pending().is_empty());
        assert_eq!(batcher.batches_flushed(), 1);
        assert_eq!(batcher.transitions_flushed(), 2);
    }

    #[test]
    fn test_discard_restores_states() {
        let (backend, mut table) = setup();
        let mut batcher = BarrierBatcher::new();
        let a = buffer(&backend, &mut table, ResourceState::COPY_DEST);

        batcher
            .request_transition(&mut table, a, ResourceState::VERTEX_BUFFER)
            .unwrap();
        batcher.flush(&mut CommandList::new());
        batcher
            .request_transition(&mut table, a, ResourceState::SHADER_RESOURCE)
            .unwrap();

        batcher.discard(&mut table);
        assert_eq!(table.state(a).unwrap(), ResourceState::COPY_DEST);
        assert!(batcher.pending().is_empty());
    }

    #[test]
    fn test_invalid_handle() {
        let (backend, mut table) = setup();
        let mut batcher = BarrierBatcher::new();
        let a = buffer(&backend, &mut table, ResourceState::COMMON);
        table.release(a, 0).unwrap();
        assert!(matches!(
            batcher.request_transition(&mut table, a, ResourceState::COPY_DEST),
            Err(GraphicsError::InvalidHandle)
        ));
    }
}
