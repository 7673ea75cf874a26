//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't talk to a GPU. It simulates a single queue with a
//! completion counter so the whole orchestration layer (frame pacing,
//! deferred release, ring recycling) can be exercised without hardware.
//!
//! # Completion
//!
//! With [`GpuCompletion::Immediate`] every submission completes as soon as it
//! is submitted. With [`GpuCompletion::Manual`] submissions stay pending until
//! the test driver calls [`DummyBackend::complete_next`] or
//! [`DummyBackend::complete_all`], possibly from another thread. Waiting on a
//! pending value blocks the caller until then.
//!
//! # Execution
//!
//! When a submission completes its command list is "executed": buffer copies
//! move bytes between the CPU-side storage of dummy buffers, and every command
//! is counted in [`DummyStats`] so tests can check what the GPU would have seen.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::commands::{CommandList, GpuCommand};
use crate::config::GpuCompletion;
use crate::error::GraphicsError;
use crate::pipeline::{PipelineDescriptor, ShaderBytecode, ShaderStage};
use crate::types::{BufferDescriptor, TextureDescriptor};

use super::{
    BackendLimits, GpuBackend, GpuDescriptorHeap, GpuPipeline, GpuResource, GpuView, NativeHeap,
    NativePipeline, NativeView, PipelineKind, ViewKind,
};

/// Base of the synthetic GPU address space handed out for buffers.
const ADDRESS_BASE: u64 = 0x1000_0000_0000;

/// Address space reserved per buffer.
const ADDRESS_STRIDE: u64 = 0x1_0000_0000;

/// Counts of the work the dummy GPU has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DummyStats {
    /// Command lists submitted.
    pub submissions: u64,
    /// Command lists that completed.
    pub completed_submissions: u64,
    /// Compute dispatches executed.
    pub dispatches: u64,
    /// Draws executed (indexed and non-indexed).
    pub draws: u64,
    /// Barrier batches executed.
    pub barrier_batches: u64,
    /// Individual state transitions executed.
    pub transitions: u64,
    /// Unordered-access barriers executed.
    pub uav_barriers: u64,
    /// Buffer-to-buffer copies executed.
    pub buffer_copies: u64,
    /// Buffer-to-texture copies executed.
    pub texture_copies: u64,
    /// Pipeline binds executed.
    pub pipeline_binds: u64,
    /// Waits that had to block because the value was not reached yet.
    pub blocked_waits: u64,
}

/// Shared bookkeeping of live dummy allocations.
#[derive(Debug, Default)]
struct AllocationTracker {
    live: AtomicUsize,
    bytes: AtomicU64,
}

/// A simulated buffer or texture.
pub struct DummyResource {
    id: u64,
    size: u64,
    address: Option<u64>,
    data: Option<Mutex<Vec<u8>>>,
    tracker: Arc<AllocationTracker>,
}

impl DummyResource {
    /// Unique id of this resource within its backend.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Allocation size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, offset: u64, size: u64) -> Result<(), GraphicsError> {
        if offset.checked_add(size).is_none_or(|end| end > self.size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "range {}..{} exceeds buffer size {}",
                offset,
                offset.saturating_add(size),
                self.size
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DummyResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyResource")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("buffer", &self.data.is_some())
            .finish()
    }
}

impl Drop for DummyResource {
    fn drop(&mut self) {
        log::trace!("DummyBackend: destroying resource {}", self.id);
        self.tracker.live.fetch_sub(1, Ordering::AcqRel);
        self.tracker.bytes.fetch_sub(self.size, Ordering::AcqRel);
    }
}

struct PendingSubmission {
    signal_value: u64,
    slot: usize,
    commands: Vec<GpuCommand>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingSubmission>,
    completed: u64,
    last_signaled: u64,
    device_lost: bool,
}

/// Dummy GPU backend.
pub struct DummyBackend {
    completion: GpuCompletion,
    queue: Mutex<QueueState>,
    progress: Condvar,
    stats: Mutex<DummyStats>,
    tracker: Arc<AllocationTracker>,
    next_id: AtomicU64,
    memory_budget: Option<u64>,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new(completion: GpuCompletion) -> Self {
        Self {
            completion,
            queue: Mutex::new(QueueState::default()),
            progress: Condvar::new(),
            stats: Mutex::new(DummyStats::default()),
            tracker: Arc::new(AllocationTracker::default()),
            next_id: AtomicU64::new(1),
            memory_budget: None,
        }
    }

    /// Create a backend whose submissions complete only on request.
    pub fn manual() -> Self {
        Self::new(GpuCompletion::Manual)
    }

    /// Limit the total bytes of live resources; creation beyond it fails.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// The completion policy.
    pub fn completion(&self) -> GpuCompletion {
        self.completion
    }

    /// Snapshot of executed work.
    pub fn stats(&self) -> DummyStats {
        *self.stats.lock()
    }

    /// Number of resources that have not been destroyed yet.
    pub fn live_resources(&self) -> usize {
        self.tracker.live.load(Ordering::Acquire)
    }

    /// Bytes held by live resources.
    pub fn live_bytes(&self) -> u64 {
        self.tracker.bytes.load(Ordering::Acquire)
    }

    /// Number of submissions waiting to complete.
    pub fn pending_submissions(&self) -> usize {
        self.queue.lock().pending.len()
    }

    /// Frame slots of the pending submissions, oldest first.
    pub fn pending_slots(&self) -> Vec<usize> {
        self.queue.lock().pending.iter().map(|p| p.slot).collect()
    }

    /// Complete the oldest pending submission.
    ///
    /// Returns the value it signaled, or `None` if nothing was pending.
    pub fn complete_next(&self) -> Option<u64> {
        let mut queue = self.queue.lock();
        let submission = queue.pending.pop_front()?;
        let value = submission.signal_value;
        self.execute(&submission);
        queue.completed = value;
        drop(queue);
        self.progress.notify_all();
        log::trace!("DummyBackend: completed value {}", value);
        Some(value)
    }

    /// Complete every pending submission up to and including `value`.
    pub fn complete_up_to(&self, value: u64) {
        loop {
            let next = self.queue.lock().pending.front().map(|p| p.signal_value);
            match next {
                Some(v) if v <= value => {
                    self.complete_next();
                }
                _ => break,
            }
        }
    }

    /// Complete every pending submission.
    pub fn complete_all(&self) {
        while self.complete_next().is_some() {}
    }

    /// Simulate device removal; every later queue operation fails.
    pub fn lose_device(&self) {
        log::warn!("DummyBackend: simulating device loss");
        self.queue.lock().device_lost = true;
        self.progress.notify_all();
    }

    fn execute(&self, submission: &PendingSubmission) {
        let mut stats = self.stats.lock();
        stats.completed_submissions += 1;
        for command in &submission.commands {
            match command {
                GpuCommand::Barriers(batch) => {
                    stats.barrier_batches += 1;
                    stats.transitions += batch.transitions.len() as u64;
                    stats.uav_barriers += batch.uav_barriers.len() as u64;
                }
                GpuCommand::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    stats.buffer_copies += 1;
                    if let Err(e) = copy_bytes(src, *src_offset, dst, *dst_offset, *size) {
                        log::error!("DummyBackend: buffer copy failed: {}", e);
                    }
                }
                GpuCommand::CopyBufferToTexture { .. } => stats.texture_copies += 1,
                GpuCommand::SetPipeline(_) => stats.pipeline_binds += 1,
                GpuCommand::Draw { .. } | GpuCommand::DrawIndexed { .. } => stats.draws += 1,
                GpuCommand::Dispatch { .. } => stats.dispatches += 1,
                _ => {}
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate(&self, size: u64, with_data: bool) -> Result<DummyResource, GraphicsError> {
        if let Some(budget) = self.memory_budget {
            let used = self.tracker.bytes.load(Ordering::Acquire);
            if used + size > budget {
                return Err(GraphicsError::AllocationError(format!(
                    "out of memory: {} bytes requested, {} of {} in use",
                    size, used, budget
                )));
            }
        }

        let id = self.next_id();
        self.tracker.live.fetch_add(1, Ordering::AcqRel);
        self.tracker.bytes.fetch_add(size, Ordering::AcqRel);

        Ok(DummyResource {
            id,
            size,
            address: with_data.then(|| ADDRESS_BASE + id * ADDRESS_STRIDE),
            data: with_data.then(|| Mutex::new(vec![0u8; size as usize])),
            tracker: Arc::clone(&self.tracker),
        })
    }
}

fn dummy_resource(resource: &GpuResource) -> Result<&DummyResource, GraphicsError> {
    match resource {
        GpuResource::Dummy(r) => Ok(r),
        #[cfg(feature = "vulkan-backend")]
        GpuResource::Vulkan(_) => Err(GraphicsError::InvalidParameter(
            "resource belongs to another backend".to_string(),
        )),
    }
}

fn buffer_data(resource: &GpuResource) -> Result<(&DummyResource, &Mutex<Vec<u8>>), GraphicsError> {
    let resource = dummy_resource(resource)?;
    let data = resource
        .data
        .as_ref()
        .ok_or_else(|| GraphicsError::InvalidParameter("resource is not a buffer".to_string()))?;
    Ok((resource, data))
}

fn copy_bytes(
    src: &GpuResource,
    src_offset: u64,
    dst: &GpuResource,
    dst_offset: u64,
    size: u64,
) -> Result<(), GraphicsError> {
    let (src, src_data) = buffer_data(src)?;
    let (dst, dst_data) = buffer_data(dst)?;
    src.check_range(src_offset, size)?;
    dst.check_range(dst_offset, size)?;

    let bytes = src_data.lock()[src_offset as usize..(src_offset + size) as usize].to_vec();
    dst_data.lock()[dst_offset as usize..(dst_offset + size) as usize].copy_from_slice(&bytes);
    Ok(())
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new(GpuCompletion::Immediate)
    }
}

impl std::fmt::Debug for DummyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("DummyBackend")
            .field("completion", &self.completion)
            .field("completed", &queue.completed)
            .field("last_signaled", &queue.last_signaled)
            .field("pending", &queue.pending.len())
            .finish_non_exhaustive()
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn limits(&self) -> BackendLimits {
        BackendLimits {
            min_constant_alignment: 256,
            max_push_constant_bytes: 128,
            max_shader_visible_descriptors: 1 << 20,
        }
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuResource, GraphicsError> {
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "buffer size cannot be zero".to_string(),
            ));
        }
        Ok(GpuResource::Dummy(self.allocate(descriptor.size, true)?))
    }

    fn create_texture(
        &self,
        descriptor: &TextureDescriptor,
    ) -> Result<GpuResource, GraphicsError> {
        log::trace!(
            "DummyBackend: creating texture {:?} ({}x{}x{}, {} mips)",
            descriptor.label,
            descriptor.size.width,
            descriptor.size.height,
            descriptor.size.depth,
            descriptor.mip_level_count
        );
        if descriptor.size.width == 0 || descriptor.size.height == 0 {
            return Err(GraphicsError::InvalidParameter(
                "texture dimensions cannot be zero".to_string(),
            ));
        }
        if descriptor.mip_level_count == 0
            || descriptor.mip_level_count > descriptor.size.max_mip_levels()
        {
            return Err(GraphicsError::InvalidParameter(format!(
                "invalid mip level count {} for {}x{}",
                descriptor.mip_level_count, descriptor.size.width, descriptor.size.height
            )));
        }
        let size = (0..descriptor.mip_level_count)
            .map(|level| descriptor.mip_level_size(level))
            .sum();
        Ok(GpuResource::Dummy(self.allocate(size, false)?))
    }

    fn write_buffer(
        &self,
        buffer: &GpuResource,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        log::trace!(
            "DummyBackend: write_buffer offset={} len={}",
            offset,
            data.len()
        );
        let (resource, storage) = buffer_data(buffer)?;
        resource.check_range(offset, data.len() as u64)?;
        let start = offset as usize;
        storage.lock()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &GpuResource,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, GraphicsError> {
        log::trace!("DummyBackend: read_buffer offset={} size={}", offset, size);
        let (resource, storage) = buffer_data(buffer)?;
        resource.check_range(offset, size)?;
        Ok(storage.lock()[offset as usize..(offset + size) as usize].to_vec())
    }

    fn buffer_gpu_address(&self, buffer: &GpuResource) -> Result<u64, GraphicsError> {
        dummy_resource(buffer)?
            .address
            .ok_or_else(|| GraphicsError::InvalidParameter("resource is not a buffer".to_string()))
    }

    fn create_view(
        &self,
        resource: &Arc<GpuResource>,
        kind: ViewKind,
    ) -> Result<GpuView, GraphicsError> {
        let inner = dummy_resource(resource)?;
        let is_buffer = inner.data.is_some();
        match kind {
            ViewKind::Buffer { offset, size } => {
                if !is_buffer {
                    return Err(GraphicsError::InvalidParameter(
                        "buffer view of a texture".to_string(),
                    ));
                }
                inner.check_range(offset, size)?;
            }
            ViewKind::Sampled { .. } | ViewKind::Storage { .. } if is_buffer => {
                return Err(GraphicsError::InvalidParameter(
                    "texture view of a buffer".to_string(),
                ));
            }
            _ => {}
        }
        log::trace!("DummyBackend: creating view {:?} of {}", kind, inner.id);
        Ok(GpuView::new(Arc::clone(resource), kind, NativeView::Dummy))
    }

    fn create_descriptor_heap(
        &self,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<GpuDescriptorHeap, GraphicsError> {
        log::trace!(
            "DummyBackend: creating descriptor heap (capacity: {}, shader visible: {})",
            capacity,
            shader_visible
        );
        Ok(GpuDescriptorHeap::new(
            capacity,
            shader_visible,
            NativeHeap::Cpu,
        ))
    }

    fn write_descriptor(
        &self,
        heap: &GpuDescriptorHeap,
        index: u32,
        view: &Arc<GpuView>,
    ) -> Result<(), GraphicsError> {
        heap.store(index, Arc::clone(view))
    }

    fn copy_descriptors(
        &self,
        src: &GpuDescriptorHeap,
        src_index: u32,
        dst: &GpuDescriptorHeap,
        dst_index: u32,
        count: u32,
    ) -> Result<(), GraphicsError> {
        let views = src.range(src_index, count)?;
        for (i, view) in views.into_iter().enumerate() {
            dst.store(dst_index + i as u32, view)?;
        }
        Ok(())
    }

    fn create_pipeline(
        &self,
        descriptor: &PipelineDescriptor,
        shaders: &[ShaderBytecode],
    ) -> Result<GpuPipeline, GraphicsError> {
        let has = |stage| shaders.iter().any(|s| s.stage() == stage);
        let kind = match descriptor {
            PipelineDescriptor::Graphics(_) => {
                if !has(ShaderStage::Vertex) {
                    return Err(GraphicsError::PipelineCreationError(
                        "graphics pipeline needs a vertex shader".to_string(),
                    ));
                }
                PipelineKind::Graphics
            }
            PipelineDescriptor::Compute(_) => {
                if !has(ShaderStage::Compute) {
                    return Err(GraphicsError::PipelineCreationError(
                        "compute pipeline needs a compute shader".to_string(),
                    ));
                }
                PipelineKind::Compute
            }
        };
        log::trace!(
            "DummyBackend: creating {:?} pipeline {:?}",
            kind,
            descriptor.label()
        );
        Ok(GpuPipeline::new(kind, NativePipeline::Dummy))
    }

    fn submit(
        &self,
        commands: &CommandList,
        slot: usize,
        signal_value: u64,
    ) -> Result<(), GraphicsError> {
        let mut queue = self.queue.lock();
        if queue.device_lost {
            return Err(GraphicsError::DeviceLost);
        }
        if signal_value <= queue.last_signaled {
            return Err(GraphicsError::InvalidParameter(format!(
                "signal value {} does not advance past {}",
                signal_value, queue.last_signaled
            )));
        }
        log::trace!(
            "DummyBackend: submitting {} commands for slot {} (signal {})",
            commands.len(),
            slot,
            signal_value
        );
        queue.last_signaled = signal_value;
        self.stats.lock().submissions += 1;

        let submission = PendingSubmission {
            signal_value,
            slot,
            commands: commands.iter().cloned().collect(),
        };

        match self.completion {
            GpuCompletion::Immediate => {
                self.execute(&submission);
                queue.completed = signal_value;
                drop(queue);
                self.progress.notify_all();
            }
            GpuCompletion::Manual => queue.pending.push_back(submission),
        }
        Ok(())
    }

    fn completed_value(&self) -> Result<u64, GraphicsError> {
        let queue = self.queue.lock();
        if queue.device_lost {
            return Err(GraphicsError::DeviceLost);
        }
        Ok(queue.completed)
    }

    fn wait_value(&self, value: u64) -> Result<(), GraphicsError> {
        let mut queue = self.queue.lock();
        if value > queue.last_signaled {
            return Err(GraphicsError::InvalidParameter(format!(
                "waiting for value {} that was never submitted (last {})",
                value, queue.last_signaled
            )));
        }
        if queue.completed < value {
            self.stats.lock().blocked_waits += 1;
        }
        while queue.completed < value {
            if queue.device_lost {
                return Err(GraphicsError::DeviceLost);
            }
            self.progress.wait(&mut queue);
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), GraphicsError> {
        let target = self.queue.lock().last_signaled;
        self.wait_value(target)
    }
}

static_assertions::assert_impl_all!(DummyBackend: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BufferUsage;

    #[test]
    fn test_immediate_completion() {
        let backend = DummyBackend::default();
        backend.submit(&CommandList::new(), 0, 1).unwrap();
        assert_eq!(backend.completed_value().unwrap(), 1);
        backend.wait_value(1).unwrap();
        assert_eq!(backend.stats().blocked_waits, 0);
    }

    #[test]
    fn test_manual_completion() {
        let backend = DummyBackend::manual();
        backend.submit(&CommandList::new(), 0, 1).unwrap();
        backend.submit(&CommandList::new(), 1, 2).unwrap();
        assert_eq!(backend.completed_value().unwrap(), 0);
        assert_eq!(backend.pending_slots(), vec![0, 1]);

        assert_eq!(backend.complete_next(), Some(1));
        assert_eq!(backend.completed_value().unwrap(), 1);
        backend.submit(&CommandList::new(), 0, 3).unwrap();
        backend.complete_up_to(2);
        assert_eq!(backend.completed_value().unwrap(), 2);
        assert_eq!(backend.pending_submissions(), 1);
        backend.complete_all();
        assert_eq!(backend.completed_value().unwrap(), 3);
        assert_eq!(backend.complete_next(), None);
    }

    #[test]
    fn test_signal_values_must_increase() {
        let backend = DummyBackend::default();
        backend.submit(&CommandList::new(), 0, 2).unwrap();
        assert!(backend.submit(&CommandList::new(), 1, 2).is_err());
        assert!(backend.wait_value(3).is_err());
    }

    #[test]
    fn test_buffer_round_trip_and_copy() {
        let backend = DummyBackend::default();
        let desc = BufferDescriptor::new(16, BufferUsage::UPLOAD | BufferUsage::COPY_SRC);
        let src = Arc::new(backend.create_buffer(&desc).unwrap());
        let dst = Arc::new(backend.create_buffer(&desc).unwrap());
        backend.write_buffer(&src, 4, &[1, 2, 3, 4]).unwrap();

        let mut list = CommandList::new();
        list.push(GpuCommand::CopyBuffer {
            src: Arc::clone(&src),
            src_offset: 4,
            dst: Arc::clone(&dst),
            dst_offset: 0,
            size: 4,
        });
        backend.submit(&list, 0, 1).unwrap();

        assert_eq!(backend.read_buffer(&dst, 0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.stats().buffer_copies, 1);
        assert!(backend.write_buffer(&src, 14, &[0; 4]).is_err());
    }

    #[test]
    fn test_live_resource_tracking() {
        let backend = DummyBackend::default();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::VERTEX))
            .unwrap();
        assert_eq!(backend.live_resources(), 1);
        assert_eq!(backend.live_bytes(), 64);
        drop(buffer);
        assert_eq!(backend.live_resources(), 0);
    }

    #[test]
    fn test_memory_budget() {
        let backend = DummyBackend::default().with_memory_budget(100);
        let _a = backend
            .create_buffer(&BufferDescriptor::new(64, BufferUsage::VERTEX))
            .unwrap();
        let result = backend.create_buffer(&BufferDescriptor::new(64, BufferUsage::VERTEX));
        assert!(matches!(result, Err(GraphicsError::AllocationError(_))));
    }

    #[test]
    fn test_device_lost() {
        let backend = DummyBackend::manual();
        backend.submit(&CommandList::new(), 0, 1).unwrap();
        backend.lose_device();
        assert!(matches!(backend.wait_value(1), Err(GraphicsError::DeviceLost)));
        assert!(matches!(
            backend.submit(&CommandList::new(), 0, 2),
            Err(GraphicsError::DeviceLost)
        ));
    }
}
