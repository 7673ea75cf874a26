//! The graphics context.
//!
//! [`GraphicsContext`] is the explicit owner of every orchestration component.
//! There is no global state: create a context, drive frames through it, and
//! drop it (or call [`shutdown`](GraphicsContext::shutdown)) when done.
//!
//! # Construction and Teardown
//!
//! ```text
//! backend -> resource table -> descriptor allocators -> upload ring
//!         -> frame orchestrator -> presenter
//!
//! shutdown: drain GPU -> presenter -> pipelines -> descriptors -> resources
//! ```
//!
//! # Frame Loop
//!
//! ```ignore
//! let mut ctx = GraphicsContext::new(ContextConfig::default())?;
//!
//! loop {
//!     ctx.begin_frame()?;
//!
//!     ctx.set_pipeline(pipeline)?;
//!     ctx.set_vertex_buffer(0, vertices, 0)?;
//!
//!     let back_buffer = ctx.back_buffer();
//!     ctx.begin_rendering(&[ColorTarget::clear(back_buffer, [0.1, 0.1, 0.1, 1.0])], None)?;
//!     ctx.draw(36, 1, 0, 0)?;
//!     ctx.end_rendering()?;
//!
//!     ctx.end_frame()?;
//! }
//! ```
//!
//! Every recording helper requests the resource states it needs and flushes
//! the barrier batch before recording its command, so barriers accumulated
//! since the last GPU operation go out as a single batch. Barriers cannot be
//! recorded inside a rendering scope, so bind vertex, index and descriptor
//! resources before `begin_rendering`.
//!
//! # Errors Inside a Frame
//!
//! On any error between `begin_frame` and `end_frame` call
//! [`abort_frame`](GraphicsContext::abort_frame). It discards the recorded
//! commands, restores the resource states the frame had changed and returns
//! the slot to idle.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{self, GpuBackend, GpuResource, GpuView, ViewKind};
use crate::barriers::BarrierBatcher;
use crate::commands::{ColorAttachment, CommandList, DepthAttachment, GpuCommand};
use crate::config::ContextConfig;
use crate::descriptors::{
    CpuDescriptor, DescriptorAllocators, GpuDescriptor, PersistentAllocation, ViewDesc,
};
use crate::error::GraphicsError;
use crate::frame::{Fence, FrameOrchestrator};
use crate::pipeline::{
    ComputePipelineDescriptor, GraphicsPipelineDescriptor, PipelineCache, PipelineHandle,
    ShaderBytecode,
};
use crate::present::{HeadlessPresenter, Presenter};
use crate::resources::{
    CONSTANT_BUFFER_WINDOW, ResourceDesc, ResourceHandle, ResourceTable, UploadAllocation,
    UploadRing,
};
use crate::types::{
    BufferDescriptor, Extent3d, IndexFormat, ResourceState, ScissorRect,
    TextureDescriptor, TextureUsage, Viewport,
};

/// A color attachment for [`GraphicsContext::begin_rendering`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTarget {
    /// The texture rendered into.
    pub handle: ResourceHandle,
    /// Clear color, or `None` to keep the existing contents.
    pub clear: Option<[f32; 4]>,
}

impl ColorTarget {
    /// Render into `handle`, keeping its contents.
    pub fn load(handle: ResourceHandle) -> Self {
        Self {
            handle,
            clear: None,
        }
    }

    /// Render into `handle` after clearing it.
    pub fn clear(handle: ResourceHandle, color: [f32; 4]) -> Self {
        Self {
            handle,
            clear: Some(color),
        }
    }
}

/// A depth attachment for [`GraphicsContext::begin_rendering`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTarget {
    /// The depth texture.
    pub handle: ResourceHandle,
    /// Clear depth, or `None` to keep the existing contents.
    pub clear: Option<f32>,
}

/// Builds the presenter during context construction.
pub type PresenterFactory<'a> = dyn FnOnce(
        &dyn GpuBackend,
        &mut ResourceTable,
        &ContextConfig,
    ) -> Result<Box<dyn Presenter>, GraphicsError>
    + 'a;

/// Owner of the backend and every orchestration component.
///
/// Fields are declared in teardown order.
pub struct GraphicsContext {
    presenter: Box<dyn Presenter>,
    pipelines: PipelineCache,
    barriers: BarrierBatcher,
    frames: FrameOrchestrator,
    upload: UploadRing,
    descriptors: DescriptorAllocators,
    resources: ResourceTable,
    fence: Fence,
    backend: Arc<dyn GpuBackend>,
    config: ContextConfig,
    orphaned_pipelines: Arc<Mutex<Vec<PipelineHandle>>>,
    rendering: bool,
    shut_down: bool,
}

impl GraphicsContext {
    /// Create a context on the backend the configuration selects.
    pub fn new(config: ContextConfig) -> Result<Self, GraphicsError> {
        config.validate()?;
        let backend = backend::create_backend(&config)?;
        Self::with_backend(config, backend)
    }

    /// Create a context on an existing backend with a headless presenter.
    pub fn with_backend(
        config: ContextConfig,
        backend: Arc<dyn GpuBackend>,
    ) -> Result<Self, GraphicsError> {
        Self::with_presenter(config, backend, Box::new(headless_presenter))
    }

    /// Create a context with a custom presenter.
    pub fn with_presenter(
        config: ContextConfig,
        backend: Arc<dyn GpuBackend>,
        make_presenter: Box<PresenterFactory<'_>>,
    ) -> Result<Self, GraphicsError> {
        config.validate()?;
        log::info!(
            "Creating graphics context: {} backend, {} frames in flight",
            backend.name(),
            config.frames_in_flight
        );

        let fence = Fence::new(Arc::clone(&backend));
        let mut resources = ResourceTable::new();
        let descriptors = DescriptorAllocators::new(backend.as_ref(), &config)?;
        let alignment = config
            .upload_alignment
            .max(backend.limits().min_constant_alignment);
        let upload = UploadRing::new(
            Arc::clone(&backend),
            config.upload_region_size,
            config.frames_in_flight,
            alignment,
        )?;
        let frames = FrameOrchestrator::new(config.frames_in_flight)?;
        let presenter = make_presenter(backend.as_ref(), &mut resources, &config)?;

        Ok(Self {
            presenter,
            pipelines: PipelineCache::new(),
            barriers: BarrierBatcher::new(),
            frames,
            upload,
            descriptors,
            resources,
            fence,
            backend,
            config,
            orphaned_pipelines: Arc::new(Mutex::new(Vec::new())),
            rendering: false,
            shut_down: false,
        })
    }

    // ========================================================================
    // Frames
    // ========================================================================

    /// Begin a frame.
    ///
    /// Blocks if the next slot's previous frame is still on the GPU. Returns
    /// the slot index.
    pub fn begin_frame(&mut self) -> Result<usize, GraphicsError> {
        profile_scope!("begin_frame");
        let acquired = self.frames.begin_frame(&self.fence)?;

        let completed = self.fence.completed_value()?;
        self.frames.update_completed(completed);
        self.collect_garbage(completed);

        if acquired.recycled {
            self.upload.begin_frame(acquired.slot);
            self.descriptors.ring.begin_frame(acquired.slot);
        }

        log::debug!(
            "Frame {} started in slot {} (waited: {}, completed fence {})",
            self.frames.frame_count(),
            acquired.slot,
            acquired.waited,
            completed
        );
        Ok(acquired.slot)
    }

    /// Finish the frame: move the back buffer to `PRESENT`, submit, present.
    ///
    /// Returns the fence value the frame signals.
    pub fn end_frame(&mut self) -> Result<u64, GraphicsError> {
        profile_scope!("end_frame");
        if !self.frames.in_frame() {
            return Err(GraphicsError::FrameState(
                "end_frame called without begin_frame".to_string(),
            ));
        }

        if self.rendering {
            log::warn!("end_frame inside a rendering scope; closing it");
            self.end_rendering()?;
        }

        let back_buffer = self.presenter.current_back_buffer();
        self.barriers
            .request_transition(&mut self.resources, back_buffer, ResourceState::PRESENT)?;
        self.barriers.flush(self.frames.commands_mut()?);

        let value = self.frames.end_frame(self.backend.as_ref())?;
        self.barriers.commit();
        self.presenter.present()?;
        frame_mark!();

        log::debug!("Frame {} submitted (fence {})", self.frames.frame_count(), value);
        Ok(value)
    }

    /// Discard everything recorded in the current frame.
    pub fn abort_frame(&mut self) {
        self.rendering = false;
        self.barriers.discard(&mut self.resources);
        self.frames.abort_frame();
    }

    /// Submit recorded work and block until the GPU has finished everything.
    ///
    /// The current slot stays open for recording, with its upload and
    /// descriptor regions reset.
    pub fn finish_gpu_commands(&mut self) -> Result<(), GraphicsError> {
        profile_scope!("finish_gpu_commands");
        if self.rendering {
            return Err(GraphicsError::FrameState(
                "cannot submit inside a rendering scope".to_string(),
            ));
        }
        if self.frames.is_recording() {
            self.barriers.flush(self.frames.commands_mut()?);
        }
        self.frames
            .finish_gpu_commands(self.backend.as_ref(), &self.fence)?;
        self.barriers.commit();

        let completed = self.fence.completed_value()?;
        self.collect_garbage(completed);

        let slot = self.frames.current_slot();
        self.upload.begin_frame(slot);
        self.descriptors.ring.begin_frame(slot);
        log::debug!("GPU drained at fence {}", completed);
        Ok(())
    }

    /// Block until every submitted frame has completed.
    pub fn wait_idle(&mut self) -> Result<(), GraphicsError> {
        self.frames.wait_idle(&self.fence)?;
        let completed = self.fence.completed_value()?;
        self.collect_garbage(completed);
        Ok(())
    }

    /// Resize the back buffers. Not allowed inside a frame.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), GraphicsError> {
        if self.frames.in_frame() {
            return Err(GraphicsError::FrameState(
                "cannot resize back buffers inside a frame".to_string(),
            ));
        }
        let tag = self.frames.next_signal_value();
        self.presenter.resize(
            self.backend.as_ref(),
            &mut self.resources,
            width,
            height,
            tag,
        )?;
        self.config.width = width;
        self.config.height = height;
        Ok(())
    }

    /// Drain the GPU and tear everything down in reverse construction order.
    ///
    /// Called automatically on drop. Teardown happens even if the drain
    /// fails, in which case the drain error is returned.
    pub fn shutdown(&mut self) -> Result<(), GraphicsError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        log::info!("Shutting down graphics context");

        if self.frames.in_frame() {
            log::warn!("Shutdown inside a frame, discarding recorded commands");
            self.abort_frame();
        }
        let drained = self
            .frames
            .wait_idle(&self.fence)
            .and_then(|()| self.backend.wait_idle());

        self.presenter.release(&mut self.resources, 0);
        self.pipelines.clear();
        self.descriptors.cpu.reset();
        self.descriptors.shader_visible_heap().clear();
        self.resources.clear();

        drained
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Create a buffer in `initial_state`.
    pub fn create_buffer(
        &mut self,
        descriptor: BufferDescriptor,
        initial_state: ResourceState,
    ) -> Result<ResourceHandle, GraphicsError> {
        self.resources
            .create(self.backend.as_ref(), descriptor, initial_state)
    }

    /// Create a texture in `initial_state`.
    pub fn create_texture(
        &mut self,
        descriptor: TextureDescriptor,
        initial_state: ResourceState,
    ) -> Result<ResourceHandle, GraphicsError> {
        self.resources
            .create(self.backend.as_ref(), descriptor, initial_state)
    }

    /// Release a resource. The handle is invalid immediately; the native
    /// object is destroyed once the frame being recorded has completed.
    pub fn release_resource(&mut self, handle: ResourceHandle) -> Result<(), GraphicsError> {
        let tag = self.frames.next_signal_value();
        self.resources.release(handle, tag)
    }

    /// Create a view of a resource.
    pub fn create_view(
        &self,
        handle: ResourceHandle,
        view: ViewDesc,
    ) -> Result<Arc<GpuView>, GraphicsError> {
        let resource = self.resolve(handle)?;
        let kind = view_kind(self.resources.desc(handle)?, view)?;
        Ok(Arc::new(self.backend.create_view(&resource, kind)?))
    }

    /// Allocate a CPU descriptor and write a view of `handle` into it.
    pub fn create_descriptor(
        &mut self,
        handle: ResourceHandle,
        view: ViewDesc,
    ) -> Result<CpuDescriptor, GraphicsError> {
        let descriptor = self.allocate_descriptors(1)?;
        self.write_descriptor(descriptor, handle, view)?;
        Ok(descriptor)
    }

    /// Reserve `n` consecutive CPU descriptors.
    pub fn allocate_descriptors(&mut self, n: u32) -> Result<CpuDescriptor, GraphicsError> {
        self.descriptors.cpu.allocate(n)
    }

    /// Write a view of `handle` into an allocated CPU descriptor.
    ///
    /// Rewriting a descriptor does not affect copies already staged.
    pub fn write_descriptor(
        &mut self,
        descriptor: CpuDescriptor,
        handle: ResourceHandle,
        view: ViewDesc,
    ) -> Result<(), GraphicsError> {
        let view = self.create_view(handle, view)?;
        self.descriptors
            .cpu
            .write(self.backend.as_ref(), descriptor, &view)
    }

    /// Copy CPU descriptors into this frame's region of the shader-visible ring.
    pub fn stage_descriptors(
        &mut self,
        sources: &[CpuDescriptor],
    ) -> Result<GpuDescriptor, GraphicsError> {
        self.descriptors.ring.copy_to_shader_visible(
            self.backend.as_ref(),
            &self.descriptors.cpu,
            sources,
        )
    }

    /// Reserve persistent bindless slots.
    pub fn allocate_persistent(&mut self, n: u32) -> Result<PersistentAllocation, GraphicsError> {
        self.descriptors.bindless.allocate_persistent(n)
    }

    /// Write a view of `handle` into a persistent bindless slot.
    pub fn write_persistent(
        &mut self,
        slot: u32,
        handle: ResourceHandle,
        view: ViewDesc,
    ) -> Result<(), GraphicsError> {
        let view = self.create_view(handle, view)?;
        self.descriptors
            .bindless
            .write_persistent(self.backend.as_ref(), slot, &view)
    }

    // ========================================================================
    // Pipelines
    // ========================================================================

    /// Create (or reuse) a graphics pipeline.
    pub fn create_graphics_pipeline(
        &mut self,
        descriptor: GraphicsPipelineDescriptor,
        shaders: &[ShaderBytecode],
    ) -> Result<PipelineHandle, GraphicsError> {
        self.pipelines
            .create_graphics(self.backend.as_ref(), descriptor, shaders)
    }

    /// Create (or reuse) a compute pipeline.
    pub fn create_compute_pipeline(
        &mut self,
        descriptor: ComputePipelineDescriptor,
        shader: &ShaderBytecode,
    ) -> Result<PipelineHandle, GraphicsError> {
        self.pipelines
            .create_compute(self.backend.as_ref(), descriptor, shader)
    }

    /// Release a pipeline once the frame being recorded has completed.
    pub fn release_pipeline(&mut self, handle: PipelineHandle) -> Result<(), GraphicsError> {
        let tag = self.frames.next_signal_value();
        self.pipelines.release(handle, tag)
    }

    // ========================================================================
    // Barriers
    // ========================================================================

    /// Request that `handle` be in `state` before the next GPU operation.
    ///
    /// Returns true if a transition is queued for the handle.
    pub fn transition(
        &mut self,
        handle: ResourceHandle,
        state: ResourceState,
    ) -> Result<bool, GraphicsError> {
        self.barriers
            .request_transition(&mut self.resources, handle, state)
            .inspect_err(|e| log_invalid(handle, e))
    }

    /// Order unordered-access writes to `handle` before later accesses.
    pub fn uav_barrier(&mut self, handle: ResourceHandle) -> Result<(), GraphicsError> {
        self.barriers
            .request_uav_barrier(&self.resources, handle)
            .inspect_err(|e| log_invalid(handle, e))
    }

    /// Record every queued barrier now. Returns the number of transitions.
    pub fn flush_barriers(&mut self) -> Result<usize, GraphicsError> {
        Ok(self.barriers.flush(self.frames.commands_mut()?))
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record a buffer-to-buffer copy.
    pub fn copy_buffer(
        &mut self,
        src: ResourceHandle,
        src_offset: u64,
        dst: ResourceHandle,
        dst_offset: u64,
        size: u64,
    ) -> Result<(), GraphicsError> {
        self.ensure_recording()?;
        check_range(self.buffer_desc(src)?, src_offset, size)?;
        check_range(self.buffer_desc(dst)?, dst_offset, size)?;
        let src_resource = self.resolve(src)?;
        let dst_resource = self.resolve(dst)?;

        self.transition(src, ResourceState::COPY_SOURCE)?;
        self.transition(dst, ResourceState::COPY_DEST)?;
        self.record()?.push(GpuCommand::CopyBuffer {
            src: src_resource,
            src_offset,
            dst: dst_resource,
            dst_offset,
            size,
        });
        Ok(())
    }

    /// Copy `data` into a buffer through the upload ring (or a temporary
    /// staging buffer when the frame's region is too small).
    pub fn upload_buffer_data<T: bytemuck::Pod>(
        &mut self,
        handle: ResourceHandle,
        offset: u64,
        data: &[T],
    ) -> Result<(), GraphicsError> {
        self.ensure_recording()?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as u64;
        check_range(self.buffer_desc(handle)?, offset, size)?;
        if size == 0 {
            return Ok(());
        }
        let dst = self.resolve(handle)?;
        let (src, src_offset) = self.stage(bytes, true)?;

        self.transition(handle, ResourceState::COPY_DEST)?;
        self.record()?.push(GpuCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset: offset,
            size,
        });
        Ok(())
    }

    /// Copy tightly packed texels into one mip level of a texture.
    ///
    /// The data goes through a temporary staging buffer that is destroyed once
    /// the frame completes.
    pub fn upload_texture_data(
        &mut self,
        handle: ResourceHandle,
        mip_level: u32,
        data: &[u8],
    ) -> Result<(), GraphicsError> {
        self.ensure_recording()?;
        let desc = self.texture_desc(handle)?.clone();
        if mip_level >= desc.mip_level_count {
            return Err(GraphicsError::InvalidParameter(format!(
                "mip level {} out of range ({} levels)",
                mip_level, desc.mip_level_count
            )));
        }
        let expected = desc.mip_level_size(mip_level);
        if data.len() as u64 != expected {
            return Err(GraphicsError::InvalidParameter(format!(
                "mip level {} needs {} bytes, got {}",
                mip_level,
                expected,
                data.len()
            )));
        }

        let dst = self.resolve(handle)?;
        let (src, src_offset) = self.stage(data, false)?;
        let extent = desc.size.mip_level(mip_level);

        self.transition(handle, ResourceState::COPY_DEST)?;
        self.record()?.push(GpuCommand::CopyBufferToTexture {
            src,
            src_offset,
            bytes_per_row: extent.width * desc.format.block_size(),
            dst,
            mip_level,
            extent,
        });
        Ok(())
    }

    /// Bind a pipeline for subsequent draws or dispatches.
    pub fn set_pipeline(&mut self, handle: PipelineHandle) -> Result<(), GraphicsError> {
        let commands = self.frames.commands_mut()?;
        self.pipelines.set_current(handle, commands).inspect_err(|_| {
            log::error!("Invalid pipeline handle {:?} used while recording", handle)
        })
    }

    /// Bind a vertex buffer.
    pub fn set_vertex_buffer(
        &mut self,
        slot: u32,
        handle: ResourceHandle,
        offset: u64,
    ) -> Result<(), GraphicsError> {
        self.ensure_recording()?;
        let buffer = self.resolve(handle)?;
        self.transition(handle, ResourceState::VERTEX_BUFFER)?;
        self.record()?.push(GpuCommand::SetVertexBuffer {
            slot,
            buffer,
            offset,
        });
        Ok(())
    }

    /// Bind an index buffer.
    pub fn set_index_buffer(
        &mut self,
        handle: ResourceHandle,
        offset: u64,
        format: IndexFormat,
    ) -> Result<(), GraphicsError> {
        self.ensure_recording()?;
        let buffer = self.resolve(handle)?;
        self.transition(handle, ResourceState::INDEX_BUFFER)?;
        self.record()?.push(GpuCommand::SetIndexBuffer {
            buffer,
            offset,
            format,
        });
        Ok(())
    }

    /// Set root constants.
    pub fn set_constants(&mut self, data: &[u32]) -> Result<(), GraphicsError> {
        let max = self.backend.limits().max_push_constant_bytes as usize;
        if data.len() * 4 > max {
            return Err(GraphicsError::InvalidParameter(format!(
                "{} bytes of constants exceed the {} byte limit",
                data.len() * 4,
                max
            )));
        }
        self.record()?.push(GpuCommand::SetConstants {
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Bind an upload-ring allocation as the constant buffer.
    pub fn set_constant_buffer(
        &mut self,
        allocation: &UploadAllocation,
    ) -> Result<(), GraphicsError> {
        if allocation.size() > CONSTANT_BUFFER_WINDOW {
            return Err(GraphicsError::InvalidParameter(format!(
                "constant buffer of {} bytes exceeds the {} byte window",
                allocation.size(),
                CONSTANT_BUFFER_WINDOW
            )));
        }
        let buffer = Arc::clone(self.upload.buffer());
        self.record()?.push(GpuCommand::SetConstantBuffer {
            buffer,
            offset: allocation.offset(),
            size: allocation.size(),
        });
        Ok(())
    }

    /// Point shaders at a table in the shader-visible heap.
    pub fn bind_descriptor_table(&mut self, base: u32) -> Result<(), GraphicsError> {
        self.frames
            .commands_mut()?
            .push(GpuCommand::BindDescriptorTable { base });
        Ok(())
    }

    /// Begin rendering into color and depth targets.
    ///
    /// Also sets the viewport and scissor to cover the targets. Resources the
    /// draws read must be bound (and so transitioned) before this call:
    /// state transitions are not allowed inside a rendering scope.
    pub fn begin_rendering(
        &mut self,
        color: &[ColorTarget],
        depth: Option<DepthTarget>,
    ) -> Result<(), GraphicsError> {
        self.ensure_recording()?;
        if self.rendering {
            return Err(GraphicsError::FrameState(
                "begin_rendering inside a rendering scope".to_string(),
            ));
        }
        let first = color
            .first()
            .map(|c| c.handle)
            .or(depth.map(|d| d.handle))
            .ok_or_else(|| {
                GraphicsError::InvalidParameter("rendering needs at least one target".to_string())
            })?;
        let extent = self.texture_desc(first)?.size;

        let mut color_attachments = Vec::with_capacity(color.len());
        for target in color {
            let desc = self.texture_desc(target.handle)?;
            check_attachment(desc, extent, TextureUsage::RENDER_ATTACHMENT)?;
            color_attachments.push(ColorAttachment {
                texture: self.resolve(target.handle)?,
                clear: target.clear,
            });
            self.transition(target.handle, ResourceState::RENDER_TARGET)?;
        }

        let depth_attachment = match depth {
            Some(target) => {
                let desc = self.texture_desc(target.handle)?;
                check_attachment(desc, extent, TextureUsage::RENDER_ATTACHMENT)?;
                let attachment = DepthAttachment {
                    texture: self.resolve(target.handle)?,
                    clear: target.clear,
                };
                self.transition(target.handle, ResourceState::DEPTH_WRITE)?;
                Some(attachment)
            }
            None => None,
        };

        let commands = self.record()?;
        commands.push(GpuCommand::BeginRendering {
            color: color_attachments,
            depth: depth_attachment,
            extent,
        });
        commands.push(GpuCommand::SetViewport(Viewport::from_dimensions(
            extent.width,
            extent.height,
        )));
        commands.push(GpuCommand::SetScissor(ScissorRect::from_dimensions(
            extent.width,
            extent.height,
        )));
        self.rendering = true;
        Ok(())
    }

    /// End the current rendering scope.
    pub fn end_rendering(&mut self) -> Result<(), GraphicsError> {
        if !self.rendering {
            return Err(GraphicsError::FrameState(
                "end_rendering without begin_rendering".to_string(),
            ));
        }
        self.frames.commands_mut()?.push(GpuCommand::EndRendering);
        self.rendering = false;
        Ok(())
    }

    /// Record a non-indexed draw.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), GraphicsError> {
        self.record()?.push(GpuCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    /// Record an indexed draw.
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), GraphicsError> {
        self.record()?.push(GpuCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
        Ok(())
    }

    /// Record a compute dispatch.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), GraphicsError> {
        self.record()?.push(GpuCommand::Dispatch { x, y, z });
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The backend.
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// The configuration the context was created with (size tracks resizes).
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The fence over the backend's queue.
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// The resource table.
    pub fn resources(&self) -> &ResourceTable {
        &self.resources
    }

    /// The descriptor allocators.
    pub fn descriptors(&self) -> &DescriptorAllocators {
        &self.descriptors
    }

    /// The upload ring.
    pub fn upload_ring(&self) -> &UploadRing {
        &self.upload
    }

    /// The upload ring, for allocating this frame's constants.
    pub fn upload_ring_mut(&mut self) -> &mut UploadRing {
        &mut self.upload
    }

    /// The pipeline cache.
    pub fn pipelines(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// The barrier batcher.
    pub fn barriers(&self) -> &BarrierBatcher {
        &self.barriers
    }

    /// The frame orchestrator.
    pub fn frames(&self) -> &FrameOrchestrator {
        &self.frames
    }

    /// Commands recorded so far in the current slot.
    pub fn commands(&mut self) -> Result<&CommandList, GraphicsError> {
        self.frames.commands_mut().map(|c| &*c)
    }

    /// The presenter.
    pub fn presenter(&self) -> &dyn Presenter {
        self.presenter.as_ref()
    }

    /// Handle of the back buffer this frame renders into.
    pub fn back_buffer(&self) -> ResourceHandle {
        self.presenter.current_back_buffer()
    }

    /// Render-target descriptor of the back buffers.
    pub fn back_buffer_descriptor(&self) -> &TextureDescriptor {
        self.presenter.back_buffer_descriptor()
    }

    /// Width of the back buffers.
    pub fn frame_width(&self) -> u32 {
        self.back_buffer_descriptor().size.width
    }

    /// Height of the back buffers.
    pub fn frame_height(&self) -> u32 {
        self.back_buffer_descriptor().size.height
    }

    /// Returns true if commands can be recorded.
    pub fn is_recording(&self) -> bool {
        self.frames.is_recording()
    }

    /// Returns true between `begin_rendering` and `end_rendering`.
    pub fn is_rendering(&self) -> bool {
        self.rendering
    }

    /// Last fence value the GPU has confirmed.
    pub fn completed_value(&self) -> Result<u64, GraphicsError> {
        self.fence.completed_value()
    }

    /// Fence value the frame being recorded will signal.
    pub fn next_signal_value(&self) -> u64 {
        self.frames.next_signal_value()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Shared list owners without context access push pipeline handles to.
    ///
    /// Handles pushed here are released at the next frame boundary.
    pub(crate) fn orphaned_pipelines(&self) -> Arc<Mutex<Vec<PipelineHandle>>> {
        Arc::clone(&self.orphaned_pipelines)
    }

    fn collect_garbage(&mut self, completed: u64) {
        let orphans: Vec<_> = self.orphaned_pipelines.lock().drain(..).collect();
        let tag = self.frames.next_signal_value();
        for handle in orphans {
            if let Err(e) = self.pipelines.release(handle, tag) {
                log::warn!("Orphaned pipeline {:?} already released: {}", handle, e);
            }
        }

        let resources = self.resources.collect_garbage(completed);
        let pipelines = self.pipelines.collect_garbage(completed);
        if resources + pipelines > 0 {
            log::trace!(
                "Destroyed {} resources and {} pipelines (fence {})",
                resources,
                pipelines,
                completed
            );
        }
    }

    fn ensure_recording(&self) -> Result<(), GraphicsError> {
        if self.frames.is_recording() {
            Ok(())
        } else {
            Err(GraphicsError::FrameState(
                "no frame is recording; call begin_frame first".to_string(),
            ))
        }
    }

    /// The current command list, with pending barriers flushed into it.
    fn record(&mut self) -> Result<&mut CommandList, GraphicsError> {
        let barriers_pending =
            !self.barriers.pending().is_empty() || self.barriers.pending_uav_barriers() > 0;
        if self.rendering && barriers_pending {
            return Err(GraphicsError::FrameState(
                "resource transition inside a rendering scope; bind resources before begin_rendering"
                    .to_string(),
            ));
        }
        let commands = self.frames.commands_mut()?;
        self.barriers.flush(commands);
        Ok(commands)
    }

    fn resolve(&self, handle: ResourceHandle) -> Result<Arc<GpuResource>, GraphicsError> {
        self.resources
            .get(handle)
            .map(Arc::clone)
            .inspect_err(|e| log_invalid(handle, e))
    }

    fn buffer_desc(&self, handle: ResourceHandle) -> Result<&BufferDescriptor, GraphicsError> {
        let desc = self
            .resources
            .desc(handle)
            .inspect_err(|e| log_invalid(handle, e))?;
        desc.as_buffer().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("{:?} is not a buffer", handle))
        })
    }

    fn texture_desc(&self, handle: ResourceHandle) -> Result<&TextureDescriptor, GraphicsError> {
        let desc = self
            .resources
            .desc(handle)
            .inspect_err(|e| log_invalid(handle, e))?;
        desc.as_texture().ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("{:?} is not a texture", handle))
        })
    }

    /// Put `bytes` somewhere the GPU can copy from.
    fn stage(
        &mut self,
        bytes: &[u8],
        use_ring: bool,
    ) -> Result<(Arc<GpuResource>, u64), GraphicsError> {
        let size = bytes.len() as u64;
        if use_ring && self.upload.fits(size) {
            let allocation = self.upload.allocate_bytes(size, 4)?;
            self.upload.write(&allocation, bytes)?;
            return Ok((Arc::clone(self.upload.buffer()), allocation.offset()));
        }

        let descriptor = BufferDescriptor::staging(size);
        let native = Arc::new(self.backend.create_buffer(&descriptor)?);
        self.backend.write_buffer(&native, 0, bytes)?;

        let handle = self.resources.register(
            Arc::clone(&native),
            ResourceDesc::Buffer(descriptor),
            ResourceState::COPY_SOURCE,
        );
        self.resources
            .release(handle, self.frames.next_signal_value())?;
        log::trace!("Staging {} bytes through a temporary buffer", size);
        Ok((native, 0))
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Graphics context shutdown failed: {}", e);
        }
    }
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("backend", &self.backend.name())
            .field("frames", &self.frames)
            .field("resources", &self.resources.live_count())
            .field("pipelines", &self.pipelines.len())
            .field("upload", &self.upload)
            .field("descriptors", &self.descriptors)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(GraphicsContext: Send);

fn headless_presenter(
    backend: &dyn GpuBackend,
    table: &mut ResourceTable,
    config: &ContextConfig,
) -> Result<Box<dyn Presenter>, GraphicsError> {
    Ok(Box::new(HeadlessPresenter::new(
        backend,
        table,
        config.back_buffer_count,
        config.width,
        config.height,
        config.back_buffer_format,
    )?))
}

fn log_invalid(handle: ResourceHandle, error: &GraphicsError) {
    if matches!(error, GraphicsError::InvalidHandle) {
        log::error!("Invalid resource handle {:?} used while recording", handle);
    }
}

fn check_range(desc: &BufferDescriptor, offset: u64, size: u64) -> Result<(), GraphicsError> {
    match offset.checked_add(size) {
        Some(end) if end <= desc.size => Ok(()),
        _ => Err(GraphicsError::InvalidParameter(format!(
            "range {}..{} out of bounds for {:?} ({} bytes)",
            offset,
            offset.saturating_add(size),
            desc.label,
            desc.size
        ))),
    }
}

fn check_attachment(
    desc: &TextureDescriptor,
    extent: Extent3d,
    usage: TextureUsage,
) -> Result<(), GraphicsError> {
    if !desc.usage.contains(usage) {
        return Err(GraphicsError::InvalidParameter(format!(
            "{:?} is missing {:?} usage",
            desc.label, usage
        )));
    }
    if desc.size != extent {
        return Err(GraphicsError::InvalidParameter(format!(
            "attachment {:?} is {:?}, expected {:?}",
            desc.label, desc.size, extent
        )));
    }
    Ok(())
}

/// Resolve a requested view against the resource it views.
fn view_kind(desc: &ResourceDesc, view: ViewDesc) -> Result<ViewKind, GraphicsError> {
    match (desc, view) {
        (
            ResourceDesc::Texture(texture),
            ViewDesc::ShaderResource {
                base_mip,
                mip_count,
            },
        ) => {
            let levels = texture.mip_level_count;
            let count = mip_count.unwrap_or(levels.saturating_sub(base_mip));
            if count == 0 || base_mip + count > levels {
                return Err(GraphicsError::InvalidParameter(format!(
                    "mips {}..{} out of range ({} levels)",
                    base_mip,
                    base_mip + count,
                    levels
                )));
            }
            Ok(ViewKind::Sampled {
                base_mip,
                mip_count: count,
            })
        }
        (ResourceDesc::Texture(texture), ViewDesc::UnorderedAccess { mip_level }) => {
            if !texture.usage.contains(TextureUsage::STORAGE) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "{:?} was not created with STORAGE usage",
                    texture.label
                )));
            }
            if mip_level >= texture.mip_level_count {
                return Err(GraphicsError::InvalidParameter(format!(
                    "mip level {} out of range ({} levels)",
                    mip_level, texture.mip_level_count
                )));
            }
            Ok(ViewKind::Storage { mip_level })
        }
        (ResourceDesc::Buffer(buffer), ViewDesc::Buffer { offset, size }) => {
            let size = size.unwrap_or(buffer.size.saturating_sub(offset));
            check_range(buffer, offset, size)?;
            Ok(ViewKind::Buffer { offset, size })
        }
        (desc, view) => Err(GraphicsError::InvalidParameter(format!(
            "{:?} view does not apply to {:?}",
            view,
            desc.label()
        ))),
    }
}
