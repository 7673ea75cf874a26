//! Integration tests for frame orchestration.
//!
//! These tests drive a [`GraphicsContext`] the way a renderer does and check
//! the orchestration guarantees end to end. Tests are parameterized using
//! `rstest` to run against every backend available on the machine.
//!
//! # Test Categories
//!
//! - **Frame Tests**: Slot rotation, blocking reuse, completion draining
//! - **Upload Tests**: Region boundaries and recycling
//! - **Descriptor Tests**: Monotonic allocation and exhaustion
//! - **Barrier Tests**: Coalescing and idempotence across a real frame
//! - **Mipmap Tests**: Compute mip chain generation
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests (the Vulkan cases skip without a device)
//! cargo test --test gpu_tests
//!
//! # With log output
//! RUST_LOG=debug cargo test --test gpu_tests -- --nocapture
//! ```

mod common;

use std::thread;
use std::time::Duration;

use rstest::rstest;

use common::{Backend, TestContext, create_mipmapped_texture, generate_checkerboard};
use gpuframe_graphics::{
    BufferDescriptor, BufferUsage, ColorTarget, ContextConfig, GraphicsError, MipmapGenerator,
    ResourceState, TextureFormat, TextureUsage, ViewDesc,
};

// ============================================================================
// Frame Tests
// ============================================================================

/// Reusing a slot blocks until the GPU confirms its previous frame, and the
/// completion can come from another thread.
#[rstest]
fn test_begin_frame_blocks_until_slot_completes(#[values(2, 3)] frames: usize) {
    let config = Backend::DummyManual.config().with_frames_in_flight(frames);
    let TestContext { mut ctx, dummy } =
        TestContext::with_config(Backend::DummyManual, config).unwrap();
    let dummy = dummy.unwrap();

    for frame in 0..frames {
        assert_eq!(ctx.begin_frame().unwrap(), frame);
        assert_eq!(ctx.end_frame().unwrap(), frame as u64 + 1);
    }
    assert_eq!(dummy.pending_slots(), (0..frames).collect::<Vec<_>>());

    let completer = {
        let dummy = dummy.clone();
        thread::spawn(move || {
            // Complete only once the main thread is parked in the wait.
            while dummy.stats().blocked_waits == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            dummy.complete_next()
        })
    };

    let slot = ctx.begin_frame().unwrap();
    assert_eq!(slot, 0);
    assert_eq!(completer.join().unwrap(), Some(1));
    assert_eq!(ctx.frames().wait_count(), 1);
    assert!(ctx.completed_value().unwrap() >= 1);

    // The other slots are still on the GPU.
    assert_eq!(ctx.end_frame().unwrap(), frames as u64 + 1);
    dummy.complete_all();
    ctx.shutdown().unwrap();
}

/// A buffer created as a copy destination and moved to vertex-buffer state
/// records exactly one transition.
#[test]
fn test_buffer_transition_end_to_end() {
    let config = Backend::Dummy
        .config()
        .with_frames_in_flight(2)
        .with_upload_region_size(64 * 1024);
    let TestContext { mut ctx, dummy } = TestContext::with_config(Backend::Dummy, config).unwrap();
    let dummy = dummy.unwrap();

    let buffer = ctx
        .create_buffer(
            BufferDescriptor::new(1024, BufferUsage::VERTEX | BufferUsage::COPY_DST),
            ResourceState::COPY_DEST,
        )
        .unwrap();
    assert!(ctx.transition(buffer, ResourceState::VERTEX_BUFFER).unwrap());
    assert_eq!(ctx.flush_barriers().unwrap(), 1);
    assert_eq!(
        ctx.resources().state(buffer).unwrap(),
        ResourceState::VERTEX_BUFFER
    );

    ctx.finish_gpu_commands().unwrap();
    assert_eq!(dummy.stats().transitions, 1);
    ctx.shutdown().unwrap();
}

/// Frames never wait while the GPU keeps up.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_frame_rotation(#[case] backend: Backend) {
    let Some(TestContext { mut ctx, .. }) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let mut last = 0;
    for frame in 0..6 {
        let slot = ctx.begin_frame().unwrap();
        assert_eq!(slot, frame % 2);
        let target = ctx.back_buffer();
        ctx.begin_rendering(&[ColorTarget::clear(target, [0.2, 0.3, 0.4, 1.0])], None)
            .unwrap();
        ctx.end_rendering().unwrap();
        let value = ctx.end_frame().unwrap();
        assert!(value > last, "fence values must increase");
        last = value;
    }

    ctx.wait_idle().unwrap();
    assert!(ctx.completed_value().unwrap() >= last);
    assert_eq!(ctx.frames().frame_count(), 6);
}

/// `finish_gpu_commands` drains everything and leaves the slot recording.
#[rstest]
#[case::dummy(Backend::DummyManual)]
#[case::vulkan(Backend::Vulkan)]
fn test_finish_gpu_commands_drains(#[case] backend: Backend) {
    let Some(tc) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let TestContext { mut ctx, dummy } = tc;

    let buffer = ctx
        .create_buffer(
            BufferDescriptor::new(256, BufferUsage::STORAGE | BufferUsage::COPY_DST),
            ResourceState::COMMON,
        )
        .unwrap();
    ctx.upload_buffer_data(buffer, 0, &[7u32; 64]).unwrap();

    let completer = dummy.clone().map(|dummy| {
        thread::spawn(move || {
            while dummy.stats().blocked_waits == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            dummy.complete_all();
        })
    });
    ctx.finish_gpu_commands().unwrap();
    if let Some(completer) = completer {
        completer.join().unwrap();
    }

    assert!(ctx.is_recording());
    assert_eq!(ctx.completed_value().unwrap(), ctx.frames().last_submitted());
    assert_eq!(ctx.upload_ring().used(), 0);
}

// ============================================================================
// Upload Tests
// ============================================================================

/// An allocation of exactly the remaining bytes succeeds, one more byte
/// fails, and the region is whole again once its slot is recycled.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_upload_region_boundary(#[case] backend: Backend) {
    let config = backend.config().with_upload_region_size(4096);
    let Some(TestContext { mut ctx, .. }) = TestContext::with_config(backend, config) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.begin_frame().unwrap();
    let ring = ctx.upload_ring_mut();
    let alignment = ring.alignment();
    ring.allocate_bytes(100, 4).unwrap();

    let rest = ring.region_size() - 100u64.next_multiple_of(alignment);
    assert!(ring.fits(rest));
    assert!(!ring.fits(rest + 1));
    let last = ring.allocate_bytes(rest, 4).unwrap();
    assert_eq!(last.size(), rest);
    assert_eq!(ring.remaining(), 0);
    assert_eq!(
        ring.allocate_bytes(1, 4),
        Err(GraphicsError::UploadRegionExhausted)
    );
    // Zero-byte requests never fail.
    assert!(ring.allocate_bytes(0, 4).is_ok());
    ctx.end_frame().unwrap();

    // Slot 1, then slot 0 again with a fresh region.
    ctx.begin_frame().unwrap();
    ctx.end_frame().unwrap();
    ctx.begin_frame().unwrap();
    assert_eq!(ctx.upload_ring().current_slot(), 0);
    assert_eq!(ctx.upload_ring().used(), 0);
    assert!(ctx.upload_ring().fits(4096));
    ctx.end_frame().unwrap();
}

/// Constants uploaded through the ring land where the GPU reads them.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_constant_buffer_binding(#[case] backend: Backend) {
    let Some(TestContext { mut ctx, .. }) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    ctx.begin_frame().unwrap();
    let constants = ctx
        .upload_ring_mut()
        .upload(&[1.0f32, 0.5, 0.25, 1.0])
        .unwrap();
    assert_eq!(constants.offset() % ctx.upload_ring().alignment(), 0);
    ctx.set_constant_buffer(&constants).unwrap();

    let bytes = ctx
        .backend()
        .read_buffer(ctx.upload_ring().buffer(), constants.offset(), 16)
        .unwrap();
    assert_eq!(bytes, bytemuck::cast_slice::<f32, u8>(&[1.0, 0.5, 0.25, 1.0]));
    ctx.end_frame().unwrap();
}

// ============================================================================
// Descriptor Tests
// ============================================================================

/// CPU descriptors are handed out monotonically and never reused.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_descriptor_allocation_is_monotonic(#[case] backend: Backend) {
    let config = backend.config().with_cpu_descriptor_capacity(8);
    let Some(TestContext { mut ctx, .. }) = TestContext::with_config(backend, config) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let texture = ctx
        .create_texture(
            gpuframe_graphics::TextureDescriptor::new_2d(
                16,
                16,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED,
            ),
            ResourceState::PIXEL_SHADER_RESOURCE,
        )
        .unwrap();

    let a = ctx.create_descriptor(texture, ViewDesc::texture()).unwrap();
    let b = ctx.allocate_descriptors(3).unwrap();
    let c = ctx.create_descriptor(texture, ViewDesc::texture()).unwrap();
    assert_eq!(a.index(), 0);
    assert_eq!(b.index(), 1);
    assert_eq!(c.index(), 4);

    // Frames do not recycle CPU descriptors.
    ctx.begin_frame().unwrap();
    ctx.end_frame().unwrap();
    let d = ctx.allocate_descriptors(3).unwrap();
    assert_eq!(d.index(), 5);
    assert_eq!(
        ctx.allocate_descriptors(1),
        Err(GraphicsError::DescriptorPoolExhausted)
    );
}

/// Direct and bindless paths can serve the same texture in one frame.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_direct_and_bindless_paths(#[case] backend: Backend) {
    let Some(TestContext { mut ctx, .. }) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let texture = ctx
        .create_texture(
            gpuframe_graphics::TextureDescriptor::new_2d(
                32,
                32,
                TextureFormat::Rgba8Unorm,
                TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            ),
            ResourceState::COPY_DEST,
        )
        .unwrap();
    ctx.upload_texture_data(texture, 0, &generate_checkerboard(32))
        .unwrap();
    ctx.transition(texture, ResourceState::PIXEL_SHADER_RESOURCE)
        .unwrap();

    let persistent = ctx.allocate_persistent(1).unwrap();
    ctx.write_persistent(persistent.slot(), texture, ViewDesc::texture())
        .unwrap();

    ctx.begin_frame().unwrap();
    let cpu = ctx.create_descriptor(texture, ViewDesc::texture()).unwrap();
    let table = ctx.stage_descriptors(&[cpu]).unwrap();
    assert!(table.index() < persistent.slot());
    ctx.bind_descriptor_table(table.index()).unwrap();
    ctx.end_frame().unwrap();

    let heap = ctx.descriptors().shader_visible_heap();
    assert!(heap.view(table.index()).is_some());
    assert!(heap.view(persistent.slot()).is_some());
}

// ============================================================================
// Barrier Tests
// ============================================================================

/// Requesting the state a resource is already in records nothing, and a
/// chain of requests before the next GPU operation becomes one transition.
#[rstest]
#[case::dummy(Backend::Dummy)]
#[case::vulkan(Backend::Vulkan)]
fn test_barriers_are_idempotent(#[case] backend: Backend) {
    let Some(TestContext { mut ctx, dummy }) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let buffer = ctx
        .create_buffer(
            BufferDescriptor::new(64, BufferUsage::VERTEX | BufferUsage::COPY_DST),
            ResourceState::VERTEX_BUFFER,
        )
        .unwrap();

    ctx.begin_frame().unwrap();
    assert!(!ctx.transition(buffer, ResourceState::VERTEX_BUFFER).unwrap());
    assert_eq!(ctx.flush_barriers().unwrap(), 0);

    assert!(ctx.transition(buffer, ResourceState::COPY_DEST).unwrap());
    assert!(ctx.transition(buffer, ResourceState::COPY_DEST).unwrap());
    assert!(ctx.transition(buffer, ResourceState::UNORDERED_ACCESS).unwrap());
    assert_eq!(ctx.barriers().pending().len(), 1);
    assert_eq!(ctx.flush_barriers().unwrap(), 1);

    // Back to where it started before any GPU operation: nothing queued.
    assert!(ctx.transition(buffer, ResourceState::COPY_DEST).unwrap());
    assert!(!ctx.transition(buffer, ResourceState::UNORDERED_ACCESS).unwrap());
    assert_eq!(ctx.flush_barriers().unwrap(), 0);

    let commands = ctx.commands().unwrap();
    assert_eq!(commands.barrier_batch_count(), 1);
    ctx.end_frame().unwrap();

    if let Some(dummy) = dummy {
        // The back buffer was never rendered to, so it never left PRESENT.
        assert_eq!(dummy.stats().transitions, 1);
        assert_eq!(
            ctx.resources().state(buffer).unwrap(),
            ResourceState::UNORDERED_ACCESS
        );
    }
}

/// A full textured frame: upload, bind, draw and present, with every state
/// change batched in front of the operation that needs it.
#[rstest]
#[case::dummy(Backend::Dummy)]
fn test_frame_barrier_batches(#[case] backend: Backend) {
    let Some(TestContext { mut ctx, dummy }) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };
    let dummy = dummy.unwrap();

    let vertices = ctx
        .create_buffer(
            BufferDescriptor::new(48, BufferUsage::VERTEX | BufferUsage::COPY_DST),
            ResourceState::COMMON,
        )
        .unwrap();
    let indices = ctx
        .create_buffer(
            BufferDescriptor::new(12, BufferUsage::INDEX | BufferUsage::COPY_DST),
            ResourceState::COMMON,
        )
        .unwrap();

    ctx.begin_frame().unwrap();
    ctx.upload_buffer_data(vertices, 0, &[0.0f32; 12]).unwrap();
    ctx.upload_buffer_data(indices, 0, &[0u32, 1, 2]).unwrap();
    ctx.set_vertex_buffer(0, vertices, 0).unwrap();
    ctx.set_index_buffer(indices, 0, gpuframe_graphics::IndexFormat::Uint32)
        .unwrap();
    let target = ctx.back_buffer();
    ctx.begin_rendering(&[ColorTarget::clear(target, [0.0, 0.0, 0.0, 1.0])], None)
        .unwrap();
    ctx.draw_indexed(3, 1, 0, 0, 0).unwrap();
    ctx.end_rendering().unwrap();
    ctx.end_frame().unwrap();

    let stats = dummy.stats();
    // vertices COMMON->COPY_DEST, indices COMMON->COPY_DEST, vertices -> VB,
    // indices -> IB, back buffer -> RT, back buffer -> PRESENT
    assert_eq!(stats.transitions, 6);
    assert_eq!(stats.barrier_batches, 6);
    assert_eq!(stats.buffer_copies, 2);
    assert_eq!(stats.draws, 1);

    // Same frame again: the buffers only move between read states.
    ctx.begin_frame().unwrap();
    ctx.set_vertex_buffer(0, vertices, 0).unwrap();
    ctx.set_index_buffer(indices, 0, gpuframe_graphics::IndexFormat::Uint32)
        .unwrap();
    let target = ctx.back_buffer();
    ctx.begin_rendering(&[ColorTarget::load(target)], None)
        .unwrap();
    ctx.draw_indexed(3, 1, 0, 0, 0).unwrap();
    ctx.end_rendering().unwrap();
    ctx.end_frame().unwrap();
    assert_eq!(dummy.stats().transitions, 6 + 2);
}

// ============================================================================
// Mipmap Tests
// ============================================================================

/// A 256x256 texture with a full chain takes one dispatch per level below
/// the top, and `finish` returns only after the GPU is done.
#[rstest]
#[case::dummy(Backend::DummyManual)]
#[case::vulkan(Backend::Vulkan)]
fn test_mipmap_generation(#[case] backend: Backend) {
    let Some(TestContext { mut ctx, dummy }) = TestContext::new(backend) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let texture = create_mipmapped_texture(&mut ctx, 256, 9);
    ctx.upload_texture_data(texture, 0, &generate_checkerboard(256))
        .unwrap();

    let mut generator = MipmapGenerator::new(&mut ctx).unwrap();
    assert_eq!(generator.generate(&mut ctx, texture).unwrap(), 8);
    assert_eq!(ctx.commands().unwrap().dispatch_count(), 8);
    assert_eq!(
        ctx.resources().state(texture).unwrap(),
        ResourceState::UNORDERED_ACCESS
    );

    let completer = dummy.clone().map(|dummy| {
        thread::spawn(move || {
            while dummy.stats().blocked_waits == 0 {
                thread::sleep(Duration::from_millis(1));
            }
            dummy.complete_all();
        })
    });
    generator.finish(&mut ctx).unwrap();
    if let Some(completer) = completer {
        completer.join().unwrap();
    }

    assert_eq!(ctx.completed_value().unwrap(), ctx.frames().last_submitted());
    if let Some(dummy) = dummy {
        assert_eq!(dummy.stats().dispatches, 8);
        // One UAV barrier between consecutive levels.
        assert_eq!(dummy.stats().uav_barriers, 7);
    }
    // The kernel is released with the frame being recorded.
    assert_eq!(ctx.pipelines().pending_destruction_count(), 1);
}

/// A single-level texture needs no work.
#[test]
fn test_mipmap_single_level_is_noop() {
    let TestContext { mut ctx, .. } = TestContext::new(Backend::Dummy).unwrap();
    let texture = create_mipmapped_texture(&mut ctx, 64, 1);

    let mut generator = MipmapGenerator::new(&mut ctx).unwrap();
    assert_eq!(generator.generate(&mut ctx, texture).unwrap(), 0);
    generator.finish(&mut ctx).unwrap();
}

// ============================================================================
// Configuration Tests
// ============================================================================

/// Contexts built from a TOML file behave like ones built in code.
#[test]
fn test_context_from_toml() {
    let config = ContextConfig::from_toml_str(
        r#"
        backend = "dummy"
        frames_in_flight = 3
        upload_region_size = 65536
        width = 32
        height = 32
        "#,
    )
    .unwrap();
    let TestContext { mut ctx, .. } = TestContext::with_config(Backend::Dummy, config).unwrap();

    for expected_slot in [0, 1, 2, 0] {
        assert_eq!(ctx.begin_frame().unwrap(), expected_slot);
        ctx.end_frame().unwrap();
    }
    assert_eq!(ctx.upload_ring().region_size(), 65536);
    assert_eq!(ctx.frame_width(), 32);
}
