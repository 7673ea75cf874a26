use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use gpuframe_graphics::{
    BackendKind, BarrierBatcher, BufferDescriptor, BufferUsage, ColorTarget, CommandList,
    ContextConfig, DummyBackend, GraphicsContext, ResourceState, ResourceTable, TextureDescriptor,
    TextureFormat, TextureUsage, ViewDesc,
};

fn dummy_context() -> GraphicsContext {
    let config = ContextConfig::new()
        .with_backend(BackendKind::Dummy)
        .with_size(64, 64);
    GraphicsContext::with_backend(config, Arc::new(DummyBackend::default())).unwrap()
}

// ---------------------------------------------------------------------------
// Frame loop
// ---------------------------------------------------------------------------

fn bench_empty_frame(c: &mut Criterion) {
    let mut ctx = dummy_context();
    c.bench_function("frame_begin_clear_end", |b| {
        b.iter(|| {
            ctx.begin_frame().unwrap();
            let target = ctx.back_buffer();
            ctx.begin_rendering(&[ColorTarget::clear(target, [0.0; 4])], None)
                .unwrap();
            ctx.end_rendering().unwrap();
            black_box(ctx.end_frame().unwrap());
        });
    });
}

fn bench_frame_with_uploads(c: &mut Criterion) {
    let mut ctx = dummy_context();
    let buffer = ctx
        .create_buffer(
            BufferDescriptor::new(4096, BufferUsage::STORAGE | BufferUsage::COPY_DST),
            ResourceState::COMMON,
        )
        .unwrap();
    let payload = [0.5f32; 256];
    c.bench_function("frame_16_buffer_uploads", |b| {
        b.iter(|| {
            ctx.begin_frame().unwrap();
            for _ in 0..16 {
                ctx.upload_buffer_data(buffer, 0, &payload).unwrap();
            }
            black_box(ctx.end_frame().unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Upload ring
// ---------------------------------------------------------------------------

fn bench_upload_ring_allocate(c: &mut Criterion) {
    let mut ctx = dummy_context();
    ctx.begin_frame().unwrap();
    c.bench_function("upload_ring_allocate_256b", |b| {
        b.iter(|| {
            let ring = ctx.upload_ring_mut();
            if !ring.fits(256) {
                let slot = ring.current_slot();
                ring.begin_frame(slot);
            }
            black_box(ring.allocate_bytes(256, 16).unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Barriers
// ---------------------------------------------------------------------------

fn bench_barrier_coalescing(c: &mut Criterion) {
    let backend = DummyBackend::default();
    let mut table = ResourceTable::new();
    let handles: Vec<_> = (0..64)
        .map(|_| {
            table
                .create(
                    &backend,
                    BufferDescriptor::new(256, BufferUsage::STORAGE),
                    ResourceState::COMMON,
                )
                .unwrap()
        })
        .collect();
    let mut batcher = BarrierBatcher::new();
    let mut commands = CommandList::new();

    c.bench_function("barriers_64_resources_3_requests_each", |b| {
        b.iter(|| {
            for &handle in &handles {
                batcher
                    .request_transition(&mut table, handle, ResourceState::COPY_DEST)
                    .unwrap();
                batcher
                    .request_transition(&mut table, handle, ResourceState::UNORDERED_ACCESS)
                    .unwrap();
                batcher
                    .request_transition(&mut table, handle, ResourceState::COMMON)
                    .unwrap();
            }
            black_box(batcher.flush(&mut commands));
            batcher.commit();
            commands.clear();
        });
    });
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

fn bench_stage_descriptors(c: &mut Criterion) {
    let mut ctx = dummy_context();
    let texture = ctx
        .create_texture(
            TextureDescriptor::new_2d(16, 16, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED),
            ResourceState::PIXEL_SHADER_RESOURCE,
        )
        .unwrap();
    let first = ctx.create_descriptor(texture, ViewDesc::texture()).unwrap();
    let second = ctx.create_descriptor(texture, ViewDesc::texture()).unwrap();
    let sources = [first, second];

    c.bench_function("frame_stage_8_descriptor_tables", |b| {
        b.iter(|| {
            ctx.begin_frame().unwrap();
            for _ in 0..8 {
                black_box(ctx.stage_descriptors(&sources).unwrap());
            }
            ctx.end_frame().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_empty_frame,
    bench_frame_with_uploads,
    bench_upload_ring_allocate,
    bench_barrier_coalescing,
    bench_stage_descriptors,
);

criterion_main!(benches);
