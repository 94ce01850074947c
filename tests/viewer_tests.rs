//! End-to-end tests against the headless backend
//!
//! These exercise the public API the way the viewer binary does: build a
//! [`GraphicsContext`], upload a [`SceneAsset`], record the two scene passes
//! and inspect what the simulated GPU saw.

mod common;

use common::*;
use glam::{Mat4, Vec3};
use rstest::rstest;
use scene_viewer::asset::{MeshData, SceneAsset};
use scene_viewer::backend::{BufferHandle, DescriptorView, GraphicsBackend, HeadlessBackend};
use scene_viewer::engine::FrameLoop;
use scene_viewer::resources::descriptor::kind::ShaderResource;
use scene_viewer::resources::{
    BufferInit, DescriptorAllocator, GpuBuffer, GpuTexture, GraphicsContext, ResourceError,
    UploadBatch,
};
use scene_viewer::scene::Camera;
use scene_viewer::scene_renderer::{DrawStats, PassTargets, SceneRenderer, ABSENT_TEXTURE};
use scene_viewer::ViewerConfig;

fn uploaded_renderer(
    ctx: &mut GraphicsContext<HeadlessBackend>,
    asset: &SceneAsset,
) -> SceneRenderer {
    let format = ctx.backend().swapchain_format();
    let mut renderer = SceneRenderer::new(ctx, format).expect("renderer");
    let batch = renderer.upload_gpu_resources(ctx, asset).expect("upload");
    flush_uploads(ctx, batch, 1);
    renderer
}

/// Scratch uniform buffer standing in for the per-frame constants
fn constants(ctx: &mut GraphicsContext<HeadlessBackend>) -> BufferHandle {
    let mut batch = UploadBatch::new();
    let init = BufferInit {
        cpu_accessible: true,
        ..BufferInit::new("constants", 256)
    };
    GpuBuffer::new(ctx.backend_mut(), &init, &mut batch)
        .unwrap()
        .handle()
}

fn depth_targets(depth: &GpuTexture) -> PassTargets {
    PassTargets {
        color: depth.view(),
        depth: depth.view(),
        width: WIDTH,
        height: HEIGHT,
    }
}

// ============================================================================
// Descriptor heaps
// ============================================================================

#[test]
fn freed_descriptor_slots_are_reused() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let mut pool = DescriptorAllocator::<ShaderResource>::new(&mut backend, 4, true).unwrap();

    let slots: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
    assert!(pool.allocate().is_err());

    let mut indices: Vec<u32> = slots.iter().map(|slot| slot.index()).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    pool.free(slots[2]).unwrap();
    assert_eq!(pool.live_count(), 3);
    assert_eq!(pool.allocate().unwrap().index(), 2);
    assert_eq!(pool.live_count(), 4);
}

#[test]
fn double_free_is_rejected() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let mut pool = DescriptorAllocator::<ShaderResource>::new(&mut backend, 2, true).unwrap();
    let slot = pool.allocate().unwrap();
    pool.free(slot).unwrap();
    assert!(pool.free(slot).is_err());
}

// ============================================================================
// Buffers and uploads
// ============================================================================

#[test]
fn cpu_accessible_buffer_reads_back_written_bytes() {
    let mut backend = HeadlessBackend::new(WIDTH, HEIGHT);
    let payload: Vec<u8> = (0..64u8).collect();
    let mut batch = UploadBatch::new();
    let init = BufferInit {
        cpu_accessible: true,
        init_data: Some(&payload),
        ..BufferInit::new("readback", payload.len() as u64)
    };
    let buffer = GpuBuffer::new(&mut backend, &init, &mut batch).unwrap();
    assert!(batch.is_empty());

    let read = buffer.read_back(&mut backend, payload.len() as u64).unwrap();
    assert_eq!(read, payload);
}

#[test]
fn staged_buffer_contents_land_after_the_copy() {
    let mut ctx = headless_context();
    let payload = [7u8; 32];
    let mut batch = UploadBatch::new();
    let init = BufferInit {
        init_data: Some(&payload),
        ..BufferInit::new("staged", 32)
    };
    let buffer = GpuBuffer::new(ctx.backend_mut(), &init, &mut batch).unwrap();
    assert_eq!(batch.len(), 1);

    flush_uploads(&mut ctx, batch, 1);
    assert_eq!(
        ctx.backend().buffer_contents(buffer.handle()).unwrap(),
        &payload[..]
    );
}

#[test]
fn staging_is_kept_until_its_fence_completes() {
    let mut ctx = headless_context();
    let payload = [1u8; 16];
    let mut batch = UploadBatch::new();
    let init = BufferInit {
        init_data: Some(&payload),
        ..BufferInit::new("early", 16)
    };
    GpuBuffer::new(ctx.backend_mut(), &init, &mut batch).unwrap();

    let backend = ctx.backend_mut();
    backend.submit().unwrap();
    backend.signal_fence(1).unwrap();
    batch.stamp(1);
    assert!(matches!(
        batch.release(backend),
        Err(ResourceError::StagingInFlight { .. })
    ));
    assert_eq!(batch.len(), 1);

    // The copy runs, but the fence is still queued behind it
    assert_eq!(backend.step_gpu(1), 1);
    assert_eq!(backend.completed_fence_value(), 0);
    assert!(matches!(
        batch.release(backend),
        Err(ResourceError::StagingInFlight { .. })
    ));

    assert_eq!(backend.step_gpu(1), 1);
    assert_eq!(backend.completed_fence_value(), 1);
    batch.release(backend).unwrap();
    assert!(batch.is_empty());
}

// ============================================================================
// Scene upload and drawing
// ============================================================================

#[test]
fn materials_resolve_textures_to_descriptor_slots() {
    let mut ctx = headless_context();
    let asset = two_mesh_scene();
    let renderer = uploaded_renderer(&mut ctx, &asset);
    assert!(renderer.is_uploaded());
    assert_eq!(renderer.mesh_count(), 2);
    let mesh_records = renderer.mesh_records_buffer().unwrap();
    assert!(ctx.backend().buffer_contents(mesh_records).unwrap().len() >= 2 * 160);

    let records = renderer.material_records();
    let plain = &records[renderer.material_index(0).unwrap() as usize];
    assert_eq!(plain.base_color, PLAIN_COLOR.to_array());
    assert_eq!((plain.metallic, plain.roughness), (0.25, 0.7));
    assert_eq!(plain.albedo_index, ABSENT_TEXTURE);
    assert_eq!(plain.metallic_roughness_index, ABSENT_TEXTURE);
    assert_eq!(plain.normal_index, ABSENT_TEXTURE);

    let textured = &records[renderer.material_index(1).unwrap() as usize];
    assert_eq!(
        renderer.texture_slot(0).map(|slot| slot.index() as i32),
        Some(textured.albedo_index)
    );
    assert_eq!(textured.normal_index, ABSENT_TEXTURE);

    // The slot must lead back to the uploaded texels
    let backend = ctx.backend();
    let heap = ctx.shader_resources().heap();
    let Some(DescriptorView::Texture(view)) = backend.descriptor(heap, textured.albedo_index as u32)
    else {
        panic!("albedo slot does not hold a texture view");
    };
    let texture = backend.view_texture(view).unwrap();
    assert_eq!(backend.texture_contents(texture).unwrap(), &asset.images[0].rgba[..]);
}

#[rstest]
#[case::in_front(Vec3::ZERO, 1)]
#[case::behind_camera(Vec3::Z * 50.0, 0)]
#[case::far_to_the_side(Vec3::X * 500.0, 0)]
fn frustum_decides_which_meshes_draw(#[case] offset: Vec3, #[case] expected_draws: usize) {
    let mut ctx = headless_context();
    let mut asset = SceneAsset::new();
    asset
        .meshes
        .push(MeshData::cube("cube", 1.0).with_transform(Mat4::from_translation(offset)));
    let renderer = uploaded_renderer(&mut ctx, &asset);
    let (vertices, indices): (BufferHandle, BufferHandle) = renderer.mesh_buffers(0).unwrap();

    let depth = GpuTexture::depth(&mut ctx, "Depth", WIDTH, HEIGHT).unwrap();
    let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
    let scene_constants = constants(&mut ctx);
    ctx.backend_mut().clear_logs();
    let stats = renderer
        .render_depth_only(
            ctx.backend_mut(),
            &depth_targets(&depth),
            scene_constants,
            &camera.frustum(),
        )
        .unwrap();

    assert_eq!(stats.drawn as usize, expected_draws);
    let pass = ctx.backend().pass_log().last().unwrap();
    let touching = pass
        .draws
        .iter()
        .filter(|draw| draw.references(vertices) || draw.references(indices))
        .count();
    assert_eq!(touching, expected_draws);
}

#[test]
fn base_pass_draws_meshes_in_scene_order() {
    let mut ctx = headless_context();
    let renderer = uploaded_renderer(&mut ctx, &two_mesh_scene());
    let depth = GpuTexture::depth(&mut ctx, "Depth", WIDTH, HEIGHT).unwrap();
    let camera = Camera::new(Vec3::new(0.0, 0.0, 6.0), Vec3::ZERO);
    let scene_constants = constants(&mut ctx);
    let light_constants = constants(&mut ctx);
    ctx.backend_mut().clear_logs();

    let stats = renderer
        .render_base_pass(
            &mut ctx,
            &depth_targets(&depth),
            scene_constants,
            light_constants,
            &camera.frustum(),
            [0.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
    assert_eq!(stats, DrawStats { drawn: 2, culled: 0 });

    let pass = ctx.backend().pass_log().last().unwrap();
    let drawn: Vec<_> = pass
        .draws
        .iter()
        .map(|draw| (draw.push_constant_u32(0), draw.push_constant_u32(1)))
        .collect();
    assert_eq!(
        drawn,
        vec![
            (Some(0), renderer.material_index(0)),
            (Some(1), renderer.material_index(1)),
        ]
    );
    assert!(pass.draws.iter().all(|draw| draw.indices == (0..36)));
}

// ============================================================================
// Frame loop
// ============================================================================

#[test]
fn scene_slots_stay_clear_of_the_overlay_range() {
    let config = ViewerConfig {
        width: WIDTH,
        height: HEIGHT,
        ..Default::default()
    };
    let mut frame_loop = FrameLoop::new(HeadlessBackend::new(WIDTH, HEIGHT), &config).unwrap();
    let reserved = frame_loop.ui_descriptors();
    assert_eq!(reserved.len() as u32, config.ui_descriptors);

    let asset = two_mesh_scene();
    frame_loop.load_scene(&asset).unwrap();
    let renderer = frame_loop.renderer();

    let texture_slots: Vec<u32> = (0..asset.textures.len())
        .map(|texture| renderer.texture_slot(texture).unwrap().index())
        .collect();
    let material_slots = renderer.material_records().iter().flat_map(|record| {
        [
            record.albedo_index,
            record.metallic_roughness_index,
            record.normal_index,
        ]
    });
    let referenced: Vec<u32> = material_slots
        .filter(|&index| index != ABSENT_TEXTURE)
        .map(|index| index as u32)
        .collect();
    assert!(!referenced.is_empty());

    for slot in texture_slots.iter().chain(&referenced) {
        assert!(!reserved.contains(slot), "slot {slot} is inside {reserved:?}");
    }
}

#[rstest]
#[case::double_buffered(2)]
#[case::triple_buffered(3)]
fn cpu_never_runs_more_than_slots_ahead(#[case] slots: usize) {
    let config = ViewerConfig {
        width: WIDTH,
        height: HEIGHT,
        frame_slots: slots,
        ..Default::default()
    };
    let mut frame_loop = FrameLoop::new(HeadlessBackend::new(WIDTH, HEIGHT), &config).unwrap();
    frame_loop.load_scene(&two_mesh_scene()).unwrap();

    let slots = slots as u64;
    for frame in 0..10u64 {
        let stats = frame_loop.render_frame().unwrap();
        assert_eq!(stats.frame_index, frame);
        assert_eq!(frame_loop.last_stats(), &stats);

        let signaled = frame_loop.synchronizer().last_signaled();
        let completed = frame_loop.backend_mut().completed_fence_value();
        assert_eq!(signaled, stats.fence_value);
        assert!(signaled - completed <= slots);
        // Recording this frame waited on the fence `slots` frames back
        if stats.fence_value + 1 > slots {
            assert!(completed >= stats.fence_value + 1 - slots);
        }
    }
    assert_eq!(frame_loop.backend().frames_presented(), 10);

    let backend = frame_loop.shutdown().unwrap();
    assert_eq!(backend.pending_signals(), 0);
}
