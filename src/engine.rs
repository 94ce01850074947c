//! Frame orchestration
//!
//! [`FrameLoop`] owns the graphics context, the frame slots and the scene
//! renderer, and records one frame per [`FrameLoop::render_frame`]:
//! depth pre-pass, culled base pass into the slot's render target, copy to
//! the backbuffer, overlay, submit, present, then advance the fence.

use crate::asset::SceneAsset;
use crate::backend::{BackendError, FrameContext, GraphicsBackend, HeadlessBackend};
use crate::pipeline::CLEAR_COLOR;
use crate::resources::{ConstantBuffer, GpuTexture, GraphicsContext, ResourceState};
use crate::scene::{Camera, LightConstants, SceneConstants, SceneLighting};
use crate::scene_renderer::{DrawStats, PassTargets, SceneRenderer};
use crate::sync::FrameSynchronizer;
use crate::{ViewerConfig, ViewerError};
use glam::Vec3;
use std::ops::Range;
use std::time::{Duration, Instant};

/// Render target and constant buffers owned by one in-flight frame
struct FrameSlot {
    target: GpuTexture,
    scene_constants: ConstantBuffer,
    light_constants: ConstantBuffer,
}

/// What one frame did
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameStats {
    pub frame_index: u64,
    /// CPU time spent recording the scene passes
    pub frame_time: Duration,
    /// Fence value the frame was signaled with
    pub fence_value: u64,
    pub completed_fence: u64,
    pub depth: DrawStats,
    pub base: DrawStats,
    pub camera_position: Vec3,
}

pub struct FrameLoop<B: GraphicsBackend> {
    ctx: GraphicsContext<B>,
    sync: FrameSynchronizer,
    renderer: SceneRenderer,
    slots: Vec<FrameSlot>,
    depth: GpuTexture,
    camera: Camera,
    lighting: SceneLighting,
    ui_descriptors: Range<u32>,
    width: u32,
    height: u32,
    frame_index: u64,
    last_stats: FrameStats,
}

impl<B: GraphicsBackend> FrameLoop<B> {
    pub fn new(backend: B, config: &ViewerConfig) -> Result<Self, ViewerError> {
        let mut ctx = GraphicsContext::new(backend, config.descriptors)?;
        let ui_descriptors = ctx
            .shader_resources_mut()
            .reserve(config.ui_descriptors)?;
        log::debug!("Reserved descriptors {:?} for the overlay", ui_descriptors);

        let sync = FrameSynchronizer::new(config.frame_slots, config.fence_timeout)?;
        let (width, height) = ctx.backend().surface_size();
        let format = ctx.backend().swapchain_format();

        let mut slots = Vec::with_capacity(config.frame_slots);
        for index in 0..config.frame_slots {
            let target = GpuTexture::render_target(
                &mut ctx,
                &format!("Frame Target {}", index),
                width,
                height,
                format,
            )?;
            let scene_constants = ConstantBuffer::for_type::<SceneConstants, _>(
                ctx.backend_mut(),
                &format!("Scene Constants {}", index),
            )?;
            let light_constants = ConstantBuffer::for_type::<LightConstants, _>(
                ctx.backend_mut(),
                &format!("Light Constants {}", index),
            )?;
            slots.push(FrameSlot {
                target,
                scene_constants,
                light_constants,
            });
        }
        let depth = GpuTexture::depth(&mut ctx, "Depth Buffer", width, height)?;
        let renderer = SceneRenderer::new(&mut ctx, format)?;

        let mut camera = Camera::default();
        camera.set_aspect(width as f32, height as f32);

        log::info!(
            "Frame loop ready: {}x{} {:?}, {} frame slots",
            width,
            height,
            format,
            config.frame_slots
        );

        Ok(Self {
            ctx,
            sync,
            renderer,
            slots,
            depth,
            camera,
            lighting: SceneLighting::default(),
            ui_descriptors,
            width,
            height,
            frame_index: 0,
            last_stats: FrameStats::default(),
        })
    }

    /// Upload `asset`, wait for the copies and frame the camera on it.
    pub fn load_scene(&mut self, asset: &SceneAsset) -> Result<(), ViewerError> {
        let mut batch = self.renderer.upload_gpu_resources(&mut self.ctx, asset)?;
        let backend = self.ctx.backend_mut();
        backend.submit()?;
        let fence = self.sync.signal_and_wait_idle(backend)?;
        batch.stamp(fence);
        batch.release(backend)?;

        if let Some(bounds) = self.renderer.bounds() {
            self.camera.frame_bounds(&bounds);
        }
        self.camera.set_aspect(self.width as f32, self.height as f32);
        Ok(())
    }

    /// Record, submit and present one frame without an overlay.
    pub fn render_frame(&mut self) -> Result<FrameStats, ViewerError> {
        self.render_frame_with(|_, _, _| Ok(()))
    }

    /// Record, submit and present one frame.
    ///
    /// `overlay` runs after the scene reached the backbuffer and before the
    /// submit, so it can record into the same command stream. It receives the
    /// statistics of the frame being recorded.
    pub fn render_frame_with<F>(&mut self, overlay: F) -> Result<FrameStats, ViewerError>
    where
        F: FnOnce(&mut B, &FrameContext, &FrameStats) -> Result<(), BackendError>,
    {
        let start = Instant::now();
        let frame = self.ctx.backend_mut().begin_frame()?;
        let slot_index = self.sync.current_slot();

        let scene_constants = self.camera.scene_constants(self.width, self.height);
        let light_constants = self.lighting.constants();
        let frustum = self.camera.frustum();

        let slot = &mut self.slots[slot_index];
        let backend = self.ctx.backend_mut();
        slot.scene_constants.map_and_set_data(backend, &scene_constants)?;
        slot.light_constants.map_and_set_data(backend, &light_constants)?;
        slot.target
            .transition(backend, ResourceState::CopySource, ResourceState::RenderTarget)?;

        let targets = PassTargets {
            color: slot.target.view(),
            depth: self.depth.view(),
            width: self.width,
            height: self.height,
        };
        let depth_stats = self.renderer.render_depth_only(
            backend,
            &targets,
            slot.scene_constants.handle(),
            &frustum,
        )?;
        self.depth
            .transition(backend, ResourceState::DepthWrite, ResourceState::DepthRead)?;

        let base_stats = self.renderer.render_base_pass(
            &mut self.ctx,
            &targets,
            slot.scene_constants.handle(),
            slot.light_constants.handle(),
            &frustum,
            CLEAR_COLOR,
        )?;

        let backend = self.ctx.backend_mut();
        self.depth
            .transition(backend, ResourceState::DepthRead, ResourceState::DepthWrite)?;
        slot.target
            .transition(backend, ResourceState::RenderTarget, ResourceState::CopySource)?;
        if let Some(backbuffer) = frame.backbuffer {
            backend.copy_texture_to_texture(
                slot.target.handle(),
                backbuffer,
                self.width.min(frame.width),
                self.height.min(frame.height),
            )?;
        }

        let stats = FrameStats {
            frame_index: self.frame_index,
            frame_time: start.elapsed(),
            fence_value: self.sync.next_fence_value(),
            completed_fence: backend.completed_fence_value(),
            depth: depth_stats,
            base: base_stats,
            camera_position: self.camera.position,
        };
        overlay(backend, &frame, &stats)?;

        backend.submit()?;
        backend.present()?;
        self.sync.advance_frame(backend)?;

        log::trace!(
            "Frame {}: drew {} culled {} (fence {})",
            stats.frame_index,
            stats.base.drawn,
            stats.base.culled,
            stats.fence_value
        );
        self.frame_index += 1;
        self.last_stats = stats;
        Ok(stats)
    }

    /// Wait for the GPU and free every resource.
    pub fn shutdown(mut self) -> Result<B, ViewerError> {
        self.sync.signal_and_wait_idle(self.ctx.backend_mut())?;
        self.renderer.destroy(&mut self.ctx)?;
        for slot in self.slots.drain(..) {
            slot.target.destroy(&mut self.ctx)?;
            slot.scene_constants.destroy(self.ctx.backend_mut())?;
            slot.light_constants.destroy(self.ctx.backend_mut())?;
        }
        self.depth.destroy(&mut self.ctx)?;
        log::info!("Frame loop shut down after {} frames", self.frame_index);
        Ok(self.ctx.into_backend())
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn renderer(&self) -> &SceneRenderer {
        &self.renderer
    }

    pub fn context(&self) -> &GraphicsContext<B> {
        &self.ctx
    }

    pub fn backend(&self) -> &B {
        self.ctx.backend()
    }

    pub fn backend_mut(&mut self) -> &mut B {
        self.ctx.backend_mut()
    }

    pub fn synchronizer(&self) -> &FrameSynchronizer {
        &self.sync
    }

    /// Shader-resource slots set aside for the overlay.
    ///
    /// egui-wgpu binds its font and user textures through its own bind
    /// groups, so nothing writes these slots today. The range is a budget:
    /// it is carved before any scene upload and the scene never allocates
    /// from it.
    pub fn ui_descriptors(&self) -> Range<u32> {
        self.ui_descriptors.clone()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn last_stats(&self) -> &FrameStats {
        &self.last_stats
    }
}

/// Render `frames` frames of `asset` with the headless backend.
pub fn run_headless(
    config: &ViewerConfig,
    asset: &SceneAsset,
    frames: u64,
) -> Result<Vec<FrameStats>, ViewerError> {
    let backend = HeadlessBackend::new(config.width, config.height);
    let mut frame_loop = FrameLoop::new(backend, config)?;
    frame_loop.load_scene(asset)?;

    let mut stats = Vec::with_capacity(frames as usize);
    for _ in 0..frames {
        let frame = frame_loop.render_frame()?;
        log::info!(
            "Headless frame {}: depth {}/{} base {}/{} drawn/culled, {:.2} ms",
            frame.frame_index,
            frame.depth.drawn,
            frame.depth.culled,
            frame.base.drawn,
            frame.base.culled,
            frame.frame_time.as_secs_f64() * 1000.0
        );
        stats.push(frame);
    }
    frame_loop.shutdown()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::MeshData;
    use rstest::rstest;

    fn cube_scene() -> SceneAsset {
        let mut asset = SceneAsset::new();
        asset.meshes.push(MeshData::cube("cube", 1.0));
        asset
    }

    fn config() -> ViewerConfig {
        ViewerConfig {
            width: 32,
            height: 24,
            ..Default::default()
        }
    }

    #[test]
    fn frames_record_both_passes() {
        let mut frame_loop = FrameLoop::new(HeadlessBackend::new(32, 24), &config()).unwrap();
        frame_loop.load_scene(&cube_scene()).unwrap();
        frame_loop.backend_mut().clear_logs();

        let stats = frame_loop.render_frame().unwrap();
        assert_eq!(stats.depth, DrawStats { drawn: 1, culled: 0 });
        assert_eq!(stats.base, DrawStats { drawn: 1, culled: 0 });

        let labels: Vec<_> = frame_loop
            .backend()
            .pass_log()
            .iter()
            .map(|p| p.label.clone().unwrap_or_default())
            .collect();
        assert_eq!(labels, vec!["Depth Prepass", "Forward Pass"]);
        assert_eq!(frame_loop.backend().frames_presented(), 1);
    }

    #[rstest]
    #[case(2)]
    #[case(3)]
    fn in_flight_frames_stay_within_slots(#[case] slots: usize) {
        let config = ViewerConfig {
            frame_slots: slots,
            ..config()
        };
        let mut frame_loop = FrameLoop::new(HeadlessBackend::new(32, 24), &config).unwrap();
        frame_loop.load_scene(&cube_scene()).unwrap();
        for _ in 0..8 {
            frame_loop.render_frame().unwrap();
            let last = frame_loop.synchronizer().last_signaled();
            let completed = frame_loop.backend_mut().completed_fence_value();
            assert!(last - completed <= slots as u64);
        }
    }

    #[test]
    fn slot_targets_return_to_copy_source() {
        let mut frame_loop = FrameLoop::new(HeadlessBackend::new(32, 24), &config()).unwrap();
        frame_loop.load_scene(&cube_scene()).unwrap();
        for _ in 0..3 {
            frame_loop.render_frame().unwrap();
        }
        assert!(frame_loop
            .slots
            .iter()
            .all(|slot| slot.target.state() == ResourceState::CopySource));
        assert_eq!(frame_loop.depth.state(), ResourceState::DepthWrite);
    }

    #[test]
    fn overlay_sees_the_frame_being_recorded() {
        let mut frame_loop = FrameLoop::new(HeadlessBackend::new(32, 24), &config()).unwrap();
        frame_loop.load_scene(&cube_scene()).unwrap();
        frame_loop.render_frame().unwrap();

        let mut seen = None;
        let second = frame_loop
            .render_frame_with(|_, _, current| {
                seen = Some(*current);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, Some(second));
        assert_eq!(second.frame_index, 1);
        assert_eq!(second.base, DrawStats { drawn: 1, culled: 0 });
    }

    #[test]
    fn headless_run_releases_everything() {
        let stats = run_headless(&config(), &cube_scene(), 3).unwrap();
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[2].frame_index, 2);
    }
}
