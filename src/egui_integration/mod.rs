//! egui debug overlay
//!
//! [`draw_overlay`] lays out the statistics window; [`WgpuEguiIntegration`]
//! feeds it winit input and paints it onto the wgpu backbuffer.

mod wgpu;

pub use self::wgpu::WgpuEguiIntegration;

use crate::engine::FrameStats;

/// Add the statistics window to the current egui frame.
pub fn draw_overlay(ctx: &egui::Context, stats: &FrameStats) {
    egui::Window::new("Frame")
        .default_pos([10.0, 10.0])
        .resizable(false)
        .show(ctx, |ui| {
            let ms = stats.frame_time.as_secs_f64() * 1000.0;
            ui.label(format!("Frame {}: {:.2} ms", stats.frame_index, ms));
            ui.label(format!(
                "Fence: signaled {} / completed {}",
                stats.fence_value, stats.completed_fence
            ));
            ui.separator();
            egui::Grid::new("draw_stats").striped(true).show(ui, |ui| {
                ui.label("Pass");
                ui.label("Drawn");
                ui.label("Culled");
                ui.end_row();
                for (name, pass) in [("Depth", stats.depth), ("Base", stats.base)] {
                    ui.label(name);
                    ui.label(pass.drawn.to_string());
                    ui.label(pass.culled.to_string());
                    ui.end_row();
                }
            });
            ui.separator();
            let p = stats.camera_position;
            ui.label(format!("Camera: ({:.2}, {:.2}, {:.2})", p.x, p.y, p.z));
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene_renderer::DrawStats;

    #[test]
    fn overlay_produces_shapes() {
        let ctx = egui::Context::default();
        let stats = FrameStats {
            frame_index: 7,
            base: DrawStats { drawn: 3, culled: 1 },
            ..Default::default()
        };
        let output = ctx.run(egui::RawInput::default(), |ctx| draw_overlay(ctx, &stats));
        assert!(!output.shapes.is_empty());
    }
}
