//! Scene render passes
//!
//! Two passes draw the scene each frame:
//! 1. Depth pre-pass - depth only, no color targets
//! 2. Forward pass - shaded color, tested against the pre-pass depth
//!
//! Both read per-draw mesh and material indices from push constants.

pub mod depth_prepass;
pub mod forward_pass;

pub use depth_prepass::DepthPrepass;
pub use forward_pass::{ForwardBindings, ForwardPass};

use bytemuck::{Pod, Zeroable};

/// Per-draw root constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawConstants {
    pub mesh_index: u32,
    pub material_index: u32,
}

pub const DRAW_CONSTANTS_SIZE: u32 = std::mem::size_of::<DrawConstants>() as u32;

/// Background color of the forward pass
pub const CLEAR_COLOR: [f32; 4] = [0.05, 0.05, 0.08, 1.0];

/// WGSL declarations shared by both passes. Must match
/// [`crate::scene::SceneConstants`], [`crate::scene_renderer::MeshRecordGpu`]
/// and [`DrawConstants`].
const SHADER_COMMON: &str = r#"
struct SceneConstants {
    view_projection: mat4x4<f32>,
    view: mat4x4<f32>,
    camera_position: vec4<f32>,
    viewport: vec4<f32>,
}

struct MeshRecord {
    world: mat4x4<f32>,
    normal: mat4x4<f32>,
    aabb_min: vec4<f32>,
    aabb_max: vec4<f32>,
}

struct DrawConstants {
    mesh_index: u32,
    material_index: u32,
}

var<push_constant> draw: DrawConstants;
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GraphicsBackend, HeadlessBackend, TextureFormat};

    #[test]
    fn both_pipelines_build() {
        let mut backend = HeadlessBackend::new(4, 4);
        DepthPrepass::new(&mut backend).unwrap();
        let format = backend.swapchain_format();
        let forward = ForwardPass::new(&mut backend, format, 64).unwrap();
        assert_eq!(forward.texture_table_size(), 64);
        assert_eq!(format, TextureFormat::Rgba8UnormSrgb);
    }

    #[test]
    fn texture_table_size_lands_in_shader() {
        let source = forward_pass::forward_shader(256);
        assert!(source.contains("binding_array<texture_2d<f32>, 256>"));
        assert!(source.contains("var<push_constant> draw: DrawConstants;"));
    }
}
