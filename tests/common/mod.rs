//! Shared fixtures for the headless integration tests

#![allow(dead_code)]

use glam::{Mat4, Vec3, Vec4};
use scene_viewer::asset::{ImageData, MaterialData, MeshData, SceneAsset, TextureData};
use scene_viewer::backend::{GraphicsBackend, HeadlessBackend};
use scene_viewer::resources::{DescriptorCapacities, GraphicsContext, UploadBatch};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

/// Headless context with room for a handful of textures
pub fn headless_context() -> GraphicsContext<HeadlessBackend> {
    let capacities = DescriptorCapacities {
        shader_resource: 64,
        ..Default::default()
    };
    GraphicsContext::new(HeadlessBackend::new(WIDTH, HEIGHT), capacities)
        .expect("headless context")
}

/// Submit recorded uploads, wait on `fence` and free the staging buffers.
pub fn flush_uploads(ctx: &mut GraphicsContext<HeadlessBackend>, mut batch: UploadBatch, fence: u64) {
    let backend = ctx.backend_mut();
    backend.submit().expect("submit");
    backend.signal_fence(fence).expect("signal");
    assert!(backend.wait_for_fence(fence, None).expect("wait"));
    batch.stamp(fence);
    batch.release(backend).expect("release staging");
}

pub const PLAIN_COLOR: Vec4 = Vec4::new(0.2, 0.6, 0.9, 1.0);

/// Mesh A: flat colored material, no textures.
/// Mesh B: a 2x2 checkerboard albedo, shifted along +X.
pub fn two_mesh_scene() -> SceneAsset {
    let mut asset = SceneAsset::new();
    asset
        .images
        .push(ImageData::checkerboard(2, 1, [255, 0, 0, 255], [0, 0, 255, 255]));
    asset.textures.push(TextureData {
        name: Some("albedo".to_string()),
        image: 0,
    });
    asset
        .materials
        .push(
            MaterialData::new("plain")
                .with_base_color(PLAIN_COLOR)
                .with_metallic(0.25)
                .with_roughness(0.7),
        );
    asset
        .materials
        .push(MaterialData::new("textured").with_base_color_texture(0));
    asset.meshes.push(MeshData::cube("a", 1.0).with_material(0));
    asset.meshes.push(
        MeshData::cube("b", 1.0)
            .with_transform(Mat4::from_translation(Vec3::X * 1.5))
            .with_material(1),
    );
    asset
}
