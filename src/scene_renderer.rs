//! GPU residency of a loaded scene and the two culled draw passes over it
//!
//! [`SceneRenderer::upload_gpu_resources`] turns a [`SceneAsset`] into vertex
//! and index buffers, one mesh record array, one material record array and a
//! sampled texture per image. Material texture references become indices
//! into the shader-resource heap, or [`ABSENT_TEXTURE`].

use crate::asset::{AssetError, SceneAsset};
use crate::backend::{
    BackendError, BufferHandle, DescriptorView, GraphicsBackend, SamplerDescriptor, SamplerHandle,
    TextureFormat, TextureViewHandle,
};
use crate::pipeline::{DepthPrepass, DrawConstants, ForwardBindings, ForwardPass};
use crate::resources::descriptor::kind::{Sampler, ShaderResource};
use crate::resources::{
    DescriptorError, DescriptorSlot, FormattedBuffer, GpuTexture, GraphicsContext, ResourceError,
    StructuredBuffer, UploadBatch,
};
use crate::scene::{Aabb, Frustum};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use thiserror::Error;

/// Texture index of a material slot with no texture
pub const ABSENT_TEXTURE: i32 = -1;

#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Scene has no meshes to upload")]
    NoMeshes,
    #[error("Scene resources have not been uploaded")]
    NotUploaded,
    #[error("Scene resources are already resident")]
    AlreadyUploaded,
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Per-mesh record read by both passes through `meshes[draw.mesh_index]`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshRecordGpu {
    pub world: Mat4,
    /// Inverse transpose of `world`
    pub normal: Mat4,
    pub aabb_min: Vec4,
    pub aabb_max: Vec4,
}

/// Per-material record; texture indices point into the shader-resource heap
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialRecordGpu {
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub albedo_index: i32,
    pub metallic_roughness_index: i32,
    pub normal_index: i32,
    pub _pad: [i32; 3],
}

/// Draws issued and skipped by one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub drawn: u32,
    pub culled: u32,
}

/// Views the passes render into
#[derive(Debug, Clone, Copy)]
pub struct PassTargets {
    pub color: TextureViewHandle,
    pub depth: TextureViewHandle,
    pub width: u32,
    pub height: u32,
}

struct GpuMesh {
    name: String,
    vertices: StructuredBuffer,
    indices: FormattedBuffer,
    world_bounds: Aabb,
    material_index: u32,
}

/// Everything created by one upload
struct ResidentScene {
    meshes: Vec<GpuMesh>,
    mesh_records: StructuredBuffer,
    material_records: StructuredBuffer,
    materials: Vec<MaterialRecordGpu>,
    images: Vec<GpuTexture>,
    /// One shader-resource slot per glTF texture
    texture_views: Vec<DescriptorSlot<ShaderResource>>,
    bounds: Aabb,
}

pub struct SceneRenderer {
    depth_prepass: DepthPrepass,
    forward: ForwardPass,
    sampler: SamplerHandle,
    sampler_slot: DescriptorSlot<Sampler>,
    scene: Option<ResidentScene>,
}

impl SceneRenderer {
    /// Build both pipelines; `color_format` is the format of the frame targets.
    pub fn new<B: GraphicsBackend>(
        ctx: &mut GraphicsContext<B>,
        color_format: TextureFormat,
    ) -> Result<Self, RendererError> {
        let texture_table_size = ctx.shader_resources().capacity();
        let supported = ctx.backend().max_texture_table_size();
        if texture_table_size > supported {
            return Err(BackendError::LimitExceeded {
                limit: "sampled textures per shader stage",
                requested: texture_table_size,
                supported,
            }
            .into());
        }
        let depth_prepass = DepthPrepass::new(ctx.backend_mut())?;
        let forward = ForwardPass::new(ctx.backend_mut(), color_format, texture_table_size)?;
        let sampler = ctx
            .backend_mut()
            .create_sampler(&SamplerDescriptor::linear_repeat("Material Sampler"))?;
        let sampler_slot = ctx.create_sampler_slot(sampler)?;
        Ok(Self {
            depth_prepass,
            forward,
            sampler,
            sampler_slot,
            scene: None,
        })
    }

    /// Create every GPU resource `asset` needs.
    ///
    /// The copies are recorded, not submitted; the returned batch holds the
    /// staging buffers until the caller has confirmed their completion.
    pub fn upload_gpu_resources<B: GraphicsBackend>(
        &mut self,
        ctx: &mut GraphicsContext<B>,
        asset: &SceneAsset,
    ) -> Result<UploadBatch, RendererError> {
        if self.scene.is_some() {
            return Err(RendererError::AlreadyUploaded);
        }
        if asset.meshes.is_empty() {
            return Err(RendererError::NoMeshes);
        }
        asset.validate()?;

        let mut batch = UploadBatch::new();

        let srgb = srgb_images(asset);
        let mut images = Vec::with_capacity(asset.images.len());
        for (index, image) in asset.images.iter().enumerate() {
            let label = format!("Image {} ({})", index, image.name);
            images.push(GpuTexture::color(
                ctx,
                &label,
                image.width,
                image.height,
                &image.rgba,
                srgb[index],
                &mut batch,
            )?);
        }

        let mut texture_views = Vec::with_capacity(asset.textures.len());
        for texture in &asset.textures {
            let view = images[texture.image].view();
            texture_views.push(ctx.create_shader_resource(DescriptorView::Texture(view))?);
        }

        let resolve = |texture: Option<usize>| -> i32 {
            texture
                .map(|t| texture_views[t].index() as i32)
                .unwrap_or(ABSENT_TEXTURE)
        };
        let mut materials: Vec<MaterialRecordGpu> = asset
            .materials
            .iter()
            .map(|material| MaterialRecordGpu {
                base_color: material.base_color.to_array(),
                metallic: material.metallic,
                roughness: material.roughness,
                albedo_index: resolve(material.base_color_texture),
                metallic_roughness_index: resolve(material.metallic_roughness_texture),
                normal_index: resolve(material.normal_texture),
                _pad: [0; 3],
            })
            .collect();
        // Meshes without a material use this one
        let default_material = materials.len() as u32;
        materials.push(default_material_record());

        let mut meshes = Vec::with_capacity(asset.meshes.len());
        let mut records = Vec::with_capacity(asset.meshes.len());
        let mut bounds = Aabb::EMPTY;
        for (index, mesh) in asset.meshes.iter().enumerate() {
            let vertices = StructuredBuffer::new(
                ctx,
                &format!("{} Vertices", mesh.name),
                &mesh.vertices,
                &mut batch,
            )?;
            let indices = FormattedBuffer::from_u32(
                ctx.backend_mut(),
                &format!("{} Indices", mesh.name),
                &mesh.indices,
                &mut batch,
            )?;
            let world_bounds = mesh.world_bounds();
            bounds = bounds.union(&world_bounds);
            records.push(MeshRecordGpu {
                world: mesh.transform,
                normal: mesh.transform.inverse().transpose(),
                aabb_min: world_bounds.min.extend(1.0),
                aabb_max: world_bounds.max.extend(1.0),
            });
            log::debug!(
                "Mesh {} '{}': {} vertices, {} indices",
                index,
                mesh.name,
                mesh.vertices.len(),
                mesh.indices.len()
            );
            meshes.push(GpuMesh {
                name: mesh.name.clone(),
                vertices,
                indices,
                world_bounds,
                material_index: mesh.material.map_or(default_material, |m| m as u32),
            });
        }

        let mesh_records = StructuredBuffer::new(ctx, "Mesh Records", &records, &mut batch)?;
        let material_records =
            StructuredBuffer::new(ctx, "Material Records", &materials, &mut batch)?;

        log::info!(
            "Uploaded scene: {} meshes, {} materials, {} images, {} staging bytes",
            meshes.len(),
            materials.len(),
            images.len(),
            batch.total_bytes()
        );

        self.scene = Some(ResidentScene {
            meshes,
            mesh_records,
            material_records,
            materials,
            images,
            texture_views,
            bounds,
        });
        Ok(batch)
    }

    fn resident(&self) -> Result<&ResidentScene, RendererError> {
        self.scene.as_ref().ok_or(RendererError::NotUploaded)
    }

    /// Depth-only pass over every mesh whose world bounds meet `frustum`.
    pub fn render_depth_only<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        targets: &PassTargets,
        scene_constants: BufferHandle,
        frustum: &Frustum,
    ) -> Result<DrawStats, RendererError> {
        let scene = self.resident()?;
        self.depth_prepass.begin(
            backend,
            targets.depth,
            (targets.width, targets.height),
            scene_constants,
            scene.mesh_records.handle(),
        );
        let stats = draw_visible(backend, scene, frustum);
        backend.end_render_pass()?;
        Ok(stats)
    }

    /// Shaded pass, tested against the depth written by
    /// [`SceneRenderer::render_depth_only`].
    pub fn render_base_pass<B: GraphicsBackend>(
        &self,
        ctx: &mut GraphicsContext<B>,
        targets: &PassTargets,
        scene_constants: BufferHandle,
        light_constants: BufferHandle,
        frustum: &Frustum,
        clear_color: [f32; 4],
    ) -> Result<DrawStats, RendererError> {
        let scene = self.resident()?;
        let bindings = ForwardBindings {
            scene_constants,
            light_constants,
            mesh_records: scene.mesh_records.handle(),
            material_records: scene.material_records.handle(),
            texture_heap: ctx.shader_resources().heap(),
            sampler_heap: ctx.samplers().heap(),
            sampler_index: self.sampler_slot.index(),
        };
        let backend = ctx.backend_mut();
        self.forward.begin(
            backend,
            targets.color,
            targets.depth,
            (targets.width, targets.height),
            clear_color,
            &bindings,
        );
        let stats = draw_visible(backend, scene, frustum);
        backend.end_render_pass()?;
        Ok(stats)
    }

    pub fn is_uploaded(&self) -> bool {
        self.scene.is_some()
    }

    pub fn mesh_count(&self) -> usize {
        self.scene.as_ref().map_or(0, |s| s.meshes.len())
    }

    /// World-space bounds of the resident scene
    pub fn bounds(&self) -> Option<Aabb> {
        self.scene.as_ref().map(|s| s.bounds)
    }

    /// CPU copy of the uploaded material records; the last one is the default
    pub fn material_records(&self) -> &[MaterialRecordGpu] {
        self.scene
            .as_ref()
            .map(|s| s.materials.as_slice())
            .unwrap_or(&[])
    }

    pub fn material_index(&self, mesh: usize) -> Option<u32> {
        self.scene.as_ref()?.meshes.get(mesh).map(|m| m.material_index)
    }

    /// Vertex and index buffer of a mesh
    pub fn mesh_buffers(&self, mesh: usize) -> Option<(BufferHandle, BufferHandle)> {
        self.scene
            .as_ref()?
            .meshes
            .get(mesh)
            .map(|m| (m.vertices.handle(), m.indices.handle()))
    }

    pub fn mesh_records_buffer(&self) -> Option<BufferHandle> {
        self.scene.as_ref().map(|s| s.mesh_records.handle())
    }

    pub fn material_records_buffer(&self) -> Option<BufferHandle> {
        self.scene.as_ref().map(|s| s.material_records.handle())
    }

    pub fn image(&self, index: usize) -> Option<&GpuTexture> {
        self.scene.as_ref()?.images.get(index)
    }

    pub fn texture_slot(&self, texture: usize) -> Option<DescriptorSlot<ShaderResource>> {
        self.scene.as_ref()?.texture_views.get(texture).copied()
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// Free every scene resource. The GPU must be idle.
    pub fn destroy<B: GraphicsBackend>(
        &mut self,
        ctx: &mut GraphicsContext<B>,
    ) -> Result<(), RendererError> {
        let Some(scene) = self.scene.take() else {
            return Ok(());
        };
        for slot in scene.texture_views {
            ctx.release_shader_resource(slot)?;
        }
        for image in scene.images {
            image.destroy(ctx)?;
        }
        for mesh in scene.meshes {
            log::trace!("Destroying mesh '{}'", mesh.name);
            mesh.vertices.destroy(ctx)?;
            mesh.indices.destroy(ctx.backend_mut())?;
        }
        scene.mesh_records.destroy(ctx)?;
        scene.material_records.destroy(ctx)?;
        log::debug!("Scene resources released");
        Ok(())
    }
}

fn draw_visible<B: GraphicsBackend>(
    backend: &mut B,
    scene: &ResidentScene,
    frustum: &Frustum,
) -> DrawStats {
    let mut stats = DrawStats::default();
    for (index, mesh) in scene.meshes.iter().enumerate() {
        if !frustum.intersects_aabb(&mesh.world_bounds) {
            stats.culled += 1;
            continue;
        }
        let constants = DrawConstants {
            mesh_index: index as u32,
            material_index: mesh.material_index,
        };
        backend.set_push_constants(0, bytemuck::bytes_of(&constants));
        backend.set_vertex_buffer(0, mesh.vertices.vertex_view().buffer, 0);
        let indices = mesh.indices.index_view();
        backend.set_index_buffer(indices.buffer, 0, indices.format);
        backend.draw_indexed(0..indices.count, 0, 0..1);
        stats.drawn += 1;
    }
    stats
}

fn default_material_record() -> MaterialRecordGpu {
    MaterialRecordGpu {
        base_color: [0.8, 0.8, 0.8, 1.0],
        metallic: 0.0,
        roughness: 0.5,
        albedo_index: ABSENT_TEXTURE,
        metallic_roughness_index: ABSENT_TEXTURE,
        normal_index: ABSENT_TEXTURE,
        _pad: [0; 3],
    }
}

/// Images sampled as base color are sRGB; everything else holds linear data.
fn srgb_images(asset: &SceneAsset) -> Vec<bool> {
    let mut srgb = vec![false; asset.images.len()];
    let mut linear = vec![false; asset.images.len()];
    for material in &asset.materials {
        if let Some(texture) = material.base_color_texture {
            srgb[asset.textures[texture].image] = true;
        }
        for texture in [material.metallic_roughness_texture, material.normal_texture]
            .into_iter()
            .flatten()
        {
            linear[asset.textures[texture].image] = true;
        }
    }
    for (index, (s, l)) in srgb.iter_mut().zip(&linear).enumerate() {
        if *s && *l {
            log::warn!("Image {} is used as both color and data, loading it linear", index);
            *s = false;
        }
    }
    srgb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{ImageData, MaterialData, MeshData, TextureData};
    use crate::backend::HeadlessBackend;
    use crate::resources::DescriptorCapacities;
    use crate::scene::Camera;
    use glam::Vec3;

    fn context() -> GraphicsContext<HeadlessBackend> {
        let capacities = DescriptorCapacities {
            shader_resource: 64,
            ..Default::default()
        };
        GraphicsContext::new(HeadlessBackend::new(64, 64), capacities).unwrap()
    }

    fn finish(ctx: &mut GraphicsContext<HeadlessBackend>, mut batch: UploadBatch) {
        let backend = ctx.backend_mut();
        backend.submit().unwrap();
        backend.signal_fence(1).unwrap();
        assert!(backend.wait_for_fence(1, None).unwrap());
        batch.stamp(1);
        batch.release(backend).unwrap();
    }

    #[test]
    fn record_layouts_match_shader() {
        assert_eq!(std::mem::size_of::<MeshRecordGpu>(), 160);
        assert_eq!(std::mem::size_of::<MaterialRecordGpu>(), 48);
    }

    #[test]
    fn texture_table_larger_than_adapter_limit_is_refused() {
        let backend = HeadlessBackend::new(64, 64).with_texture_table_limit(16);
        let capacities = DescriptorCapacities {
            shader_resource: 64,
            ..Default::default()
        };
        let mut ctx = GraphicsContext::new(backend, capacities).unwrap();
        let format = ctx.backend().swapchain_format();
        let result = SceneRenderer::new(&mut ctx, format);
        assert!(matches!(
            result,
            Err(RendererError::Backend(BackendError::LimitExceeded {
                requested: 64,
                supported: 16,
                ..
            }))
        ));
    }

    #[test]
    fn empty_scene_is_rejected() {
        let mut ctx = context();
        let format = ctx.backend().swapchain_format();
        let mut renderer = SceneRenderer::new(&mut ctx, format).unwrap();
        let result = renderer.upload_gpu_resources(&mut ctx, &SceneAsset::new());
        assert!(matches!(result, Err(RendererError::NoMeshes)));
    }

    #[test]
    fn rendering_before_upload_fails() {
        let mut ctx = context();
        let format = ctx.backend().swapchain_format();
        let renderer = SceneRenderer::new(&mut ctx, format).unwrap();
        let frustum = Camera::default().frustum();
        let targets = PassTargets {
            color: TextureViewHandle(0),
            depth: TextureViewHandle(0),
            width: 1,
            height: 1,
        };
        let result =
            renderer.render_depth_only(ctx.backend_mut(), &targets, BufferHandle(0), &frustum);
        assert!(matches!(result, Err(RendererError::NotUploaded)));
    }

    #[test]
    fn meshes_without_material_get_default() {
        let mut ctx = context();
        let format = ctx.backend().swapchain_format();
        let mut renderer = SceneRenderer::new(&mut ctx, format).unwrap();
        let mut asset = SceneAsset::new();
        asset.materials.push(MaterialData::new("red").with_base_color(Vec4::new(1.0, 0.0, 0.0, 1.0)));
        asset.meshes.push(MeshData::cube("plain", 1.0));
        asset.meshes.push(MeshData::cube("red", 1.0).with_material(0));

        let batch = renderer.upload_gpu_resources(&mut ctx, &asset).unwrap();
        finish(&mut ctx, batch);

        assert_eq!(renderer.material_records().len(), 2);
        assert_eq!(renderer.material_index(0), Some(1));
        assert_eq!(renderer.material_index(1), Some(0));
        assert_eq!(renderer.material_records()[1], default_material_record());

        let uploaded = ctx
            .backend()
            .buffer_contents(renderer.material_records_buffer().unwrap())
            .unwrap();
        let first: MaterialRecordGpu = bytemuck::pod_read_unaligned(&uploaded[..48]);
        assert_eq!(first.base_color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(first.albedo_index, ABSENT_TEXTURE);
    }

    #[test]
    fn second_upload_is_refused() {
        let mut ctx = context();
        let format = ctx.backend().swapchain_format();
        let mut renderer = SceneRenderer::new(&mut ctx, format).unwrap();
        let mut asset = SceneAsset::new();
        asset.meshes.push(MeshData::cube("cube", 1.0));
        let batch = renderer.upload_gpu_resources(&mut ctx, &asset).unwrap();
        finish(&mut ctx, batch);
        assert!(matches!(
            renderer.upload_gpu_resources(&mut ctx, &asset),
            Err(RendererError::AlreadyUploaded)
        ));
    }

    #[test]
    fn shared_image_prefers_linear() {
        let mut asset = SceneAsset::new();
        asset.images.push(ImageData::solid_color([255; 4], "a"));
        asset.images.push(ImageData::solid_color([128; 4], "b"));
        asset.textures.push(TextureData { name: None, image: 0 });
        asset.textures.push(TextureData { name: None, image: 1 });
        asset.materials.push(
            MaterialData::new("m")
                .with_base_color_texture(0)
                .with_normal_texture(1)
                .with_metallic_roughness_texture(0),
        );
        assert_eq!(srgb_images(&asset), vec![false, false]);

        asset.materials[0].metallic_roughness_texture = None;
        assert_eq!(srgb_images(&asset), vec![true, false]);
    }

    #[test]
    fn culled_meshes_are_counted() {
        let mut ctx = context();
        let format = ctx.backend().swapchain_format();
        let mut renderer = SceneRenderer::new(&mut ctx, format).unwrap();
        let mut asset = SceneAsset::new();
        asset.meshes.push(MeshData::cube("visible", 1.0));
        asset.meshes.push(
            MeshData::cube("behind", 1.0).with_transform(Mat4::from_translation(Vec3::Z * 50.0)),
        );
        let batch = renderer.upload_gpu_resources(&mut ctx, &asset).unwrap();
        finish(&mut ctx, batch);

        let depth = GpuTexture::depth(&mut ctx, "Depth", 64, 64).unwrap();
        let camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
        let targets = PassTargets {
            color: depth.view(),
            depth: depth.view(),
            width: 64,
            height: 64,
        };
        let stats = renderer
            .render_depth_only(ctx.backend_mut(), &targets, BufferHandle(0), &camera.frustum())
            .unwrap();
        assert_eq!(stats, DrawStats { drawn: 1, culled: 1 });

        let pass = ctx.backend().pass_log().last().unwrap();
        assert_eq!(pass.draws.len(), 1);
        assert_eq!(pass.draws[0].push_constant_u32(0), Some(0));
    }
}
