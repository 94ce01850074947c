//! CPU-side scene data handed to the renderer
//!
//! A [`SceneAsset`] is what the glTF adapter produces and what
//! [`crate::scene_renderer::SceneRenderer::upload_gpu_resources`] consumes.
//! Indices between its arrays are plain `usize`s into the sibling arrays.

pub mod gltf;
mod material;
mod mesh;

pub use material::{ImageData, MaterialData, TextureData};
pub use mesh::MeshData;

use crate::scene::Aabb;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("No asset path was given")]
    Missing,
    #[error("Asset file {0} does not exist")]
    NotFound(PathBuf),
    #[error("glTF import failed: {0}")]
    Import(#[from] gltf_dep::Error),
    #[error("Mesh {mesh} primitive {primitive} has no POSITION attribute")]
    MissingPositions { mesh: usize, primitive: usize },
    #[error("Image {index} has unsupported pixel format {format}")]
    UnsupportedImageFormat { index: usize, format: String },
    #[error("Image {index} pixel data does not match {width}x{height}")]
    ImageData { index: usize, width: u32, height: u32 },
    #[error("{owner} {index} references {target} {reference}, which does not exist")]
    DanglingReference {
        owner: &'static str,
        index: usize,
        target: &'static str,
        reference: usize,
    },
    #[error("Mesh {mesh} index {value} is out of range for {vertices} vertices")]
    IndexOutOfRange { mesh: usize, value: u32, vertices: usize },
    #[error("Mesh {mesh} has {count} vertices, more than 32-bit indices can address")]
    TooManyVertices { mesh: usize, count: usize },
    #[error("Asset contains no meshes")]
    NoMeshes,
}

/// Meshes, materials and images of one loaded model
#[derive(Debug, Clone, Default)]
pub struct SceneAsset {
    pub meshes: Vec<MeshData>,
    pub materials: Vec<MaterialData>,
    pub images: Vec<ImageData>,
    /// glTF textures: each points at one image
    pub textures: Vec<TextureData>,
}

impl SceneAsset {
    pub fn new() -> Self {
        Self::default()
    }

    /// World-space bounds of every mesh
    pub fn bounds(&self) -> Aabb {
        self.meshes
            .iter()
            .fold(Aabb::EMPTY, |acc, mesh| acc.union(&mesh.world_bounds()))
    }

    pub fn triangle_count(&self) -> usize {
        self.meshes.iter().map(|m| m.indices.len() / 3).sum()
    }

    /// Check every cross reference before anything is uploaded.
    pub fn validate(&self) -> Result<(), AssetError> {
        if self.meshes.is_empty() {
            return Err(AssetError::NoMeshes);
        }
        for (index, mesh) in self.meshes.iter().enumerate() {
            if let Some(material) = mesh.material {
                if material >= self.materials.len() {
                    return Err(AssetError::DanglingReference {
                        owner: "mesh",
                        index,
                        target: "material",
                        reference: material,
                    });
                }
            }
            let vertices = mesh.vertices.len();
            if let Some(&value) = mesh.indices.iter().find(|&&i| i as usize >= vertices) {
                return Err(AssetError::IndexOutOfRange {
                    mesh: index,
                    value,
                    vertices,
                });
            }
        }
        for (index, material) in self.materials.iter().enumerate() {
            for texture in material.texture_refs().into_iter().flatten() {
                if texture >= self.textures.len() {
                    return Err(AssetError::DanglingReference {
                        owner: "material",
                        index,
                        target: "texture",
                        reference: texture,
                    });
                }
            }
        }
        for (index, texture) in self.textures.iter().enumerate() {
            if texture.image >= self.images.len() {
                return Err(AssetError::DanglingReference {
                    owner: "texture",
                    index,
                    target: "image",
                    reference: texture.image,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat4, Vec3};

    fn two_cubes() -> SceneAsset {
        let mut asset = SceneAsset::new();
        asset.meshes.push(MeshData::cube("a", 1.0));
        asset
            .meshes
            .push(MeshData::cube("b", 1.0).with_transform(Mat4::from_translation(Vec3::X * 4.0)));
        asset
    }

    #[test]
    fn bounds_cover_all_meshes() {
        let bounds = two_cubes().bounds();
        assert_eq!(bounds.min, Vec3::splat(-0.5));
        assert_eq!(bounds.max, Vec3::new(4.5, 0.5, 0.5));
    }

    #[test]
    fn empty_asset_is_rejected() {
        assert!(matches!(SceneAsset::new().validate(), Err(AssetError::NoMeshes)));
    }

    #[test]
    fn dangling_material_is_rejected() {
        let mut asset = two_cubes();
        asset.meshes[1].material = Some(3);
        assert!(matches!(
            asset.validate(),
            Err(AssetError::DanglingReference {
                owner: "mesh",
                index: 1,
                reference: 3,
                ..
            })
        ));
    }

    #[test]
    fn texture_must_point_at_an_image() {
        let mut asset = two_cubes();
        asset.materials.push(MaterialData::new("textured").with_base_color_texture(0));
        asset.textures.push(TextureData {
            name: None,
            image: 0,
        });
        assert!(asset.validate().is_err());

        asset.images.push(ImageData::solid_color([255, 0, 0, 255], "red"));
        asset.meshes[0].material = Some(0);
        asset.validate().unwrap();
    }
}
