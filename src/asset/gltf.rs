//! glTF import into a [`SceneAsset`]
//!
//! Walks the default scene with accumulated node transforms and emits one
//! [`MeshData`] per triangle primitive. Missing optional attributes are
//! replaced with defaults and reported once per load.

use super::{AssetError, ImageData, MaterialData, MeshData, SceneAsset, TextureData};
use crate::backend::Vertex;
use glam::{Mat4, Vec2, Vec3, Vec4};
use image::{DynamicImage, ImageBuffer};
use std::path::Path;

/// Primitives that needed default attributes
#[derive(Debug, Default)]
struct Substitutions {
    normals: usize,
    tex_coords: usize,
    colors: usize,
    tangents: usize,
    skipped_primitives: usize,
}

impl Substitutions {
    fn report(&self, path: &Path) {
        if self.normals > 0 {
            log::warn!("{}: {} primitives without normals, using +Y", path.display(), self.normals);
        }
        if self.tex_coords > 0 {
            log::warn!("{}: {} primitives without UVs, using 0,0", path.display(), self.tex_coords);
        }
        if self.colors > 0 {
            log::debug!("{}: {} primitives without vertex colors, using white", path.display(), self.colors);
        }
        if self.tangents > 0 {
            log::warn!(
                "{}: {} primitives without tangents, normal maps disabled for them",
                path.display(),
                self.tangents
            );
        }
        if self.skipped_primitives > 0 {
            log::warn!(
                "{}: skipped {} non-triangle primitives",
                path.display(),
                self.skipped_primitives
            );
        }
    }
}

/// Load a `.gltf` or `.glb` file, resolving external buffers and images
/// relative to it.
pub fn load_gltf(path: &Path) -> Result<SceneAsset, AssetError> {
    if !path.exists() {
        return Err(AssetError::NotFound(path.to_path_buf()));
    }
    let (document, buffers, images) = gltf_dep::import(path)?;

    let image_names: Vec<String> = document
        .images()
        .map(|image| {
            image
                .name()
                .map(String::from)
                .unwrap_or_else(|| format!("image{}", image.index()))
        })
        .collect();
    let images = images
        .into_iter()
        .zip(image_names)
        .enumerate()
        .map(|(index, (data, name))| convert_image(index, data, &name))
        .collect::<Result<Vec<_>, _>>()?;

    let textures = document
        .textures()
        .map(|texture| TextureData {
            name: texture.name().map(String::from),
            image: texture.source().index(),
        })
        .collect();

    let materials = document.materials().map(|m| load_material(&m)).collect();

    let mut substitutions = Substitutions::default();
    let mut meshes = Vec::new();
    let roots: Vec<gltf_dep::Node> = match document.default_scene() {
        Some(scene) => scene.nodes().collect(),
        None if document.scenes().len() > 0 => {
            document.scenes().flat_map(|scene| scene.nodes()).collect()
        }
        None => parentless_nodes(&document),
    };
    for node in roots {
        visit_node(&node, Mat4::IDENTITY, &buffers, &mut meshes, &mut substitutions)?;
    }
    substitutions.report(path);

    let asset = SceneAsset {
        meshes,
        materials,
        images,
        textures,
    };
    asset.validate()?;
    log::info!(
        "Loaded {}: {} meshes, {} triangles, {} materials, {} images",
        path.display(),
        asset.meshes.len(),
        asset.triangle_count(),
        asset.materials.len(),
        asset.images.len()
    );
    Ok(asset)
}

fn parentless_nodes<'a>(document: &'a gltf_dep::Document) -> Vec<gltf_dep::Node<'a>> {
    let mut is_child = vec![false; document.nodes().len()];
    for node in document.nodes() {
        for child in node.children() {
            is_child[child.index()] = true;
        }
    }
    document
        .nodes()
        .filter(|node| !is_child[node.index()])
        .collect()
}

fn load_material(material: &gltf_dep::Material) -> MaterialData {
    let pbr = material.pbr_metallic_roughness();
    MaterialData {
        name: material
            .name()
            .map(String::from)
            .unwrap_or_else(|| format!("material{}", material.index().unwrap_or(0))),
        base_color: Vec4::from_array(pbr.base_color_factor()),
        metallic: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        base_color_texture: pbr.base_color_texture().map(|t| t.texture().index()),
        metallic_roughness_texture: pbr.metallic_roughness_texture().map(|t| t.texture().index()),
        normal_texture: material.normal_texture().map(|t| t.texture().index()),
    }
}

fn visit_node(
    node: &gltf_dep::Node,
    parent: Mat4,
    buffers: &[gltf_dep::buffer::Data],
    meshes: &mut Vec<MeshData>,
    substitutions: &mut Substitutions,
) -> Result<(), AssetError> {
    let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        let primitive_count = mesh.primitives().len();
        for primitive in mesh.primitives() {
            if primitive.mode() != gltf_dep::mesh::Mode::Triangles {
                substitutions.skipped_primitives += 1;
                continue;
            }
            let name = match mesh.name() {
                Some(name) if primitive_count > 1 => format!("{}_prim{}", name, primitive.index()),
                Some(name) => name.to_string(),
                None => format!("mesh{}_prim{}", mesh.index(), primitive.index()),
            };
            let data = load_primitive(&mesh, &primitive, buffers, substitutions, name)?;
            meshes.push(data.with_transform(world));
        }
    }

    for child in node.children() {
        visit_node(&child, world, buffers, meshes, substitutions)?;
    }
    Ok(())
}

fn load_primitive(
    mesh: &gltf_dep::Mesh,
    primitive: &gltf_dep::Primitive,
    buffers: &[gltf_dep::buffer::Data],
    substitutions: &mut Substitutions,
    name: String,
) -> Result<MeshData, AssetError> {
    let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));

    let positions: Vec<Vec3> = reader
        .read_positions()
        .ok_or(AssetError::MissingPositions {
            mesh: mesh.index(),
            primitive: primitive.index(),
        })?
        .map(Vec3::from_array)
        .collect();
    let count = positions.len();

    let normals: Vec<Vec3> = match reader.read_normals() {
        Some(normals) => normals.map(Vec3::from_array).collect(),
        None => {
            substitutions.normals += 1;
            vec![Vec3::Y; count]
        }
    };
    let uvs: Vec<Vec2> = match reader.read_tex_coords(0) {
        Some(uvs) => uvs.into_f32().map(Vec2::from_array).collect(),
        None => {
            substitutions.tex_coords += 1;
            vec![Vec2::ZERO; count]
        }
    };
    let colors: Vec<Vec4> = match reader.read_colors(0) {
        Some(colors) => colors.into_rgba_f32().map(Vec4::from_array).collect(),
        None => {
            substitutions.colors += 1;
            vec![Vec4::ONE; count]
        }
    };
    let tangents: Vec<Vec4> = match reader.read_tangents() {
        Some(tangents) => tangents.map(Vec4::from_array).collect(),
        None => {
            substitutions.tangents += 1;
            vec![Vec4::ZERO; count]
        }
    };

    let vertices = (0..count)
        .map(|i| Vertex {
            position: positions[i],
            normal: normals.get(i).copied().unwrap_or(Vec3::Y),
            uv: uvs.get(i).copied().unwrap_or(Vec2::ZERO),
            color: colors.get(i).copied().unwrap_or(Vec4::ONE),
            tangent: tangents.get(i).copied().unwrap_or(Vec4::ZERO),
        })
        .collect();

    let indices = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => sequential_indices(mesh.index(), count)?,
    };

    let mut data = MeshData::new(name, vertices, indices);
    data.material = primitive.material().index();
    Ok(data)
}

/// Index list for a non-indexed primitive: one index per vertex.
fn sequential_indices(mesh: usize, count: usize) -> Result<Vec<u32>, AssetError> {
    let count = u32::try_from(count).map_err(|_| AssetError::TooManyVertices { mesh, count })?;
    Ok((0..count).collect())
}

/// Widen any supported glTF pixel layout to RGBA8.
fn convert_image(
    index: usize,
    data: gltf_dep::image::Data,
    name: &str,
) -> Result<ImageData, AssetError> {
    use gltf_dep::image::Format;

    let gltf_dep::image::Data {
        pixels,
        format,
        width,
        height,
    } = data;
    let wide = |pixels: &[u8]| -> Vec<u16> {
        pixels
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    };
    let image = match format {
        Format::R8 => ImageBuffer::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        Format::R8G8 => ImageBuffer::from_raw(width, height, pixels).map(DynamicImage::ImageLumaA8),
        Format::R8G8B8 => ImageBuffer::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        Format::R8G8B8A8 => ImageBuffer::from_raw(width, height, pixels).map(DynamicImage::ImageRgba8),
        Format::R16 => ImageBuffer::from_raw(width, height, wide(&pixels)).map(DynamicImage::ImageLuma16),
        Format::R16G16B16 => ImageBuffer::from_raw(width, height, wide(&pixels)).map(DynamicImage::ImageRgb16),
        Format::R16G16B16A16 => {
            ImageBuffer::from_raw(width, height, wide(&pixels)).map(DynamicImage::ImageRgba16)
        }
        other => {
            return Err(AssetError::UnsupportedImageFormat {
                index,
                format: format!("{:?}", other),
            })
        }
    };
    let image = image.ok_or(AssetError::ImageData {
        index,
        width,
        height,
    })?;
    Ok(ImageData::from_image(image, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gltf_dep::image::{Data, Format};

    #[test]
    fn rgb_images_gain_opaque_alpha() {
        let data = Data {
            pixels: vec![1, 2, 3, 4, 5, 6],
            format: Format::R8G8B8,
            width: 2,
            height: 1,
        };
        let image = convert_image(0, data, "rgb").unwrap();
        assert_eq!(image.rgba, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn truncated_pixels_are_rejected() {
        let data = Data {
            pixels: vec![0; 7],
            format: Format::R8G8B8A8,
            width: 2,
            height: 1,
        };
        assert!(matches!(
            convert_image(3, data, "short"),
            Err(AssetError::ImageData { index: 3, .. })
        ));
    }

    #[test]
    fn non_indexed_primitives_get_sequential_indices() {
        assert_eq!(sequential_indices(0, 4).unwrap(), vec![0, 1, 2, 3]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn vertex_counts_beyond_u32_are_rejected() {
        let count = u32::MAX as usize + 1;
        assert!(matches!(
            sequential_indices(2, count),
            Err(AssetError::TooManyVertices { mesh: 2, count: c }) if c == count
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let result = load_gltf(Path::new("does/not/exist.glb"));
        assert!(matches!(result, Err(AssetError::NotFound(_))));
    }
}
