//! Material, texture and image data

use glam::Vec4;
use image::DynamicImage;

/// Metallic-roughness material as read from the asset
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialData {
    pub name: String,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,

    /// Indices into [`super::SceneAsset::textures`]
    pub base_color_texture: Option<usize>,
    pub metallic_roughness_texture: Option<usize>,
    pub normal_texture: Option<usize>,
}

impl Default for MaterialData {
    fn default() -> Self {
        // glTF defaults
        Self {
            name: "default".to_string(),
            base_color: Vec4::ONE,
            metallic: 1.0,
            roughness: 1.0,
            base_color_texture: None,
            metallic_roughness_texture: None,
            normal_texture: None,
        }
    }
}

impl MaterialData {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color = color;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic = metallic;
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn with_base_color_texture(mut self, texture: usize) -> Self {
        self.base_color_texture = Some(texture);
        self
    }

    pub fn with_metallic_roughness_texture(mut self, texture: usize) -> Self {
        self.metallic_roughness_texture = Some(texture);
        self
    }

    pub fn with_normal_texture(mut self, texture: usize) -> Self {
        self.normal_texture = Some(texture);
        self
    }

    /// Albedo, metallic-roughness and normal texture references, in that order
    pub fn texture_refs(&self) -> [Option<usize>; 3] {
        [
            self.base_color_texture,
            self.metallic_roughness_texture,
            self.normal_texture,
        ]
    }
}

/// A glTF texture: which image it samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub name: Option<String>,
    /// Index into [`super::SceneAsset::images`]
    pub image: usize,
}

/// Decoded image, tightly packed RGBA8 rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl ImageData {
    pub fn from_image(image: DynamicImage, name: &str) -> Self {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self {
            name: name.to_string(),
            width,
            height,
            rgba: rgba.into_raw(),
        }
    }

    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: 1,
            height: 1,
            rgba: color.to_vec(),
        }
    }

    /// Two-color checkerboard with `cell`-pixel squares
    pub fn checkerboard(size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = cell.max(1);
        let mut rgba = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let even = ((x / cell) + (y / cell)) % 2 == 0;
                rgba.extend_from_slice(if even { &a } else { &b });
            }
        }
        Self {
            name: "checkerboard".to_string(),
            width: size,
            height: size,
            rgba,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkerboard_alternates() {
        let image = ImageData::checkerboard(4, 2, [255; 4], [0, 0, 0, 255]);
        assert_eq!(image.rgba.len(), 64);
        assert_eq!(&image.rgba[0..4], &[255; 4]);
        assert_eq!(&image.rgba[8..12], &[0, 0, 0, 255]);
        // Third row starts a new band of cells
        assert_eq!(&image.rgba[32..36], &[0, 0, 0, 255]);
    }

    #[test]
    fn grayscale_images_expand_to_rgba() {
        let gray = image::GrayImage::from_raw(2, 1, vec![10, 200]).unwrap();
        let data = ImageData::from_image(DynamicImage::ImageLuma8(gray), "gray");
        assert_eq!(data.rgba, vec![10, 10, 10, 255, 200, 200, 200, 255]);
    }

    #[test]
    fn texture_refs_keep_order() {
        let material = MaterialData::new("m")
            .with_normal_texture(2)
            .with_base_color_texture(0);
        assert_eq!(material.texture_refs(), [Some(0), None, Some(2)]);
    }
}
