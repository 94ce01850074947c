//! Scene lighting

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// Directional light (like the sun)
#[derive(Debug, Clone)]
pub struct DirectionalLight {
    /// Direction the light travels in
    pub direction: Vec3,
    pub color: Vec3,
    pub intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.5, -1.0, -0.5).normalize(),
            color: Vec3::ONE,
            intensity: 3.0,
        }
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize_or_zero(),
            color,
            intensity,
        }
    }
}

/// One directional light and the ambient term
#[derive(Debug, Clone)]
pub struct SceneLighting {
    pub sun: DirectionalLight,
    pub ambient: Vec3,
}

impl Default for SceneLighting {
    fn default() -> Self {
        Self {
            sun: DirectionalLight::default(),
            ambient: Vec3::splat(0.08),
        }
    }
}

impl SceneLighting {
    pub fn constants(&self) -> LightConstants {
        LightConstants {
            direction: self.sun.direction.extend(0.0),
            color_intensity: self.sun.color.extend(self.sun.intensity),
            ambient: self.ambient.extend(1.0),
        }
    }
}

/// Light constant buffer contents
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct LightConstants {
    /// xyz = direction the light travels in
    pub direction: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// xyz = ambient color
    pub ambient: Vec4,
}
