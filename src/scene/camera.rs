//! Camera and per-frame scene constants

use super::frustum::{Aabb, Frustum};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Perspective projection parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    /// Vertical field of view in radians
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            fov_y: std::f32::consts::FRAC_PI_4,
            aspect: 4.0 / 3.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    /// Right-handed projection with a 0..1 depth range
    pub fn matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far)
    }
}

/// Camera for viewing the scene
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::default(),
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            ..Default::default()
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection.matrix()
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize_or_zero()
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection_matrix())
    }

    pub fn set_aspect(&mut self, width: f32, height: f32) {
        if height > 0.0 {
            self.projection.aspect = width / height;
        }
    }

    /// Place the camera so the whole of `bounds` is in view, looking at its
    /// center from the front and slightly above.
    pub fn frame_bounds(&mut self, bounds: &Aabb) {
        let center = bounds.center();
        let radius = bounds.half_extent().length().max(0.01);
        let half_fov = self.projection.fov_y * 0.5;
        let distance = radius / half_fov.sin();
        let direction = Vec3::new(0.0, 0.35, 1.0).normalize();

        self.target = center;
        self.position = center + direction * distance;
        self.projection.near = (distance - radius).max(distance * 0.001).max(0.01);
        self.projection.far = (distance + radius) * 4.0;
    }

    /// Constants shared by both scene passes
    pub fn scene_constants(&self, width: u32, height: u32) -> SceneConstants {
        let view = self.view_matrix();
        SceneConstants {
            view_projection: self.projection_matrix() * view,
            view,
            camera_position: self.position.extend(1.0),
            viewport: Vec4::new(
                width as f32,
                height as f32,
                self.projection.near,
                self.projection.far,
            ),
        }
    }
}

/// Scene constant buffer contents
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SceneConstants {
    pub view_projection: Mat4,
    pub view: Mat4,
    pub camera_position: Vec4,
    /// x = width, y = height, z = near, w = far
    pub viewport: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framed_bounds_are_visible() {
        let bounds = Aabb::new(Vec3::new(10.0, -2.0, 3.0), Vec3::new(14.0, 2.0, 5.0));
        let mut camera = Camera::default();
        camera.frame_bounds(&bounds);

        assert!(camera.frustum().intersects_aabb(&bounds));
        assert!((camera.target - bounds.center()).length() < 1e-5);
        assert!(camera.projection.near > 0.0);
        assert!(camera.projection.far > camera.projection.near);
    }

    #[test]
    fn constants_carry_viewport() {
        let camera = Camera::default();
        let constants = camera.scene_constants(800, 600);
        assert_eq!(constants.viewport.x, 800.0);
        assert_eq!(constants.viewport.y, 600.0);
        assert_eq!(constants.camera_position.truncate(), camera.position);
        assert_eq!(std::mem::size_of::<SceneConstants>(), 160);
    }
}
