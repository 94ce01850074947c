//! Mesh data and procedural fixtures

use crate::backend::Vertex;
use crate::scene::Aabb;
use glam::{Mat4, Vec2, Vec3};

/// One glTF primitive: geometry, placement and material
#[derive(Debug, Clone)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Object-to-world transform, with every parent node applied
    pub transform: Mat4,
    /// Object-space bounds of the positions
    pub bounds: Aabb,
    /// Index into [`super::SceneAsset::materials`]; `None` uses the default material
    pub material: Option<usize>,
}

impl MeshData {
    pub fn new(name: impl Into<String>, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let bounds = Aabb::from_points(vertices.iter().map(|v| v.position));
        Self {
            name: name.into(),
            vertices,
            indices,
            transform: Mat4::IDENTITY,
            bounds,
            material: None,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_material(mut self, material: usize) -> Self {
        self.material = Some(material);
        self
    }

    pub fn world_bounds(&self) -> Aabb {
        self.bounds.transformed(&self.transform)
    }

    /// Axis-aligned cube of edge `size` centered at the origin
    pub fn cube(name: &str, size: f32) -> Self {
        let h = size * 0.5;
        let faces = [
            (Vec3::Z, Vec3::X),
            (Vec3::NEG_Z, Vec3::NEG_X),
            (Vec3::X, Vec3::NEG_Z),
            (Vec3::NEG_X, Vec3::Z),
            (Vec3::Y, Vec3::X),
            (Vec3::NEG_Y, Vec3::X),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, right) in faces {
            let up = normal.cross(right);
            let base = vertices.len() as u32;
            for (u, v) in [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
                let offset = right * (u * 2.0 - 1.0) + up * (1.0 - v * 2.0);
                let mut vertex = Vertex::new((normal + offset) * h, normal, Vec2::new(u, v));
                vertex.tangent = right.extend(1.0);
                vertices.push(vertex);
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self::new(name, vertices, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_is_closed_and_bounded() {
        let cube = MeshData::cube("cube", 2.0);
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert_eq!(cube.bounds, Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0)));
        for v in &cube.vertices {
            // Every corner sits on the face its normal points out of
            assert!((v.position.dot(v.normal) - 1.0).abs() < 1e-5);
            assert_eq!(v.tangent.w, 1.0);
        }
    }

    #[test]
    fn cube_winding_faces_outward() {
        let cube = MeshData::cube("cube", 1.0);
        for tri in cube.indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|i| cube.vertices[tri[i] as usize]);
            let face_normal = (b.position - a.position).cross(c.position - a.position);
            assert!(face_normal.dot(a.normal) > 0.0);
        }
    }

    #[test]
    fn world_bounds_follow_transform() {
        let cube = MeshData::cube("cube", 1.0)
            .with_transform(Mat4::from_scale_rotation_translation(
                Vec3::splat(2.0),
                glam::Quat::IDENTITY,
                Vec3::new(0.0, 10.0, 0.0),
            ));
        let world = cube.world_bounds();
        assert_eq!(world.min, Vec3::new(-1.0, 9.0, -1.0));
        assert_eq!(world.max, Vec3::new(1.0, 11.0, 1.0));
    }
}
