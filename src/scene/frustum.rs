//! View frustum and bounding boxes for culling

use glam::{Mat4, Vec3, Vec4};

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Box containing nothing; the identity for [`Aabb::union`]
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |aabb, p| Self {
            min: aabb.min.min(p),
            max: aabb.max.max(p),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extent(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// World-space box enclosing this box after `transform`
    pub fn transformed(&self, transform: &Mat4) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        Self::from_points(self.corners().map(|c| transform.transform_point3(c)))
    }
}

/// Plane `normal . p + d = 0`; points with a positive distance are inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    fn from_row(row: Vec4) -> Self {
        let normal = row.truncate();
        let len = normal.length();
        if len > 0.0 {
            Self {
                normal: normal / len,
                d: row.w / len,
            }
        } else {
            Self { normal, d: row.w }
        }
    }

    pub fn distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }
}

/// Six inward-facing planes: left, right, bottom, top, near, far
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract the planes of a view-projection matrix with a 0..1 clip depth.
    pub fn from_view_projection(m: &Mat4) -> Self {
        let (r0, r1, r2, r3) = (m.row(0), m.row(1), m.row(2), m.row(3));
        Self {
            planes: [
                Plane::from_row(r3 + r0),
                Plane::from_row(r3 - r0),
                Plane::from_row(r3 + r1),
                Plane::from_row(r3 - r1),
                Plane::from_row(r2),
                Plane::from_row(r3 - r2),
            ],
        }
    }

    /// False only when the box lies entirely outside one of the planes.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        if aabb.is_empty() {
            return false;
        }
        self.planes.iter().all(|plane| {
            // Corner furthest along the plane normal
            let positive = Vec3::select(plane.normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            plane.distance(positive) >= 0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn frustum() -> Frustum {
        // Looking down -Z from the origin
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        Frustum::from_view_projection(&(proj * view))
    }

    fn unit_box_at(center: Vec3) -> Aabb {
        Aabb::new(center - Vec3::splat(0.5), center + Vec3::splat(0.5))
    }

    #[rstest]
    #[case::ahead(Vec3::new(0.0, 0.0, -5.0), true)]
    #[case::behind(Vec3::new(0.0, 0.0, 5.0), false)]
    #[case::far_left(Vec3::new(-50.0, 0.0, -5.0), false)]
    #[case::far_right(Vec3::new(50.0, 0.0, -5.0), false)]
    #[case::above(Vec3::new(0.0, 50.0, -5.0), false)]
    #[case::below(Vec3::new(0.0, -50.0, -5.0), false)]
    #[case::past_far_plane(Vec3::new(0.0, 0.0, -200.0), false)]
    #[case::straddling_near_plane(Vec3::new(0.0, 0.0, -0.2), true)]
    #[case::straddling_left_edge(Vec3::new(-5.3, 0.0, -5.0), true)]
    fn box_classification(#[case] center: Vec3, #[case] visible: bool) {
        assert_eq!(frustum().intersects_aabb(&unit_box_at(center)), visible);
    }

    #[test]
    fn planes_are_normalized() {
        for plane in frustum().planes {
            assert!((plane.normal.length() - 1.0).abs() < 1e-4);
        }
        let inside = Vec3::new(0.0, 0.0, -1.0);
        assert!(frustum().planes.iter().all(|p| p.distance(inside) >= 0.0));
        let before_near = Vec3::new(0.0, 0.0, -0.05);
        assert!(frustum().planes.iter().any(|p| p.distance(before_near) < 0.0));
    }

    #[test]
    fn transformed_box_encloses_rotated_corners() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        let transform = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0))
            * Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4);
        let world = aabb.transformed(&transform);
        let reach = 2.0f32.sqrt();
        assert!((world.min.x - (10.0 - reach)).abs() < 1e-4);
        assert!((world.max.x - (10.0 + reach)).abs() < 1e-4);
        assert!((world.max.y - 1.0).abs() < 1e-4);
    }

    #[test]
    fn empty_box_is_never_visible() {
        assert!(Aabb::EMPTY.is_empty());
        assert!(!frustum().intersects_aabb(&Aabb::EMPTY));
        let points = [Vec3::ONE, Vec3::NEG_ONE];
        assert_eq!(
            Aabb::from_points(points),
            Aabb::new(Vec3::NEG_ONE, Vec3::ONE)
        );
    }
}
