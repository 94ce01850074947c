//! Camera, lighting and culling math

mod camera;
mod camera_controller;
pub mod frustum;
mod light;

pub use camera::*;
pub use camera_controller::*;
pub use frustum::{Aabb, Frustum, Plane};
pub use light::*;
