//! Backend abstraction layer
//!
//! Provides common traits and types that the wgpu and headless backends implement.

pub mod headless;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use headless::HeadlessBackend;
pub use traits::*;
pub use types::*;
