//! Scene Viewer - a glTF viewer built around explicit GPU resource lifetimes
//!
//! Each frame runs a depth pre-pass and a frustum-culled forward pass over
//! the loaded scene, then draws a debug overlay. Two backends implement the
//! GPU seam:
//! - **wgpu**: the real device, with a window and swapchain
//! - **headless**: CPU memory with a lazily executing queue, for tests and
//!   GPU-less runs
//!
//! # Features
//! - Typed descriptor heaps with slot reuse
//! - Staged uploads whose staging buffers live until their fence completes
//! - Per-resource state tracking with checked transitions
//! - Fence-paced frame slots bounding how far the CPU runs ahead

pub mod args;
pub mod asset;
pub mod backend;
pub mod egui_integration;
pub mod engine;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod scene_renderer;
pub mod sync;
pub mod window;

pub use args::ViewerArgs;
pub use egui_integration::WgpuEguiIntegration;
pub use engine::{FrameLoop, FrameStats};
pub use scene_renderer::SceneRenderer;

// Re-export wgpu backend for direct access
pub use backend::wgpu_backend::WgpuBackend;

use asset::AssetError;
use backend::BackendError;
use resources::{DescriptorCapacities, DescriptorError, ResourceError};
use scene_renderer::RendererError;
use std::time::Duration;
use sync::SyncError;
use thiserror::Error;

/// Anything that stops the viewer
#[derive(Error, Debug)]
pub enum ViewerError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
    #[error("Synchronization error: {0}")]
    Sync(#[from] SyncError),
    #[error("Renderer error: {0}")]
    Renderer(#[from] RendererError),
    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),
    #[error("Window error: {0}")]
    Window(String),
}

/// Configuration for the viewer
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Window title
    pub title: String,
    /// Window width; fixed for the lifetime of the window
    pub width: u32,
    /// Window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Frames that may be in flight at once
    pub frame_slots: usize,
    /// Slot counts of the four descriptor heaps
    pub descriptors: DescriptorCapacities,
    /// Shader-resource slots reserved for the overlay
    pub ui_descriptors: u32,
    /// Bound on every fence wait; `None` waits forever
    pub fence_timeout: Option<Duration>,
    /// Exit after this many frames
    pub frame_limit: Option<u64>,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            title: "Scene Viewer".to_string(),
            width: 800,
            height: 600,
            vsync: false,
            frame_slots: 2,
            descriptors: DescriptorCapacities::default(),
            ui_descriptors: 16,
            fence_timeout: None,
            frame_limit: None,
        }
    }
}
