//! GPU resource management
//!
//! Descriptor heaps, buffers, textures and the staged upload path. Every
//! constructor takes the backend or the [`GraphicsContext`] explicitly.

pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod state;
pub mod texture;
pub mod upload;

pub use buffer::*;
pub use context::{DescriptorCapacities, GraphicsContext};
pub use descriptor::{DescriptorAllocator, DescriptorError, DescriptorKind, DescriptorSlot};
pub use state::{ResourceState, StateError, TrackedState};
pub use texture::GpuTexture;
pub use upload::{ResourceUploader, StagingBuffer, TextureCopyLayout, UploadBatch};

use crate::backend::BackendError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Resource {0} has no contents")]
    Empty(String),
    #[error("Buffer {label} is not CPU accessible")]
    NotCpuAccessible { label: String },
    #[error("Image {label} has {actual} bytes, expected {expected}")]
    ImageSize {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("Upload of {len} bytes does not fit {label} ({size} bytes)")]
    UploadTooLarge { label: String, len: u64, size: u64 },
    #[error("Staging buffers still in flight (needs fence {required:?}, completed {completed})")]
    StagingInFlight {
        required: Option<u64>,
        completed: u64,
    },
}
