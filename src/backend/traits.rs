//! Core backend abstraction traits
//!
//! These traits define the interface that both the wgpu and the headless
//! backends implement. Everything above this layer is generic over
//! [`GraphicsBackend`] and never touches a graphics API directly.

use crate::backend::types::*;
use std::time::Duration;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Required feature not supported: {0}")]
    FeatureNotSupported(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Unknown {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },
    #[error("Buffer {0} is not CPU visible")]
    NotCpuVisible(u64),
    #[error("Access of {len} bytes at offset {offset} exceeds buffer {id} of size {size}")]
    OutOfBounds {
        id: u64,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[error("{kind} {id} is still referenced by GPU work that has not completed")]
    ResourceInUse { kind: &'static str, id: u64 },
    #[error("Descriptor index {index} out of range for heap {heap} (capacity {capacity})")]
    DescriptorOutOfRange { heap: u64, index: u32, capacity: u32 },
    #[error("Device limit on {limit} is {supported}, {requested} requested")]
    LimitExceeded {
        limit: &'static str,
        requested: u32,
        supported: u32,
    },
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPipelineHandle(pub(crate) u64);

/// Handle to a pipeline layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineLayoutHandle(pub(crate) u64);

/// Handle to a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHeapHandle(pub(crate) u64);

impl BufferHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl TextureHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl TextureViewHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl DescriptorHeapHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderStageFlags(u32);

impl ShaderStageFlags {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ShaderStageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Descriptor heap creation parameters
#[derive(Debug, Clone)]
pub struct DescriptorHeapDescriptor {
    pub label: Option<String>,
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub shader_visible: bool,
}

/// A view written into a descriptor heap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorView {
    /// Sampled texture
    Texture(TextureViewHandle),
    /// Read-only buffer view. `stride == 0` means an untyped byte view.
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        stride: u32,
    },
    /// Writable untyped buffer view
    StorageBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    RenderTarget(TextureViewHandle),
    DepthStencil(TextureViewHandle),
    Sampler(SamplerHandle),
}

/// One resource slot of a pipeline layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutSlotKind {
    UniformBuffer,
    StorageBuffer,
    /// Table of sampled textures read out of a shader-resource descriptor heap
    TextureTable { count: u32 },
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutSlot {
    pub kind: LayoutSlotKind,
    pub visibility: ShaderStageFlags,
}

/// Pipeline layout: push constant block followed by resource slots.
///
/// Slot `i` is bound with [`GraphicsBackend::set_binding`] using index `i`.
#[derive(Debug, Clone)]
pub struct PipelineLayoutDescriptor {
    pub label: Option<String>,
    /// Size in bytes of the per-draw push constant block (0 for none)
    pub push_constant_size: u32,
    pub push_constant_visibility: ShaderStageFlags,
    pub slots: Vec<LayoutSlot>,
}

impl PipelineLayoutDescriptor {
    /// Fail if any texture table is longer than `supported` entries.
    pub fn check_texture_tables(&self, supported: u32) -> BackendResult<()> {
        for slot in &self.slots {
            if let LayoutSlotKind::TextureTable { count } = slot.kind {
                if count > supported {
                    return Err(BackendError::LimitExceeded {
                        limit: "sampled textures per shader stage",
                        requested: count,
                        supported,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Resource bound to a pipeline layout slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    UniformBuffer(BufferHandle),
    StorageBuffer(BufferHandle),
    DescriptorTable(DescriptorHeapHandle),
    Sampler { heap: DescriptorHeapHandle, index: u32 },
}

/// Render pipeline descriptor
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    pub layout: PipelineLayoutHandle,
    pub shader: String,
    pub vertex_entry: String,
    /// `None` for depth-only pipelines
    pub fragment_entry: Option<String>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub primitive_topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_targets: Vec<ColorTargetState>,
}

#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

#[derive(Debug, Clone)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorWrites(pub u32);

impl ColorWrites {
    pub const ALL: Self = Self(0xF);

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Color attachment for render pass
#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub view: TextureViewHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOp {
    Clear([f32; 4]),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// Depth stencil attachment for render pass
#[derive(Debug, Clone)]
pub struct DepthStencilAttachment {
    pub view: TextureViewHandle,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub depth_clear_value: f32,
}

/// Render pass descriptor
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
}

/// Placement of texel rows inside a staging buffer for a buffer-to-texture copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDataLayout {
    pub offset: u64,
    pub bytes_per_row: u32,
    pub rows_per_image: u32,
}

/// Resource a barrier applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierResource {
    Buffer(BufferHandle),
    Texture(TextureHandle),
}

/// A recorded resource state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrier {
    pub resource: BarrierResource,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// Frame context returned when beginning a frame
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Presentable image, when the backend drives a swapchain
    pub backbuffer: Option<TextureHandle>,
    pub backbuffer_view: Option<TextureViewHandle>,
    pub width: u32,
    pub height: u32,
}

/// Main graphics backend trait
pub trait GraphicsBackend: Sized {
    /// Human readable backend name for logs
    fn name(&self) -> &'static str;

    /// Get the actual surface size
    fn surface_size(&self) -> (u32, u32);

    /// Get the presentation format
    fn swapchain_format(&self) -> TextureFormat;

    /// Longest texture table a pipeline layout may declare
    fn max_texture_table_size(&self) -> u32;

    /// Acquire the next presentable image
    fn begin_frame(&mut self) -> BackendResult<FrameContext>;

    /// Present the image acquired by `begin_frame`
    fn present(&mut self) -> BackendResult<()>;

    // Resource creation

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Write through the CPU mapping of a CPU visible buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;

    /// Read buffer contents back to the CPU, blocking until they are available
    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64)
        -> BackendResult<Vec<u8>>;

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a texture view
    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle>;

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    // Descriptor heaps

    /// Create a descriptor heap
    fn create_descriptor_heap(
        &mut self,
        desc: &DescriptorHeapDescriptor,
    ) -> BackendResult<DescriptorHeapHandle>;

    /// Write a view into a heap slot
    fn write_descriptor(
        &mut self,
        heap: DescriptorHeapHandle,
        index: u32,
        view: DescriptorView,
    ) -> BackendResult<()>;

    /// Forget the view stored in a heap slot
    fn clear_descriptor(&mut self, heap: DescriptorHeapHandle, index: u32) -> BackendResult<()>;

    // Pipeline creation

    /// Create a pipeline layout
    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDescriptor,
    ) -> BackendResult<PipelineLayoutHandle>;

    /// Create a render pipeline
    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    // Transfer and synchronization commands, recorded outside render passes

    /// Copy a byte range between buffers
    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> BackendResult<()>;

    /// Copy pitched texel rows from a buffer into mip 0 of a texture
    fn copy_buffer_to_texture(
        &mut self,
        src: BufferHandle,
        layout: ImageDataLayout,
        dst: TextureHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()>;

    /// Copy mip 0 of one texture into another of the same size and format
    fn copy_texture_to_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()>;

    /// Record resource state transitions
    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]);

    // Command recording and execution

    /// Begin a render pass
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor);

    /// End the current render pass
    fn end_render_pass(&mut self) -> BackendResult<()>;

    /// Set the render pipeline
    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    /// Write per-draw push constants for the current pipeline
    fn set_push_constants(&mut self, offset: u32, data: &[u8]);

    /// Bind a resource to a slot of the current pipeline layout
    fn set_binding(&mut self, slot: u32, binding: Binding);

    /// Set vertex buffer
    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64);

    /// Set index buffer
    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);

    /// Set viewport
    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32);

    /// Draw indexed primitives
    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    );

    /// Submit everything recorded since the last submit
    fn submit(&mut self) -> BackendResult<()>;

    // Fences

    /// Ask the queue to signal `value` once all previously submitted work completes
    fn signal_fence(&mut self, value: u64) -> BackendResult<()>;

    /// Highest fence value the GPU has reached
    fn completed_fence_value(&mut self) -> u64;

    /// Block until the fence reaches `value`. `None` waits forever.
    ///
    /// Returns `false` if the timeout elapsed first.
    fn wait_for_fence(&mut self, value: u64, timeout: Option<Duration>) -> BackendResult<bool>;

    // Resource cleanup

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> BackendResult<()>;

    /// Destroy a texture
    fn destroy_texture(&mut self, texture: TextureHandle) -> BackendResult<()>;
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}
