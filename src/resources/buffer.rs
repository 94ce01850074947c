//! GPU buffers
//!
//! [`GpuBuffer`] owns the allocation and its tracked state. The constant,
//! structured, formatted and raw variants each embed one and add the views
//! their users need.

use super::context::GraphicsContext;
use super::descriptor::kind::ShaderResource;
use super::descriptor::DescriptorSlot;
use super::state::{ResourceState, TrackedState};
use super::upload::{ResourceUploader, UploadBatch};
use super::ResourceError;
use crate::backend::{
    BarrierResource, BufferDescriptor, BufferHandle, BufferUsage, DescriptorView,
    GraphicsBackend, IndexFormat, MemoryLocation,
};
use bytemuck::Pod;

/// Constant buffers are placed on 256-byte boundaries
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Minimum alignment of any buffer size
const MIN_BUFFER_ALIGNMENT: u64 = 4;

/// Parameters for [`GpuBuffer::new`]
#[derive(Debug, Clone)]
pub struct BufferInit<'a> {
    pub label: &'a str,
    pub size: u64,
    pub alignment: u64,
    /// Keep the buffer in the upload heap, writable from the CPU
    pub cpu_accessible: bool,
    pub allow_unordered_access: bool,
    pub usage: BufferUsage,
    /// Contents to upload; staged through an upload buffer unless `cpu_accessible`
    pub init_data: Option<&'a [u8]>,
    pub initial_state: ResourceState,
}

impl<'a> BufferInit<'a> {
    pub fn new(label: &'a str, size: u64) -> Self {
        Self {
            label,
            size,
            alignment: MIN_BUFFER_ALIGNMENT,
            cpu_accessible: false,
            allow_unordered_access: false,
            usage: BufferUsage::empty(),
            init_data: None,
            initial_state: ResourceState::Common,
        }
    }
}

/// A buffer allocation with its tracked access state.
#[derive(Debug)]
pub struct GpuBuffer {
    handle: BufferHandle,
    label: String,
    size: u64,
    location: MemoryLocation,
    state: TrackedState,
}

impl GpuBuffer {
    /// Allocate a buffer, uploading `init.init_data` if present.
    ///
    /// Device-local contents are staged: the staging buffer lands in `batch`
    /// and the buffer ends up in `init.initial_state` after the copy.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        init: &BufferInit,
        batch: &mut UploadBatch,
    ) -> Result<Self, ResourceError> {
        let alignment = init.alignment.max(MIN_BUFFER_ALIGNMENT);
        let size = init.size.next_multiple_of(alignment);
        if size == 0 {
            return Err(ResourceError::Empty(init.label.to_string()));
        }
        if let Some(data) = init.init_data {
            if data.len() as u64 > size {
                return Err(ResourceError::UploadTooLarge {
                    label: init.label.to_string(),
                    len: data.len() as u64,
                    size,
                });
            }
        }

        let staged = init.init_data.is_some() && !init.cpu_accessible;
        let mut usage = init.usage;
        if staged {
            usage = usage | BufferUsage::COPY_DST;
        }
        if init.allow_unordered_access {
            usage = usage | BufferUsage::STORAGE | BufferUsage::STORAGE_WRITE;
        }
        let location = if init.cpu_accessible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let handle = backend.create_buffer(&BufferDescriptor {
            label: Some(init.label.to_string()),
            size,
            usage,
            location,
        })?;
        log::debug!(
            "Created buffer {} ({} bytes, {:?})",
            init.label,
            size,
            location
        );

        let first_state = if staged {
            ResourceState::CopyDest
        } else {
            init.initial_state
        };
        let mut buffer = Self {
            handle,
            label: init.label.to_string(),
            size,
            location,
            state: TrackedState::new(BarrierResource::Buffer(handle), first_state),
        };

        match init.init_data {
            Some(data) if staged => ResourceUploader::upload_buffer(
                backend,
                init.label,
                handle,
                &mut buffer.state,
                data,
                init.initial_state,
                batch,
            )?,
            Some(data) => buffer.write(backend, 0, data)?,
            None => {}
        }

        Ok(buffer)
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size after alignment
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_cpu_accessible(&self) -> bool {
        self.location.is_cpu_visible()
    }

    pub fn state(&self) -> ResourceState {
        self.state.current()
    }

    pub fn transition<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        expected: ResourceState,
        next: ResourceState,
    ) -> Result<bool, ResourceError> {
        Ok(self.state.transition(backend, expected, next)?)
    }

    /// Write through the persistent CPU mapping.
    pub fn write<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ResourceError> {
        if !self.is_cpu_accessible() {
            return Err(ResourceError::NotCpuAccessible {
                label: self.label.clone(),
            });
        }
        if offset + data.len() as u64 > self.size {
            return Err(ResourceError::UploadTooLarge {
                label: self.label.clone(),
                len: offset + data.len() as u64,
                size: self.size,
            });
        }
        backend.write_buffer(self.handle, offset, data)?;
        Ok(())
    }

    /// Blocking readback of the first `len` bytes
    pub fn read_back<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        len: u64,
    ) -> Result<Vec<u8>, ResourceError> {
        Ok(backend.read_buffer(self.handle, 0, len.min(self.size))?)
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) -> Result<(), ResourceError> {
        backend.destroy_buffer(self.handle)?;
        Ok(())
    }
}

/// CPU-written constants, rewritten every frame
#[derive(Debug)]
pub struct ConstantBuffer {
    buffer: GpuBuffer,
}

impl ConstantBuffer {
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        size: u64,
    ) -> Result<Self, ResourceError> {
        let mut init = BufferInit::new(label, size);
        init.alignment = CONSTANT_BUFFER_ALIGNMENT;
        init.cpu_accessible = true;
        init.usage = BufferUsage::UNIFORM;
        init.initial_state = ResourceState::VertexAndConstantBuffer;
        let mut no_uploads = UploadBatch::new();
        let buffer = GpuBuffer::new(backend, &init, &mut no_uploads)?;
        Ok(Self { buffer })
    }

    /// Sized for one `T`
    pub fn for_type<T: Pod, B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
    ) -> Result<Self, ResourceError> {
        Self::new(backend, label, std::mem::size_of::<T>() as u64)
    }

    /// Copy `value` into the mapped memory.
    ///
    /// Only valid while no submitted frame that reads this buffer is still running.
    pub fn map_and_set_data<T: Pod, B: GraphicsBackend>(
        &self,
        backend: &mut B,
        value: &T,
    ) -> Result<(), ResourceError> {
        self.buffer.write(backend, 0, bytemuck::bytes_of(value))
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) -> Result<(), ResourceError> {
        self.buffer.destroy(backend)
    }
}

/// Vertex buffer view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub buffer: BufferHandle,
    pub size: u64,
    pub stride: u32,
}

/// Index buffer view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub buffer: BufferHandle,
    pub format: IndexFormat,
    pub count: u32,
}

/// Device-local array of `count` elements of `stride` bytes
#[derive(Debug)]
pub struct StructuredBuffer {
    buffer: GpuBuffer,
    stride: u32,
    count: u32,
    srv: DescriptorSlot<ShaderResource>,
}

impl StructuredBuffer {
    pub fn new<T: Pod, B: GraphicsBackend>(
        ctx: &mut GraphicsContext<B>,
        label: &str,
        elements: &[T],
        batch: &mut UploadBatch,
    ) -> Result<Self, ResourceError> {
        if elements.is_empty() {
            return Err(ResourceError::Empty(label.to_string()));
        }
        let stride = std::mem::size_of::<T>() as u32;
        let bytes: &[u8] = bytemuck::cast_slice(elements);
        let mut init = BufferInit::new(label, bytes.len() as u64);
        init.usage = BufferUsage::VERTEX | BufferUsage::STORAGE;
        init.init_data = Some(bytes);
        init.initial_state = ResourceState::GenericRead;
        let buffer = GpuBuffer::new(ctx.backend_mut(), &init, batch)?;

        let srv = ctx.create_shader_resource(DescriptorView::Buffer {
            buffer: buffer.handle(),
            offset: 0,
            size: bytes.len() as u64,
            stride,
        })?;

        Ok(Self {
            buffer,
            stride,
            count: elements.len() as u32,
            srv,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn srv(&self) -> DescriptorSlot<ShaderResource> {
        self.srv
    }

    pub fn vertex_view(&self) -> VertexBufferView {
        VertexBufferView {
            buffer: self.buffer.handle(),
            size: self.stride as u64 * self.count as u64,
            stride: self.stride,
        }
    }

    pub fn destroy<B: GraphicsBackend>(self, ctx: &mut GraphicsContext<B>) -> Result<(), ResourceError> {
        ctx.release_shader_resource(self.srv)?;
        self.buffer.destroy(ctx.backend_mut())
    }
}

/// Device-local typed buffer; used for 32-bit indices
#[derive(Debug)]
pub struct FormattedBuffer {
    buffer: GpuBuffer,
    format: IndexFormat,
    count: u32,
}

impl FormattedBuffer {
    pub fn from_u32<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        indices: &[u32],
        batch: &mut UploadBatch,
    ) -> Result<Self, ResourceError> {
        if indices.is_empty() {
            return Err(ResourceError::Empty(label.to_string()));
        }
        let bytes: &[u8] = bytemuck::cast_slice(indices);
        let mut init = BufferInit::new(label, bytes.len() as u64);
        init.usage = BufferUsage::INDEX;
        init.init_data = Some(bytes);
        init.initial_state = ResourceState::IndexBuffer;
        let buffer = GpuBuffer::new(backend, &init, batch)?;
        Ok(Self {
            buffer,
            format: IndexFormat::Uint32,
            count: indices.len() as u32,
        })
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn index_view(&self) -> IndexBufferView {
        IndexBufferView {
            buffer: self.buffer.handle(),
            format: self.format,
            count: self.count,
        }
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) -> Result<(), ResourceError> {
        self.buffer.destroy(backend)
    }
}

/// Untyped byte buffer with both a read view and a write view
#[derive(Debug)]
pub struct RawBuffer {
    buffer: GpuBuffer,
    srv: DescriptorSlot<ShaderResource>,
    uav: DescriptorSlot<ShaderResource>,
}

impl RawBuffer {
    pub fn new<B: GraphicsBackend>(
        ctx: &mut GraphicsContext<B>,
        label: &str,
        size: u64,
        cpu_accessible: bool,
        init_data: Option<&[u8]>,
        batch: &mut UploadBatch,
    ) -> Result<Self, ResourceError> {
        let mut init = BufferInit::new(label, size);
        init.cpu_accessible = cpu_accessible;
        init.allow_unordered_access = true;
        init.init_data = init_data;
        init.initial_state = ResourceState::UnorderedAccess;
        let buffer = GpuBuffer::new(ctx.backend_mut(), &init, batch)?;

        let srv = ctx.create_shader_resource(DescriptorView::Buffer {
            buffer: buffer.handle(),
            offset: 0,
            size: buffer.size(),
            stride: 0,
        })?;
        let uav = ctx.create_shader_resource(DescriptorView::StorageBuffer {
            buffer: buffer.handle(),
            offset: 0,
            size: buffer.size(),
        })?;

        Ok(Self { buffer, srv, uav })
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut GpuBuffer {
        &mut self.buffer
    }

    pub fn srv(&self) -> DescriptorSlot<ShaderResource> {
        self.srv
    }

    pub fn uav(&self) -> DescriptorSlot<ShaderResource> {
        self.uav
    }

    pub fn destroy<B: GraphicsBackend>(self, ctx: &mut GraphicsContext<B>) -> Result<(), ResourceError> {
        ctx.release_shader_resource(self.srv)?;
        ctx.release_shader_resource(self.uav)?;
        self.buffer.destroy(ctx.backend_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::resources::context::DescriptorCapacities;
    use rstest::rstest;

    fn context() -> GraphicsContext<HeadlessBackend> {
        GraphicsContext::new(HeadlessBackend::new(16, 16), DescriptorCapacities::default()).unwrap()
    }

    #[rstest]
    #[case::one_byte(1, 4, 4)]
    #[case::aligned(64, 16, 64)]
    #[case::rounded(65, 16, 80)]
    #[case::constant(12, 256, 256)]
    fn size_is_rounded_to_alignment(#[case] size: u64, #[case] alignment: u64, #[case] expected: u64) {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut init = BufferInit::new("sized", size);
        init.alignment = alignment;
        init.usage = BufferUsage::STORAGE;
        let buffer = GpuBuffer::new(&mut backend, &init, &mut UploadBatch::new()).unwrap();
        assert_eq!(buffer.size(), expected);
    }

    #[test]
    fn cpu_accessible_round_trip() {
        let mut backend = HeadlessBackend::new(4, 4);
        let data: Vec<u8> = (0..=200u8).collect();
        let mut init = BufferInit::new("mapped", 256);
        init.cpu_accessible = true;
        init.usage = BufferUsage::STORAGE;
        init.init_data = Some(&data);
        let mut batch = UploadBatch::new();
        let buffer = GpuBuffer::new(&mut backend, &init, &mut batch).unwrap();

        assert!(batch.is_empty());
        let read = buffer.read_back(&mut backend, data.len() as u64).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn device_local_contents_are_staged() {
        let mut ctx = context();
        let vertices = [1.0f32, 2.0, 3.0, 4.0];
        let mut batch = UploadBatch::new();
        let buffer = StructuredBuffer::new(&mut ctx, "verts", &vertices, &mut batch).unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(buffer.buffer().state(), ResourceState::GenericRead);
        assert_eq!(buffer.stride(), 4);
        assert_eq!(buffer.count(), 4);
        assert!(buffer.buffer().write(ctx.backend_mut(), 0, &[0; 4]).is_err());

        ctx.backend_mut().submit().unwrap();
        ctx.backend_mut().signal_fence(1).unwrap();
        let read = buffer.buffer().read_back(ctx.backend_mut(), 16).unwrap();
        assert_eq!(read, bytemuck::cast_slice::<f32, u8>(&vertices));

        let heap = ctx.shader_resources().heap();
        assert_eq!(
            ctx.backend().descriptor(heap, buffer.srv().index()),
            Some(DescriptorView::Buffer {
                buffer: buffer.handle(),
                offset: 0,
                size: 16,
                stride: 4,
            })
        );
        batch.stamp(1);
        batch.release(ctx.backend_mut()).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn constant_buffer_takes_latest_value() {
        let mut backend = HeadlessBackend::new(4, 4);
        let cb = ConstantBuffer::for_type::<[f32; 4], _>(&mut backend, "constants").unwrap();
        assert_eq!(cb.buffer().size(), CONSTANT_BUFFER_ALIGNMENT);
        cb.map_and_set_data(&mut backend, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        cb.map_and_set_data(&mut backend, &[5.0f32, 6.0, 7.0, 8.0]).unwrap();
        let read = cb.buffer().read_back(&mut backend, 16).unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, f32>(&read), &[5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn raw_buffer_exposes_read_and_write_views() {
        let mut ctx = context();
        let mut batch = UploadBatch::new();
        let mut raw = RawBuffer::new(&mut ctx, "raw", 32, true, Some(&[7u8; 32]), &mut batch).unwrap();
        assert_ne!(raw.srv(), raw.uav());
        assert_eq!(raw.buffer().state(), ResourceState::UnorderedAccess);

        // A write after a read has to go through an explicit transition.
        let backend = ctx.backend_mut();
        raw.buffer_mut()
            .transition(backend, ResourceState::UnorderedAccess, ResourceState::ShaderResource)
            .unwrap();
        assert!(matches!(
            raw.buffer_mut().transition(
                backend,
                ResourceState::UnorderedAccess,
                ResourceState::ShaderResource
            ),
            Err(ResourceError::State(_))
        ));

        let live_before = ctx.shader_resources().live_count();
        raw.destroy(&mut ctx).unwrap();
        assert_eq!(ctx.shader_resources().live_count(), live_before - 2);
    }

    #[test]
    fn empty_index_data_is_rejected() {
        let mut backend = HeadlessBackend::new(4, 4);
        let result = FormattedBuffer::from_u32(&mut backend, "indices", &[], &mut UploadBatch::new());
        assert!(matches!(result, Err(ResourceError::Empty(_))));
    }
}
