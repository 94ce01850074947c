//! Headless backend for tests and GPU-less runs.
//!
//! Resources live in CPU memory. Submitted command lists are queued and only
//! executed when something forces the simulated GPU forward (a fence wait, a
//! readback, or an explicit [`HeadlessBackend::step_gpu`]). That keeps the
//! fence and staging-lifetime contracts observable: a copy whose staging
//! buffer was overwritten or destroyed before execution behaves exactly as
//! badly as it would on real hardware.

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::time::Duration;

/// Texture table limit reported unless [`HeadlessBackend::with_texture_table_limit`] lowers it
pub const DEFAULT_MAX_TEXTURE_TABLE: u32 = 1 << 16;

/// A draw call captured at record time
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub pipeline: Option<RenderPipelineHandle>,
    pub vertex_buffer: Option<BufferHandle>,
    pub index_buffer: Option<BufferHandle>,
    pub push_constants: Vec<u8>,
    pub bindings: Vec<(u32, Binding)>,
    pub indices: Range<u32>,
    pub base_vertex: i32,
    pub instances: Range<u32>,
}

impl DrawCall {
    /// Read a `u32` out of the push constant block
    pub fn push_constant_u32(&self, index: usize) -> Option<u32> {
        let start = index * 4;
        let bytes = self.push_constants.get(start..start + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Whether this draw reads geometry from `buffer`
    pub fn references(&self, buffer: BufferHandle) -> bool {
        self.vertex_buffer == Some(buffer) || self.index_buffer == Some(buffer)
    }
}

/// A render pass captured at record time
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPass {
    pub label: Option<String>,
    pub color_attachments: Vec<TextureViewHandle>,
    pub depth_attachment: Option<TextureViewHandle>,
    pub draws: Vec<DrawCall>,
}

#[derive(Debug, Clone)]
enum Command {
    CopyBufferToBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: BufferHandle,
        layout: ImageDataLayout,
        dst: TextureHandle,
        width: u32,
        height: u32,
    },
    CopyTextureToTexture {
        src: TextureHandle,
        dst: TextureHandle,
    },
    Barrier(ResourceBarrier),
    RenderPass(RecordedPass),
}

impl Command {
    fn references_buffer(&self, buffer: BufferHandle) -> bool {
        match self {
            Command::CopyBufferToBuffer { src, dst, .. } => *src == buffer || *dst == buffer,
            Command::CopyBufferToTexture { src, .. } => *src == buffer,
            Command::CopyTextureToTexture { .. } => false,
            Command::Barrier(barrier) => barrier.resource == BarrierResource::Buffer(buffer),
            Command::RenderPass(pass) => pass.draws.iter().any(|draw| {
                draw.references(buffer)
                    || draw.bindings.iter().any(|(_, binding)| match binding {
                        Binding::UniformBuffer(b) | Binding::StorageBuffer(b) => *b == buffer,
                        _ => false,
                    })
            }),
        }
    }

    fn references_texture(&self, texture: TextureHandle) -> bool {
        match self {
            Command::CopyBufferToTexture { dst, .. } => *dst == texture,
            Command::CopyTextureToTexture { src, dst } => *src == texture || *dst == texture,
            Command::Barrier(barrier) => barrier.resource == BarrierResource::Texture(texture),
            _ => false,
        }
    }
}

#[derive(Debug)]
enum QueueItem {
    Submission(Vec<Command>),
    Signal(u64),
}

struct HeadlessBuffer {
    desc: BufferDescriptor,
    data: Vec<u8>,
}

struct HeadlessTexture {
    desc: TextureDescriptor,
    data: Vec<u8>,
}

struct HeadlessHeap {
    desc: DescriptorHeapDescriptor,
    slots: Vec<Option<DescriptorView>>,
}

/// Pass being recorded, with the bind state draws snapshot from
struct PendingPass {
    pass: RecordedPass,
    pipeline: Option<RenderPipelineHandle>,
    vertex_buffer: Option<BufferHandle>,
    index_buffer: Option<BufferHandle>,
    push_constants: Vec<u8>,
    bindings: HashMap<u32, Binding>,
}

/// CPU-memory backend with a lazily executing queue.
pub struct HeadlessBackend {
    width: u32,
    height: u32,
    format: TextureFormat,
    max_texture_table: u32,

    buffers: HashMap<u64, HeadlessBuffer>,
    textures: HashMap<u64, HeadlessTexture>,
    texture_views: HashMap<u64, (TextureHandle, TextureViewDescriptor)>,
    samplers: HashMap<u64, SamplerDescriptor>,
    heaps: HashMap<u64, HeadlessHeap>,
    layouts: HashMap<u64, PipelineLayoutDescriptor>,
    pipelines: HashMap<u64, RenderPipelineDescriptor>,
    next_id: u64,

    recording: Vec<Command>,
    pending_pass: Option<PendingPass>,
    queue: VecDeque<QueueItem>,

    completed_fence: u64,

    pass_log: Vec<RecordedPass>,
    barrier_log: Vec<ResourceBarrier>,
    fence_waits: Vec<u64>,
    frames_presented: u64,
}

impl HeadlessBackend {
    /// Create a new headless backend rendering at the given size.
    pub fn new(width: u32, height: u32) -> Self {
        log::debug!("HeadlessBackend: created ({}x{})", width, height);
        Self {
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            max_texture_table: DEFAULT_MAX_TEXTURE_TABLE,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            heaps: HashMap::new(),
            layouts: HashMap::new(),
            pipelines: HashMap::new(),
            next_id: 1,
            recording: Vec::new(),
            pending_pass: None,
            queue: VecDeque::new(),
            completed_fence: 0,
            pass_log: Vec::new(),
            barrier_log: Vec::new(),
            fence_waits: Vec::new(),
            frames_presented: 0,
        }
    }

    /// Report a smaller texture table limit, as a low-end adapter would.
    pub fn with_texture_table_limit(mut self, limit: u32) -> Self {
        self.max_texture_table = limit;
        self
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, handle: BufferHandle) -> BackendResult<&HeadlessBuffer> {
        self.buffers.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: handle.0,
        })
    }

    fn texture(&self, handle: TextureHandle) -> BackendResult<&HeadlessTexture> {
        self.textures.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: handle.0,
        })
    }

    fn heap_mut(&mut self, handle: DescriptorHeapHandle) -> BackendResult<&mut HeadlessHeap> {
        self.heaps.get_mut(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "descriptor heap",
            id: handle.0,
        })
    }

    /// Execute up to `count` queued items (submissions or fence signals).
    ///
    /// Returns how many items were executed.
    pub fn step_gpu(&mut self, count: usize) -> usize {
        let mut executed = 0;
        while executed < count {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            self.execute(item);
            executed += 1;
        }
        executed
    }

    /// Execute everything that has been submitted.
    pub fn run_gpu_until_idle(&mut self) {
        while let Some(item) = self.queue.pop_front() {
            self.execute(item);
        }
    }

    fn execute(&mut self, item: QueueItem) {
        match item {
            QueueItem::Signal(value) => {
                log::trace!("HeadlessBackend: fence reached {}", value);
                self.completed_fence = self.completed_fence.max(value);
            }
            QueueItem::Submission(commands) => {
                for command in commands {
                    self.execute_command(command);
                }
            }
        }
    }

    fn execute_command(&mut self, command: Command) {
        match command {
            Command::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let Some(bytes) = self.buffers.get(&src.0).map(|b| {
                    b.data[src_offset as usize..(src_offset + size) as usize].to_vec()
                }) else {
                    log::error!("HeadlessBackend: copy source buffer {} vanished", src.0);
                    return;
                };
                if let Some(dst) = self.buffers.get_mut(&dst.0) {
                    dst.data[dst_offset as usize..(dst_offset + size) as usize]
                        .copy_from_slice(&bytes);
                }
            }
            Command::CopyBufferToTexture {
                src,
                layout,
                dst,
                width,
                height,
            } => {
                let Some(src) = self.buffers.get(&src.0) else {
                    log::error!("HeadlessBackend: copy source buffer {} vanished", src.0);
                    return;
                };
                let Some(dst_texture) = self.textures.get_mut(&dst.0) else {
                    return;
                };
                let bpp = dst_texture.desc.format.bytes_per_pixel() as usize;
                let row_bytes = width as usize * bpp;
                let dst_pitch = dst_texture.desc.width as usize * bpp;
                for row in 0..height as usize {
                    let src_start = layout.offset as usize + row * layout.bytes_per_row as usize;
                    let dst_start = row * dst_pitch;
                    dst_texture.data[dst_start..dst_start + row_bytes]
                        .copy_from_slice(&src.data[src_start..src_start + row_bytes]);
                }
            }
            Command::CopyTextureToTexture { src, dst } => {
                let Some(bytes) = self.textures.get(&src.0).map(|t| t.data.clone()) else {
                    return;
                };
                if let Some(dst) = self.textures.get_mut(&dst.0) {
                    let len = bytes.len().min(dst.data.len());
                    dst.data[..len].copy_from_slice(&bytes[..len]);
                }
            }
            Command::Barrier(_) | Command::RenderPass(_) => {}
        }
    }

    fn is_referenced(&self, predicate: impl Fn(&Command) -> bool) -> bool {
        self.recording.iter().any(&predicate)
            || self
                .pending_pass
                .as_ref()
                .is_some_and(|p| predicate(&Command::RenderPass(p.pass.clone())))
            || self.queue.iter().any(|item| match item {
                QueueItem::Submission(commands) => commands.iter().any(&predicate),
                QueueItem::Signal(_) => false,
            })
    }

    /// GPU-side contents of a buffer as of the last executed command
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    /// Tightly packed texel rows of mip 0
    pub fn texture_contents(&self, texture: TextureHandle) -> Option<&[u8]> {
        self.textures.get(&texture.0).map(|t| t.data.as_slice())
    }

    /// Texture a view was created from
    pub fn view_texture(&self, view: TextureViewHandle) -> Option<TextureHandle> {
        self.texture_views.get(&view.0).map(|(texture, _)| *texture)
    }

    /// View currently written into a heap slot
    pub fn descriptor(&self, heap: DescriptorHeapHandle, index: u32) -> Option<DescriptorView> {
        self.heaps
            .get(&heap.0)
            .and_then(|h| h.slots.get(index as usize).copied().flatten())
    }

    pub fn buffer_exists(&self, buffer: BufferHandle) -> bool {
        self.buffers.contains_key(&buffer.0)
    }

    /// Every render pass recorded so far, in recording order
    pub fn pass_log(&self) -> &[RecordedPass] {
        &self.pass_log
    }

    /// Every barrier recorded so far, in recording order
    pub fn barrier_log(&self) -> &[ResourceBarrier] {
        &self.barrier_log
    }

    /// Fence values the CPU blocked on that were not yet complete
    pub fn fence_waits(&self) -> &[u64] {
        &self.fence_waits
    }

    pub fn clear_logs(&mut self) {
        self.pass_log.clear();
        self.barrier_log.clear();
        self.fence_waits.clear();
    }

    /// Signals queued but not yet reached by the simulated GPU
    pub fn pending_signals(&self) -> usize {
        self.queue
            .iter()
            .filter(|item| matches!(item, QueueItem::Signal(_)))
            .count()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "Headless Backend"
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn max_texture_table_size(&self) -> u32 {
        self.max_texture_table
    }

    fn swapchain_format(&self) -> TextureFormat {
        self.format
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        Ok(FrameContext {
            backbuffer: None,
            backbuffer_view: None,
            width: self.width,
            height: self.height,
        })
    }

    fn present(&mut self) -> BackendResult<()> {
        self.frames_presented += 1;
        log::trace!("HeadlessBackend: present #{}", self.frames_presented);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?} has zero size",
                desc.label
            )));
        }
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {}, {:?})",
            desc.label,
            desc.size,
            desc.location
        );
        let id = self.allocate_id();
        self.buffers.insert(
            id,
            HeadlessBuffer {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let entry = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: buffer.0,
            })?;
        if !entry.desc.location.is_cpu_visible() {
            return Err(BackendError::NotCpuVisible(buffer.0));
        }
        let end = offset + data.len() as u64;
        if end > entry.desc.size {
            return Err(BackendError::OutOfBounds {
                id: buffer.0,
                offset,
                len: data.len() as u64,
                size: entry.desc.size,
            });
        }
        entry.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> BackendResult<Vec<u8>> {
        // A readback waits for the queue to drain, as a mapped read would.
        self.run_gpu_until_idle();
        let entry = self.buffer(buffer)?;
        if offset + size > entry.desc.size {
            return Err(BackendError::OutOfBounds {
                id: buffer.0,
                offset,
                len: size,
                size: entry.desc.size,
            });
        }
        Ok(entry.data[offset as usize..(offset + size) as usize].to_vec())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has zero extent",
                desc.label
            )));
        }
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{}, {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        let size = (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize;
        let id = self.allocate_id();
        self.textures.insert(
            id,
            HeadlessTexture {
                desc: desc.clone(),
                data: vec![0; size],
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        self.texture(texture)?;
        let id = self.allocate_id();
        self.texture_views.insert(id, (texture, desc.clone()));
        Ok(TextureViewHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("HeadlessBackend: creating sampler {:?}", desc.label);
        let id = self.allocate_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn create_descriptor_heap(
        &mut self,
        desc: &DescriptorHeapDescriptor,
    ) -> BackendResult<DescriptorHeapHandle> {
        log::trace!(
            "HeadlessBackend: creating {:?} heap {:?} (capacity: {})",
            desc.kind,
            desc.label,
            desc.capacity
        );
        let id = self.allocate_id();
        self.heaps.insert(
            id,
            HeadlessHeap {
                desc: desc.clone(),
                slots: vec![None; desc.capacity as usize],
            },
        );
        Ok(DescriptorHeapHandle(id))
    }

    fn write_descriptor(
        &mut self,
        heap: DescriptorHeapHandle,
        index: u32,
        view: DescriptorView,
    ) -> BackendResult<()> {
        let entry = self.heap_mut(heap)?;
        let capacity = entry.desc.capacity;
        let slot = entry
            .slots
            .get_mut(index as usize)
            .ok_or(BackendError::DescriptorOutOfRange {
                heap: heap.0,
                index,
                capacity,
            })?;
        *slot = Some(view);
        Ok(())
    }

    fn clear_descriptor(&mut self, heap: DescriptorHeapHandle, index: u32) -> BackendResult<()> {
        let entry = self.heap_mut(heap)?;
        let capacity = entry.desc.capacity;
        let slot = entry
            .slots
            .get_mut(index as usize)
            .ok_or(BackendError::DescriptorOutOfRange {
                heap: heap.0,
                index,
                capacity,
            })?;
        *slot = None;
        Ok(())
    }

    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDescriptor,
    ) -> BackendResult<PipelineLayoutHandle> {
        desc.check_texture_tables(self.max_texture_table)?;
        let id = self.allocate_id();
        self.layouts.insert(id, desc.clone());
        Ok(PipelineLayoutHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if !self.layouts.contains_key(&desc.layout.0) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{:?}: unknown layout {}",
                desc.label, desc.layout.0
            )));
        }
        if desc.shader.trim().is_empty() {
            return Err(BackendError::ShaderCreationFailed(format!(
                "{:?}: empty shader source",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.pipelines.insert(id, desc.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) -> BackendResult<()> {
        for (handle, offset) in [(src, src_offset), (dst, dst_offset)] {
            let entry = self.buffer(handle)?;
            if offset + size > entry.desc.size {
                return Err(BackendError::OutOfBounds {
                    id: handle.0,
                    offset,
                    len: size,
                    size: entry.desc.size,
                });
            }
        }
        self.recording.push(Command::CopyBufferToBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: BufferHandle,
        layout: ImageDataLayout,
        dst: TextureHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let texture = self.texture(dst)?;
        let row_bytes = width * texture.desc.format.bytes_per_pixel();
        if layout.bytes_per_row < row_bytes {
            return Err(BackendError::OutOfBounds {
                id: src.0,
                offset: layout.offset,
                len: row_bytes as u64,
                size: layout.bytes_per_row as u64,
            });
        }
        let needed = layout.offset
            + layout.bytes_per_row as u64 * height.saturating_sub(1) as u64
            + row_bytes as u64;
        let source = self.buffer(src)?;
        if needed > source.desc.size {
            return Err(BackendError::OutOfBounds {
                id: src.0,
                offset: layout.offset,
                len: needed,
                size: source.desc.size,
            });
        }
        self.recording.push(Command::CopyBufferToTexture {
            src,
            layout,
            dst,
            width,
            height,
        });
        Ok(())
    }

    fn copy_texture_to_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        _width: u32,
        _height: u32,
    ) -> BackendResult<()> {
        self.texture(src)?;
        self.texture(dst)?;
        self.recording.push(Command::CopyTextureToTexture { src, dst });
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        for barrier in barriers {
            log::trace!(
                "HeadlessBackend: barrier {:?} {:?} -> {:?}",
                barrier.resource,
                barrier.before,
                barrier.after
            );
            self.barrier_log.push(*barrier);
            self.recording.push(Command::Barrier(*barrier));
        }
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.pending_pass = Some(PendingPass {
            pass: RecordedPass {
                label: desc.label.clone(),
                color_attachments: desc.color_attachments.iter().map(|a| a.view).collect(),
                depth_attachment: desc.depth_stencil_attachment.as_ref().map(|a| a.view),
                draws: Vec::new(),
            },
            pipeline: None,
            vertex_buffer: None,
            index_buffer: None,
            push_constants: Vec::new(),
            bindings: HashMap::new(),
        });
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        let Some(pending) = self.pending_pass.take() else {
            return Ok(());
        };
        log::trace!(
            "HeadlessBackend: recorded pass {:?} with {} draws",
            pending.pass.label,
            pending.pass.draws.len()
        );
        self.pass_log.push(pending.pass.clone());
        self.recording.push(Command::RenderPass(pending.pass));
        Ok(())
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(ref mut pending) = self.pending_pass {
            pending.pipeline = Some(pipeline);
            pending.bindings.clear();
        }
    }

    fn set_push_constants(&mut self, offset: u32, data: &[u8]) {
        if let Some(ref mut pending) = self.pending_pass {
            let end = offset as usize + data.len();
            if pending.push_constants.len() < end {
                pending.push_constants.resize(end, 0);
            }
            pending.push_constants[offset as usize..end].copy_from_slice(data);
        }
    }

    fn set_binding(&mut self, slot: u32, binding: Binding) {
        if let Some(ref mut pending) = self.pending_pass {
            pending.bindings.insert(slot, binding);
        }
    }

    fn set_vertex_buffer(&mut self, _slot: u32, buffer: BufferHandle, _offset: u64) {
        if let Some(ref mut pending) = self.pending_pass {
            pending.vertex_buffer = Some(buffer);
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _offset: u64, _format: IndexFormat) {
        if let Some(ref mut pending) = self.pending_pass {
            pending.index_buffer = Some(buffer);
        }
    }

    fn set_viewport(&mut self, _x: f32, _y: f32, _w: f32, _h: f32, _min: f32, _max: f32) {}

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        if let Some(ref mut pending) = self.pending_pass {
            let mut bindings: Vec<(u32, Binding)> =
                pending.bindings.iter().map(|(k, v)| (*k, *v)).collect();
            bindings.sort_by_key(|(slot, _)| *slot);
            pending.pass.draws.push(DrawCall {
                pipeline: pending.pipeline,
                vertex_buffer: pending.vertex_buffer,
                index_buffer: pending.index_buffer,
                push_constants: pending.push_constants.clone(),
                bindings,
                indices,
                base_vertex,
                instances,
            });
        }
    }

    fn submit(&mut self) -> BackendResult<()> {
        if self.recording.is_empty() {
            return Ok(());
        }
        let commands = std::mem::take(&mut self.recording);
        log::trace!("HeadlessBackend: submitting {} commands", commands.len());
        self.queue.push_back(QueueItem::Submission(commands));
        Ok(())
    }

    fn signal_fence(&mut self, value: u64) -> BackendResult<()> {
        self.queue.push_back(QueueItem::Signal(value));
        Ok(())
    }

    fn completed_fence_value(&mut self) -> u64 {
        self.completed_fence
    }

    fn wait_for_fence(&mut self, value: u64, timeout: Option<Duration>) -> BackendResult<bool> {
        if self.completed_fence >= value {
            return Ok(true);
        }
        self.fence_waits.push(value);
        while self.completed_fence < value {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            self.execute(item);
        }
        if self.completed_fence >= value {
            return Ok(true);
        }
        match timeout {
            Some(_) => Ok(false),
            // Nothing queued will ever reach the value: a real device would hang here.
            None => Err(BackendError::DeviceLost),
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> BackendResult<()> {
        if self.is_referenced(|c| c.references_buffer(buffer)) {
            return Err(BackendError::ResourceInUse {
                kind: "buffer",
                id: buffer.0,
            });
        }
        self.buffers.remove(&buffer.0);
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) -> BackendResult<()> {
        if self.is_referenced(|c| c.references_texture(texture)) {
            return Err(BackendError::ResourceInUse {
                kind: "texture",
                id: texture.0,
            });
        }
        self.textures.remove(&texture.0);
        self.texture_views.retain(|_, (t, _)| *t != texture);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_buffer(backend: &mut HeadlessBackend, size: u64) -> BufferHandle {
        backend
            .create_buffer(&BufferDescriptor {
                label: Some("staging".into()),
                size,
                usage: BufferUsage::COPY_SRC,
                location: MemoryLocation::CpuToGpu,
            })
            .unwrap()
    }

    fn device_buffer(backend: &mut HeadlessBackend, size: u64) -> BufferHandle {
        backend
            .create_buffer(&BufferDescriptor {
                label: Some("device".into()),
                size,
                usage: BufferUsage::COPY_DST | BufferUsage::STORAGE,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap()
    }

    #[test]
    fn copies_execute_only_when_the_queue_advances() {
        let mut backend = HeadlessBackend::new(4, 4);
        let src = upload_buffer(&mut backend, 8);
        let dst = device_buffer(&mut backend, 8);
        backend.write_buffer(src, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        backend.copy_buffer_to_buffer(src, 0, dst, 0, 8).unwrap();
        backend.submit().unwrap();
        backend.signal_fence(1).unwrap();

        assert_eq!(backend.completed_fence_value(), 0);
        assert_eq!(backend.buffer_contents(dst).unwrap(), &[0; 8]);

        assert!(backend.wait_for_fence(1, None).unwrap());
        assert_eq!(backend.completed_fence_value(), 1);
        assert_eq!(backend.buffer_contents(dst).unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn destroying_a_buffer_in_flight_is_rejected() {
        let mut backend = HeadlessBackend::new(4, 4);
        let src = upload_buffer(&mut backend, 4);
        let dst = device_buffer(&mut backend, 4);
        backend.copy_buffer_to_buffer(src, 0, dst, 0, 4).unwrap();
        backend.submit().unwrap();
        backend.signal_fence(1).unwrap();

        assert!(matches!(
            backend.destroy_buffer(src),
            Err(BackendError::ResourceInUse { .. })
        ));

        backend.wait_for_fence(1, None).unwrap();
        backend.destroy_buffer(src).unwrap();
        assert!(!backend.buffer_exists(src));
    }

    #[test]
    fn device_local_buffers_reject_cpu_writes() {
        let mut backend = HeadlessBackend::new(4, 4);
        let dst = device_buffer(&mut backend, 4);
        assert!(matches!(
            backend.write_buffer(dst, 0, &[0; 4]),
            Err(BackendError::NotCpuVisible(_))
        ));
    }

    #[test]
    fn waiting_on_an_unsignaled_value_times_out() {
        let mut backend = HeadlessBackend::new(4, 4);
        let reached = backend
            .wait_for_fence(3, Some(Duration::from_millis(1)))
            .unwrap();
        assert!(!reached);
        assert!(matches!(
            backend.wait_for_fence(3, None),
            Err(BackendError::DeviceLost)
        ));
    }

    #[test]
    fn pitched_rows_are_unpacked_into_the_texture() {
        let mut backend = HeadlessBackend::new(4, 4);
        let texture = backend
            .create_texture(&TextureDescriptor {
                label: Some("tex".into()),
                width: 2,
                height: 2,
                ..Default::default()
            })
            .unwrap();
        let staging = upload_buffer(&mut backend, 512);
        let mut bytes = vec![0u8; 512];
        bytes[..8].copy_from_slice(&[1, 1, 1, 1, 2, 2, 2, 2]);
        bytes[256..264].copy_from_slice(&[3, 3, 3, 3, 4, 4, 4, 4]);
        backend.write_buffer(staging, 0, &bytes).unwrap();
        backend
            .copy_buffer_to_texture(
                staging,
                ImageDataLayout {
                    offset: 0,
                    bytes_per_row: 256,
                    rows_per_image: 2,
                },
                texture,
                2,
                2,
            )
            .unwrap();
        backend.submit().unwrap();
        backend.run_gpu_until_idle();

        assert_eq!(
            backend.texture_contents(texture).unwrap(),
            &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]
        );
    }
}
