//! wgpu backend implementation

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle ids reserved for the image acquired from the swapchain
const BACKBUFFER_TEXTURE_ID: u64 = u64::MAX;
const BACKBUFFER_VIEW_ID: u64 = u64::MAX - 1;

/// Buffered render pass command
#[derive(Clone)]
enum RenderCommand {
    SetPipeline(RenderPipelineHandle),
    SetBinding { slot: u32, binding: Binding },
    SetPushConstants { offset: u32, data: Vec<u8> },
    SetVertexBuffer { slot: u32, buffer: BufferHandle, offset: u64 },
    SetIndexBuffer { buffer: BufferHandle, offset: u64, format: IndexFormat },
    SetViewport { x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32 },
    DrawIndexed { indices: std::ops::Range<u32>, base_vertex: i32, instances: std::ops::Range<u32> },
}

/// Render command after bind groups have been resolved
enum ResolvedCommand {
    Command(RenderCommand),
    BindGroup(BindGroupKey),
}

/// Pending render pass with buffered commands
struct PendingRenderPass {
    descriptor: RenderPassDescriptor,
    commands: Vec<RenderCommand>,
}

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    desc: BufferDescriptor,
    /// Staging buffers are created mapped and written through the mapping
    mapped: bool,
}

struct WgpuLayout {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    desc: PipelineLayoutDescriptor,
}

struct WgpuHeap {
    desc: DescriptorHeapDescriptor,
    slots: Vec<Option<DescriptorView>>,
    generation: u64,
}

/// Identity of a bind group: the layout plus everything bound to it.
/// Heap generations invalidate cached groups when a table slot changes.
#[derive(Clone, PartialEq, Eq, Hash)]
struct BindGroupKey {
    layout: u64,
    bindings: Vec<(u32, Binding)>,
    heap_generations: Vec<(u64, u64)>,
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    current_texture: Option<wgpu::SurfaceTexture>,
    current_view: Option<wgpu::TextureView>,

    // Resource storage
    buffers: HashMap<u64, WgpuBuffer>,
    textures: HashMap<u64, wgpu::Texture>,
    texture_views: HashMap<u64, wgpu::TextureView>,
    samplers: HashMap<u64, wgpu::Sampler>,
    heaps: HashMap<u64, WgpuHeap>,
    layouts: HashMap<u64, WgpuLayout>,
    render_pipelines: HashMap<u64, (wgpu::RenderPipeline, PipelineLayoutHandle)>,
    bind_groups: HashMap<BindGroupKey, wgpu::BindGroup>,
    next_id: u64,

    /// Bound into texture table entries that hold no texture
    placeholder_view: wgpu::TextureView,

    // Command encoding
    encoder: Option<wgpu::CommandEncoder>,
    pending_render_pass: Option<PendingRenderPass>,

    // Fences
    completed_fence: Arc<AtomicU64>,
    last_signaled: u64,
    /// Fence value that must complete before a resource may be destroyed
    last_use: HashMap<u64, u64>,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        }
    }

    fn convert_texture_format_back(format: wgpu::TextureFormat) -> TextureFormat {
        match format {
            wgpu::TextureFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
            wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
            wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
            wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
            wgpu::TextureFormat::Rgba16Float => TextureFormat::Rgba16Float,
            wgpu::TextureFormat::Depth32Float => TextureFormat::Depth32Float,
            _ => TextureFormat::Rgba8Unorm,
        }
    }

    fn convert_buffer_usage(desc: &BufferDescriptor) -> wgpu::BufferUsages {
        if Self::is_staging(desc) {
            return wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC;
        }
        let usage = desc.usage;
        // Every other buffer can be read back, and CPU visible ones are
        // written through the queue.
        let mut result = wgpu::BufferUsages::COPY_SRC;
        if usage.contains(BufferUsage::COPY_DST) || desc.location.is_cpu_visible() {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) || usage.contains(BufferUsage::STORAGE_WRITE) {
            result |= wgpu::BufferUsages::STORAGE;
        }
        result
    }

    /// Upload-heap buffers whose only job is to be copied from
    fn is_staging(desc: &BufferDescriptor) -> bool {
        desc.location == MemoryLocation::CpuToGpu && desc.usage == BufferUsage::COPY_SRC
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::STORAGE_BINDING) {
            result |= wgpu::TextureUsages::STORAGE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
            VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        }
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
        }
    }

    fn convert_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
        match mode {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }

    fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
        match mode {
            AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
            AddressMode::Repeat => wgpu::AddressMode::Repeat,
            AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        }
    }

    fn convert_stages(flags: ShaderStageFlags) -> wgpu::ShaderStages {
        let mut stages = wgpu::ShaderStages::empty();
        if flags.contains(ShaderStageFlags::VERTEX) {
            stages |= wgpu::ShaderStages::VERTEX;
        }
        if flags.contains(ShaderStageFlags::FRAGMENT) {
            stages |= wgpu::ShaderStages::FRAGMENT;
        }
        stages
    }

    fn convert_load_op_color(op: &LoadOp) -> wgpu::LoadOp<wgpu::Color> {
        match op {
            LoadOp::Clear(color) => wgpu::LoadOp::Clear(wgpu::Color {
                r: color[0] as f64,
                g: color[1] as f64,
                b: color[2] as f64,
                a: color[3] as f64,
            }),
            LoadOp::Load => wgpu::LoadOp::Load,
        }
    }

    fn convert_store_op(op: StoreOp) -> wgpu::StoreOp {
        match op {
            StoreOp::Store => wgpu::StoreOp::Store,
            StoreOp::Discard => wgpu::StoreOp::Discard,
        }
    }
}

impl WgpuBackend {
    /// Create the backend for a window. Blocks on adapter and device creation.
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    pub async fn new_async(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        let (instance, surface, adapter, device, queue) = Self::init_native(window.clone()).await?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| BackendError::SurfaceCreationFailed("Surface reports no formats".into()))?;

        // The rendered frame is copied into the backbuffer rather than drawn there.
        if !surface_caps.usages.contains(wgpu::TextureUsages::COPY_DST) {
            return Err(BackendError::FeatureNotSupported(
                "swapchain images as copy destination".into(),
            ));
        }

        let present_mode = if vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };

        // Clamp to device limits while maintaining aspect ratio
        let max_size = device.limits().max_texture_dimension_2d;
        let (clamped_width, clamped_height) = if size.width > max_size || size.height > max_size {
            let scale = (max_size as f32 / size.width as f32).min(max_size as f32 / size.height as f32);
            let new_width = ((size.width as f32 * scale) as u32).max(1);
            let new_height = ((size.height as f32 * scale) as u32).max(1);
            (new_width, new_height)
        } else {
            (size.width.max(1), size.height.max(1))
        };

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST,
            format: surface_format,
            width: clamped_width,
            height: clamped_height,
            present_mode,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };

        surface.configure(&device, &surface_config);

        let placeholder = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Placeholder Texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let placeholder_view = placeholder.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            surface_config,
            current_texture: None,
            current_view: None,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            heaps: HashMap::new(),
            layouts: HashMap::new(),
            render_pipelines: HashMap::new(),
            bind_groups: HashMap::new(),
            next_id: 1,
            placeholder_view,
            encoder: None,
            pending_render_pass: None,
            completed_fence: Arc::new(AtomicU64::new(0)),
            last_signaled: 0,
            last_use: HashMap::new(),
        })
    }

    async fn init_native(
        window: Arc<winit::window::Window>,
    ) -> BackendResult<(
        wgpu::Instance,
        wgpu::Surface<'static>,
        wgpu::Adapter,
        wgpu::Device,
        wgpu::Queue,
    )> {
        // On Windows, try Vulkan first to avoid D3D12 debug layer validation errors
        let backends = if std::env::var("WGPU_BACKEND").is_ok() {
            wgpu::Backends::all()
        } else {
            #[cfg(target_os = "windows")]
            {
                wgpu::Backends::VULKAN
            }
            #[cfg(not(target_os = "windows"))]
            {
                wgpu::Backends::all()
            }
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await;

        // If no adapter found with preferred backend, try with all backends
        let (instance, surface, adapter) = if adapter.is_none() && backends != wgpu::Backends::all() {
            log::warn!("Preferred backend not available, falling back to all backends");
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });
            let surface = instance
                .create_surface(window.clone())
                .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: Some(&surface),
                    force_fallback_adapter: false,
                })
                .await
                .ok_or_else(|| {
                    BackendError::InitializationFailed("No suitable adapter found".into())
                })?;
            (instance, surface, adapter)
        } else {
            let adapter = adapter.ok_or_else(|| {
                BackendError::InitializationFailed("No suitable adapter found".into())
            })?;
            (instance, surface, adapter)
        };

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        // Per-draw indices travel as push constants and materials index a
        // texture table, so both features are mandatory.
        let required = wgpu::Features::PUSH_CONSTANTS | wgpu::Features::TEXTURE_BINDING_ARRAY;
        let supported = adapter.features();
        if !supported.contains(required) {
            return Err(BackendError::FeatureNotSupported(format!(
                "{:?}",
                required - (supported & required)
            )));
        }
        let optional = wgpu::Features::SAMPLED_TEXTURE_AND_STORAGE_BUFFER_ARRAY_NON_UNIFORM_INDEXING;
        let features = required | (supported & optional);

        let adapter_limits = adapter.limits();
        let limits = wgpu::Limits {
            max_push_constant_size: adapter_limits.max_push_constant_size.min(128),
            max_sampled_textures_per_shader_stage: adapter_limits.max_sampled_textures_per_shader_stage,
            ..wgpu::Limits::default()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Graphics Device"),
                    required_features: features,
                    required_limits: limits,
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        Ok((instance, surface, adapter, device, queue))
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, handle: BufferHandle) -> BackendResult<&WgpuBuffer> {
        self.buffers.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "buffer",
            id: handle.0,
        })
    }

    fn texture(&self, handle: TextureHandle) -> BackendResult<&wgpu::Texture> {
        Self::lookup_texture(&self.textures, &self.current_texture, handle)
    }

    fn lookup_buffer(
        buffers: &HashMap<u64, WgpuBuffer>,
        handle: BufferHandle,
    ) -> BackendResult<&wgpu::Buffer> {
        buffers
            .get(&handle.0)
            .map(|entry| &entry.buffer)
            .ok_or(BackendError::InvalidHandle {
                kind: "buffer",
                id: handle.0,
            })
    }

    fn lookup_texture<'a>(
        textures: &'a HashMap<u64, wgpu::Texture>,
        current: &'a Option<wgpu::SurfaceTexture>,
        handle: TextureHandle,
    ) -> BackendResult<&'a wgpu::Texture> {
        if handle.0 == BACKBUFFER_TEXTURE_ID {
            if let Some(current) = current.as_ref() {
                return Ok(&current.texture);
            }
        }
        textures.get(&handle.0).ok_or(BackendError::InvalidHandle {
            kind: "texture",
            id: handle.0,
        })
    }

    fn view(&self, handle: TextureViewHandle) -> Option<&wgpu::TextureView> {
        if handle.0 == BACKBUFFER_VIEW_ID {
            return self.current_view.as_ref();
        }
        self.texture_views.get(&handle.0)
    }

    /// Mark a resource as used by work that completes with the next signal
    fn touch(&mut self, id: u64) {
        self.last_use.insert(id, self.last_signaled + 1);
    }

    fn in_use(&mut self, id: u64) -> bool {
        let Some(&needed) = self.last_use.get(&id) else {
            return false;
        };
        self.completed_fence_value() < needed
    }

    fn unmap_if_mapped(&mut self, handle: BufferHandle) {
        if let Some(entry) = self.buffers.get_mut(&handle.0) {
            if entry.mapped {
                entry.buffer.unmap();
                entry.mapped = false;
            }
        }
    }

    fn ensure_encoder<'a>(
        encoder: &'a mut Option<wgpu::CommandEncoder>,
        device: &wgpu::Device,
    ) -> &'a mut wgpu::CommandEncoder {
        encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            })
        })
    }

    /// Resolve a binding set against a layout, creating the bind group if it is not cached.
    fn resolve_bind_group(
        &mut self,
        layout: PipelineLayoutHandle,
        bindings: &HashMap<u32, Binding>,
    ) -> BackendResult<BindGroupKey> {
        let mut sorted: Vec<(u32, Binding)> = bindings.iter().map(|(k, v)| (*k, *v)).collect();
        sorted.sort_by_key(|(slot, _)| *slot);

        let mut heap_generations = Vec::new();
        for (_, binding) in &sorted {
            let heap = match binding {
                Binding::DescriptorTable(heap) | Binding::Sampler { heap, .. } => heap.0,
                _ => continue,
            };
            if let Some(entry) = self.heaps.get(&heap) {
                heap_generations.push((heap, entry.generation));
            }
        }

        let key = BindGroupKey {
            layout: layout.0,
            bindings: sorted,
            heap_generations,
        };
        if self.bind_groups.contains_key(&key) {
            return Ok(key);
        }

        let layout_entry = self.layouts.get(&layout.0).ok_or(BackendError::InvalidHandle {
            kind: "pipeline layout",
            id: layout.0,
        })?;

        let missing = |slot: usize| BackendError::InvalidHandle {
            kind: "binding",
            id: slot as u64,
        };

        // Texture tables are gathered first so the entries can borrow them.
        let mut tables: HashMap<usize, Vec<&wgpu::TextureView>> = HashMap::new();
        for (slot, slot_desc) in layout_entry.desc.slots.iter().enumerate() {
            let LayoutSlotKind::TextureTable { count } = slot_desc.kind else {
                continue;
            };
            let Some(Binding::DescriptorTable(heap)) = bindings.get(&(slot as u32)) else {
                return Err(missing(slot));
            };
            let heap = self.heaps.get(&heap.0).ok_or(BackendError::InvalidHandle {
                kind: "descriptor heap",
                id: heap.0,
            })?;
            let views = (0..count as usize)
                .map(|i| match heap.slots.get(i).copied().flatten() {
                    Some(DescriptorView::Texture(view)) => self
                        .texture_views
                        .get(&view.0)
                        .unwrap_or(&self.placeholder_view),
                    _ => &self.placeholder_view,
                })
                .collect();
            tables.insert(slot, views);
        }

        let mut entries = Vec::with_capacity(layout_entry.desc.slots.len());
        for (slot, slot_desc) in layout_entry.desc.slots.iter().enumerate() {
            let binding = bindings.get(&(slot as u32)).ok_or_else(|| missing(slot))?;
            let resource = match (slot_desc.kind, binding) {
                (LayoutSlotKind::UniformBuffer, Binding::UniformBuffer(buffer))
                | (LayoutSlotKind::StorageBuffer, Binding::StorageBuffer(buffer)) => {
                    let entry = self.buffers.get(&buffer.0).ok_or(BackendError::InvalidHandle {
                        kind: "buffer",
                        id: buffer.0,
                    })?;
                    entry.buffer.as_entire_binding()
                }
                (LayoutSlotKind::TextureTable { .. }, _) => {
                    let views = tables.get(&slot).ok_or_else(|| missing(slot))?;
                    wgpu::BindingResource::TextureViewArray(views)
                }
                (LayoutSlotKind::Sampler, Binding::Sampler { heap, index }) => {
                    let sampler = self
                        .heaps
                        .get(&heap.0)
                        .and_then(|h| h.slots.get(*index as usize).copied().flatten())
                        .and_then(|view| match view {
                            DescriptorView::Sampler(sampler) => self.samplers.get(&sampler.0),
                            _ => None,
                        })
                        .ok_or_else(|| missing(slot))?;
                    wgpu::BindingResource::Sampler(sampler)
                }
                _ => return Err(missing(slot)),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32,
                resource,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: layout_entry.desc.label.as_deref(),
            layout: &layout_entry.bind_group_layout,
            entries: &entries,
        });

        self.bind_groups.insert(key.clone(), bind_group);
        Ok(key)
    }

    /// Drop cached bind groups that captured an older version of `heap`
    fn invalidate_heap(&mut self, heap: u64) {
        if let Some(entry) = self.heaps.get_mut(&heap) {
            entry.generation += 1;
        }
        self.bind_groups
            .retain(|key, _| key.heap_generations.iter().all(|(h, _)| *h != heap));
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu Backend"
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn max_texture_table_size(&self) -> u32 {
        self.device.limits().max_sampled_textures_per_shader_stage
    }

    fn swapchain_format(&self) -> TextureFormat {
        Self::convert_texture_format_back(self.surface_config.format)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        let output = self
            .surface
            .get_current_texture()
            .map_err(|e| match e {
                wgpu::SurfaceError::Lost => BackendError::SurfaceLost,
                wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
                _ => BackendError::AcquireImageFailed(e.to_string()),
            })?;

        self.current_view = Some(output.texture.create_view(&wgpu::TextureViewDescriptor::default()));
        self.current_texture = Some(output);

        Ok(FrameContext {
            backbuffer: Some(TextureHandle(BACKBUFFER_TEXTURE_ID)),
            backbuffer_view: Some(TextureViewHandle(BACKBUFFER_VIEW_ID)),
            width: self.surface_config.width,
            height: self.surface_config.height,
        })
    }

    fn present(&mut self) -> BackendResult<()> {
        self.submit()?;
        self.current_view = None;
        if let Some(texture) = self.current_texture.take() {
            texture.present();
        }
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?} has zero size",
                desc.label
            )));
        }
        let size = desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = Self::is_staging(desc);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size,
            usage: Self::convert_buffer_usage(desc),
            mapped_at_creation: staging,
        });

        let id = self.allocate_id();
        self.buffers.insert(
            id,
            WgpuBuffer {
                buffer,
                desc: desc.clone(),
                mapped: staging,
            },
        );

        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let entry = self.buffer(buffer)?;
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
        if data.is_empty() {
            return Ok(());
        }

        if entry.mapped {
            // Mapped ranges must start on MAP_ALIGNMENT and cover whole words.
            let start = offset - offset % wgpu::MAP_ALIGNMENT;
            let mapped_end = end.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
            let skip = (offset - start) as usize;
            let mut view = entry.buffer.slice(start..mapped_end).get_mapped_range_mut();
            view[skip..skip + data.len()].copy_from_slice(data);
        } else if Self::is_staging(&entry.desc) {
            log::error!("Staging buffer {} written after it was consumed by a copy", buffer.0);
            return Err(BackendError::NotCpuVisible(buffer.0));
        } else {
            self.queue.write_buffer(&entry.buffer, offset, data);
        }
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        self.submit()?;
        let entry = self.buffer(buffer)?;
        if offset + size > entry.desc.size {
            return Err(BackendError::OutOfBounds {
                id: buffer.0,
                offset,
                len: size,
                size: entry.desc.size,
            });
        }

        let align = wgpu::COPY_BUFFER_ALIGNMENT;
        let start = offset - offset % align;
        let end = (offset + size).next_multiple_of(align);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: end - start,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(&entry.buffer, start, &readback, 0, end - start);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| BackendError::DeviceLost)?
            .map_err(|_| BackendError::DeviceLost)?;

        let skip = (offset - start) as usize;
        let bytes = slice.get_mapped_range()[skip..skip + size as usize].to_vec();
        readback.unmap();
        Ok(bytes)
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has zero extent",
                desc.label
            )));
        }
        let format = Self::convert_texture_format(desc.format);
        // Allow views in the sRGB twin of color formats.
        let view_formats: Vec<wgpu::TextureFormat> = if desc.format.is_depth() {
            Vec::new()
        } else if format.is_srgb() {
            vec![format.remove_srgb_suffix()]
        } else {
            vec![format.add_srgb_suffix()]
        };

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &view_formats,
        });

        let id = self.allocate_id();
        self.textures.insert(id, texture);

        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let tex = self.texture(texture)?;

        let view = tex.create_view(&wgpu::TextureViewDescriptor {
            label: desc.label.as_deref(),
            format: desc.format.map(Self::convert_texture_format),
            aspect: match desc.aspect {
                Some(TextureAspect::DepthOnly) => wgpu::TextureAspect::DepthOnly,
                _ => wgpu::TextureAspect::All,
            },
            ..Default::default()
        });

        let id = self.allocate_id();
        self.texture_views.insert(id, view);

        Ok(TextureViewHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: desc.label.as_deref(),
            address_mode_u: Self::convert_address_mode(desc.address_mode_u),
            address_mode_v: Self::convert_address_mode(desc.address_mode_v),
            address_mode_w: Self::convert_address_mode(desc.address_mode_w),
            mag_filter: Self::convert_filter_mode(desc.mag_filter),
            min_filter: Self::convert_filter_mode(desc.min_filter),
            mipmap_filter: Self::convert_filter_mode(desc.mipmap_filter),
            lod_min_clamp: 0.0,
            lod_max_clamp: 32.0,
            compare: None,
            anisotropy_clamp: 1,
            border_color: None,
        });

        let id = self.allocate_id();
        self.samplers.insert(id, sampler);

        Ok(SamplerHandle(id))
    }

    fn create_descriptor_heap(
        &mut self,
        desc: &DescriptorHeapDescriptor,
    ) -> BackendResult<DescriptorHeapHandle> {
        log::debug!(
            "Creating {:?} descriptor heap {:?} with {} entries",
            desc.kind,
            desc.label,
            desc.capacity
        );
        let id = self.allocate_id();
        self.heaps.insert(
            id,
            WgpuHeap {
                desc: desc.clone(),
                slots: vec![None; desc.capacity as usize],
                generation: 0,
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
        let entry = self.heaps.get_mut(&heap.0).ok_or(BackendError::InvalidHandle {
            kind: "descriptor heap",
            id: heap.0,
        })?;
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
        self.invalidate_heap(heap.0);
        Ok(())
    }

    fn clear_descriptor(&mut self, heap: DescriptorHeapHandle, index: u32) -> BackendResult<()> {
        let entry = self.heaps.get_mut(&heap.0).ok_or(BackendError::InvalidHandle {
            kind: "descriptor heap",
            id: heap.0,
        })?;
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
        self.invalidate_heap(heap.0);
        Ok(())
    }

    fn create_pipeline_layout(
        &mut self,
        desc: &PipelineLayoutDescriptor,
    ) -> BackendResult<PipelineLayoutHandle> {
        desc.check_texture_tables(self.max_texture_table_size())?;
        let entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                let (ty, count) = match slot.kind {
                    LayoutSlotKind::UniformBuffer => (
                        wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        None,
                    ),
                    LayoutSlotKind::StorageBuffer => (
                        wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: true },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        None,
                    ),
                    LayoutSlotKind::TextureTable { count } => (
                        wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        NonZeroU32::new(count),
                    ),
                    LayoutSlotKind::Sampler => (
                        wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        None,
                    ),
                };
                wgpu::BindGroupLayoutEntry {
                    binding: index as u32,
                    visibility: Self::convert_stages(slot.visibility),
                    ty,
                    count,
                }
            })
            .collect();

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: desc.label.as_deref(),
                entries: &entries,
            });

        let push_constant_ranges: Vec<wgpu::PushConstantRange> = if desc.push_constant_size > 0 {
            vec![wgpu::PushConstantRange {
                stages: Self::convert_stages(desc.push_constant_visibility),
                range: 0..desc.push_constant_size,
            }]
        } else {
            Vec::new()
        };

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: desc.label.as_deref(),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &push_constant_ranges,
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::PipelineCreationFailed(error.to_string()));
        }

        let id = self.allocate_id();
        self.layouts.insert(
            id,
            WgpuLayout {
                bind_group_layout,
                pipeline_layout,
                desc: desc.clone(),
            },
        );
        Ok(PipelineLayoutHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: desc.label.as_deref(),
                source: wgpu::ShaderSource::Wgsl(desc.shader.as_str().into()),
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::ShaderCreationFailed(error.to_string()));
        }

        let layout = self.layouts.get(&desc.layout.0).ok_or(BackendError::InvalidHandle {
            kind: "pipeline layout",
            id: desc.layout.0,
        })?;

        // Build vertex buffer layouts with proper lifetimes
        let vertex_attrs: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: Self::convert_vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();

        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = desc
            .vertex_layouts
            .iter()
            .zip(vertex_attrs.iter())
            .map(|(layout, attrs)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: attrs,
            })
            .collect();

        let color_targets: Vec<Option<wgpu::ColorTargetState>> = desc
            .color_targets
            .iter()
            .map(|target| {
                Some(wgpu::ColorTargetState {
                    format: Self::convert_texture_format(target.format),
                    blend: target.blend.as_ref().map(|b| wgpu::BlendState {
                        color: wgpu::BlendComponent {
                            src_factor: Self::convert_blend_factor(b.color.src_factor),
                            dst_factor: Self::convert_blend_factor(b.color.dst_factor),
                            operation: Self::convert_blend_operation(b.color.operation),
                        },
                        alpha: wgpu::BlendComponent {
                            src_factor: Self::convert_blend_factor(b.alpha.src_factor),
                            dst_factor: Self::convert_blend_factor(b.alpha.dst_factor),
                            operation: Self::convert_blend_operation(b.alpha.operation),
                        },
                    }),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(target.write_mask.bits()),
                })
            })
            .collect();

        let primitive = wgpu::PrimitiveState {
            topology: match desc.primitive_topology {
                PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
                PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
                PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
            },
            strip_index_format: None,
            front_face: match desc.front_face {
                FrontFace::Ccw => wgpu::FrontFace::Ccw,
                FrontFace::Cw => wgpu::FrontFace::Cw,
            },
            cull_mode: match desc.cull_mode {
                CullMode::None => None,
                CullMode::Front => Some(wgpu::Face::Front),
                CullMode::Back => Some(wgpu::Face::Back),
            },
            ..Default::default()
        };

        let depth_stencil = desc.depth_stencil.as_ref().map(|ds| wgpu::DepthStencilState {
            format: Self::convert_texture_format(ds.format),
            depth_write_enabled: ds.depth_write_enabled,
            depth_compare: Self::convert_compare_function(ds.depth_compare),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: desc.label.as_deref(),
                layout: Some(&layout.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: &desc.vertex_entry,
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: desc.fragment_entry.as_ref().map(|entry| wgpu::FragmentState {
                    module: &shader,
                    entry_point: entry,
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive,
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::PipelineCreationFailed(error.to_string()));
        }

        let id = self.allocate_id();
        self.render_pipelines.insert(id, (pipeline, desc.layout));

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
        self.unmap_if_mapped(src);
        self.touch(src.0);
        self.touch(dst.0);
        let source = Self::lookup_buffer(&self.buffers, src)?;
        let destination = Self::lookup_buffer(&self.buffers, dst)?;
        let encoder = Self::ensure_encoder(&mut self.encoder, &self.device);
        encoder.copy_buffer_to_buffer(
            source,
            src_offset,
            destination,
            dst_offset,
            size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
        );
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
        self.unmap_if_mapped(src);
        self.touch(src.0);
        self.touch(dst.0);
        let source = Self::lookup_buffer(&self.buffers, src)?;
        let texture = Self::lookup_texture(&self.textures, &self.current_texture, dst)?;
        let encoder = Self::ensure_encoder(&mut self.encoder, &self.device);
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: source,
                layout: wgpu::ImageDataLayout {
                    offset: layout.offset,
                    bytes_per_row: Some(layout.bytes_per_row),
                    rows_per_image: Some(layout.rows_per_image),
                },
            },
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn copy_texture_to_texture(
        &mut self,
        src: TextureHandle,
        dst: TextureHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        self.touch(src.0);
        let source = Self::lookup_texture(&self.textures, &self.current_texture, src)?;
        let destination = Self::lookup_texture(&self.textures, &self.current_texture, dst)?;
        let encoder = Self::ensure_encoder(&mut self.encoder, &self.device);
        encoder.copy_texture_to_texture(
            wgpu::ImageCopyTexture {
                texture: source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyTexture {
                texture: destination,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        // wgpu tracks resource usage itself; the transitions are only logged.
        for barrier in barriers {
            log::trace!(
                "barrier {:?}: {:?} -> {:?}",
                barrier.resource,
                barrier.before,
                barrier.after
            );
        }
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        // Store the descriptor for later execution
        self.pending_render_pass = Some(PendingRenderPass {
            descriptor: desc.clone(),
            commands: Vec::new(),
        });
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        let Some(pending) = self.pending_render_pass.take() else {
            return Ok(());
        };

        // First pass over the commands: resolve bind groups and mark resource use.
        let mut resolved = Vec::with_capacity(pending.commands.len());
        let mut layout = None;
        let mut bindings: HashMap<u32, Binding> = HashMap::new();
        let mut dirty = false;
        for cmd in pending.commands {
            match &cmd {
                RenderCommand::SetPipeline(handle) => {
                    layout = self.render_pipelines.get(&handle.0).map(|(_, l)| *l);
                    bindings.clear();
                    dirty = true;
                }
                RenderCommand::SetBinding { slot, binding } => {
                    match binding {
                        Binding::UniformBuffer(b) | Binding::StorageBuffer(b) => self.touch(b.0),
                        _ => {}
                    }
                    bindings.insert(*slot, *binding);
                    dirty = true;
                }
                RenderCommand::SetVertexBuffer { buffer, .. }
                | RenderCommand::SetIndexBuffer { buffer, .. } => self.touch(buffer.0),
                RenderCommand::DrawIndexed { .. } => {
                    if dirty {
                        if let Some(layout) = layout {
                            let key = self.resolve_bind_group(layout, &bindings)?;
                            resolved.push(ResolvedCommand::BindGroup(key));
                        }
                        dirty = false;
                    }
                }
                _ => {}
            }
            resolved.push(ResolvedCommand::Command(cmd));
        }

        let encoder = Self::ensure_encoder(&mut self.encoder, &self.device);

        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pending
            .descriptor
            .color_attachments
            .iter()
            .filter_map(|att| {
                let view = if att.view.0 == BACKBUFFER_VIEW_ID {
                    self.current_view.as_ref()?
                } else {
                    self.texture_views.get(&att.view.0)?
                };
                Some(Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: Self::convert_load_op_color(&att.load_op),
                        store: Self::convert_store_op(att.store_op),
                    },
                }))
            })
            .collect();

        let depth_attachment = pending
            .descriptor
            .depth_stencil_attachment
            .as_ref()
            .and_then(|att| {
                let view = self.texture_views.get(&att.view.0)?;
                Some(wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: Some(wgpu::Operations {
                        load: match &att.depth_load_op {
                            LoadOp::Clear(_) => wgpu::LoadOp::Clear(att.depth_clear_value),
                            LoadOp::Load => wgpu::LoadOp::Load,
                        },
                        store: Self::convert_store_op(att.depth_store_op),
                    }),
                    stencil_ops: None,
                })
            });

        // Second pass: execute with the resolved bind groups
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: pending.descriptor.label.as_deref(),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            let mut push_constant_stages = wgpu::ShaderStages::empty();
            for cmd in &resolved {
                match cmd {
                    ResolvedCommand::BindGroup(key) => {
                        if let Some(bg) = self.bind_groups.get(key) {
                            render_pass.set_bind_group(0, bg, &[]);
                        }
                    }
                    ResolvedCommand::Command(RenderCommand::SetPipeline(handle)) => {
                        if let Some((pipeline, layout)) = self.render_pipelines.get(&handle.0) {
                            render_pass.set_pipeline(pipeline);
                            push_constant_stages = self
                                .layouts
                                .get(&layout.0)
                                .map(|l| Self::convert_stages(l.desc.push_constant_visibility))
                                .unwrap_or(wgpu::ShaderStages::empty());
                        }
                    }
                    ResolvedCommand::Command(RenderCommand::SetPushConstants { offset, data }) => {
                        render_pass.set_push_constants(push_constant_stages, *offset, data);
                    }
                    ResolvedCommand::Command(RenderCommand::SetBinding { .. }) => {}
                    ResolvedCommand::Command(RenderCommand::SetVertexBuffer { slot, buffer, offset }) => {
                        if let Some(entry) = self.buffers.get(&buffer.0) {
                            render_pass.set_vertex_buffer(*slot, entry.buffer.slice(*offset..));
                        }
                    }
                    ResolvedCommand::Command(RenderCommand::SetIndexBuffer { buffer, offset, format }) => {
                        if let Some(entry) = self.buffers.get(&buffer.0) {
                            let wgpu_format = match format {
                                IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
                                IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
                            };
                            render_pass.set_index_buffer(entry.buffer.slice(*offset..), wgpu_format);
                        }
                    }
                    ResolvedCommand::Command(RenderCommand::SetViewport {
                        x,
                        y,
                        width,
                        height,
                        min_depth,
                        max_depth,
                    }) => {
                        render_pass.set_viewport(*x, *y, *width, *height, *min_depth, *max_depth);
                    }
                    ResolvedCommand::Command(RenderCommand::DrawIndexed {
                        indices,
                        base_vertex,
                        instances,
                    }) => {
                        render_pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                    }
                }
            }
        }

        Ok(())
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetPipeline(pipeline));
        }
    }

    fn set_push_constants(&mut self, offset: u32, data: &[u8]) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetPushConstants {
                offset,
                data: data.to_vec(),
            });
        }
    }

    fn set_binding(&mut self, slot: u32, binding: Binding) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetBinding { slot, binding });
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetVertexBuffer { slot, buffer, offset });
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetIndexBuffer { buffer, offset, format });
        }
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::SetViewport { x, y, width, height, min_depth, max_depth });
        }
    }

    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) {
        if let Some(ref mut pending) = self.pending_render_pass {
            pending.commands.push(RenderCommand::DrawIndexed { indices, base_vertex, instances });
        }
    }

    fn submit(&mut self) -> BackendResult<()> {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        Ok(())
    }

    fn signal_fence(&mut self, value: u64) -> BackendResult<()> {
        self.last_signaled = self.last_signaled.max(value);
        let completed = Arc::clone(&self.completed_fence);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(value, Ordering::SeqCst);
        });
        Ok(())
    }

    fn completed_fence_value(&mut self) -> u64 {
        let _ = self.device.poll(wgpu::Maintain::Poll);
        self.completed_fence.load(Ordering::SeqCst)
    }

    fn wait_for_fence(&mut self, value: u64, timeout: Option<Duration>) -> BackendResult<bool> {
        if self.completed_fence_value() >= value {
            return Ok(true);
        }

        let Some(timeout) = timeout else {
            if value > self.last_signaled {
                // Nothing submitted will ever reach this value.
                return Err(BackendError::DeviceLost);
            }
            let _ = self.device.poll(wgpu::Maintain::Wait);
            return Ok(self.completed_fence.load(Ordering::SeqCst) >= value);
        };

        let deadline = Instant::now() + timeout;
        loop {
            if self.completed_fence_value() >= value {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> BackendResult<()> {
        if self.in_use(buffer.0) {
            return Err(BackendError::ResourceInUse {
                kind: "buffer",
                id: buffer.0,
            });
        }
        self.last_use.remove(&buffer.0);
        if let Some(entry) = self.buffers.remove(&buffer.0) {
            entry.buffer.destroy();
        }
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) -> BackendResult<()> {
        if self.in_use(texture.0) {
            return Err(BackendError::ResourceInUse {
                kind: "texture",
                id: texture.0,
            });
        }
        self.last_use.remove(&texture.0);
        self.textures.remove(&texture.0);
        Ok(())
    }
}

// Additional methods for egui integration and external rendering
impl WgpuBackend {
    /// Get reference to the wgpu device (for egui-wgpu Renderer creation)
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get reference to the wgpu queue (for egui-wgpu buffer updates)
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Get the surface format as wgpu type (for egui-wgpu Renderer creation)
    pub fn wgpu_surface_format(&self) -> wgpu::TextureFormat {
        self.surface_config.format
    }

    /// Get device, queue, and encoder together for operations that need all three.
    /// This avoids borrow checker issues when calling external libraries like egui.
    pub fn device_queue_encoder(&mut self) -> (&wgpu::Device, &wgpu::Queue, &mut wgpu::CommandEncoder) {
        let encoder = Self::ensure_encoder(&mut self.encoder, &self.device);
        (&self.device, &self.queue, encoder)
    }

    /// Render egui on top of the acquired backbuffer.
    pub fn render_egui(
        &mut self,
        renderer: &egui_wgpu::Renderer,
        paint_jobs: &[egui::ClippedPrimitive],
        screen_descriptor: &egui_wgpu::ScreenDescriptor,
    ) {
        let Some(view) = self.current_view.as_ref() else {
            return;
        };
        let encoder = Self::ensure_encoder(&mut self.encoder, &self.device);

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("egui Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load, // Preserve the copied frame
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        renderer.render(&mut render_pass, paint_jobs, screen_descriptor);
    }
}
