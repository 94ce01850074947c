//! Depth pre-pass
//!
//! Writes depth for every visible mesh with a vertex-only layout: the scene
//! constants and the mesh record array. No fragment stage, no color targets.

use super::{DRAW_CONSTANTS_SIZE, SHADER_COMMON};
use crate::backend::*;
use crate::resources::texture::DEPTH_FORMAT;

/// Layout slot of the scene constant buffer
pub const SCENE_SLOT: u32 = 0;
/// Layout slot of the mesh record array
pub const MESH_SLOT: u32 = 1;

pub struct DepthPrepass {
    layout: PipelineLayoutHandle,
    pipeline: RenderPipelineHandle,
}

impl DepthPrepass {
    pub fn new<B: GraphicsBackend>(backend: &mut B) -> BackendResult<Self> {
        let layout = backend.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("Depth Prepass Layout".into()),
            push_constant_size: DRAW_CONSTANTS_SIZE,
            push_constant_visibility: ShaderStageFlags::VERTEX,
            slots: vec![
                LayoutSlot {
                    kind: LayoutSlotKind::UniformBuffer,
                    visibility: ShaderStageFlags::VERTEX,
                },
                LayoutSlot {
                    kind: LayoutSlotKind::StorageBuffer,
                    visibility: ShaderStageFlags::VERTEX,
                },
            ],
        })?;

        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Depth Prepass".into()),
            layout,
            shader: format!("{}{}", SHADER_COMMON, DEPTH_SHADER),
            vertex_entry: "vs_depth".into(),
            fragment_entry: None,
            vertex_layouts: vec![Vertex::position_only_layout()],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
            }),
            color_targets: vec![],
        })?;
        log::debug!("Depth prepass pipeline ready");

        Ok(Self { layout, pipeline })
    }

    pub fn layout(&self) -> PipelineLayoutHandle {
        self.layout
    }

    pub fn pipeline(&self) -> RenderPipelineHandle {
        self.pipeline
    }

    /// Open the pass with a cleared depth buffer and bind the per-pass slots.
    pub fn begin<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        depth_view: TextureViewHandle,
        (width, height): (u32, u32),
        scene_constants: BufferHandle,
        mesh_records: BufferHandle,
    ) {
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Depth Prepass".into()),
            color_attachments: vec![],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth_view,
                depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
            }),
        });
        backend.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        backend.set_render_pipeline(self.pipeline);
        backend.set_binding(SCENE_SLOT, Binding::UniformBuffer(scene_constants));
        backend.set_binding(MESH_SLOT, Binding::StorageBuffer(mesh_records));
    }
}

const DEPTH_SHADER: &str = r#"
@group(0) @binding(0) var<uniform> scene: SceneConstants;
@group(0) @binding(1) var<storage, read> meshes: array<MeshRecord>;

@vertex
fn vs_depth(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    let world = meshes[draw.mesh_index].world * vec4<f32>(position, 1.0);
    return scene.view_projection * world;
}
"#;
