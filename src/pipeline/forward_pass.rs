//! Forward shading pass
//!
//! Draws after the depth pre-pass with `LessEqual` and depth writes off, so
//! each pixel is shaded once. Lighting is one directional light plus ambient:
//! Lambert diffuse and a normalized Blinn-Phong lobe whose exponent follows
//! roughness. Normal maps apply when the vertex has a tangent.

use super::{DRAW_CONSTANTS_SIZE, SHADER_COMMON};
use crate::backend::*;
use crate::resources::texture::DEPTH_FORMAT;

pub const SCENE_SLOT: u32 = 0;
pub const LIGHT_SLOT: u32 = 1;
pub const MESH_SLOT: u32 = 2;
pub const MATERIAL_SLOT: u32 = 3;
pub const TEXTURE_TABLE_SLOT: u32 = 4;
pub const SAMPLER_SLOT: u32 = 5;

/// Resources bound once per forward pass
#[derive(Debug, Clone, Copy)]
pub struct ForwardBindings {
    pub scene_constants: BufferHandle,
    pub light_constants: BufferHandle,
    pub mesh_records: BufferHandle,
    pub material_records: BufferHandle,
    /// Shader-resource heap the material texture indices point into
    pub texture_heap: DescriptorHeapHandle,
    pub sampler_heap: DescriptorHeapHandle,
    pub sampler_index: u32,
}

pub struct ForwardPass {
    layout: PipelineLayoutHandle,
    pipeline: RenderPipelineHandle,
    texture_table_size: u32,
}

impl ForwardPass {
    /// `texture_table_size` is the number of shader-resource slots visible to
    /// the fragment stage.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        color_format: TextureFormat,
        texture_table_size: u32,
    ) -> BackendResult<Self> {
        let vertex = ShaderStageFlags::VERTEX;
        let fragment = ShaderStageFlags::FRAGMENT;
        let layout = backend.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("Forward Pass Layout".into()),
            push_constant_size: DRAW_CONSTANTS_SIZE,
            push_constant_visibility: ShaderStageFlags::VERTEX_FRAGMENT,
            slots: vec![
                LayoutSlot {
                    kind: LayoutSlotKind::UniformBuffer,
                    visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                },
                LayoutSlot {
                    kind: LayoutSlotKind::UniformBuffer,
                    visibility: fragment,
                },
                LayoutSlot {
                    kind: LayoutSlotKind::StorageBuffer,
                    visibility: vertex,
                },
                LayoutSlot {
                    kind: LayoutSlotKind::StorageBuffer,
                    visibility: fragment,
                },
                LayoutSlot {
                    kind: LayoutSlotKind::TextureTable {
                        count: texture_table_size,
                    },
                    visibility: fragment,
                },
                LayoutSlot {
                    kind: LayoutSlotKind::Sampler,
                    visibility: fragment,
                },
            ],
        })?;

        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("Forward Pass".into()),
            layout,
            shader: forward_shader(texture_table_size),
            vertex_entry: "vs_main".into(),
            fragment_entry: Some("fs_main".into()),
            vertex_layouts: vec![Vertex::layout()],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: false,
                depth_compare: CompareFunction::LessEqual,
            }),
            color_targets: vec![ColorTargetState {
                format: color_format,
                blend: None,
                write_mask: ColorWrites::ALL,
            }],
        })?;
        log::debug!(
            "Forward pipeline ready ({:?}, {} texture slots)",
            color_format,
            texture_table_size
        );

        Ok(Self {
            layout,
            pipeline,
            texture_table_size,
        })
    }

    pub fn layout(&self) -> PipelineLayoutHandle {
        self.layout
    }

    pub fn pipeline(&self) -> RenderPipelineHandle {
        self.pipeline
    }

    pub fn texture_table_size(&self) -> u32 {
        self.texture_table_size
    }

    /// Open the pass: clear color, load the pre-pass depth read-only.
    pub fn begin<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        color_view: TextureViewHandle,
        depth_view: TextureViewHandle,
        (width, height): (u32, u32),
        clear_color: [f32; 4],
        bindings: &ForwardBindings,
    ) {
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Forward Pass".into()),
            color_attachments: vec![ColorAttachment {
                view: color_view,
                load_op: LoadOp::Clear(clear_color),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth_view,
                depth_load_op: LoadOp::Load,
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
            }),
        });
        backend.set_viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        backend.set_render_pipeline(self.pipeline);
        backend.set_binding(SCENE_SLOT, Binding::UniformBuffer(bindings.scene_constants));
        backend.set_binding(LIGHT_SLOT, Binding::UniformBuffer(bindings.light_constants));
        backend.set_binding(MESH_SLOT, Binding::StorageBuffer(bindings.mesh_records));
        backend.set_binding(MATERIAL_SLOT, Binding::StorageBuffer(bindings.material_records));
        backend.set_binding(
            TEXTURE_TABLE_SLOT,
            Binding::DescriptorTable(bindings.texture_heap),
        );
        backend.set_binding(
            SAMPLER_SLOT,
            Binding::Sampler {
                heap: bindings.sampler_heap,
                index: bindings.sampler_index,
            },
        );
    }
}

/// Full forward shader source with the texture table sized to `texture_table_size`
pub fn forward_shader(texture_table_size: u32) -> String {
    format!(
        "{}{}",
        SHADER_COMMON,
        FORWARD_SHADER.replace("TEXTURE_TABLE_SIZE", &texture_table_size.to_string())
    )
}

const FORWARD_SHADER: &str = r#"
struct LightConstants {
    direction: vec4<f32>,
    color_intensity: vec4<f32>,
    ambient: vec4<f32>,
}

struct MaterialRecord {
    base_color: vec4<f32>,
    metallic: f32,
    roughness: f32,
    albedo_index: i32,
    metallic_roughness_index: i32,
    normal_index: i32,
    _pad0: i32,
    _pad1: i32,
    _pad2: i32,
}

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) color: vec4<f32>,
    @location(4) tangent: vec4<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) color: vec4<f32>,
    @location(4) world_tangent: vec4<f32>,
}

@group(0) @binding(0) var<uniform> scene: SceneConstants;
@group(0) @binding(1) var<uniform> light: LightConstants;
@group(0) @binding(2) var<storage, read> meshes: array<MeshRecord>;
@group(0) @binding(3) var<storage, read> materials: array<MaterialRecord>;
@group(0) @binding(4) var textures: binding_array<texture_2d<f32>, TEXTURE_TABLE_SIZE>;
@group(0) @binding(5) var material_sampler: sampler;

const PI: f32 = 3.14159265;

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    let mesh = meshes[draw.mesh_index];
    let world = mesh.world * vec4<f32>(input.position, 1.0);

    var output: VertexOutput;
    output.clip_position = scene.view_projection * world;
    output.world_position = world.xyz;
    output.world_normal = normalize((mesh.normal * vec4<f32>(input.normal, 0.0)).xyz);
    output.uv = input.uv;
    output.color = input.color;

    // w == 0 marks a vertex without a tangent
    var tangent = vec3<f32>(0.0);
    if input.tangent.w != 0.0 {
        tangent = normalize((mesh.world * vec4<f32>(input.tangent.xyz, 0.0)).xyz);
    }
    output.world_tangent = vec4<f32>(tangent, input.tangent.w);
    return output;
}

fn sample_table(index: i32, uv: vec2<f32>) -> vec4<f32> {
    return textureSampleLevel(textures[index], material_sampler, uv, 0.0);
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    let material = materials[draw.material_index];

    var albedo = material.base_color * input.color;
    if material.albedo_index >= 0 {
        albedo *= sample_table(material.albedo_index, input.uv);
    }

    var metallic = material.metallic;
    var roughness = material.roughness;
    if material.metallic_roughness_index >= 0 {
        let mr = sample_table(material.metallic_roughness_index, input.uv);
        roughness *= mr.g;
        metallic *= mr.b;
    }

    var n = normalize(input.world_normal);
    if material.normal_index >= 0 && input.world_tangent.w != 0.0 {
        let t = normalize(input.world_tangent.xyz - n * dot(n, input.world_tangent.xyz));
        let b = cross(n, t) * input.world_tangent.w;
        let tangent_normal = sample_table(material.normal_index, input.uv).xyz * 2.0 - 1.0;
        n = normalize(mat3x3<f32>(t, b, n) * tangent_normal);
    }

    let l = normalize(-light.direction.xyz);
    let v = normalize(scene.camera_position.xyz - input.world_position);
    let h = normalize(l + v);
    let n_dot_l = max(dot(n, l), 0.0);
    let radiance = light.color_intensity.rgb * light.color_intensity.w;

    let diffuse_color = albedo.rgb * (1.0 - metallic);
    let specular_color = mix(vec3<f32>(0.04), albedo.rgb, metallic);
    let shininess = exp2(10.0 * (1.0 - clamp(roughness, 0.0, 1.0)) + 1.0);
    let specular = pow(max(dot(n, h), 0.0), shininess) * (shininess + 8.0) / (8.0 * PI);

    let lit = (diffuse_color / PI + specular_color * specular) * radiance * n_dot_l;
    let color = light.ambient.rgb * albedo.rgb + lit;
    return vec4<f32>(color, albedo.a);
}
"#;
