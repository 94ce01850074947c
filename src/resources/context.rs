//! Graphics context: the backend plus the descriptor heaps every resource draws from

use super::descriptor::kind::{DepthStencil, RenderTarget, Sampler, ShaderResource};
use super::descriptor::{DescriptorAllocator, DescriptorError, DescriptorKind, DescriptorSlot};
use crate::backend::{DescriptorView, GraphicsBackend, SamplerHandle};

/// Slot counts for the four descriptor heaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorCapacities {
    pub shader_resource: u32,
    pub render_target: u32,
    pub depth_stencil: u32,
    pub sampler: u32,
}

impl Default for DescriptorCapacities {
    fn default() -> Self {
        Self {
            shader_resource: 1024,
            render_target: 16,
            depth_stencil: 4,
            sampler: 16,
        }
    }
}

/// Owns the backend and its descriptor heaps.
///
/// Threaded explicitly through every constructor that touches the device.
pub struct GraphicsContext<B: GraphicsBackend> {
    backend: B,
    shader_resources: DescriptorAllocator<ShaderResource>,
    render_targets: DescriptorAllocator<RenderTarget>,
    depth_stencils: DescriptorAllocator<DepthStencil>,
    samplers: DescriptorAllocator<Sampler>,
}

fn allocate_and_write<B: GraphicsBackend, K: DescriptorKind>(
    backend: &mut B,
    allocator: &mut DescriptorAllocator<K>,
    view: DescriptorView,
) -> Result<DescriptorSlot<K>, DescriptorError> {
    let slot = allocator.allocate()?;
    if let Err(err) = allocator.write(backend, slot, view) {
        allocator.free(slot)?;
        return Err(err);
    }
    Ok(slot)
}

impl<B: GraphicsBackend> GraphicsContext<B> {
    pub fn new(mut backend: B, capacities: DescriptorCapacities) -> Result<Self, DescriptorError> {
        let shader_resources =
            DescriptorAllocator::new(&mut backend, capacities.shader_resource, true)?;
        let render_targets = DescriptorAllocator::new(&mut backend, capacities.render_target, false)?;
        let depth_stencils = DescriptorAllocator::new(&mut backend, capacities.depth_stencil, false)?;
        let samplers = DescriptorAllocator::new(&mut backend, capacities.sampler, true)?;
        log::info!(
            "Graphics context ready on {} ({}x{})",
            backend.name(),
            backend.surface_size().0,
            backend.surface_size().1
        );
        Ok(Self {
            backend,
            shader_resources,
            render_targets,
            depth_stencils,
            samplers,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn shader_resources(&self) -> &DescriptorAllocator<ShaderResource> {
        &self.shader_resources
    }

    pub fn shader_resources_mut(&mut self) -> &mut DescriptorAllocator<ShaderResource> {
        &mut self.shader_resources
    }

    pub fn render_targets(&self) -> &DescriptorAllocator<RenderTarget> {
        &self.render_targets
    }

    pub fn depth_stencils(&self) -> &DescriptorAllocator<DepthStencil> {
        &self.depth_stencils
    }

    pub fn samplers(&self) -> &DescriptorAllocator<Sampler> {
        &self.samplers
    }

    /// Allocate a shader-resource slot holding `view`
    pub fn create_shader_resource(
        &mut self,
        view: DescriptorView,
    ) -> Result<DescriptorSlot<ShaderResource>, DescriptorError> {
        allocate_and_write(&mut self.backend, &mut self.shader_resources, view)
    }

    pub fn create_render_target(
        &mut self,
        view: DescriptorView,
    ) -> Result<DescriptorSlot<RenderTarget>, DescriptorError> {
        allocate_and_write(&mut self.backend, &mut self.render_targets, view)
    }

    pub fn create_depth_stencil(
        &mut self,
        view: DescriptorView,
    ) -> Result<DescriptorSlot<DepthStencil>, DescriptorError> {
        allocate_and_write(&mut self.backend, &mut self.depth_stencils, view)
    }

    pub fn create_sampler_slot(
        &mut self,
        sampler: SamplerHandle,
    ) -> Result<DescriptorSlot<Sampler>, DescriptorError> {
        allocate_and_write(
            &mut self.backend,
            &mut self.samplers,
            DescriptorView::Sampler(sampler),
        )
    }

    pub fn release_shader_resource(
        &mut self,
        slot: DescriptorSlot<ShaderResource>,
    ) -> Result<(), DescriptorError> {
        self.shader_resources.release(&mut self.backend, slot)
    }

    pub fn release_render_target(
        &mut self,
        slot: DescriptorSlot<RenderTarget>,
    ) -> Result<(), DescriptorError> {
        self.render_targets.release(&mut self.backend, slot)
    }

    pub fn release_depth_stencil(
        &mut self,
        slot: DescriptorSlot<DepthStencil>,
    ) -> Result<(), DescriptorError> {
        self.depth_stencils.release(&mut self.backend, slot)
    }
}
