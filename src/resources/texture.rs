//! GPU textures and their views

use super::context::GraphicsContext;
use super::descriptor::kind::{DepthStencil, RenderTarget, ShaderResource};
use super::descriptor::DescriptorSlot;
use super::state::{ResourceState, TrackedState};
use super::upload::{ResourceUploader, TextureCopyLayout, UploadBatch};
use super::ResourceError;
use crate::backend::{
    BarrierResource, DescriptorView, GraphicsBackend, TextureAspect, TextureDescriptor,
    TextureFormat, TextureHandle, TextureUsage, TextureViewDescriptor, TextureViewHandle,
};

/// Format of depth buffers
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// An image resource, its default view and whichever descriptor slots its
/// variant needs.
#[derive(Debug)]
pub struct GpuTexture {
    handle: TextureHandle,
    view: TextureViewHandle,
    label: String,
    width: u32,
    height: u32,
    format: TextureFormat,
    state: TrackedState,
    srv: Option<DescriptorSlot<ShaderResource>>,
    rtv: Option<DescriptorSlot<RenderTarget>>,
    dsv: Option<DescriptorSlot<DepthStencil>>,
}

impl GpuTexture {
    fn create<B: GraphicsBackend>(
        backend: &mut B,
        desc: &TextureDescriptor,
        view: &TextureViewDescriptor,
        initial: ResourceState,
    ) -> Result<(TextureHandle, TextureViewHandle, TrackedState), ResourceError> {
        let handle = backend.create_texture(desc)?;
        let view = backend.create_texture_view(handle, view)?;
        Ok((
            handle,
            view,
            TrackedState::new(BarrierResource::Texture(handle), initial),
        ))
    }

    /// Sampled RGBA8 texture filled from tightly packed `rgba` texels
    pub fn color<B: GraphicsBackend>(
        ctx: &mut GraphicsContext<B>,
        label: &str,
        width: u32,
        height: u32,
        rgba: &[u8],
        srgb: bool,
        batch: &mut UploadBatch,
    ) -> Result<Self, ResourceError> {
        let layout = TextureCopyLayout::for_rgba8(width, height);
        if rgba.len() != layout.packed_size() {
            return Err(ResourceError::ImageSize {
                label: label.to_string(),
                expected: layout.packed_size(),
                actual: rgba.len(),
            });
        }
        let format = if srgb {
            TextureFormat::Rgba8UnormSrgb
        } else {
            TextureFormat::Rgba8Unorm
        };
        let (handle, view, mut state) = Self::create(
            ctx.backend_mut(),
            &TextureDescriptor {
                label: Some(label.to_string()),
                width,
                height,
                mip_levels: 1,
                format,
                usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            },
            &TextureViewDescriptor {
                label: Some(label.to_string()),
                ..Default::default()
            },
            ResourceState::CopyDest,
        )?;

        ResourceUploader::upload_texture(
            ctx.backend_mut(),
            label,
            handle,
            &mut state,
            &layout,
            rgba,
            ResourceState::ShaderResource,
            batch,
        )?;
        let srv = ctx.create_shader_resource(DescriptorView::Texture(view))?;
        log::debug!("Created texture {} ({}x{}, {:?})", label, width, height, format);

        Ok(Self {
            handle,
            view,
            label: label.to_string(),
            width,
            height,
            format,
            state,
            srv: Some(srv),
            rtv: None,
            dsv: None,
        })
    }

    /// Depth buffer with a depth-stencil slot, starting in the depth-write state
    pub fn depth<B: GraphicsBackend>(
        ctx: &mut GraphicsContext<B>,
        label: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, ResourceError> {
        let (handle, view, state) = Self::create(
            ctx.backend_mut(),
            &TextureDescriptor {
                label: Some(label.to_string()),
                width,
                height,
                mip_levels: 1,
                format: DEPTH_FORMAT,
                usage: TextureUsage::RENDER_ATTACHMENT,
            },
            &TextureViewDescriptor {
                label: Some(label.to_string()),
                format: None,
                aspect: Some(TextureAspect::DepthOnly),
            },
            ResourceState::DepthWrite,
        )?;
        let dsv = ctx.create_depth_stencil(DescriptorView::DepthStencil(view))?;

        Ok(Self {
            handle,
            view,
            label: label.to_string(),
            width,
            height,
            format: DEPTH_FORMAT,
            state,
            srv: None,
            rtv: None,
            dsv: Some(dsv),
        })
    }

    /// Color attachment that is copied out of once the frame is drawn.
    ///
    /// Starts in the copy-source state, which is where a finished frame leaves it.
    /// It gets no shader-resource slot: the forward pass binds the whole
    /// shader-resource heap, and a target may not be sampled while attached.
    pub fn render_target<B: GraphicsBackend>(
        ctx: &mut GraphicsContext<B>,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<Self, ResourceError> {
        let (handle, view, state) = Self::create(
            ctx.backend_mut(),
            &TextureDescriptor {
                label: Some(label.to_string()),
                width,
                height,
                mip_levels: 1,
                format,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
            },
            &TextureViewDescriptor {
                label: Some(label.to_string()),
                ..Default::default()
            },
            ResourceState::CopySource,
        )?;
        let rtv = ctx.create_render_target(DescriptorView::RenderTarget(view))?;

        Ok(Self {
            handle,
            view,
            label: label.to_string(),
            width,
            height,
            format,
            state,
            srv: None,
            rtv: Some(rtv),
            dsv: None,
        })
    }

    pub fn handle(&self) -> TextureHandle {
        self.handle
    }

    pub fn view(&self) -> TextureViewHandle {
        self.view
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn state(&self) -> ResourceState {
        self.state.current()
    }

    pub fn srv(&self) -> Option<DescriptorSlot<ShaderResource>> {
        self.srv
    }

    pub fn rtv(&self) -> Option<DescriptorSlot<RenderTarget>> {
        self.rtv
    }

    pub fn dsv(&self) -> Option<DescriptorSlot<DepthStencil>> {
        self.dsv
    }

    pub fn transition<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        expected: ResourceState,
        next: ResourceState,
    ) -> Result<bool, ResourceError> {
        Ok(self.state.transition(backend, expected, next)?)
    }

    /// Free the descriptor slots and the image.
    pub fn destroy<B: GraphicsBackend>(self, ctx: &mut GraphicsContext<B>) -> Result<(), ResourceError> {
        if let Some(srv) = self.srv {
            ctx.release_shader_resource(srv)?;
        }
        if let Some(rtv) = self.rtv {
            ctx.release_render_target(rtv)?;
        }
        if let Some(dsv) = self.dsv {
            ctx.release_depth_stencil(dsv)?;
        }
        ctx.backend_mut().destroy_texture(self.handle)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::resources::context::DescriptorCapacities;

    fn context() -> GraphicsContext<HeadlessBackend> {
        GraphicsContext::new(HeadlessBackend::new(8, 8), DescriptorCapacities::default()).unwrap()
    }

    #[test]
    fn color_texture_uploads_through_staging() {
        let mut ctx = context();
        let texels: Vec<u8> = (0..3 * 2 * 4).map(|i| i as u8).collect();
        let mut batch = UploadBatch::new();
        let texture = GpuTexture::color(&mut ctx, "checker", 3, 2, &texels, true, &mut batch).unwrap();

        assert_eq!(batch.len(), 1);
        // Rows are padded to the copy pitch in the staging buffer.
        assert_eq!(batch.total_bytes(), 512);
        assert_eq!(texture.state(), ResourceState::ShaderResource);

        ctx.backend_mut().submit().unwrap();
        ctx.backend_mut().signal_fence(1).unwrap();
        ctx.backend_mut().wait_for_fence(1, None).unwrap();
        assert_eq!(ctx.backend().texture_contents(texture.handle()).unwrap(), texels.as_slice());

        let heap = ctx.shader_resources().heap();
        let srv = texture.srv().unwrap();
        assert_eq!(
            ctx.backend().descriptor(heap, srv.index()),
            Some(DescriptorView::Texture(texture.view()))
        );

        batch.stamp(1);
        batch.release(ctx.backend_mut()).unwrap();
    }

    #[test]
    fn mis_sized_image_is_rejected() {
        let mut ctx = context();
        let result = GpuTexture::color(&mut ctx, "short", 2, 2, &[0; 12], false, &mut UploadBatch::new());
        assert!(matches!(
            result,
            Err(ResourceError::ImageSize {
                expected: 16,
                actual: 12,
                ..
            })
        ));
    }

    #[test]
    fn variants_take_slots_from_their_own_heaps() {
        let mut ctx = context();
        let depth = GpuTexture::depth(&mut ctx, "depth", 8, 8).unwrap();
        let target = GpuTexture::render_target(&mut ctx, "target", 8, 8, TextureFormat::Rgba8UnormSrgb).unwrap();

        assert!(depth.dsv().is_some() && depth.srv().is_none() && depth.rtv().is_none());
        assert!(target.rtv().is_some() && target.srv().is_none() && target.dsv().is_none());
        assert_eq!(ctx.shader_resources().live_count(), 0);
        assert_eq!(ctx.depth_stencils().live_count(), 1);
        assert_eq!(ctx.render_targets().live_count(), 1);
        assert_eq!(depth.state(), ResourceState::DepthWrite);
        assert_eq!(target.state(), ResourceState::CopySource);

        depth.destroy(&mut ctx).unwrap();
        target.destroy(&mut ctx).unwrap();
        assert_eq!(ctx.depth_stencils().live_count(), 0);
        assert_eq!(ctx.render_targets().live_count(), 0);
        assert_eq!(ctx.shader_resources().live_count(), 0);
    }
}
