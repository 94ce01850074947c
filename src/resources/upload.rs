//! Staged uploads into device-local memory
//!
//! The uploader never frees a staging buffer itself. Every staging buffer it
//! creates goes into an [`UploadBatch`] owned by the caller, which may only be
//! released once the fence covering the copy has been reached.

use super::state::{ResourceState, TrackedState};
use super::ResourceError;
use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, ImageDataLayout,
    MemoryLocation, TextureHandle,
};

/// Row pitch alignment required for buffer-to-texture copies
pub const TEXTURE_ROW_PITCH_ALIGNMENT: u32 = 256;

/// A temporary upload-heap buffer read by a pending copy
#[derive(Debug)]
pub struct StagingBuffer {
    handle: BufferHandle,
    size: u64,
}

impl StagingBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Staging buffers of one or more uploads, alive until their copies have executed
#[derive(Debug, Default)]
pub struct UploadBatch {
    staging: Vec<StagingBuffer>,
    fence: Option<u64>,
}

impl UploadBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.staging.iter().map(|s| s.size).sum()
    }

    pub fn staging_buffers(&self) -> impl Iterator<Item = &StagingBuffer> {
        self.staging.iter()
    }

    /// Fence value whose completion covers every copy in the batch
    pub fn fence_value(&self) -> Option<u64> {
        self.fence
    }

    /// Record the fence value signaled after the copies were submitted.
    pub fn stamp(&mut self, fence_value: u64) {
        self.fence = Some(self.fence.map_or(fence_value, |f| f.max(fence_value)));
    }

    fn push(&mut self, staging: StagingBuffer) {
        self.staging.push(staging);
    }

    /// Destroy the staging buffers once the GPU has finished reading them.
    ///
    /// On refusal the batch keeps its buffers and may be released later.
    pub fn release<B: GraphicsBackend>(&mut self, backend: &mut B) -> Result<(), ResourceError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let completed = backend.completed_fence_value();
        match self.fence {
            Some(required) if completed >= required => {}
            required => {
                return Err(ResourceError::StagingInFlight {
                    required,
                    completed,
                });
            }
        }
        let count = self.staging.len();
        let bytes = self.total_bytes();
        while let Some(staging) = self.staging.pop() {
            if let Err(err) = backend.destroy_buffer(staging.handle) {
                self.staging.push(staging);
                return Err(err.into());
            }
        }
        self.fence = None;
        log::debug!("Released {} staging buffers ({} bytes)", count, bytes);
        Ok(())
    }
}

impl Drop for UploadBatch {
    fn drop(&mut self) {
        if !self.staging.is_empty() {
            log::warn!(
                "Upload batch dropped with {} unreleased staging buffers",
                self.staging.len()
            );
        }
    }
}

/// Placement of an image inside a staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureCopyLayout {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    /// Bytes of texel data in one row
    pub unpadded_row_bytes: u32,
    /// Distance between row starts in the staging buffer
    pub row_pitch: u32,
    pub rows_per_image: u32,
    pub slice_pitch: u64,
    pub total_size: u64,
}

impl TextureCopyLayout {
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        let unpadded_row_bytes = width * bytes_per_pixel;
        let row_pitch = unpadded_row_bytes.next_multiple_of(TEXTURE_ROW_PITCH_ALIGNMENT);
        let slice_pitch = row_pitch as u64 * height as u64;
        Self {
            width,
            height,
            bytes_per_pixel,
            unpadded_row_bytes,
            row_pitch,
            rows_per_image: height,
            slice_pitch,
            total_size: slice_pitch,
        }
    }

    pub fn for_rgba8(width: u32, height: u32) -> Self {
        Self::new(width, height, 4)
    }

    /// Size of the tightly packed source data
    pub fn packed_size(&self) -> usize {
        self.unpadded_row_bytes as usize * self.height as usize
    }

    /// Spread tightly packed rows out to the staging row pitch.
    pub fn pitch_rows(&self, packed: &[u8]) -> Vec<u8> {
        let row = self.unpadded_row_bytes as usize;
        let pitch = self.row_pitch as usize;
        if row == pitch {
            return packed.to_vec();
        }
        let mut staged = vec![0u8; self.total_size as usize];
        for (src, dst) in packed.chunks_exact(row).zip(staged.chunks_exact_mut(pitch)) {
            dst[..row].copy_from_slice(src);
        }
        staged
    }

    pub fn image_data_layout(&self) -> ImageDataLayout {
        ImageDataLayout {
            offset: 0,
            bytes_per_row: self.row_pitch,
            rows_per_image: self.rows_per_image,
        }
    }
}

/// Records staging copies into device-local resources.
pub struct ResourceUploader;

impl ResourceUploader {
    fn create_staging<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        bytes: &[u8],
    ) -> Result<StagingBuffer, ResourceError> {
        let size = bytes.len() as u64;
        let handle = backend.create_buffer(&BufferDescriptor {
            label: Some(format!("{} staging", label)),
            size,
            usage: BufferUsage::COPY_SRC,
            location: MemoryLocation::CpuToGpu,
        })?;
        backend.write_buffer(handle, 0, bytes)?;
        Ok(StagingBuffer { handle, size })
    }

    /// Copy `data` into a buffer that is in the copy-destination state, then
    /// transition it to `final_state`.
    pub fn upload_buffer<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        dst: BufferHandle,
        dst_state: &mut TrackedState,
        data: &[u8],
        final_state: ResourceState,
        batch: &mut UploadBatch,
    ) -> Result<(), ResourceError> {
        if data.is_empty() {
            return Err(ResourceError::Empty(label.to_string()));
        }
        let staging = Self::create_staging(backend, label, data)?;
        backend.copy_buffer_to_buffer(staging.handle, 0, dst, 0, staging.size)?;
        batch.push(staging);
        dst_state.transition(backend, ResourceState::CopyDest, final_state)?;
        Ok(())
    }

    /// Copy tightly packed texels into mip 0 of a texture in the copy-destination
    /// state, then transition it to `final_state`.
    #[allow(clippy::too_many_arguments)]
    pub fn upload_texture<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        dst: TextureHandle,
        dst_state: &mut TrackedState,
        layout: &TextureCopyLayout,
        texels: &[u8],
        final_state: ResourceState,
        batch: &mut UploadBatch,
    ) -> Result<(), ResourceError> {
        if texels.len() != layout.packed_size() {
            return Err(ResourceError::ImageSize {
                label: label.to_string(),
                expected: layout.packed_size(),
                actual: texels.len(),
            });
        }
        let staged = layout.pitch_rows(texels);
        let staging = Self::create_staging(backend, label, &staged)?;
        backend.copy_buffer_to_texture(
            staging.handle,
            layout.image_data_layout(),
            dst,
            layout.width,
            layout.height,
        )?;
        batch.push(staging);
        dst_state.transition(backend, ResourceState::CopyDest, final_state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BarrierResource, HeadlessBackend};
    use rstest::rstest;

    #[rstest]
    #[case::narrow(1, 1, 256, 256)]
    #[case::exact(64, 3, 256, 768)]
    #[case::padded(65, 2, 512, 1024)]
    #[case::wide(300, 4, 1280, 5120)]
    fn row_pitch_is_aligned(
        #[case] width: u32,
        #[case] height: u32,
        #[case] row_pitch: u32,
        #[case] total: u64,
    ) {
        let layout = TextureCopyLayout::for_rgba8(width, height);
        assert_eq!(layout.row_pitch, row_pitch);
        assert_eq!(layout.row_pitch % TEXTURE_ROW_PITCH_ALIGNMENT, 0);
        assert_eq!(layout.total_size, total);
        assert_eq!(layout.rows_per_image, height);
    }

    #[test]
    fn pitched_rows_keep_texels_in_place() {
        let layout = TextureCopyLayout::for_rgba8(2, 2);
        let packed: Vec<u8> = (0..16).collect();
        let staged = layout.pitch_rows(&packed);
        assert_eq!(staged.len(), 512);
        assert_eq!(&staged[..8], &packed[..8]);
        assert_eq!(&staged[256..264], &packed[8..]);
        assert!(staged[8..256].iter().all(|b| *b == 0));
    }

    #[test]
    fn batch_refuses_release_before_fence() {
        let mut backend = HeadlessBackend::new(4, 4);
        let dst = backend
            .create_buffer(&BufferDescriptor {
                label: Some("dst".into()),
                size: 4,
                usage: BufferUsage::COPY_DST | BufferUsage::STORAGE,
                location: MemoryLocation::GpuOnly,
            })
            .unwrap();
        let mut state = TrackedState::new(BarrierResource::Buffer(dst), ResourceState::CopyDest);
        let mut batch = UploadBatch::new();
        ResourceUploader::upload_buffer(
            &mut backend,
            "dst",
            dst,
            &mut state,
            &[9, 8, 7, 6],
            ResourceState::ShaderResource,
            &mut batch,
        )
        .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(state.current(), ResourceState::ShaderResource);

        backend.submit().unwrap();
        backend.signal_fence(1).unwrap();
        batch.stamp(1);

        let staging = batch.staging_buffers().next().unwrap().handle();
        let refused = batch.release(&mut backend);
        assert!(matches!(
            refused,
            Err(ResourceError::StagingInFlight {
                required: Some(1),
                completed: 0
            })
        ));
        assert_eq!(batch.len(), 1);

        backend.wait_for_fence(1, None).unwrap();
        assert_eq!(backend.buffer_contents(dst).unwrap(), &[9, 8, 7, 6]);
        batch.release(&mut backend).unwrap();
        assert!(!backend.buffer_exists(staging));
    }

    #[test]
    fn unstamped_batch_is_in_flight() {
        let mut backend = HeadlessBackend::new(4, 4);
        let staging = ResourceUploader::create_staging(&mut backend, "x", &[1, 2, 3, 4]).unwrap();
        let mut batch = UploadBatch::new();
        batch.push(staging);
        let result = batch.release(&mut backend);
        assert!(matches!(
            result,
            Err(ResourceError::StagingInFlight { required: None, .. })
        ));

        backend.submit().unwrap();
        backend.signal_fence(1).unwrap();
        backend.wait_for_fence(1, None).unwrap();
        batch.stamp(1);
        batch.release(&mut backend).unwrap();
        assert!(batch.is_empty());
    }
}
