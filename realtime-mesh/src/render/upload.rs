use std::fmt;

use crate::{SectionId, StreamKind};

/// Destination of geometry data on the GPU (or wherever the host renders from).
///
/// Implemented by the host. [`RenderProxySynchronizer`](super::RenderProxySynchronizer) calls
/// it only from [`swap()`](super::RenderProxySynchronizer::swap), on the thread which owns the
/// synchronizer.
pub trait UploadBuffer {
    /// Allocates a buffer able to hold `capacity_bytes` bytes of the given stream.
    ///
    /// Any previous allocation for the same stream remains valid until it is
    /// [released](Self::release).
    fn allocate(
        &mut self,
        section: SectionId,
        lod: usize,
        kind: StreamKind,
        capacity_bytes: usize,
    ) -> Result<BufferHandle, UploadError>;

    /// Copies `bytes` into the most recently allocated buffer of the given stream, starting at
    /// `byte_offset`.
    fn upload_range(
        &mut self,
        section: SectionId,
        lod: usize,
        kind: StreamKind,
        byte_offset: usize,
        bytes: &[u8],
    ) -> Result<(), UploadError>;

    /// Frees a buffer which will no longer be used.
    fn release(&mut self, handle: BufferHandle) {
        _ = handle;
    }
}

impl<U: UploadBuffer + ?Sized> UploadBuffer for &mut U {
    fn allocate(
        &mut self,
        section: SectionId,
        lod: usize,
        kind: StreamKind,
        capacity_bytes: usize,
    ) -> Result<BufferHandle, UploadError> {
        (**self).allocate(section, lod, kind, capacity_bytes)
    }

    fn upload_range(
        &mut self,
        section: SectionId,
        lod: usize,
        kind: StreamKind,
        byte_offset: usize,
        bytes: &[u8],
    ) -> Result<(), UploadError> {
        (**self).upload_range(section, lod, kind, byte_offset, bytes)
    }

    fn release(&mut self, handle: BufferHandle) {
        (**self).release(handle)
    }
}

/// Opaque identifier of a buffer allocated by an [`UploadBuffer`].
///
/// Its meaning is entirely up to the [`UploadBuffer`] implementation.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[expect(clippy::exhaustive_structs)]
pub struct BufferHandle(pub u64);

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Failure reported by an [`UploadBuffer`].
///
/// The synchronizer keeps the affected range pending and tries again at the next swap; it
/// never drops data because of an upload failure.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum UploadError {
    /// The device has no room for the allocation or staging data.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// The upload referred to a buffer which does not exist.
    #[error("no buffer allocated for {section} LOD {lod} {kind}")]
    NoBuffer {
        /// Section of the upload.
        section: SectionId,
        /// LOD index of the upload.
        lod: usize,
        /// Stream of the upload.
        kind: StreamKind,
    },
    /// Any other failure.
    #[error("upload failed: {0}")]
    Other(String),
}
