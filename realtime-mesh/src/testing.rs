//! In-memory implementations of the external interfaces, for tests and benchmarks.
//! Not a stable API.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::collision::{CollisionRepresentation, InstallError, PhysicsWorld};
use crate::render::{BufferHandle, UploadBuffer, UploadError};
use crate::{SectionId, StreamKind, StreamSet, Version};

/// A flat grid of `n × n` cells covering `[0, 1]²`, with every stream
/// [`shapes::MeshBuilder`](crate::shapes::MeshBuilder) produces.
pub fn grid_mesh(n: u32) -> StreamSet {
    crate::shapes::plane(n, 1.0, [255, 255, 255, 255])
}

type StreamKey = (SectionId, usize, StreamKind);

/// A call made to a [`RecordingUploadBuffer`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums, missing_docs)]
pub enum UploadCall {
    Allocate {
        section: SectionId,
        lod: usize,
        kind: StreamKind,
        capacity_bytes: usize,
        handle: BufferHandle,
    },
    Upload {
        section: SectionId,
        lod: usize,
        kind: StreamKind,
        bytes: Range<usize>,
    },
    Release(BufferHandle),
}

/// [`UploadBuffer`] which stores buffers in memory and records every call.
#[derive(Debug, Default)]
pub struct RecordingUploadBuffer {
    /// Every call, in order, excluding failed ones.
    pub calls: Vec<UploadCall>,
    /// This many upcoming calls of [`UploadBuffer::upload_range()`] fail.
    pub fail_uploads: usize,
    /// This many calls of [`UploadBuffer::upload_range()`] succeed before `fail_uploads`
    /// takes effect.
    pub uploads_before_failure: usize,
    /// This many upcoming calls of [`UploadBuffer::allocate()`] fail.
    pub fail_allocations: usize,
    next_handle: u64,
    buffers: BTreeMap<BufferHandle, Vec<u8>>,
    current: BTreeMap<StreamKey, BufferHandle>,
}

impl RecordingUploadBuffer {
    /// Creates an empty buffer store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the contents of the most recent buffer allocated for the stream.
    /// Its length is the allocated capacity.
    pub fn contents(&self, section: SectionId, lod: usize, kind: StreamKind) -> Option<&[u8]> {
        let handle = self.current.get(&(section, lod, kind))?;
        self.buffers.get(handle).map(Vec::as_slice)
    }

    /// Returns the contents of a buffer which has not been released.
    pub fn buffer(&self, handle: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&handle).map(Vec::as_slice)
    }

    /// Number of buffers allocated and not released.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Returns the byte ranges uploaded, in order.
    pub fn uploads(&self) -> Vec<(SectionId, usize, StreamKind, Range<usize>)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                UploadCall::Upload {
                    section,
                    lod,
                    kind,
                    bytes,
                } => Some((*section, *lod, *kind, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    /// Total bytes uploaded.
    pub fn bytes_uploaded(&self) -> usize {
        self.uploads().iter().map(|(.., bytes)| bytes.len()).sum()
    }
}

impl UploadBuffer for RecordingUploadBuffer {
    fn allocate(
        &mut self,
        section: SectionId,
        lod: usize,
        kind: StreamKind,
        capacity_bytes: usize,
    ) -> Result<BufferHandle, UploadError> {
        if self.fail_allocations > 0 {
            self.fail_allocations -= 1;
            return Err(UploadError::OutOfMemory);
        }
        let handle = BufferHandle(self.next_handle);
        self.next_handle += 1;
        self.buffers.insert(handle, vec![0; capacity_bytes]);
        self.current.insert((section, lod, kind), handle);
        self.calls.push(UploadCall::Allocate {
            section,
            lod,
            kind,
            capacity_bytes,
            handle,
        });
        Ok(handle)
    }

    fn upload_range(
        &mut self,
        section: SectionId,
        lod: usize,
        kind: StreamKind,
        byte_offset: usize,
        bytes: &[u8],
    ) -> Result<(), UploadError> {
        if self.fail_uploads > 0 {
            if self.uploads_before_failure > 0 {
                self.uploads_before_failure -= 1;
            } else {
                self.fail_uploads -= 1;
                return Err(UploadError::Other("injected failure".into()));
            }
        }
        let buffer = self
            .current
            .get(&(section, lod, kind))
            .and_then(|handle| self.buffers.get_mut(handle))
            .ok_or(UploadError::NoBuffer { section, lod, kind })?;
        let range = byte_offset..byte_offset + bytes.len();
        let capacity = buffer.len();
        buffer
            .get_mut(range.clone())
            .ok_or_else(|| UploadError::Other(format!("{range:?} exceeds {capacity}")))?
            .copy_from_slice(bytes);
        self.calls.push(UploadCall::Upload {
            section,
            lod,
            kind,
            bytes: range,
        });
        Ok(())
    }

    fn release(&mut self, handle: BufferHandle) {
        self.buffers.remove(&handle);
        self.current.retain(|_, h| *h != handle);
        self.calls.push(UploadCall::Release(handle));
    }
}

/// Something that happened to a [`RecordingPhysicsWorld`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums, missing_docs)]
pub enum PhysicsEvent {
    Installed(SectionId, Version),
    Rejected(SectionId, Version),
    Removed(SectionId),
}

/// [`PhysicsWorld`] which keeps installed representations in memory and records every call.
#[derive(Debug, Default)]
pub struct RecordingPhysicsWorld {
    /// Every call, in order.
    pub events: Vec<PhysicsEvent>,
    /// This many upcoming installs are rejected.
    pub fail_installs: usize,
    installed: BTreeMap<SectionId, CollisionRepresentation>,
}

impl RecordingPhysicsWorld {
    /// Creates an empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the representation installed for the section.
    pub fn installed(&self, section: SectionId) -> Option<&CollisionRepresentation> {
        self.installed.get(&section)
    }

    /// Number of sections with installed collision.
    pub fn len(&self) -> usize {
        self.installed.len()
    }

    /// Returns whether no section has installed collision.
    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

impl PhysicsWorld for RecordingPhysicsWorld {
    fn install_collision(
        &mut self,
        section: SectionId,
        representation: CollisionRepresentation,
    ) -> Result<(), InstallError> {
        let version = representation.version;
        if self.fail_installs > 0 {
            self.fail_installs -= 1;
            self.events.push(PhysicsEvent::Rejected(section, version));
            return Err(InstallError::new("injected failure"));
        }
        self.installed.insert(section, representation);
        self.events.push(PhysicsEvent::Installed(section, version));
        Ok(())
    }

    fn remove_collision(&mut self, section: SectionId) {
        self.installed.remove(&section);
        self.events.push(PhysicsEvent::Removed(section));
    }
}
