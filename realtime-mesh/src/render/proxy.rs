use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use crate::render::{BufferHandle, UploadBuffer, UploadError};
use crate::{SectionId, Snapshot, StreamKind, Version};

pub(super) type StreamKey = (usize, StreamKind);

/// Render-side state of one section: the snapshot being drawn, the snapshot waiting to replace
/// it, and the GPU buffers holding their data.
#[derive(Debug, Default)]
pub(super) struct Proxy {
    pub(super) front: Option<Arc<Snapshot>>,
    pub(super) back: Option<Arc<Snapshot>>,
    /// Element ranges of `back` whose data is not yet in the buffers.
    /// Invariant: each range lies within its stream's length in `back`.
    pub(super) pending: BTreeMap<StreamKey, Range<usize>>,
    /// Buffers `front` is drawn from.
    pub(super) allocations: BTreeMap<StreamKey, Allocation>,
    /// Buffers allocated for `back` which replace entries of `allocations` at the next swap.
    pub(super) staged: BTreeMap<StreamKey, Allocation>,
    /// Some of `allocations` hold data of `back` because an upload failed partway.
    pub(super) front_partially_updated: bool,
    /// LOD requested by the selector; clamped when drawing.
    pub(super) active_lod: usize,
}

#[derive(Clone, Copy, Debug)]
pub(super) struct Allocation {
    pub(super) handle: BufferHandle,
    pub(super) capacity_bytes: usize,
}

impl Proxy {
    /// Version of the newest snapshot this proxy holds.
    pub(super) fn latest_version(&self) -> Version {
        self.back
            .as_ref()
            .or(self.front.as_ref())
            .map_or(Version::INITIAL, |s| s.version())
    }

    /// Makes `snapshot` the back snapshot and records which of its elements must be uploaded.
    /// Returns the version of a back snapshot which was never swapped in, if any.
    ///
    /// The caller must have checked that `snapshot` is newer than [`Self::latest_version()`].
    pub(super) fn stage(&mut self, snapshot: Arc<Snapshot>) -> Option<Version> {
        let base_version = self
            .back
            .as_ref()
            .or(self.front.as_ref())
            .map(|s| s.version());
        // The recorded changes are relative to the immediately preceding version only.
        let incremental = base_version.is_some_and(|v| v.next() == snapshot.version());

        // Forget pending work on streams which no longer exist or have shrunk.
        self.pending.retain(|&(lod, kind), range| {
            match snapshot.lod(lod).and_then(|l| l.stream(kind)) {
                Some(stream) => {
                    range.end = range.end.min(stream.len());
                    range.start < range.end
                }
                None => false,
            }
        });

        for (lod_index, lod) in snapshot.lods().iter().enumerate() {
            for stream in lod.streams() {
                let key = (lod_index, stream.kind());
                let changed = if incremental {
                    snapshot.changes().get(lod_index, stream.kind())
                } else {
                    Some(0..stream.len())
                };
                if let Some(range) = changed.filter(|r| !r.is_empty()) {
                    union_into(&mut self.pending, key, range);
                }
            }
        }

        self.back
            .replace(snapshot)
            .map(|superseded| superseded.version())
    }

    /// Returns the pending uploads as byte ranges.
    pub(super) fn pending_byte_ranges(&self) -> impl Iterator<Item = (StreamKey, Range<usize>)> + '_ {
        self.pending.iter().map(|(&key, range)| {
            let stride = key.1.format().stride();
            (key, range.start * stride..range.end * stride)
        })
    }

    /// Uploads all pending ranges of `back`, stopping at the first failure.
    /// Returns the number of bytes uploaded.
    ///
    /// Every buffer which must be created or grown is allocated before anything is written,
    /// and the buffers they replace stay in use by `front` until [`Self::swap()`]. Writes to
    /// new buffers come before writes to buffers `front` is drawn from, so a failure leaves
    /// `front`'s buffers untouched unless an earlier write to them succeeded; that case is
    /// recorded in `front_partially_updated`.
    ///
    /// Ranges not uploaded, including the failed one, remain pending.
    pub(super) fn upload<U: UploadBuffer + ?Sized>(
        &mut self,
        section: SectionId,
        uploader: &mut U,
        bytes_uploaded: &mut usize,
    ) -> Result<(), UploadError> {
        let Some(back) = self.back.clone() else {
            return Ok(());
        };
        self.pending
            .retain(|&(lod, kind), _| back.lod(lod).and_then(|l| l.stream(kind)).is_some());

        // Reserve.
        let keys: Vec<StreamKey> = self.pending.keys().copied().collect();
        for key @ (lod, kind) in keys.iter().copied() {
            let Some(stream) = back.lod(lod).and_then(|l| l.stream(kind)) else {
                continue;
            };
            let needed_bytes = stream.len() * kind.format().stride();
            let current = self.staged.get(&key).or(self.allocations.get(&key));
            if current.is_some_and(|a| a.capacity_bytes >= needed_bytes) {
                continue;
            }
            let capacity_bytes = current.map_or(needed_bytes, |a| {
                needed_bytes.max(a.capacity_bytes.saturating_add(a.capacity_bytes.div_ceil(2)))
            });
            let handle = uploader.allocate(section, lod, kind, capacity_bytes)?;
            // A staged buffer which has become too small was never drawn from.
            if let Some(outgrown) = self.staged.insert(
                key,
                Allocation {
                    handle,
                    capacity_bytes,
                },
            ) {
                uploader.release(outgrown.handle);
            }
            // A fresh buffer needs all of the data, not just what changed.
            self.pending.insert(key, 0..stream.len());
        }

        // Write, new buffers first.
        let (fresh, in_place): (Vec<StreamKey>, Vec<StreamKey>) =
            keys.into_iter().partition(|key| self.staged.contains_key(key));
        for key @ (lod, kind) in fresh.into_iter().chain(in_place) {
            let (Some(stream), Some(range)) = (
                back.lod(lod).and_then(|l| l.stream(kind)),
                self.pending.get(&key).cloned(),
            ) else {
                continue;
            };
            let bytes = stream.data().element_bytes(range.clone());
            uploader.upload_range(section, lod, kind, range.start * kind.format().stride(), bytes)?;
            *bytes_uploaded += bytes.len();
            self.pending.remove(&key);
            if !self.staged.contains_key(&key) && self.front.is_some() {
                self.front_partially_updated = true;
            }
        }
        Ok(())
    }

    /// Replaces `front` with `back`, which must be fully uploaded, switches to the buffers
    /// allocated for it, and releases buffers which the new front has no use for.
    pub(super) fn swap<U: UploadBuffer + ?Sized>(&mut self, uploader: &mut U) -> bool {
        debug_assert!(self.pending.is_empty());
        let Some(back) = self.back.take() else {
            return false;
        };
        for (key, allocation) in std::mem::take(&mut self.staged) {
            if let Some(replaced) = self.allocations.insert(key, allocation) {
                uploader.release(replaced.handle);
            }
        }
        self.allocations.retain(|&(lod, kind), allocation| {
            let keep = back.lod(lod).and_then(|l| l.stream(kind)).is_some();
            if !keep {
                uploader.release(allocation.handle);
            }
            keep
        });
        self.front = Some(back);
        self.front_partially_updated = false;
        true
    }

    /// Releases every buffer.
    pub(super) fn release_all<U: UploadBuffer + ?Sized>(&mut self, uploader: &mut U) {
        let staged = std::mem::take(&mut self.staged);
        for (_, allocation) in std::mem::take(&mut self.allocations).into_iter().chain(staged) {
            uploader.release(allocation.handle);
        }
    }
}

fn union_into(pending: &mut BTreeMap<StreamKey, Range<usize>>, key: StreamKey, range: Range<usize>) {
    pending
        .entry(key)
        .and_modify(|existing| {
            *existing = existing.start.min(range.start)..existing.end.max(range.end);
        })
        .or_insert(range);
}
