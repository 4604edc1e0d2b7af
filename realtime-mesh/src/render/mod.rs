//! Handing published snapshots to a renderer.
//!
//! [`RenderProxySynchronizer`] lives on the render thread. It receives snapshots from any
//! thread through a channel, keeps only the newest one per section, and at each
//! [`swap()`](RenderProxySynchronizer::swap) uploads the elements which changed and makes
//! the new snapshot the one that is drawn.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::mesh::{MeshDataProvider, MeshEvent};
use crate::{SectionId, Snapshot, StreamKind, Version};

mod proxy;
use proxy::Proxy;
mod upload;
pub use upload::{BufferHandle, UploadBuffer, UploadError};

#[cfg(test)]
mod tests;

/// Double-buffers each section's snapshots for the render thread and performs incremental
/// uploads of changed data.
///
/// For each section there is a *front* snapshot, which is what [`draw_list()`] describes, and
/// a *back* snapshot, the newest one received and not yet swapped in. Receiving a newer
/// snapshot before the next swap replaces the back snapshot; the superseded one is never
/// uploaded (“latest wins”), but the ranges it changed are still uploaded as part of its
/// replacement.
///
/// [`draw_list()`]: Self::draw_list
#[derive(Debug)]
pub struct RenderProxySynchronizer<U> {
    uploader: U,
    inbox: flume::Receiver<MeshEvent>,
    inbox_sender: flume::Sender<MeshEvent>,
    proxies: HashMap<SectionId, Proxy>,
    /// Sections which have been removed. Section identifiers are never reused, so late
    /// snapshots of these can be recognized and ignored.
    removed: RemovedSections,
}

/// Result of [`RenderProxySynchronizer::prepare()`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PrepareOutcome {
    /// The snapshot is now the back snapshot and will be uploaded at the next swap.
    Staged {
        /// Version of the previous back snapshot, which was dropped without being drawn.
        superseded: Option<Version>,
    },
    /// The synchronizer already has this or a newer version; the snapshot was ignored.
    Stale,
    /// The section is not visible and has never been; no proxy was created.
    Hidden,
    /// The section has been removed; the snapshot was ignored.
    Removed,
}

/// A stream range waiting to be uploaded, as reported by
/// [`RenderProxySynchronizer::pending_uploads()`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[expect(clippy::exhaustive_structs)]
pub struct PendingUpload {
    /// LOD index.
    pub lod: usize,
    /// Which stream.
    pub kind: StreamKind,
    /// Range of bytes within the stream's data.
    pub bytes: Range<usize>,
}

/// What [`RenderProxySynchronizer::swap()`] did.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct SwapReport {
    /// Sections whose front snapshot was replaced.
    pub swapped: Vec<SectionId>,
    /// Sections which could not be swapped because an upload failed. They keep their
    /// previous front snapshot and buffers, and the upload is retried at the next swap.
    /// See [`DrawItem::partially_updated`] for the one exception.
    pub failed: Vec<(SectionId, UploadError)>,
    /// Total number of bytes passed to [`UploadBuffer::upload_range()`].
    pub bytes_uploaded: usize,
    /// Number of back snapshots which were replaced by newer ones before they could be
    /// swapped in, since the previous swap.
    pub superseded: usize,
}

/// One section to be drawn, as reported by [`RenderProxySynchronizer::draw_list()`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct DrawItem {
    /// Section to draw.
    pub section: SectionId,
    /// Version of the front snapshot.
    pub version: Version,
    /// LOD to draw.
    pub lod: usize,
    /// Material slot from the section's configuration.
    pub material_slot: u32,
    /// Whether the section should be drawn into shadow maps.
    pub casts_shadow: bool,
    /// Number of indices to draw.
    pub index_count: usize,
    /// Buffers of the LOD, in [`StreamKind`] order.
    pub buffers: Vec<(StreamKind, BufferHandle)>,
    /// Whether some of the section's buffers already hold data of a newer snapshot than
    /// `version`. This happens only when an upload into an existing buffer fails after
    /// another existing buffer of the section was written. The host may skip drawing the
    /// section until the next successful swap clears it.
    pub partially_updated: bool,
}

impl<U: UploadBuffer> RenderProxySynchronizer<U> {
    /// Creates a synchronizer with no sections, uploading through `uploader`.
    pub fn new(uploader: U) -> Self {
        let (inbox_sender, inbox) = flume::unbounded();
        Self {
            uploader,
            inbox,
            inbox_sender,
            proxies: HashMap::new(),
            removed: RemovedSections::default(),
        }
    }

    /// Returns a listener which delivers [`MeshEvent`]s to this synchronizer from any thread.
    ///
    /// The events are processed at the next [`swap()`](Self::swap).
    pub fn listener(&self) -> flume::Sender<MeshEvent> {
        self.inbox_sender.clone()
    }

    /// Starts following every section of `provider`, including its current snapshots.
    pub fn attach(&mut self, provider: &dyn MeshDataProvider) {
        provider.listen_events(Arc::new(self.listener()));
        // Register first, so no commit can fall between; duplicates are recognized as stale.
        for id in provider.section_ids() {
            if let Some(snapshot) = provider.snapshot(id)
                && snapshot.version() > Version::INITIAL
            {
                self.prepare(snapshot);
            }
        }
    }

    /// Returns the upload buffer.
    pub fn uploader(&self) -> &U {
        &self.uploader
    }

    /// Returns the upload buffer, mutably.
    pub fn uploader_mut(&mut self) -> &mut U {
        &mut self.uploader
    }

    /// Stores `snapshot` as the back snapshot of its section and records which byte ranges
    /// must be uploaded, based on the changes recorded when it was committed.
    ///
    /// No data is uploaded until [`swap()`](Self::swap).
    pub fn prepare(&mut self, snapshot: Arc<Snapshot>) -> PrepareOutcome {
        let id = snapshot.section();
        if self.removed.contains(id) {
            return PrepareOutcome::Removed;
        }
        if !snapshot.config().visible && !self.proxies.contains_key(&id) {
            return PrepareOutcome::Hidden;
        }
        let proxy = self.proxies.entry(id).or_default();
        if snapshot.version() <= proxy.latest_version() {
            return PrepareOutcome::Stale;
        }
        let new_version = snapshot.version();
        let superseded = proxy.stage(snapshot);
        if let Some(old) = superseded {
            log::debug!("{id}: back snapshot {old} superseded by {new_version} before swap");
        }
        PrepareOutcome::Staged { superseded }
    }

    /// Forgets a section and releases its buffers.
    ///
    /// The identifier is remembered for the life of the synchronizer so that late snapshots
    /// of the section are ignored. Consecutive identifiers share one entry, so removing
    /// sections in the order they were created takes constant space.
    pub fn remove_section(&mut self, id: SectionId) {
        self.removed.insert(id);
        if let Some(mut proxy) = self.proxies.remove(&id) {
            proxy.release_all(&mut self.uploader);
        }
    }

    /// Processes received events, uploads changed data, and replaces each section's front
    /// snapshot with its back snapshot.
    ///
    /// This is the only point at which front snapshots change and at which
    /// [`UploadBuffer`] is used. Calling it again with nothing new received has no effect.
    pub fn swap(&mut self) -> SwapReport {
        let mut report = SwapReport::default();
        for event in self.inbox.drain().collect::<Vec<_>>() {
            match event {
                MeshEvent::Published(snapshot) => {
                    if let PrepareOutcome::Staged {
                        superseded: Some(_),
                    } = self.prepare(snapshot)
                    {
                        report.superseded += 1;
                    }
                }
                MeshEvent::Removed(id) => self.remove_section(id),
            }
        }

        let mut ids: Vec<SectionId> = self
            .proxies
            .iter()
            .filter(|(_, proxy)| proxy.back.is_some())
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            let Some(proxy) = self.proxies.get_mut(&id) else {
                continue;
            };
            match proxy.upload(id, &mut self.uploader, &mut report.bytes_uploaded) {
                Ok(()) => {
                    proxy.swap(&mut self.uploader);
                    report.swapped.push(id);
                }
                Err(error) => {
                    log::warn!("{id}: upload failed, keeping previous front snapshot: {error}");
                    if proxy.front_partially_updated {
                        log::warn!("{id}: front buffers partially hold newer data");
                    }
                    report.failed.push((id, error));
                }
            }
        }
        report
    }

    /// Returns the snapshot currently drawn for the section.
    pub fn front(&self, id: SectionId) -> Option<&Arc<Snapshot>> {
        self.proxies.get(&id)?.front.as_ref()
    }

    /// Returns the snapshot waiting to be swapped in for the section.
    pub fn back(&self, id: SectionId) -> Option<&Arc<Snapshot>> {
        self.proxies.get(&id)?.back.as_ref()
    }

    /// Iterates over the front snapshots of all sections.
    pub fn fronts(&self) -> impl Iterator<Item = &Arc<Snapshot>> {
        self.proxies.values().filter_map(|proxy| proxy.front.as_ref())
    }

    /// Returns the byte ranges which the next swap will upload for the section, ignoring any
    /// reallocation it may need.
    pub fn pending_uploads(&self, id: SectionId) -> Vec<PendingUpload> {
        self.proxies.get(&id).map_or_else(Vec::new, |proxy| {
            proxy
                .pending_byte_ranges()
                .map(|((lod, kind), bytes)| PendingUpload { lod, kind, bytes })
                .collect()
        })
    }

    /// Sets which LOD to draw for the section. Out-of-range values are clamped when drawing.
    pub fn set_active_lod(&mut self, id: SectionId, lod: usize) {
        if let Some(proxy) = self.proxies.get_mut(&id) {
            proxy.active_lod = lod;
        }
    }

    /// Applies many [`set_active_lod()`](Self::set_active_lod) choices.
    pub fn apply_lod_selection(&mut self, choices: impl IntoIterator<Item = (SectionId, usize)>) {
        for (id, lod) in choices {
            self.set_active_lod(id, lod);
        }
    }

    /// Returns the LOD which would be drawn for the section.
    pub fn active_lod(&self, id: SectionId) -> Option<usize> {
        let proxy = self.proxies.get(&id)?;
        let front = proxy.front.as_ref()?;
        Some(proxy.active_lod.min(front.lods().len().checked_sub(1)?))
    }

    /// Describes everything to draw this frame: each visible, non-empty section's front
    /// snapshot at its active LOD, in section order.
    pub fn draw_list(&self) -> Vec<DrawItem> {
        let mut items: Vec<DrawItem> = self
            .proxies
            .iter()
            .filter_map(|(&section, proxy)| {
                let front = proxy.front.as_ref()?;
                if !front.config().visible {
                    return None;
                }
                let lod = self.active_lod(section)?;
                let lod_snapshot = front.lod(lod)?;
                Some(DrawItem {
                    section,
                    version: front.version(),
                    lod,
                    material_slot: front.config().material_slot,
                    casts_shadow: front.config().casts_shadow,
                    index_count: lod_snapshot.stream(StreamKind::Index).map_or(0, |s| s.len()),
                    buffers: lod_snapshot
                        .streams()
                        .filter_map(|stream| {
                            let allocation = proxy.allocations.get(&(lod, stream.kind()))?;
                            Some((stream.kind(), allocation.handle))
                        })
                        .collect(),
                    partially_updated: proxy.front_partially_updated,
                })
            })
            .collect();
        items.sort_by_key(|item| item.section);
        items
    }
}

/// Identifiers of removed sections, as runs of consecutive values.
#[derive(Debug, Default)]
struct RemovedSections {
    /// Start of each run to its end (exclusive).
    runs: BTreeMap<u64, u64>,
}

impl RemovedSections {
    fn contains(&self, id: SectionId) -> bool {
        let value = u64::from(id.0);
        self.runs
            .range(..=value)
            .next_back()
            .is_some_and(|(_, &end)| value < end)
    }

    fn insert(&mut self, id: SectionId) {
        if self.contains(id) {
            return;
        }
        let mut start = u64::from(id.0);
        let mut end = start + 1;
        if let Some((&previous_start, &previous_end)) = self.runs.range(..start).next_back()
            && previous_end == start
        {
            start = previous_start;
        }
        if let Some(next_end) = self.runs.remove(&end) {
            end = next_end;
        }
        self.runs.insert(start, end);
    }

    #[cfg(test)]
    fn run_count(&self) -> usize {
        self.runs.len()
    }
}
