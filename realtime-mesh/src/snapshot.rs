use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use crate::section::clamp_non_increasing;
use crate::stream::{StreamData, StreamElement, StreamKind};
use crate::{Bounds, Section, SectionConfig, SectionId, Version};

/// An immutable, versioned copy of a [`Section`]'s committed state.
///
/// Snapshots are shared by reference counting between the mesh and every consumer; the data
/// they refer to is never modified once published. Later commits produce new snapshots
/// rather than changing this one.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    section: SectionId,
    version: Version,
    config: SectionConfig,
    bounds: Bounds,
    lods: Vec<LodSnapshot>,
    changes: ChangeSet,
}

/// One LOD of a [`Snapshot`].
#[derive(Clone, Debug, PartialEq)]
pub struct LodSnapshot {
    screen_size: f32,
    version: Version,
    streams: BTreeMap<StreamKind, StreamSnapshot>,
}

/// One stream of a [`LodSnapshot`]: a shared reference to element data.
#[derive(Clone, Debug)]
pub struct StreamSnapshot {
    kind: StreamKind,
    data: Arc<StreamData>,
}

/// Which elements changed between a [`Snapshot`] and the snapshot of the version before it.
///
/// Streams absent from the change set are unchanged, except that streams and LODs may also
/// have been removed entirely, which is visible from the snapshots themselves.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChangeSet {
    ranges: BTreeMap<(usize, StreamKind), Range<usize>>,
}

impl Snapshot {
    /// The state of a section before anything has been committed to it.
    pub(crate) fn initial(section: SectionId, config: SectionConfig) -> Self {
        Self {
            section,
            version: Version::INITIAL,
            config,
            bounds: Bounds::EMPTY,
            lods: Vec::new(),
            changes: ChangeSet::default(),
        }
    }

    /// Captures the staged state of `section`, whose dirty ranges describe the changes since
    /// the previous snapshot. The data is shared, not copied.
    pub(crate) fn capture(section: &Section) -> Self {
        let mut changes = ChangeSet::default();
        let screen_sizes = section.effective_screen_sizes();
        let lods = section
            .lods
            .iter()
            .zip(screen_sizes)
            .enumerate()
            .map(|(lod_index, (lod, screen_size))| LodSnapshot {
                screen_size,
                version: lod.version,
                streams: lod
                    .streams
                    .iter()
                    .map(|(&kind, stream)| {
                        if let Some(range) = stream.dirty_range().get() {
                            changes.ranges.insert((lod_index, kind), range);
                        }
                        (
                            kind,
                            StreamSnapshot {
                                kind,
                                data: Arc::clone(stream.shared_data()),
                            },
                        )
                    })
                    .collect(),
            })
            .collect();
        Self {
            section: section.id,
            version: section.version,
            config: section.config.clone(),
            bounds: section.bounds,
            lods,
            changes,
        }
    }

    /// Returns the identifier of the section this is a snapshot of.
    pub fn section(&self) -> SectionId {
        self.section
    }

    /// Returns the version of this snapshot.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the section's settings as of this version.
    pub fn config(&self) -> &SectionConfig {
        &self.config
    }

    /// Returns whether a collision representation should exist for this version.
    pub fn collision_enabled(&self) -> bool {
        self.config.collision_enabled
    }

    /// Returns the bounds of the geometry.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Returns the LODs in order of decreasing detail.
    pub fn lods(&self) -> &[LodSnapshot] {
        &self.lods
    }

    /// Returns the LOD at `index`.
    pub fn lod(&self, index: usize) -> Option<&LodSnapshot> {
        self.lods.get(index)
    }

    /// Returns the effective screen size thresholds of the LODs, which are non-increasing.
    pub fn screen_sizes(&self) -> Vec<f32> {
        // Already clamped at capture, but be robust to snapshots built otherwise in the future.
        clamp_non_increasing(self.lods.iter().map(|lod| lod.screen_size))
    }

    /// Returns whether there is no geometry.
    pub fn is_empty(&self) -> bool {
        self.lods.is_empty()
    }

    /// Returns the changes since the previous version.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }
}

impl LodSnapshot {
    /// Screen size below which this LOD is preferred, after clamping.
    pub fn screen_size(&self) -> f32 {
        self.screen_size
    }

    /// Section version at which this LOD last changed.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the stream of the given kind, if this LOD has one.
    pub fn stream(&self, kind: StreamKind) -> Option<&StreamSnapshot> {
        self.streams.get(&kind)
    }

    /// Iterates over the streams in [`StreamKind`] order.
    pub fn streams(&self) -> impl Iterator<Item = &StreamSnapshot> {
        self.streams.values()
    }

    /// Returns the positions, if present.
    pub fn positions(&self) -> Option<&[[f32; 3]]> {
        self.stream(StreamKind::Position)?.as_slice()
    }

    /// Returns the indices, if present.
    pub fn indices(&self) -> Option<&[u32]> {
        self.stream(StreamKind::Index)?.as_slice()
    }
}

impl StreamSnapshot {
    /// Which attribute this stream holds.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Returns the element data.
    pub fn data(&self) -> &StreamData {
        &self.data
    }

    /// Returns the elements if they are of type `T`.
    pub fn as_slice<T: StreamElement>(&self) -> Option<&[T]> {
        self.data.as_slice()
    }

    /// Returns the element data as bytes, in native endianness.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns whether both refer to the very same buffer, as opposed to equal contents.
    pub fn shares_data_with(&self, other: &StreamSnapshot) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl PartialEq for StreamSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && (self.shares_data_with(other) || self.data == other.data)
    }
}

impl ChangeSet {
    /// Returns the range of elements of the given stream which changed, if any.
    pub fn get(&self, lod: usize, kind: StreamKind) -> Option<Range<usize>> {
        self.ranges.get(&(lod, kind)).cloned()
    }

    /// Iterates over `(lod, kind, element range)` for every changed stream.
    pub fn iter(&self) -> impl Iterator<Item = (usize, StreamKind, Range<usize>)> + '_ {
        self.ranges
            .iter()
            .map(|(&(lod, kind), range)| (lod, kind, range.clone()))
    }

    /// Returns whether no stream changed.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
