use std::collections::BTreeMap;
use std::fmt;

use crate::stream::{GeometryStream, StreamKind};
use crate::{Aabb, Bounds};

/// Identifies a [`Section`] within its [`RealtimeMesh`](crate::RealtimeMesh).
///
/// Identifiers are never reused by the same mesh, so a stale identifier refers to no section
/// rather than to the wrong one.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SectionId(pub(crate) u32);

impl SectionId {
    /// Returns the numeric value of this identifier.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SectionId {
    /// Produces a short string which is suitable for use as a unique identifier.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Debug for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same as Display
        write!(f, "{self}")
    }
}

/// A section's commit counter.
///
/// A new section is at [`Version::INITIAL`]; each successful commit publishes the next
/// version. Versions of one section never decrease.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Version(pub(crate) u64);

impl Version {
    /// The version of a section to which nothing has been committed.
    pub const INITIAL: Self = Self(0);

    /// Returns the numeric value.
    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Per-section settings which are not geometry.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[expect(clippy::exhaustive_structs)]
pub struct SectionConfig {
    /// Index of the material the host should draw this section with.
    pub material_slot: u32,
    /// Whether the section should be drawn at all.
    pub visible: bool,
    /// Whether the section should be drawn into shadow maps.
    pub casts_shadow: bool,
    /// Whether a collision representation should be cooked and installed.
    pub collision_enabled: bool,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self {
            material_slot: 0,
            visible: true,
            casts_shadow: true,
            collision_enabled: false,
        }
    }
}

/// One level of detail of a [`Section`].
#[derive(Clone, Debug)]
pub struct LodRecord {
    pub(crate) streams: BTreeMap<StreamKind, GeometryStream>,
    /// Estimated screen size at or above which this LOD is preferred over less detailed ones.
    pub(crate) screen_size: f32,
    /// Section version at which this LOD's geometry last changed.
    pub(crate) version: Version,
}

impl LodRecord {
    pub(crate) fn new(screen_size: f32) -> Self {
        Self {
            streams: BTreeMap::new(),
            screen_size,
            version: Version::INITIAL,
        }
    }

    /// Returns the stream of the given kind, if this LOD has one.
    pub fn stream(&self, kind: StreamKind) -> Option<&GeometryStream> {
        self.streams.get(&kind)
    }

    /// Iterates over this LOD's streams in [`StreamKind`] order.
    pub fn streams(&self) -> impl Iterator<Item = &GeometryStream> {
        self.streams.values()
    }

    /// The screen size threshold as set; see [`Section::effective_screen_sizes()`].
    pub fn screen_size(&self) -> f32 {
        self.screen_size
    }

    /// Section version at which this LOD's geometry or screen size last changed.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Number of vertices, as given by the position stream.
    pub fn vertex_count(&self) -> usize {
        self.stream(StreamKind::Position).map_or(0, GeometryStream::len)
    }

    /// Number of indices.
    pub fn index_count(&self) -> usize {
        self.stream(StreamKind::Index).map_or(0, GeometryStream::len)
    }

    /// Bounding box of the positions of this LOD.
    pub(crate) fn compute_aabb(&self) -> Aabb {
        match self
            .stream(StreamKind::Position)
            .and_then(|s| s.as_slice::<[f32; 3]>())
        {
            Some(positions) => Aabb::from_points(positions.iter().copied()),
            None => Aabb::EMPTY,
        }
    }
}

/// An independently updatable, independently renderable chunk of mesh geometry:
/// the staged (producer-side) state from which [`Snapshot`](crate::Snapshot)s are published.
///
/// Sections are owned by a [`RealtimeMesh`](crate::RealtimeMesh) and modified only by
/// submitting [`UpdateBatch`](crate::UpdateBatch)es.
#[derive(Clone, Debug)]
pub struct Section {
    pub(crate) id: SectionId,
    pub(crate) config: SectionConfig,
    /// Ordered by decreasing detail.
    /// Invariant: if the section has any geometry, `lods[0]` exists.
    pub(crate) lods: Vec<LodRecord>,
    pub(crate) bounds: Bounds,
    /// Bounds set explicitly, which geometry changes do not affect.
    pub(crate) bounds_override: Option<Aabb>,
    pub(crate) version: Version,
}

impl Section {
    pub(crate) fn new(id: SectionId, config: SectionConfig) -> Self {
        Self {
            id,
            config,
            lods: Vec::new(),
            bounds: Bounds::EMPTY,
            bounds_override: None,
            version: Version::INITIAL,
        }
    }

    /// Returns the identifier of this section.
    pub fn id(&self) -> SectionId {
        self.id
    }

    /// Returns the settings of this section.
    pub fn config(&self) -> &SectionConfig {
        &self.config
    }

    /// Returns the LOD records, in order of decreasing detail.
    pub fn lods(&self) -> &[LodRecord] {
        &self.lods
    }

    /// Returns the LOD record at `index`.
    pub fn lod(&self, index: usize) -> Option<&LodRecord> {
        self.lods.get(index)
    }

    /// Returns the current bounds.
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Returns the last published version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the screen size thresholds of the LODs, adjusted so that no LOD claims a
    /// larger threshold than a more detailed one.
    pub fn effective_screen_sizes(&self) -> Vec<f32> {
        clamp_non_increasing(self.lods.iter().map(|lod| lod.screen_size))
    }

    /// Replaces the bounds with ones computed from every LOD's positions, unless they have
    /// been set explicitly.
    pub(crate) fn recompute_bounds(&mut self) {
        let aabb = self.bounds_override.unwrap_or_else(|| {
            self.lods
                .iter()
                .fold(Aabb::EMPTY, |acc, lod| acc | lod.compute_aabb())
        });
        self.bounds = Bounds::new(aabb);
    }
}

/// Clamps each value to be no greater than the one before it.
pub(crate) fn clamp_non_increasing(values: impl IntoIterator<Item = f32>) -> Vec<f32> {
    let mut ceiling = f32::INFINITY;
    values
        .into_iter()
        .map(|value| {
            ceiling = value.min(ceiling);
            ceiling
        })
        .collect()
}
