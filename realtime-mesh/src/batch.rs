//! Transactional descriptions of changes to a [`Section`](crate::Section).

use crate::stream::{ElementFormat, StreamData, StreamKind, StreamSet};
use crate::{Aabb, SectionConfig, SectionId};

/// A sequence of mutations of one section, applied atomically and in order by
/// [`RealtimeMesh::submit()`](crate::RealtimeMesh::submit).
///
/// Either every operation is applied and a new version is published, or the batch is
/// rejected and the section is left exactly as it was.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateBatch {
    pub(crate) section: SectionId,
    pub(crate) ops: Vec<BatchOp>,
}

/// A single operation of an [`UpdateBatch`].
///
/// LOD indices refer to the LOD list as it is after the preceding operations of the same
/// batch have been applied.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum BatchOp {
    /// Replace all of the section's geometry with a single LOD 0 made of these streams.
    ///
    /// The previous LOD 0 screen size is kept.
    ReplaceAll(StreamSet),
    /// Overwrite elements of one existing stream starting at `offset`, possibly extending it.
    WriteRange {
        /// LOD index.
        lod: usize,
        /// Which stream of the LOD to write.
        stream: StreamKind,
        /// First element to overwrite.
        offset: usize,
        /// New elements.
        data: StreamData,
    },
    /// Append geometry to an existing LOD.
    ///
    /// Index data is relative to the appended vertices and is offset by the number of
    /// vertices the LOD had before appending.
    Append {
        /// LOD index.
        lod: usize,
        /// Elements to append to each stream.
        data: StreamSet,
    },
    /// Replace the LOD at `index` or, if `index` equals the current number of LODs, add a new
    /// least-detailed LOD.
    SetLod {
        /// LOD index.
        index: usize,
        /// The complete geometry of the LOD.
        streams: StreamSet,
        /// Screen size below which this LOD is preferred.
        screen_size: f32,
    },
    /// Remove the least-detailed LOD, which must be at `index`.
    RemoveLod {
        /// LOD index.
        index: usize,
    },
    /// Set explicit bounds which geometry changes will not affect, or, with [`None`], return
    /// to bounds computed from the geometry.
    SetBounds(Option<Aabb>),
    /// Enable or disable the collision representation.
    SetCollision(bool),
    /// Replace the section's non-geometry settings.
    SetConfig(SectionConfig),
    /// Change the screen size threshold of an existing LOD.
    SetScreenSize {
        /// LOD index.
        lod: usize,
        /// Screen size below which this LOD is preferred.
        screen_size: f32,
    },
}

impl UpdateBatch {
    /// Creates an empty batch addressed to `section`.
    ///
    /// Empty batches are rejected when submitted; add at least one operation.
    pub fn new(section: SectionId) -> Self {
        Self {
            section,
            ops: Vec::new(),
        }
    }

    /// Returns the section this batch is addressed to.
    pub fn section(&self) -> SectionId {
        self.section
    }

    /// Returns the operations in submission order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Returns whether there are no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Adds an arbitrary operation.
    pub fn push(&mut self, op: BatchOp) {
        self.ops.push(op);
    }

    /// Adds an arbitrary operation, returning `self` for chaining.
    #[must_use]
    pub fn with_op(mut self, op: BatchOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Adds [`BatchOp::ReplaceAll`].
    #[must_use]
    pub fn replace_all(self, streams: StreamSet) -> Self {
        self.with_op(BatchOp::ReplaceAll(streams))
    }

    /// Adds [`BatchOp::WriteRange`].
    #[must_use]
    pub fn write_range(
        self,
        lod: usize,
        stream: StreamKind,
        offset: usize,
        data: impl Into<StreamData>,
    ) -> Self {
        self.with_op(BatchOp::WriteRange {
            lod,
            stream,
            offset,
            data: data.into(),
        })
    }

    /// Adds [`BatchOp::Append`].
    #[must_use]
    pub fn append(self, lod: usize, data: StreamSet) -> Self {
        self.with_op(BatchOp::Append { lod, data })
    }

    /// Adds [`BatchOp::SetLod`].
    #[must_use]
    pub fn set_lod(self, index: usize, streams: StreamSet, screen_size: f32) -> Self {
        self.with_op(BatchOp::SetLod {
            index,
            streams,
            screen_size,
        })
    }

    /// Adds [`BatchOp::RemoveLod`].
    #[must_use]
    pub fn remove_lod(self, index: usize) -> Self {
        self.with_op(BatchOp::RemoveLod { index })
    }

    /// Adds [`BatchOp::SetBounds`].
    #[must_use]
    pub fn set_bounds(self, bounds: Option<Aabb>) -> Self {
        self.with_op(BatchOp::SetBounds(bounds))
    }

    /// Adds [`BatchOp::SetCollision`].
    #[must_use]
    pub fn set_collision(self, enabled: bool) -> Self {
        self.with_op(BatchOp::SetCollision(enabled))
    }

    /// Adds [`BatchOp::SetConfig`].
    #[must_use]
    pub fn set_config(self, config: SectionConfig) -> Self {
        self.with_op(BatchOp::SetConfig(config))
    }

    /// Adds [`BatchOp::SetScreenSize`].
    #[must_use]
    pub fn set_screen_size(self, lod: usize, screen_size: f32) -> Self {
        self.with_op(BatchOp::SetScreenSize { lod, screen_size })
    }
}

/// Why an [`UpdateBatch`] was rejected. The section is unchanged when this is returned.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum BatchError {
    /// The batch has no operations.
    #[error("batch contains no operations")]
    Empty,

    /// An operation would leave a gap in the LOD list or remove a LOD other than the last.
    #[error("operation {op} uses LOD {index}, but LODs must be contiguous and there are {count}")]
    NonContiguousLod {
        /// Position of the offending operation in the batch.
        op: usize,
        /// LOD index the operation used.
        index: usize,
        /// Number of LODs at that point in the batch.
        count: usize,
    },

    /// An operation refers to a LOD the section does not have.
    #[error("operation {op} refers to LOD {index}, but there are only {count}")]
    UnknownLod {
        /// Position of the offending operation in the batch.
        op: usize,
        /// LOD index the operation used.
        index: usize,
        /// Number of LODs at that point in the batch.
        count: usize,
    },

    /// An operation refers to a stream that the LOD does not have, or that cannot exist.
    #[error("operation {op} refers to {kind} stream, which LOD {lod} does not have")]
    UnknownStream {
        /// Position of the offending operation in the batch.
        op: usize,
        /// LOD index the operation used.
        lod: usize,
        /// Stream the operation used.
        kind: StreamKind,
    },

    /// Data supplied for a stream has the wrong element format.
    #[error("operation {op}: {kind} stream holds {expected:?} elements, not {found:?}")]
    FormatMismatch {
        /// Position of the offending operation in the batch.
        op: usize,
        /// Stream the operation used.
        kind: StreamKind,
        /// The stream's format.
        expected: ElementFormat,
        /// The format of the data provided.
        found: ElementFormat,
    },

    /// `RemoveLod` follows an operation which set or wrote the same LOD.
    #[error("operation {op} removes LOD {index}, which an earlier operation in the batch modified")]
    RemoveAfterModify {
        /// Position of the offending operation in the batch.
        op: usize,
        /// LOD index the operation used.
        index: usize,
    },

    /// The section would have more LODs than the configured maximum.
    #[error("operation {op} would create LOD {index}, but at most {max} are allowed")]
    TooManyLods {
        /// Position of the offending operation in the batch.
        op: usize,
        /// LOD index the operation used.
        index: usize,
        /// Configured maximum number of LODs.
        max: usize,
    },

    /// A screen size is negative or not a number.
    #[error("operation {op}: screen size {value} is not a non-negative number")]
    InvalidScreenSize {
        /// Position of the offending operation in the batch.
        op: usize,
        /// The screen size given.
        value: f32,
    },

    /// After applying the batch, the vertex streams of a LOD have different lengths.
    #[error("LOD {lod} would have {kind} stream of length {len}, but {vertex_count} vertices")]
    VertexCountMismatch {
        /// LOD index.
        lod: usize,
        /// The stream whose length disagrees with the position stream.
        kind: StreamKind,
        /// Length of that stream.
        len: usize,
        /// Length of the position stream.
        vertex_count: usize,
    },

    /// After applying the batch, an index refers to a vertex that does not exist.
    #[error("LOD {lod} would have index {value} at position {position}, but only {vertex_count} vertices")]
    IndexOutOfBounds {
        /// LOD index.
        lod: usize,
        /// Position of the index in the index stream.
        position: usize,
        /// The out-of-bounds index value.
        value: u32,
        /// Length of the position stream.
        vertex_count: usize,
    },
}
