//! Validation and application of [`UpdateBatch`]es to [`Section`]s.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::stream::{GeometryStream, StreamData, StreamError, StreamKind, StreamSet};
use crate::{
    Aabb, BatchError, BatchOp, Bounds, LodRecord, MeshConfig, Section, Snapshot, SubmitError,
    UpdateBatch,
};

/// Screen size of a LOD 0 created by [`BatchOp::ReplaceAll`] on a section without one.
pub(crate) const DEFAULT_SCREEN_SIZE: f32 = 1.0;

/// Applies `batch` to `staged` and publishes the result.
///
/// On success, `staged` holds the new state with clean dirty ranges, and the returned snapshot
/// has a version one greater than before. On failure, `staged` is unchanged.
pub(crate) fn commit(
    staged: &mut Section,
    batch: &UpdateBatch,
    config: &MeshConfig,
) -> Result<Arc<Snapshot>, SubmitError> {
    if batch.ops.is_empty() {
        return Err(BatchError::Empty.into());
    }

    // Work on a copy so that a failure part way through leaves nothing behind.
    // The copy is cheap: stream data is shared until written.
    let mut pending = Pending {
        section: staged.clone(),
        config,
        touched: BTreeSet::new(),
        full_recompute: false,
    };
    for (op_index, op) in batch.ops.iter().enumerate() {
        pending.apply(op_index, op)?;
    }
    pending.check_vertex_counts()?;
    if config.validate_indices {
        pending.check_indices()?;
    }
    pending.update_bounds();

    let Pending {
        section: mut new_section,
        touched,
        ..
    } = pending;
    let version = new_section.version.next();
    new_section.version = version;
    for &lod_index in &touched {
        if let Some(lod) = new_section.lods.get_mut(lod_index) {
            lod.version = version;
        }
    }

    let snapshot = Arc::new(Snapshot::capture(&new_section));
    for lod in &mut new_section.lods {
        for stream in lod.streams.values_mut() {
            stream.clear_dirty();
        }
    }
    *staged = new_section;

    log::trace!(
        "committed {section} {version}: {ops} ops, {lods} LODs",
        section = staged.id,
        ops = batch.ops.len(),
        lods = staged.lods.len(),
    );
    Ok(snapshot)
}

struct Pending<'c> {
    section: Section,
    config: &'c MeshConfig,
    /// LODs created or modified by the batch so far.
    touched: BTreeSet<usize>,
    /// Whether the bounds must be computed from scratch rather than extended.
    full_recompute: bool,
}

impl Pending<'_> {
    fn apply(&mut self, op: usize, batch_op: &BatchOp) -> Result<(), SubmitError> {
        match *batch_op {
            BatchOp::ReplaceAll(ref streams) => {
                let screen_size = self
                    .section
                    .lods
                    .first()
                    .map_or(DEFAULT_SCREEN_SIZE, |lod| lod.screen_size);
                self.section.lods.clear();
                self.touched.clear();
                if !streams.is_empty() {
                    let lod = self.build_lod(op, 0, streams, screen_size)?;
                    self.section.lods.push(lod);
                    self.touched.insert(0);
                }
                self.full_recompute = true;
            }

            BatchOp::WriteRange {
                lod,
                stream: kind,
                offset,
                ref data,
            } => {
                let stream = self.stream_mut(op, lod, kind)?;
                stream
                    .write(offset, data)
                    .map_err(|e| stream_error(op, e))?;
                self.touched.insert(lod);
            }

            BatchOp::Append { lod, ref data } => {
                self.append(op, lod, data)?;
                self.touched.insert(lod);
            }

            BatchOp::SetLod {
                index,
                ref streams,
                screen_size,
            } => {
                check_screen_size(op, screen_size)?;
                let count = self.section.lods.len();
                if index > count {
                    return Err(BatchError::NonContiguousLod { op, index, count }.into());
                }
                if index >= self.config.max_lods {
                    return Err(BatchError::TooManyLods {
                        op,
                        index,
                        max: self.config.max_lods,
                    }
                    .into());
                }
                let lod = self.build_lod(op, index, streams, screen_size)?;
                if index == count {
                    self.section.lods.push(lod);
                } else {
                    // The replaced geometry may have been what determined the bounds.
                    self.section.lods[index] = lod;
                    self.full_recompute = true;
                }
                self.touched.insert(index);
            }

            BatchOp::RemoveLod { index } => {
                let count = self.section.lods.len();
                if index >= count {
                    return Err(BatchError::UnknownLod { op, index, count }.into());
                }
                if index != count - 1 {
                    return Err(BatchError::NonContiguousLod { op, index, count }.into());
                }
                if self.touched.contains(&index) {
                    return Err(BatchError::RemoveAfterModify { op, index }.into());
                }
                self.section.lods.pop();
                self.full_recompute = true;
            }

            BatchOp::SetBounds(bounds) => {
                self.section.bounds_override = bounds;
                self.full_recompute = true;
            }

            BatchOp::SetCollision(enabled) => {
                self.section.config.collision_enabled = enabled;
            }

            BatchOp::SetConfig(ref config) => {
                self.section.config = config.clone();
            }

            BatchOp::SetScreenSize { lod, screen_size } => {
                check_screen_size(op, screen_size)?;
                self.lod_mut(op, lod)?.screen_size = screen_size;
                self.touched.insert(lod);
            }
        }
        Ok(())
    }

    fn lod_mut(&mut self, op: usize, index: usize) -> Result<&mut LodRecord, BatchError> {
        let count = self.section.lods.len();
        self.section
            .lods
            .get_mut(index)
            .ok_or(BatchError::UnknownLod { op, index, count })
    }

    fn stream_mut(
        &mut self,
        op: usize,
        lod: usize,
        kind: StreamKind,
    ) -> Result<&mut GeometryStream, BatchError> {
        self.lod_mut(op, lod)?
            .streams
            .get_mut(&kind)
            .ok_or(BatchError::UnknownStream { op, lod, kind })
    }

    fn build_lod(
        &self,
        op: usize,
        index: usize,
        streams: &StreamSet,
        screen_size: f32,
    ) -> Result<LodRecord, SubmitError> {
        let mut lod = LodRecord::new(screen_size);
        for (kind, data) in streams.iter() {
            if !kind.is_valid() {
                return Err(BatchError::UnknownStream {
                    op,
                    lod: index,
                    kind,
                }
                .into());
            }
            let stream =
                GeometryStream::from_data(kind, data.clone(), self.config.max_stream_elements)
                    .map_err(|e| stream_error(op, e))?;
            lod.streams.insert(kind, stream);
        }
        Ok(lod)
    }

    fn append(&mut self, op: usize, lod_index: usize, data: &StreamSet) -> Result<(), SubmitError> {
        let lod = self.lod_mut(op, lod_index)?;
        if let Some(kind) = data.kinds().find(|kind| !lod.streams.contains_key(kind)) {
            return Err(BatchError::UnknownStream {
                op,
                lod: lod_index,
                kind,
            }
            .into());
        }
        let base_vertex = lod.vertex_count();
        for (kind, elements) in data.iter() {
            let stream = lod
                .streams
                .get_mut(&kind)
                .ok_or(BatchError::UnknownStream {
                    op,
                    lod: lod_index,
                    kind,
                })?;
            let result = match (kind, elements) {
                (StreamKind::Index, StreamData::Uint32(indices)) => {
                    let rebased = rebase_indices(lod_index, base_vertex, indices)?;
                    stream.append(&rebased)
                }
                _ => stream.append(elements),
            };
            result.map_err(|e| stream_error(op, e))?;
        }
        Ok(())
    }

    /// Checks that every vertex stream of every touched LOD has one element per vertex.
    fn check_vertex_counts(&self) -> Result<(), BatchError> {
        for &lod_index in &self.touched {
            let Some(lod) = self.section.lods.get(lod_index) else {
                continue;
            };
            let vertex_count = lod.vertex_count();
            for stream in lod.streams() {
                if stream.kind().is_vertex_stream() && stream.len() != vertex_count {
                    return Err(BatchError::VertexCountMismatch {
                        lod: lod_index,
                        kind: stream.kind(),
                        len: stream.len(),
                        vertex_count,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_indices(&self) -> Result<(), BatchError> {
        for &lod_index in &self.touched {
            let Some(lod) = self.section.lods.get(lod_index) else {
                continue;
            };
            let vertex_count = lod.vertex_count();
            let Some(indices) = lod
                .stream(StreamKind::Index)
                .and_then(|s| s.as_slice::<u32>())
            else {
                continue;
            };
            if let Some((position, &value)) = indices
                .iter()
                .enumerate()
                .find(|&(_, &value)| value as usize >= vertex_count)
            {
                return Err(BatchError::IndexOutOfBounds {
                    lod: lod_index,
                    position,
                    value,
                    vertex_count,
                });
            }
        }
        Ok(())
    }

    /// Recomputes the bounds from scratch if needed, or else extends them by the positions
    /// written in this batch.
    fn update_bounds(&mut self) {
        let section = &mut self.section;
        if self.full_recompute {
            section.recompute_bounds();
        } else if section.bounds_override.is_none() {
            let mut aabb = section.bounds.aabb();
            for lod in &section.lods {
                let Some(stream) = lod.stream(StreamKind::Position) else {
                    continue;
                };
                let (Some(range), Some(positions)) =
                    (stream.dirty_range().get(), stream.as_slice::<[f32; 3]>())
                else {
                    continue;
                };
                aabb |= Aabb::from_points(positions[range].iter().copied());
            }
            section.bounds = Bounds::new(aabb);
        }
    }
}

fn check_screen_size(op: usize, value: f32) -> Result<(), BatchError> {
    if value >= 0.0 {
        Ok(())
    } else {
        Err(BatchError::InvalidScreenSize { op, value })
    }
}

fn rebase_indices(lod: usize, base_vertex: usize, indices: &[u32]) -> Result<StreamData, BatchError> {
    let overflow = |position: usize, value: u32| BatchError::IndexOutOfBounds {
        lod,
        position,
        value,
        vertex_count: base_vertex,
    };
    let base = u32::try_from(base_vertex).map_err(|_| overflow(0, 0))?;
    indices
        .iter()
        .enumerate()
        .map(|(position, &value)| value.checked_add(base).ok_or_else(|| overflow(position, value)))
        .collect::<Result<Vec<u32>, BatchError>>()
        .map(StreamData::from)
}

fn stream_error(op: usize, error: StreamError) -> SubmitError {
    match error {
        StreamError::OutOfRange(e) => SubmitError::OutOfRange(e),
        StreamError::FormatMismatch {
            kind,
            expected,
            found,
        } => SubmitError::InvalidBatch(BatchError::FormatMismatch {
            op,
            kind,
            expected,
            found,
        }),
    }
}
