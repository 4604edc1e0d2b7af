//! Typed, resizable vertex and index buffers for one attribute class of one section.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Number of texture coordinate channels a section may carry.
pub const MAX_TEX_COORDS: u8 = 4;

/// Which attribute of a mesh a [`GeometryStream`] holds.
///
/// The variant determines the [`ElementFormat`] of the stream's data.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum StreamKind {
    /// Vertex positions, `[f32; 3]`.
    Position,
    /// Vertex normals, `[f32; 3]`.
    Normal,
    /// Texture coordinates in the given channel, `[f32; 2]`.
    TexCoord(u8),
    /// Vertex colors, RGBA `[u8; 4]`.
    Color,
    /// Triangle list indices into the vertex streams, `u32`.
    Index,
}

impl StreamKind {
    /// Returns the format elements of this stream must have.
    pub const fn format(self) -> ElementFormat {
        match self {
            StreamKind::Position | StreamKind::Normal => ElementFormat::Float3,
            StreamKind::TexCoord(_) => ElementFormat::Float2,
            StreamKind::Color => ElementFormat::Unorm8x4,
            StreamKind::Index => ElementFormat::Uint32,
        }
    }

    /// Returns whether this stream holds per-vertex data (as opposed to indices).
    pub const fn is_vertex_stream(self) -> bool {
        !matches!(self, StreamKind::Index)
    }

    /// Returns whether this kind names a stream a section may actually have.
    pub(crate) const fn is_valid(self) -> bool {
        match self {
            StreamKind::TexCoord(channel) => channel < MAX_TEX_COORDS,
            _ => true,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Position => write!(f, "position"),
            StreamKind::Normal => write!(f, "normal"),
            StreamKind::TexCoord(channel) => write!(f, "texcoord{channel}"),
            StreamKind::Color => write!(f, "color"),
            StreamKind::Index => write!(f, "index"),
        }
    }
}

/// Memory layout of a single element of a [`GeometryStream`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ElementFormat {
    /// Three `f32`s.
    Float3,
    /// Two `f32`s.
    Float2,
    /// Four `u8`s, normalized.
    Unorm8x4,
    /// One `u32`.
    Uint32,
}

impl ElementFormat {
    /// Size in bytes of one element.
    pub const fn stride(self) -> usize {
        match self {
            ElementFormat::Float3 => 12,
            ElementFormat::Float2 => 8,
            ElementFormat::Unorm8x4 | ElementFormat::Uint32 => 4,
        }
    }
}

/// Element types that can be stored in a [`StreamData`].
///
/// This trait is sealed in effect: it is implemented exactly for the element types of the
/// [`ElementFormat`] variants.
pub trait StreamElement: bytemuck::Pod + fmt::Debug + PartialEq + Send + Sync {
    /// The format this element type is stored as.
    const FORMAT: ElementFormat;

    #[doc(hidden)]
    fn wrap(data: Vec<Self>) -> StreamData;
    #[doc(hidden)]
    fn slice(data: &StreamData) -> Option<&[Self]>;
}

macro_rules! impl_stream_element {
    ($element:ty, $variant:ident) => {
        impl StreamElement for $element {
            const FORMAT: ElementFormat = ElementFormat::$variant;

            fn wrap(data: Vec<Self>) -> StreamData {
                StreamData::$variant(data)
            }

            fn slice(data: &StreamData) -> Option<&[Self]> {
                match data {
                    StreamData::$variant(vec) => Some(vec),
                    _ => None,
                }
            }
        }

        impl From<Vec<$element>> for StreamData {
            fn from(data: Vec<$element>) -> Self {
                StreamData::$variant(data)
            }
        }
    };
}

impl_stream_element!([f32; 3], Float3);
impl_stream_element!([f32; 2], Float2);
impl_stream_element!([u8; 4], Unorm8x4);
impl_stream_element!(u32, Uint32);

/// Owned element data of one stream, tagged with its [`ElementFormat`].
#[derive(Clone, Debug, PartialEq)]
#[expect(clippy::exhaustive_enums)]
pub enum StreamData {
    /// See [`ElementFormat::Float3`].
    Float3(Vec<[f32; 3]>),
    /// See [`ElementFormat::Float2`].
    Float2(Vec<[f32; 2]>),
    /// See [`ElementFormat::Unorm8x4`].
    Unorm8x4(Vec<[u8; 4]>),
    /// See [`ElementFormat::Uint32`].
    Uint32(Vec<u32>),
}

/// Applies the same expression to whichever `Vec` a [`StreamData`] holds.
macro_rules! with_vec {
    ($data:expr, $vec:ident => $body:expr) => {
        match $data {
            StreamData::Float3($vec) => $body,
            StreamData::Float2($vec) => $body,
            StreamData::Unorm8x4($vec) => $body,
            StreamData::Uint32($vec) => $body,
        }
    };
}

impl StreamData {
    /// Creates empty data of the given format.
    pub const fn empty(format: ElementFormat) -> Self {
        match format {
            ElementFormat::Float3 => StreamData::Float3(Vec::new()),
            ElementFormat::Float2 => StreamData::Float2(Vec::new()),
            ElementFormat::Unorm8x4 => StreamData::Unorm8x4(Vec::new()),
            ElementFormat::Uint32 => StreamData::Uint32(Vec::new()),
        }
    }

    /// Returns the format of the elements.
    pub fn format(&self) -> ElementFormat {
        match self {
            StreamData::Float3(_) => ElementFormat::Float3,
            StreamData::Float2(_) => ElementFormat::Float2,
            StreamData::Unorm8x4(_) => ElementFormat::Unorm8x4,
            StreamData::Uint32(_) => ElementFormat::Uint32,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        with_vec!(self, v => v.len())
    }

    /// Returns whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements which can be held without reallocating.
    pub fn capacity(&self) -> usize {
        with_vec!(self, v => v.capacity())
    }

    /// Returns the elements if they are of type `T`.
    pub fn as_slice<T: StreamElement>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    /// Returns the element data interpreted as bytes in **native endianness**.
    pub fn as_bytes(&self) -> &[u8] {
        with_vec!(self, v => bytemuck::cast_slice(v.as_slice()))
    }

    /// Returns the bytes of the given range of elements.
    ///
    /// Panics if the range is out of bounds.
    pub(crate) fn element_bytes(&self, range: Range<usize>) -> &[u8] {
        let stride = self.format().stride();
        &self.as_bytes()[range.start * stride..range.end * stride]
    }

    fn reserve_exact(&mut self, additional: usize) {
        with_vec!(self, v => v.reserve_exact(additional))
    }

    fn truncate(&mut self, len: usize) {
        with_vec!(self, v => v.truncate(len))
    }

    /// Copies `source` over the elements starting at `offset`, extending `self` if needed.
    /// The formats must already be known to match.
    fn splice_from(&mut self, offset: usize, source: &StreamData) {
        fn splice<T: Copy>(dest: &mut Vec<T>, offset: usize, source: &[T]) {
            let overlap = dest.len().saturating_sub(offset).min(source.len());
            dest[offset..offset + overlap].copy_from_slice(&source[..overlap]);
            dest.extend_from_slice(&source[overlap..]);
        }
        match (self, source) {
            (StreamData::Float3(d), StreamData::Float3(s)) => splice(d, offset, s),
            (StreamData::Float2(d), StreamData::Float2(s)) => splice(d, offset, s),
            (StreamData::Unorm8x4(d), StreamData::Unorm8x4(s)) => splice(d, offset, s),
            (StreamData::Uint32(d), StreamData::Uint32(s)) => splice(d, offset, s),
            (d, s) => unreachable!("format mismatch {:?} vs {:?}", d.format(), s.format()),
        }
    }
}

/// Error returned when a write to a [`GeometryStream`] would leave its permitted range.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error(
    "writing {len} elements at offset {offset} exceeds the {kind} stream \
    (holds {element_count}, limit {max_elements})"
)]
#[non_exhaustive]
pub struct OutOfRange {
    /// The stream written to.
    pub kind: StreamKind,
    /// First element index of the rejected write.
    pub offset: usize,
    /// Number of elements in the rejected write.
    pub len: usize,
    /// Number of elements the stream held.
    pub element_count: usize,
    /// The configured maximum number of elements.
    pub max_elements: usize,
}

/// Errors from individual [`GeometryStream`] operations.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum StreamError {
    /// See [`OutOfRange`].
    #[error(transparent)]
    OutOfRange(#[from] OutOfRange),
    /// The data's element format is not the format of the stream.
    #[error("{kind} stream holds {expected:?} elements, not {found:?}")]
    FormatMismatch {
        /// The stream written to.
        kind: StreamKind,
        /// The stream's format.
        expected: ElementFormat,
        /// The format of the data provided.
        found: ElementFormat,
    },
}

/// Half-open interval of elements modified since the last commit.
///
/// Always a single interval: separate modifications are merged into the smallest range
/// covering both, so that an upload only ever needs to consider one range per stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirtyRange(Option<Range<usize>>);

impl DirtyRange {
    /// The empty range.
    pub const CLEAN: Self = Self(None);

    /// Returns the range, or [`None`] if nothing is dirty.
    pub fn get(&self) -> Option<Range<usize>> {
        self.0.clone()
    }

    /// Returns whether nothing is dirty.
    pub fn is_clean(&self) -> bool {
        self.0.is_none()
    }

    /// Extends this range to cover `range` too. Empty ranges are ignored.
    pub fn union(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        self.0 = Some(match self.0.take() {
            None => range,
            Some(old) => old.start.min(range.start)..old.end.max(range.end),
        });
    }

    /// Restricts the range to `0..len`.
    fn clamp(&mut self, len: usize) {
        if let Some(range) = &mut self.0 {
            range.end = range.end.min(len);
            if range.start >= range.end {
                self.0 = None;
            }
        }
    }
}

/// A buffer holding one attribute class (positions, normals, texture coordinates, colors or
/// indices) of one level of detail of one [`Section`](crate::Section).
///
/// The element data is shared copy-on-write with any [`Snapshot`](crate::Snapshot)
/// published from it, so publishing never copies and a snapshot's contents can never be
/// changed by later writes.
#[derive(Clone, Debug)]
pub struct GeometryStream {
    kind: StreamKind,
    data: Arc<StreamData>,
    /// Configured maximum number of elements.
    max_elements: usize,
    /// Invariant: within `0..data.len()`.
    dirty: DirtyRange,
}

impl GeometryStream {
    /// Creates an empty stream.
    pub fn new(kind: StreamKind, max_elements: usize) -> Self {
        Self {
            kind,
            data: Arc::new(StreamData::empty(kind.format())),
            max_elements,
            dirty: DirtyRange::CLEAN,
        }
    }

    /// Creates a stream holding `data`, entirely dirty.
    pub fn from_data(
        kind: StreamKind,
        data: StreamData,
        max_elements: usize,
    ) -> Result<Self, StreamError> {
        let mut stream = Self::new(kind, max_elements);
        stream.replace_all(data)?;
        Ok(stream)
    }

    /// Returns which attribute this stream holds.
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Size in bytes of one element.
    pub fn stride(&self) -> usize {
        self.kind.format().stride()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of elements which can be held without reallocating.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Configured maximum number of elements.
    pub fn max_elements(&self) -> usize {
        self.max_elements
    }

    /// Returns the element data.
    pub fn data(&self) -> &StreamData {
        &self.data
    }

    pub(crate) fn shared_data(&self) -> &Arc<StreamData> {
        &self.data
    }

    /// Returns the elements if they are of type `T`.
    pub fn as_slice<T: StreamElement>(&self) -> Option<&[T]> {
        self.data.as_slice()
    }

    /// Returns the range of elements modified since the last commit.
    pub fn dirty_range(&self) -> &DirtyRange {
        &self.dirty
    }

    fn check_format(&self, data: &StreamData) -> Result<(), StreamError> {
        let expected = self.kind.format();
        let found = data.format();
        if expected == found {
            Ok(())
        } else {
            Err(StreamError::FormatMismatch {
                kind: self.kind,
                expected,
                found,
            })
        }
    }

    fn out_of_range(&self, offset: usize, len: usize) -> OutOfRange {
        OutOfRange {
            kind: self.kind,
            offset,
            len,
            element_count: self.len(),
            max_elements: self.max_elements,
        }
    }

    /// Overwrites elements starting at `offset` with `data`, extending the stream if the
    /// write runs past its end.
    ///
    /// Fails with [`OutOfRange`], leaving the stream unchanged, if `offset` is past the end
    /// of the stream (which would leave a gap) or the write would exceed the configured
    /// maximum number of elements.
    pub fn write(&mut self, offset: usize, data: &StreamData) -> Result<(), StreamError> {
        self.check_format(data)?;
        let len = data.len();
        let end = offset
            .checked_add(len)
            .ok_or_else(|| self.out_of_range(offset, len))?;
        if offset > self.len() || end > self.max_elements {
            return Err(self.out_of_range(offset, len).into());
        }
        if len == 0 {
            return Ok(());
        }
        self.grow_for(end);
        Arc::make_mut(&mut self.data).splice_from(offset, data);
        self.mark_dirty(offset..end);
        Ok(())
    }

    /// Appends `data` to the end of the stream.
    ///
    /// Storage grows by at least half its current capacity at a time, so a sequence of
    /// appends performs a logarithmic number of reallocations.
    pub fn append(&mut self, data: &StreamData) -> Result<(), StreamError> {
        self.write(self.len(), data)
    }

    /// Replaces the entire contents of the stream.
    pub fn replace_all(&mut self, data: StreamData) -> Result<(), StreamError> {
        self.check_format(&data)?;
        if data.len() > self.max_elements {
            return Err(self.out_of_range(0, data.len()).into());
        }
        let len = data.len();
        self.data = Arc::new(data);
        // Everything is new, including any previously dirty region beyond the new length.
        self.dirty = DirtyRange::CLEAN;
        self.mark_dirty(0..len);
        Ok(())
    }

    /// Shortens the stream to `len` elements. Has no effect if it is already shorter.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            Arc::make_mut(&mut self.data).truncate(len);
            self.dirty.clamp(len);
        }
    }

    /// Records that `range` has been modified, merging it with any existing dirty range.
    ///
    /// The range is clipped to the current length of the stream.
    pub fn mark_dirty(&mut self, range: Range<usize>) {
        self.dirty.union(range);
        self.dirty.clamp(self.len());
    }

    /// Forgets the dirty range. Called only once the modifications have been published.
    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = DirtyRange::CLEAN;
    }

    /// Ensures capacity for `required` elements, growing geometrically.
    fn grow_for(&mut self, required: usize) {
        let capacity = self.capacity();
        if required <= capacity {
            return;
        }
        let grown = capacity
            .saturating_add(capacity.div_ceil(2))
            .max(required)
            .max(MIN_CAPACITY)
            .min(self.max_elements.max(required));
        let len = self.len();
        Arc::make_mut(&mut self.data).reserve_exact(grown - len);
    }
}

/// Smallest allocation made when a stream first grows.
const MIN_CAPACITY: usize = 16;

/// A set of [`StreamData`] keyed by [`StreamKind`], used to supply whole levels of detail.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamSet {
    streams: BTreeMap<StreamKind, StreamData>,
}

impl StreamSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the data for `kind`, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, kind: StreamKind, data: impl Into<StreamData>) -> Self {
        self.insert(kind, data);
        self
    }

    /// Adds or replaces the data for `kind`.
    pub fn insert(&mut self, kind: StreamKind, data: impl Into<StreamData>) {
        self.streams.insert(kind, data.into());
    }

    /// Returns the data for `kind`, if present.
    pub fn get(&self, kind: StreamKind) -> Option<&StreamData> {
        self.streams.get(&kind)
    }

    /// Iterates over the streams in [`StreamKind`] order.
    pub fn iter(&self) -> impl Iterator<Item = (StreamKind, &StreamData)> {
        self.streams.iter().map(|(&kind, data)| (kind, data))
    }

    /// Returns the kinds of stream present.
    pub fn kinds(&self) -> impl Iterator<Item = StreamKind> + '_ {
        self.streams.keys().copied()
    }

    /// Number of streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns whether there are no streams.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Returns the number of vertices, as given by the position stream.
    pub fn vertex_count(&self) -> usize {
        self.get(StreamKind::Position).map_or(0, StreamData::len)
    }
}

impl<'a> IntoIterator for &'a StreamSet {
    type Item = (&'a StreamKind, &'a StreamData);
    type IntoIter = std::collections::btree_map::Iter<'a, StreamKind, StreamData>;
    fn into_iter(self) -> Self::IntoIter {
        self.streams.iter()
    }
}
