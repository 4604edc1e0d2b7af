use core::ops;

use euclid::{Point3D, Vector3D};

use crate::{MeshSpace, Position};

// -------------------------------------------------------------------------------------------------

/// Axis-Aligned Bounding Box of the vertices belonging to a section.
///
/// This type behaves like <code>[Option]&lt;[euclid::Box3D]&gt;</code>, but has methods
/// allowing it to be used more conveniently to manage the bounding box of a possibly-empty set
/// of points. In particular, [`Aabb::union()`] combines two such possibly-absent boxes, and
/// a box containing a single point is not empty even though it has zero volume.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Aabb {
    // If no points have been added, then this box's coordinates are inverted (+inf to -inf).
    // We are not using `euclid::Box3D` because its `union()` function does not do what we want
    // for finite zero-sized boxes (they are counted as empty and ignored).
    // Invariant: no NaN.
    low: [f32; 3],
    high: [f32; 3],
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    /// The empty box, containing no points.
    pub const EMPTY: Self = Self {
        low: [f32::INFINITY; 3],
        high: [f32::NEG_INFINITY; 3],
    };

    /// Constructs the box with the given corners.
    ///
    /// Returns [`None`] if any coordinate is NaN or `low` exceeds `high` on any axis.
    pub fn from_lower_upper(low: Position, high: Position) -> Option<Self> {
        let low = low.to_array();
        let high = high.to_array();
        if (0..3).all(|axis| low[axis] <= high[axis]) {
            Some(Self { low, high })
        } else {
            None
        }
    }

    /// Computes the bounding box of a set of points. NaN points are ignored.
    pub fn from_points(points: impl IntoIterator<Item = [f32; 3]>) -> Self {
        let mut aabb = Self::EMPTY;
        for point in points {
            aabb.add_point(point.into());
        }
        aabb
    }

    /// Returns whether this box contains no points at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Returns the lower corner, or [`None`] if empty.
    pub fn lower_bounds(&self) -> Option<Position> {
        (!self.is_empty()).then(|| self.low.into())
    }

    /// Returns the upper corner, or [`None`] if empty.
    pub fn upper_bounds(&self) -> Option<Position> {
        (!self.is_empty()).then(|| self.high.into())
    }

    /// Returns the center of the box, or [`None`] if empty.
    pub fn center(&self) -> Option<Position> {
        Some(self.lower_bounds()?.lerp(self.upper_bounds()?, 0.5))
    }

    /// Returns the vector from the lower to the upper corner; zero if empty.
    pub fn size(&self) -> Vector3D<f32, MeshSpace> {
        match (self.lower_bounds(), self.upper_bounds()) {
            (Some(low), Some(high)) => high - low,
            _ => Vector3D::zero(),
        }
    }

    /// Returns the smallest box which contains every point the two inputs contain,
    /// including boundary points.
    #[inline]
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self {
            low: [0, 1, 2].map(|axis| self.low[axis].min(other.low[axis])),
            high: [0, 1, 2].map(|axis| self.high[axis].max(other.high[axis])),
        }
    }

    /// Expand this box to contain the given point.
    ///
    /// Points with NaN coordinates are ignored; they cannot be rendered meaningfully either.
    pub fn add_point(&mut self, point: Position) {
        let point = point.to_array();
        if point.iter().any(|c| c.is_nan()) {
            return;
        }
        for axis in 0..3 {
            self.low[axis] = self.low[axis].min(point[axis]);
            self.high[axis] = self.high[axis].max(point[axis]);
        }
    }

    /// Returns whether this box contains the point.
    ///
    /// Points on the boundary of the box are included.
    pub fn contains(&self, point: Position) -> bool {
        let point = point.to_array();
        (0..3).all(|axis| (self.low[axis] <= point[axis]) & (point[axis] <= self.high[axis]))
    }
}

impl ops::BitOr for Aabb {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}
impl ops::BitOrAssign for Aabb {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs)
    }
}

// -------------------------------------------------------------------------------------------------

/// Sphere enclosing a section's vertices, used for screen-size estimation.
#[derive(Copy, Clone, Debug, PartialEq)]
#[expect(clippy::exhaustive_structs)]
pub struct BoundingSphere {
    /// Center of the sphere.
    pub center: Position,
    /// Radius of the sphere; zero for a single point.
    pub radius: f32,
}

impl BoundingSphere {
    /// Returns the sphere circumscribing the box, or [`None`] if it is empty.
    pub fn from_aabb(aabb: Aabb) -> Option<Self> {
        Some(Self {
            center: aabb.center()?,
            radius: aabb.size().length() / 2.0,
        })
    }
}

/// The bounding volume of a section: an axis-aligned box and the sphere enclosing it.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Bounds {
    aabb: Aabb,
}

impl Bounds {
    /// Bounds of nothing.
    pub const EMPTY: Self = Self { aabb: Aabb::EMPTY };

    pub(crate) fn new(aabb: Aabb) -> Self {
        Self { aabb }
    }

    /// Returns the bounding box. It may be [`Aabb::EMPTY`].
    pub fn aabb(&self) -> Aabb {
        self.aabb
    }

    /// Returns the bounding sphere, or [`None`] if the bounds are empty.
    pub fn sphere(&self) -> Option<BoundingSphere> {
        BoundingSphere::from_aabb(self.aabb)
    }

    /// Returns whether the bounds contain no points.
    pub fn is_empty(&self) -> bool {
        self.aabb.is_empty()
    }
}

// -------------------------------------------------------------------------------------------------
