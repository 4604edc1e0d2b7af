//! Cooking collision representations from published snapshots and installing them into a
//! physics engine.
//!
//! Cooking happens off the mutation path: [`CollisionCookPipeline::requester()`] is a
//! [`Listener`](crate::Listener) which only enqueues jobs, and the jobs are run by a
//! [`CookWorkerPool`] or by [`CollisionCookPipeline::run_pending_cooks()`]. Results are
//! installed by [`CollisionCookPipeline::poll()`], which discards any result made stale by a
//! later commit and requests a fresh cook instead.

use crate::{Aabb, SectionId, Version};

mod cook;
pub use cook::cook;
mod hull;
mod pipeline;
pub use pipeline::{
    CollisionCookPipeline, CollisionError, CookJobQueue, CookPhase, CookReport, CookRequester,
    CookWorkerPool,
};

/// Collision geometry derived from exactly one version of a section.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct CollisionRepresentation {
    /// Section the geometry was cooked from.
    pub section: SectionId,
    /// Version of the snapshot the geometry was cooked from.
    pub version: Version,
    /// The geometry.
    pub shape: CollisionShape,
}

/// Geometry usable by a physics engine.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum CollisionShape {
    /// Arbitrary triangles, used as-is for collision.
    TriangleMesh {
        /// Vertex positions.
        vertices: Vec<[f32; 3]>,
        /// Counterclockwise triangles (unless flipped), as indices into `vertices`.
        triangles: Vec<[u32; 3]>,
    },
    /// A closed convex polyhedron.
    ConvexHull {
        /// Vertex positions; every one is an extreme point of the hull.
        vertices: Vec<[f32; 3]>,
        /// Outward-facing counterclockwise triangles (unless flipped), as indices into
        /// `vertices`.
        triangles: Vec<[u32; 3]>,
    },
    /// An axis-aligned box.
    Box(Aabb),
}

impl CollisionShape {
    /// Number of triangles; zero for [`CollisionShape::Box`].
    pub fn triangle_count(&self) -> usize {
        match self {
            CollisionShape::TriangleMesh { triangles, .. }
            | CollisionShape::ConvexHull { triangles, .. } => triangles.len(),
            CollisionShape::Box(_) => 0,
        }
    }
}

/// The physics engine's collision storage, implemented by the host.
pub trait PhysicsWorld {
    /// Replaces the section's collision geometry with `representation`.
    ///
    /// On error, the previously installed geometry, if any, must remain in effect.
    fn install_collision(
        &mut self,
        section: SectionId,
        representation: CollisionRepresentation,
    ) -> Result<(), InstallError>;

    /// Removes the section's collision geometry. Does nothing if there is none.
    fn remove_collision(&mut self, section: SectionId);
}

impl<W: PhysicsWorld + ?Sized> PhysicsWorld for &mut W {
    fn install_collision(
        &mut self,
        section: SectionId,
        representation: CollisionRepresentation,
    ) -> Result<(), InstallError> {
        (**self).install_collision(section, representation)
    }

    fn remove_collision(&mut self, section: SectionId) {
        (**self).remove_collision(section)
    }
}

/// Why cooking failed. The section's previous collision geometry stays installed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CookFailed {
    /// The section has no geometry at all.
    #[error("section has no geometry")]
    NoGeometry,
    /// The LOD used for collision has no position stream.
    #[error("LOD has no position stream")]
    MissingPositions,
    /// There are no non-degenerate triangles.
    #[error("geometry has no non-degenerate triangles")]
    NoTriangles,
    /// The points are all coplanar, collinear, coincident or not finite, so they do not
    /// enclose a volume.
    #[error("geometry is degenerate")]
    Degenerate,
}

/// Why a [`PhysicsWorld`] rejected a collision representation.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("physics world rejected collision: {reason}")]
#[non_exhaustive]
pub struct InstallError {
    /// Explanation from the physics world.
    pub reason: String,
}

impl InstallError {
    /// Constructs an [`InstallError`].
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
