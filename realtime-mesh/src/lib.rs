//! Versioned, thread-safe mesh section data for applications which generate or stream
//! geometry at interactive rates and must hand it to a renderer and a physics engine
//! without stalling either.
//!
//! The data flows in one direction:
//!
//! * A producer describes mutations of a [`Section`] as an [`UpdateBatch`] and submits it
//!   to the [`RealtimeMesh`] which owns the sections.
//! * Each successful submission publishes an immutable, reference-counted [`Snapshot`]
//!   with a version one greater than the previous one, and delivers it to every
//!   registered [`Listener`].
//! * [`render::RenderProxySynchronizer`] coalesces snapshots for the render thread and
//!   uploads only the changed byte ranges through an [`render::UploadBuffer`].
//! * [`collision::CollisionCookPipeline`] cooks collision representations off the
//!   mutation path and installs them into a [`collision::PhysicsWorld`], discarding any
//!   result which was superseded while it was being cooked.
//! * [`lod::LodSelector`] chooses which level of detail of each section is drawn.
//!
//! None of the graphics or physics APIs are used directly; the host implements the
//! narrow interfaces above.
//!
//! # Getting started
//!
//! ```ignore
//! let mesh = RealtimeMesh::new(MeshConfig::default());
//! let id = mesh.create_section(SectionConfig::default());
//! mesh.submit(UpdateBatch::new(id).replace_all(shapes::box_mesh([1.0; 3], [255; 4])))?;
//! ```

// Crate-specific lint settings. (General settings can be found in the workspace manifest.)
#![forbid(unsafe_code)]

pub mod batch;
pub use batch::{BatchError, BatchOp, UpdateBatch};
mod bounds;
pub use bounds::{Aabb, BoundingSphere, Bounds};
pub mod collision;
mod commit;
pub mod config;
pub use config::MeshConfig;
mod error;
pub use error::SubmitError;
pub mod listen;
pub use listen::{DynListener, Listener};
pub mod lod;
mod mesh;
pub use mesh::{MeshDataProvider, MeshEvent, RealtimeMesh};
pub mod render;
mod section;
pub use section::{LodRecord, Section, SectionConfig, SectionId, Version};
pub mod shapes;
mod snapshot;
pub use snapshot::{ChangeSet, LodSnapshot, Snapshot, StreamSnapshot};
pub mod stream;
pub use stream::{ElementFormat, GeometryStream, OutOfRange, StreamData, StreamKind, StreamSet};
#[doc(hidden)]
pub mod testing;

#[cfg(test)]
mod tests;

/// Coordinate system marker for vertex positions of mesh sections.
///
/// All positions are in the section's local space; placing sections in a world is the
/// host's responsibility.
#[derive(Debug)]
#[expect(clippy::exhaustive_enums)]
pub enum MeshSpace {}

/// A vertex position.
pub type Position = euclid::Point3D<f32, MeshSpace>;

/// A vector in the section's local space.
pub type MeshVector = euclid::Vector3D<f32, MeshSpace>;
