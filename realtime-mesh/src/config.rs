//! Configuration of a [`RealtimeMesh`](crate::RealtimeMesh) and its consumers.
//!
//! All configuration types can be serialized; missing fields take their default values, so
//! a configuration file need only mention what it changes.

/// Settings for a [`RealtimeMesh`](crate::RealtimeMesh).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct MeshConfig {
    /// Maximum number of elements any single stream may hold.
    /// Writes exceeding it fail with [`OutOfRange`](crate::OutOfRange).
    pub max_stream_elements: usize,

    /// What [`RealtimeMesh::submit()`](crate::RealtimeMesh::submit) does when another batch
    /// is being committed to the same section.
    pub contention: ContentionPolicy,

    /// Whether to reject batches which would leave index values referring to nonexistent
    /// vertices. Costs a scan of every modified index stream per commit.
    pub validate_indices: bool,

    /// Maximum number of LODs per section.
    pub max_lods: usize,

    /// Settings for [`LodSelector`](crate::lod::LodSelector).
    pub lod: LodConfig,

    /// Settings for [`CollisionCookPipeline`](crate::collision::CollisionCookPipeline).
    pub collision: CollisionConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_stream_elements: 1 << 24,
            contention: ContentionPolicy::Block,
            validate_indices: true,
            max_lods: 8,
            lod: LodConfig::default(),
            collision: CollisionConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Parses a configuration from JSON. Absent fields take their default values.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// How concurrent submissions to the same section are serialized.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum ContentionPolicy {
    /// Wait until the other commit finishes.
    #[default]
    Block,
    /// Return [`SubmitError::Busy`](crate::SubmitError::Busy) immediately.
    Fail,
}

/// Settings for LOD selection.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct LodConfig {
    /// Width of the band around each screen size threshold within which the selected LOD
    /// does not change.
    pub hysteresis: f32,

    /// The most detailed LOD which may be selected; more detailed ones are skipped.
    pub min_lod: usize,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            hysteresis: 0.05,
            min_lod: 0,
        }
    }
}

/// Settings for collision cooking.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct CollisionConfig {
    /// What kind of representation to cook.
    pub mode: CollisionMode,

    /// Which LOD's geometry collision is cooked from. If the section has fewer LODs, the
    /// least detailed one is used.
    pub lod: usize,

    /// Reverse the winding of every triangle, so that the collision surface faces inward.
    pub flip_normals: bool,

    /// Vertices closer than this distance on every axis are merged before cooking a
    /// triangle mesh. Zero disables welding.
    pub weld_tolerance: f32,

    /// How many times a failed cook or install of the same version is retried.
    pub max_retries: u32,

    /// Number of threads in a [`CookWorkerPool`](crate::collision::CookWorkerPool).
    pub worker_threads: usize,
}

impl Default for CollisionConfig {
    fn default() -> Self {
        Self {
            mode: CollisionMode::TriangleMesh,
            lod: 0,
            flip_normals: false,
            weld_tolerance: 0.0,
            max_retries: 3,
            worker_threads: 2,
        }
    }
}

/// Kinds of collision representation.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum CollisionMode {
    /// Use the render triangles directly.
    #[default]
    TriangleMesh,
    /// The convex hull of the vertices.
    ConvexHull,
    /// The bounding box of the vertices.
    BoundingBox,
}
