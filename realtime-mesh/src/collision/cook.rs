use hashbrown::HashMap;

use super::hull::convex_hull;
use super::{CollisionRepresentation, CollisionShape, CookFailed};
use crate::config::{CollisionConfig, CollisionMode};
use crate::{Aabb, Snapshot};

/// Builds the collision representation of `snapshot` as `config` specifies.
///
/// This is a pure function of its inputs and may be run on any thread.
pub fn cook(
    snapshot: &Snapshot,
    config: &CollisionConfig,
) -> Result<CollisionRepresentation, CookFailed> {
    let last_lod = snapshot
        .lods()
        .len()
        .checked_sub(1)
        .ok_or(CookFailed::NoGeometry)?;
    let lod = snapshot
        .lod(config.lod.min(last_lod))
        .ok_or(CookFailed::NoGeometry)?;
    let positions = lod.positions().ok_or(CookFailed::MissingPositions)?;
    if positions.is_empty() {
        return Err(CookFailed::NoGeometry);
    }

    let shape = match config.mode {
        CollisionMode::TriangleMesh => {
            let triangles: Vec<[u32; 3]> = match lod.indices() {
                Some(indices) => indices
                    .chunks_exact(3)
                    .map(|t| [t[0], t[1], t[2]])
                    .collect(),
                // Without indices, the positions are a plain triangle list.
                None => (0..positions.len() as u32 / 3)
                    .map(|t| [t * 3, t * 3 + 1, t * 3 + 2])
                    .collect(),
            };
            let (vertices, mut triangles) =
                clean_triangles(positions, &triangles, config.weld_tolerance);
            if triangles.is_empty() {
                return Err(CookFailed::NoTriangles);
            }
            if config.flip_normals {
                flip(&mut triangles);
            }
            CollisionShape::TriangleMesh {
                vertices,
                triangles,
            }
        }
        CollisionMode::ConvexHull => {
            let (vertices, mut triangles) = convex_hull(positions)?;
            if config.flip_normals {
                flip(&mut triangles);
            }
            CollisionShape::ConvexHull {
                vertices,
                triangles,
            }
        }
        CollisionMode::BoundingBox => {
            let aabb = Aabb::from_points(positions.iter().copied());
            if aabb.is_empty() {
                return Err(CookFailed::Degenerate);
            }
            CollisionShape::Box(aabb)
        }
    };

    Ok(CollisionRepresentation {
        section: snapshot.section(),
        version: snapshot.version(),
        shape,
    })
}

fn flip(triangles: &mut [[u32; 3]]) {
    for triangle in triangles {
        triangle.swap(1, 2);
    }
}

/// Welds vertices closer than `tolerance`, drops triangles which are degenerate or refer to
/// missing or non-finite vertices, and drops vertices no triangle uses.
fn clean_triangles(
    positions: &[[f32; 3]],
    triangles: &[[u32; 3]],
    tolerance: f32,
) -> (Vec<[f32; 3]>, Vec<[u32; 3]>) {
    // Map each input vertex to its representative input vertex.
    let representative: Vec<Option<u32>> = if tolerance > 0.0 {
        let mut cells: HashMap<[i64; 3], u32> = HashMap::new();
        positions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if !p.iter().all(|c| c.is_finite()) {
                    return None;
                }
                let cell = p.map(|c| (f64::from(c) / f64::from(tolerance)).round() as i64);
                Some(*cells.entry(cell).or_insert(i as u32))
            })
            .collect()
    } else {
        positions
            .iter()
            .enumerate()
            .map(|(i, p)| p.iter().all(|c| c.is_finite()).then_some(i as u32))
            .collect()
    };

    let mut output_index: HashMap<u32, u32> = HashMap::new();
    let mut vertices = Vec::new();
    let mut output_triangles = Vec::with_capacity(triangles.len());
    for triangle in triangles {
        let Some(mapped) = triangle
            .iter()
            .map(|&i| representative.get(i as usize).copied().flatten())
            .collect::<Option<Vec<u32>>>()
        else {
            continue;
        };
        let [a, b, c] = [mapped[0], mapped[1], mapped[2]];
        if a == b || b == c || c == a || zero_area([a, b, c].map(|i| positions[i as usize])) {
            continue;
        }
        output_triangles.push([a, b, c].map(|i| {
            *output_index.entry(i).or_insert_with(|| {
                vertices.push(positions[i as usize]);
                (vertices.len() - 1) as u32
            })
        }));
    }
    (vertices, output_triangles)
}

fn zero_area([a, b, c]: [[f32; 3]; 3]) -> bool {
    let u = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let v = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let cross = [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ];
    cross == [0.0; 3]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::grid_mesh;
    use crate::{RealtimeMesh, SectionConfig, StreamKind, StreamSet, UpdateBatch};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn snapshot_of(streams: StreamSet) -> Arc<Snapshot> {
        let mesh = RealtimeMesh::new(crate::MeshConfig::default());
        let id = mesh.create_section(SectionConfig::default());
        mesh.submit(UpdateBatch::new(id).replace_all(streams)).unwrap()
    }

    #[test]
    fn triangle_mesh_of_grid() {
        let snapshot = snapshot_of(grid_mesh(2));
        let rep = cook(&snapshot, &CollisionConfig::default()).unwrap();
        assert_eq!(rep.version, snapshot.version());
        assert_eq!(rep.shape.triangle_count(), 8);
    }

    #[test]
    fn flip_reverses_winding() {
        let snapshot = snapshot_of(grid_mesh(1));
        let normal = cook(&snapshot, &CollisionConfig::default()).unwrap();
        let flipped = cook(
            &snapshot,
            &CollisionConfig {
                flip_normals: true,
                ..CollisionConfig::default()
            },
        )
        .unwrap();
        let (
            CollisionShape::TriangleMesh { triangles: a, .. },
            CollisionShape::TriangleMesh { triangles: b, .. },
        ) = (normal.shape, flipped.shape)
        else {
            panic!("wrong shape");
        };
        assert_eq!(a[0], [b[0][0], b[0][2], b[0][1]]);
    }

    #[test]
    fn degenerate_triangles_are_no_triangles() {
        let snapshot = snapshot_of(
            StreamSet::new()
                .with(StreamKind::Position, vec![[0.0f32; 3], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]])
                .with(StreamKind::Index, vec![0u32, 1, 2, 0, 0, 1]),
        );
        assert_eq!(
            cook(&snapshot, &CollisionConfig::default()),
            Err(CookFailed::NoTriangles)
        );
    }

    #[test]
    fn weld_merges_near_vertices() {
        // Two triangles sharing an edge, but with the shared vertices duplicated and offset.
        let snapshot = snapshot_of(
            StreamSet::new()
                .with(
                    StreamKind::Position,
                    vec![
                        [0.0f32, 0.0, 0.0],
                        [1.0, 0.0, 0.0],
                        [0.0, 1.0, 0.0],
                        [1.0001, 0.0, 0.0],
                        [1.0, 1.0, 0.0],
                        [0.0, 1.0001, 0.0],
                    ],
                )
                .with(StreamKind::Index, vec![0u32, 1, 2, 3, 4, 5]),
        );
        let config = CollisionConfig {
            weld_tolerance: 0.01,
            ..CollisionConfig::default()
        };
        let CollisionShape::TriangleMesh { vertices, triangles } =
            cook(&snapshot, &config).unwrap().shape
        else {
            panic!("wrong shape");
        };
        assert_eq!(vertices.len(), 4);
        assert_eq!(triangles.len(), 2);
    }

    #[test]
    fn empty_section_has_no_geometry() {
        let snapshot = snapshot_of(StreamSet::new());
        assert_eq!(
            cook(&snapshot, &CollisionConfig::default()),
            Err(CookFailed::NoGeometry)
        );
    }

    #[test]
    fn bounding_box() {
        let snapshot = snapshot_of(grid_mesh(3));
        let rep = cook(
            &snapshot,
            &CollisionConfig {
                mode: CollisionMode::BoundingBox,
                ..CollisionConfig::default()
            },
        )
        .unwrap();
        assert_eq!(rep.shape, CollisionShape::Box(snapshot.bounds().aabb()));
    }
}
