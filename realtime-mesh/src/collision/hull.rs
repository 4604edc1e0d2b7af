//! Incremental 3D convex hull.

use std::collections::BTreeSet;

use euclid::default::Vector3D;
use hashbrown::HashMap;

use super::CookFailed;

type V = Vector3D<f64>;

/// Computes the convex hull of `points`, returning its vertices and outward-facing
/// counterclockwise triangles. Non-finite points are ignored.
pub(super) fn convex_hull(points: &[[f32; 3]]) -> Result<(Vec<[f32; 3]>, Vec<[u32; 3]>), CookFailed> {
    let points: Vec<V> = points
        .iter()
        .filter(|p| p.iter().all(|c| c.is_finite()))
        .map(|&[x, y, z]| V::new(x.into(), y.into(), z.into()))
        .collect();
    let first = *points.first().ok_or(CookFailed::Degenerate)?;

    let extent = points
        .iter()
        .map(|p| (*p - first).abs())
        .fold(V::zero(), |a, b| a.max(b));
    let scale = extent.x.max(extent.y).max(extent.z);
    if scale == 0.0 {
        return Err(CookFailed::Degenerate);
    }
    let epsilon = scale * 1e-9;

    let [a, b, c, d] = initial_tetrahedron(&points, epsilon)?;
    let mut faces: Vec<[usize; 3]> = vec![[a, b, c], [a, c, d], [a, d, b], [b, d, c]];
    // Orient outward: the centroid of the tetrahedron must be behind every face.
    let centroid = (points[a] + points[b] + points[c] + points[d]) / 4.0;
    for face in &mut faces {
        if signed_distance(&points, *face, centroid) > 0.0 {
            face.swap(1, 2);
        }
    }

    for (index, &point) in points.iter().enumerate() {
        if [a, b, c, d].contains(&index) {
            continue;
        }
        let (visible, hidden): (Vec<[usize; 3]>, Vec<[usize; 3]>) = faces
            .iter()
            .copied()
            .partition(|&face| signed_distance(&points, face, point) > epsilon);
        if visible.is_empty() {
            continue;
        }
        // The horizon consists of the edges of visible faces whose opposite edge belongs to
        // a face that remains.
        let visible_edges: BTreeSet<(usize, usize)> = visible
            .iter()
            .flat_map(|&[p, q, r]| [(p, q), (q, r), (r, p)])
            .collect();
        faces = hidden;
        for &(p, q) in &visible_edges {
            if !visible_edges.contains(&(q, p)) {
                faces.push([p, q, index]);
            }
        }
    }

    // Compact to only the vertices the faces use.
    let mut remap: HashMap<usize, u32> = HashMap::new();
    let mut vertices = Vec::new();
    let triangles = faces
        .iter()
        .map(|face| {
            face.map(|i| {
                *remap.entry(i).or_insert_with(|| {
                    let p = points[i];
                    vertices.push([p.x as f32, p.y as f32, p.z as f32]);
                    (vertices.len() - 1) as u32
                })
            })
        })
        .collect();
    Ok((vertices, triangles))
}

/// Picks four points spanning a volume.
fn initial_tetrahedron(points: &[V], epsilon: f64) -> Result<[usize; 4], CookFailed> {
    let farthest = |metric: &dyn Fn(V) -> f64| -> (usize, f64) {
        points
            .iter()
            .enumerate()
            .map(|(i, &p)| (i, metric(p)))
            .fold((0, f64::NEG_INFINITY), |best, candidate| {
                if candidate.1 > best.1 { candidate } else { best }
            })
    };

    let a = 0;
    let (b, ab_distance) = farthest(&|p| (p - points[a]).length());
    if ab_distance <= epsilon {
        return Err(CookFailed::Degenerate);
    }
    let ab = points[b] - points[a];
    let (c, line_distance) = farthest(&|p| ab.cross(p - points[a]).length() / ab.length());
    if line_distance <= epsilon {
        return Err(CookFailed::Degenerate);
    }
    let normal = ab.cross(points[c] - points[a]).normalize();
    let (d, plane_distance) = farthest(&|p| normal.dot(p - points[a]).abs());
    if plane_distance <= epsilon {
        return Err(CookFailed::Degenerate);
    }
    Ok([a, b, c, d])
}

/// Distance of `point` in front of the plane of `face`, positive on the side from which the
/// face's vertices appear counterclockwise.
fn signed_distance(points: &[V], [p, q, r]: [usize; 3], point: V) -> f64 {
    let normal = (points[q] - points[p]).cross(points[r] - points[p]);
    let length = normal.length();
    if length == 0.0 {
        return 0.0;
    }
    normal.dot(point - points[p]) / length
}
