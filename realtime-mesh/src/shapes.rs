//! Construction of simple meshes, as [`StreamSet`]s ready for
//! [`UpdateBatch::replace_all()`](crate::UpdateBatch::replace_all) and similar.

use crate::{MeshVector, Position, StreamKind, StreamSet};

/// Accumulates vertices and triangles, then produces a [`StreamSet`] with position, normal,
/// texture coordinate (channel 0), color, and index streams.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshBuilder {
    positions: Vec<[f32; 3]>,
    normals: Vec<[f32; 3]>,
    tex_coords: Vec<[f32; 2]>,
    colors: Vec<[u8; 4]>,
    indices: Vec<u32>,
}

impl MeshBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a vertex and returns its index.
    pub fn push_vertex(
        &mut self,
        position: Position,
        normal: MeshVector,
        tex_coord: [f32; 2],
        color: [u8; 4],
    ) -> u32 {
        let index = self.positions.len() as u32;
        self.positions.push(position.to_array());
        self.normals.push(normal.to_array());
        self.tex_coords.push(tex_coord);
        self.colors.push(color);
        index
    }

    /// Adds a triangle of previously added vertices, counterclockwise when viewed from its
    /// front.
    pub fn push_triangle(&mut self, triangle: [u32; 3]) {
        self.indices.extend_from_slice(&triangle);
    }

    /// Adds a flat quadrilateral, given its corners in counterclockwise order.
    pub fn push_quad(&mut self, corners: [Position; 4], normal: MeshVector, color: [u8; 4]) {
        const UVS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        let [a, b, c, d] = [0, 1, 2, 3].map(|i| self.push_vertex(corners[i], normal, UVS[i], color));
        self.push_triangle([a, b, c]);
        self.push_triangle([a, c, d]);
    }

    /// Number of vertices added so far.
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of indices added so far; three per triangle.
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Produces the streams.
    pub fn build(self) -> StreamSet {
        StreamSet::new()
            .with(StreamKind::Position, self.positions)
            .with(StreamKind::Normal, self.normals)
            .with(StreamKind::TexCoord(0), self.tex_coords)
            .with(StreamKind::Color, self.colors)
            .with(StreamKind::Index, self.indices)
    }
}

/// A box centered on the origin with the given half extents, with separate vertices for each
/// face so that normals are flat.
pub fn box_mesh(half_extents: [f32; 3], color: [u8; 4]) -> StreamSet {
    let [hx, hy, hz] = half_extents;
    let x = MeshVector::new(hx, 0.0, 0.0);
    let y = MeshVector::new(0.0, hy, 0.0);
    let z = MeshVector::new(0.0, 0.0, hz);
    // (outward axis, u, v) with u × v pointing outward.
    let faces = [(x, y, z), (-x, z, y), (y, z, x), (-y, x, z), (z, x, y), (-z, y, x)];

    let mut builder = MeshBuilder::new();
    for (out, u, v) in faces {
        let center = Position::origin() + out;
        builder.push_quad(
            [center - u - v, center + u - v, center + u + v, center - u + v],
            u.cross(v).normalize(),
            color,
        );
    }
    builder.build()
}

/// A flat grid of `divisions × divisions` square cells covering `[0, size]²` in the XY
/// plane, facing +Z.
pub fn plane(divisions: u32, size: f32, color: [u8; 4]) -> StreamSet {
    height_field(divisions, size, color, |_, _| 0.0)
}

/// Like [`plane()`], but with each vertex raised to `height(x, y)` on the Z axis, and
/// normals estimated from the neighboring heights.
pub fn height_field(
    divisions: u32,
    size: f32,
    color: [u8; 4],
    height: impl Fn(f32, f32) -> f32,
) -> StreamSet {
    let n = divisions.max(1);
    let step = size / n as f32;
    let mut builder = MeshBuilder::new();
    for row in 0..=n {
        for column in 0..=n {
            let (x, y) = (column as f32 * step, row as f32 * step);
            let dx = height(x + step / 2.0, y) - height(x - step / 2.0, y);
            let dy = height(x, y + step / 2.0) - height(x, y - step / 2.0);
            let normal = MeshVector::new(-dx, -dy, step);
            builder.push_vertex(
                Position::new(x, y, height(x, y)),
                normal.try_normalize().unwrap_or(MeshVector::new(0.0, 0.0, 1.0)),
                [column as f32 / n as f32, row as f32 / n as f32],
                color,
            );
        }
    }
    let stride = n + 1;
    for row in 0..n {
        for column in 0..n {
            let i = row * stride + column;
            builder.push_triangle([i, i + 1, i + stride + 1]);
            builder.push_triangle([i, i + stride + 1, i + stride]);
        }
    }
    builder.build()
}
