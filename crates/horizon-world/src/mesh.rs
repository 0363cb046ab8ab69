//! CPU-side terrain mesh data.
//!
//! A tile mesh is a square grid of `resolution × resolution` vertices with two
//! triangles per grid quad. Vertex layout is `#[repr(C)]` and `Pod` so the
//! arrays can be handed to a GPU backend without conversion.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// One terrain vertex as uploaded to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TerrainVertex {
    /// World-space position
    pub position: [f32; 3],
    /// Unit surface normal
    pub normal: [f32; 3],
    /// Unit tangent along +X of the surface
    pub tangent: [f32; 3],
    /// Linear RGB color
    pub color: [f32; 3],
}

impl TerrainVertex {
    /// Size of one vertex in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Vertex and index arrays for one tile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    /// Vertices in row-major order (X fastest, then Z)
    pub vertices: Vec<TerrainVertex>,
    /// Triangle list indices
    pub indices: Vec<u32>,
    /// Vertices per grid side
    pub resolution: u32,
}

impl MeshData {
    /// Builds the triangle-list indices for a square vertex grid.
    ///
    /// Triangles wind counter-clockwise when seen from +Y.
    #[must_use]
    pub fn grid_indices(resolution: u32) -> Vec<u32> {
        if resolution < 2 {
            return Vec::new();
        }
        let quads = (resolution - 1) as usize;
        let mut indices = Vec::with_capacity(quads * quads * 6);
        for row in 0..resolution - 1 {
            for col in 0..resolution - 1 {
                let a = row * resolution + col;
                let b = a + resolution;
                let c = a + 1;
                let d = b + 1;
                indices.extend_from_slice(&[a, b, c, c, b, d]);
            }
        }
        indices
    }

    /// Returns the vertex at grid position (col, row).
    #[must_use]
    pub fn vertex(&self, col: u32, row: u32) -> Option<&TerrainVertex> {
        if col >= self.resolution || row >= self.resolution {
            return None;
        }
        self.vertices.get((row * self.resolution + col) as usize)
    }

    /// Number of triangles.
    #[must_use]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Approximate heap footprint in bytes.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.vertices.len() * TerrainVertex::SIZE + self.indices.len() * std::mem::size_of::<u32>()
    }
}

/// Tangent for a surface normal.
///
/// Crosses the normal with +Z, switching to +X when the normal is nearly
/// parallel to Z so the cross product never degenerates. For an upward normal
/// the result points along +X.
#[must_use]
pub fn tangent_for_normal(normal: Vec3) -> Vec3 {
    let axis = if normal.z.abs() > 0.99 { Vec3::X } else { Vec3::Z };
    normal.cross(axis).normalize_or_zero()
}
