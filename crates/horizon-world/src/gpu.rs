//! GPU backend abstraction.
//!
//! Terrain code never talks to a graphics API directly. It asks a
//! [`MeshBackend`] to create, delete and draw indexed vertex buffers. Every
//! backend method must be called on the thread that owns the GPU context.
//!
//! [`HeadlessBackend`] keeps only bookkeeping, which makes it suitable for
//! tests, tools and servers that need terrain heights without a display.

use ahash::AHashMap;
use horizon_common::GpuError;
use tracing::trace;

use crate::mesh::TerrainVertex;

/// Opaque handle to a GPU-resident mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshHandle(u64);

impl MeshHandle {
    /// Creates a handle from a raw backend id.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw backend id.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Render-thread GPU operations needed by terrain tiles.
pub trait MeshBackend {
    /// Uploads vertex and index data into GPU buffers.
    ///
    /// On failure the backend releases anything it allocated during the call.
    fn create_buffer(
        &mut self,
        label: &str,
        vertices: &[TerrainVertex],
        indices: &[u32],
    ) -> Result<MeshHandle, GpuError>;

    /// Releases the buffers behind a handle. Unknown handles are ignored.
    fn delete_buffer(&mut self, handle: MeshHandle);

    /// Issues an indexed draw of the mesh behind a handle.
    fn draw_indexed(&mut self, handle: MeshHandle);
}

/// Size of one uploaded mesh in the headless backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadlessMesh {
    /// Vertex count
    pub vertex_count: usize,
    /// Index count
    pub index_count: usize,
}

/// Bookkeeping-only backend.
///
/// Tracks live buffers and draw calls, and can be told to fail uploads so
/// callers can exercise their rollback paths.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    /// Next handle id
    next_id: u64,
    /// Live meshes
    meshes: AHashMap<MeshHandle, HeadlessMesh>,
    /// Draw calls since the last `take_draws`
    draws: Vec<MeshHandle>,
    /// Uploads left to fail
    fail_uploads: usize,
    /// Total successful uploads
    uploads: u64,
    /// Total deletions of live handles
    deletions: u64,
}

impl HeadlessBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` uploads fail.
    pub fn fail_next_uploads(&mut self, count: usize) {
        self.fail_uploads = count;
    }

    /// Number of live GPU meshes.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.meshes.len()
    }

    /// Looks up a live mesh.
    #[must_use]
    pub fn mesh(&self, handle: MeshHandle) -> Option<&HeadlessMesh> {
        self.meshes.get(&handle)
    }

    /// Successful uploads so far.
    #[must_use]
    pub const fn upload_count(&self) -> u64 {
        self.uploads
    }

    /// Deletions of live meshes so far.
    #[must_use]
    pub const fn deletion_count(&self) -> u64 {
        self.deletions
    }

    /// Returns and clears the draw calls recorded since the last call.
    pub fn take_draws(&mut self) -> Vec<MeshHandle> {
        std::mem::take(&mut self.draws)
    }
}

impl MeshBackend for HeadlessBackend {
    fn create_buffer(
        &mut self,
        label: &str,
        vertices: &[TerrainVertex],
        indices: &[u32],
    ) -> Result<MeshHandle, GpuError> {
        if self.fail_uploads > 0 {
            self.fail_uploads -= 1;
            return Err(GpuError::BufferAlloc(format!("{label}: injected failure")));
        }
        if vertices.is_empty() || indices.is_empty() {
            return Err(GpuError::BufferAlloc(format!("{label}: empty mesh")));
        }

        self.next_id += 1;
        let handle = MeshHandle(self.next_id);
        self.meshes.insert(
            handle,
            HeadlessMesh {
                vertex_count: vertices.len(),
                index_count: indices.len(),
            },
        );
        self.uploads += 1;
        trace!("{label}: created headless mesh {}", handle.0);
        Ok(handle)
    }

    fn delete_buffer(&mut self, handle: MeshHandle) {
        if self.meshes.remove(&handle).is_some() {
            self.deletions += 1;
        }
    }

    fn draw_indexed(&mut self, handle: MeshHandle) {
        if self.meshes.contains_key(&handle) {
            self.draws.push(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> (Vec<TerrainVertex>, Vec<u32>) {
        let v = TerrainVertex {
            position: [0.0; 3],
            normal: [0.0, 1.0, 0.0],
            tangent: [1.0, 0.0, 0.0],
            color: [1.0; 3],
        };
        (vec![v; 4], vec![0, 2, 1, 1, 2, 3])
    }

    #[test]
    fn test_create_draw_delete() {
        let mut backend = HeadlessBackend::new();
        let (vertices, indices) = quad();
        let handle = backend
            .create_buffer("quad", &vertices, &indices)
            .expect("upload failed");
        assert_eq!(backend.live_buffers(), 1);
        assert_eq!(backend.mesh(handle).map(|m| m.index_count), Some(6));

        backend.draw_indexed(handle);
        assert_eq!(backend.take_draws(), vec![handle]);
        assert!(backend.take_draws().is_empty());

        backend.delete_buffer(handle);
        backend.delete_buffer(handle);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.deletion_count(), 1);

        // Drawing a deleted handle is ignored
        backend.draw_indexed(handle);
        assert!(backend.take_draws().is_empty());
    }

    #[test]
    fn test_injected_failures() {
        let mut backend = HeadlessBackend::new();
        let (vertices, indices) = quad();
        backend.fail_next_uploads(2);
        assert!(backend.create_buffer("a", &vertices, &indices).is_err());
        assert!(backend.create_buffer("b", &vertices, &indices).is_err());
        assert!(backend.create_buffer("c", &vertices, &indices).is_ok());
        assert_eq!(backend.live_buffers(), 1);
    }
}
