//! GPU vertex and index buffers for terrain tiles.
//!
//! [`WgpuMeshBackend`] implements the world crate's [`MeshBackend`] on a wgpu
//! device. Draw calls are recorded by handle and replayed into a render pass
//! with [`WgpuMeshBackend::encode_draws`].

use ahash::AHashMap;
use horizon_common::GpuError;
use horizon_world::{MeshBackend, MeshHandle, TerrainVertex};
use tracing::{debug, trace, warn};
use wgpu::util::DeviceExt;

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 4] = wgpu::vertex_attr_array![
    0 => Float32x3,
    1 => Float32x3,
    2 => Float32x3,
    3 => Float32x3,
];

/// Vertex buffer layout matching [`TerrainVertex`]: position, normal,
/// tangent and color at shader locations 0 to 3.
#[must_use]
pub fn terrain_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: TerrainVertex::SIZE as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &VERTEX_ATTRIBUTES,
    }
}

/// One uploaded mesh.
struct GpuMesh {
    vertex: wgpu::Buffer,
    index: wgpu::Buffer,
    index_count: u32,
    bytes: u64,
}

impl GpuMesh {
    fn destroy(&self) {
        self.vertex.destroy();
        self.index.destroy();
    }
}

/// wgpu implementation of [`MeshBackend`].
///
/// Must live on the thread that owns the device.
pub struct WgpuMeshBackend {
    /// Device buffers are created on
    device: wgpu::Device,
    /// Live meshes by handle
    meshes: AHashMap<MeshHandle, GpuMesh>,
    /// Draws recorded since the last encode
    pending_draws: Vec<MeshHandle>,
    /// Next handle id
    next_id: u64,
    /// Bytes held by live meshes
    resident_bytes: u64,
}

impl WgpuMeshBackend {
    /// Creates a backend for a device.
    #[must_use]
    pub fn new(device: wgpu::Device) -> Self {
        Self {
            device,
            meshes: AHashMap::new(),
            pending_draws: Vec::new(),
            next_id: 0,
            resident_bytes: 0,
        }
    }

    /// Device used for buffer creation.
    #[must_use]
    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Number of live meshes.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.meshes.len()
    }

    /// Bytes of vertex and index data on the GPU.
    #[must_use]
    pub const fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    /// Draws recorded and not yet encoded.
    #[must_use]
    pub fn pending_draws(&self) -> usize {
        self.pending_draws.len()
    }

    /// Forgets recorded draws without encoding them.
    pub fn discard_draws(&mut self) {
        self.pending_draws.clear();
    }

    /// Replays recorded draws into a render pass whose pipeline uses
    /// [`terrain_vertex_layout`]. Returns the number of draws encoded.
    pub fn encode_draws(&mut self, pass: &mut wgpu::RenderPass<'_>) -> usize {
        let draws = std::mem::take(&mut self.pending_draws);
        let mut encoded = 0;
        for handle in draws {
            let Some(mesh) = self.meshes.get(&handle) else {
                continue;
            };
            pass.set_vertex_buffer(0, mesh.vertex.slice(..));
            pass.set_index_buffer(mesh.index.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..mesh.index_count, 0, 0..1);
            encoded += 1;
        }
        encoded
    }
}

impl MeshBackend for WgpuMeshBackend {
    fn create_buffer(
        &mut self,
        label: &str,
        vertices: &[TerrainVertex],
        indices: &[u32],
    ) -> Result<MeshHandle, GpuError> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(GpuError::BufferAlloc(format!("{label}: empty mesh")));
        }
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(indices);
        let max_size = self.device.limits().max_buffer_size;
        let largest = vertex_bytes.len().max(index_bytes.len()) as u64;
        if largest > max_size {
            return Err(GpuError::BufferAlloc(format!(
                "{label}: {largest} bytes exceeds device limit of {max_size}"
            )));
        }
        let index_count = u32::try_from(indices.len())
            .map_err(|_| GpuError::BufferAlloc(format!("{label}: too many indices")))?;

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let vertex = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label} vertices")),
            contents: vertex_bytes,
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label} indices")),
            contents: index_bytes,
            usage: wgpu::BufferUsages::INDEX,
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());

        let mesh = GpuMesh {
            vertex,
            index,
            index_count,
            bytes: (vertex_bytes.len() + index_bytes.len()) as u64,
        };
        if let Some(e) = validation {
            mesh.destroy();
            return Err(GpuError::ValidationError(format!("{label}: {e}")));
        }
        if let Some(e) = out_of_memory {
            mesh.destroy();
            return Err(GpuError::BufferAlloc(format!("{label}: {e}")));
        }

        self.next_id += 1;
        let handle = MeshHandle::from_raw(self.next_id);
        self.resident_bytes += mesh.bytes;
        self.meshes.insert(handle, mesh);
        trace!("{label}: uploaded mesh {}", handle.raw());
        Ok(handle)
    }

    fn delete_buffer(&mut self, handle: MeshHandle) {
        if let Some(mesh) = self.meshes.remove(&handle) {
            self.resident_bytes = self.resident_bytes.saturating_sub(mesh.bytes);
            mesh.destroy();
        }
    }

    fn draw_indexed(&mut self, handle: MeshHandle) {
        if self.meshes.contains_key(&handle) {
            self.pending_draws.push(handle);
        } else {
            warn!("Draw of unknown mesh {} ignored", handle.raw());
        }
    }
}

impl Drop for WgpuMeshBackend {
    fn drop(&mut self) {
        if !self.meshes.is_empty() {
            debug!("Releasing {} terrain meshes with the backend", self.meshes.len());
        }
        for mesh in self.meshes.values() {
            mesh.destroy();
        }
    }
}

impl std::fmt::Debug for WgpuMeshBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuMeshBackend")
            .field("live_buffers", &self.meshes.len())
            .field("resident_bytes", &self.resident_bytes)
            .field("pending_draws", &self.pending_draws.len())
            .finish_non_exhaustive()
    }
}
