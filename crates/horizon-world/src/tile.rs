//! Terrain tiles.
//!
//! A [`Tile`] owns the mesh for one `(x, z, level)` grid cell and moves
//! through a small state machine:
//!
//! ```text
//! Generating ──► Generated ──► Buffered
//!     │              │             │
//!     ├──► Failed    └─────────────┴──► Retired
//!     └──────────────────────────────────┘
//! ```
//!
//! Mesh construction only touches its own buffers and the height source, so
//! it runs on worker threads without synchronization. Buffer creation and
//! deletion go through a [`MeshBackend`] and must stay on the render thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use glam::{Vec2, Vec3};
use horizon_common::{Aabb, ChunkKey, GenerationError, UploadError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::camera::CameraView;
use crate::color::ColorBands;
use crate::gpu::{MeshBackend, MeshHandle};
use crate::height::HeightSource;
use crate::mesh::{tangent_for_normal, MeshData, TerrainVertex};
use crate::pool::{PoolError, WorkerPool};

/// Lifecycle state of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    /// Waiting for or running mesh generation
    Generating,
    /// CPU mesh ready, not yet on the GPU
    Generated,
    /// Mesh lives in GPU buffers
    Buffered,
    /// Resources released; the tile is dead
    Retired,
    /// Generation failed; the tile stays ungenerated for this run
    Failed,
}

/// Mesh-building settings shared by every tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Samples per side of the coarse grid used for height bounds
    pub bounds_samples: u32,
    /// Extra height added above and below the sampled bounds
    pub bounds_margin: f32,
    /// Vertex color bands
    pub colors: ColorBands,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            colors: ColorBands::default(),
            bounds_samples: 9,
            bounds_margin: 4.0,
        }
    }
}

/// Conservative vertical extent of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightBounds {
    /// Lowest height
    pub min: f32,
    /// Highest height
    pub max: f32,
}

/// Everything needed to build a tile mesh, detached from the tile itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileDesc {
    /// Tile identity
    pub key: ChunkKey,
    /// World-space minimum X/Z corner
    pub origin: Vec2,
    /// Footprint side length in world units
    pub size: f32,
    /// Vertices per side
    pub resolution: u32,
}

/// Result of mesh generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedMesh {
    /// CPU mesh arrays
    pub mesh: MeshData,
    /// Culling bounds
    pub bounds: HeightBounds,
}

/// Cancellation flag shared between a tile and its generation job.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Creates a fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Best effort: a finished job is unaffected.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Builds the mesh and height bounds for a tile.
///
/// Polls `cancel` once per vertex row.
pub fn build_mesh(
    desc: &TileDesc,
    heights: &dyn HeightSource,
    settings: &MeshSettings,
    cancel: Option<&TaskHandle>,
) -> Result<GeneratedMesh, GenerationError> {
    let res = desc.resolution;
    if res < 2 {
        return Err(GenerationError::InvalidParameters(format!(
            "resolution {res} is below 2"
        )));
    }
    if !(desc.size.is_finite() && desc.size > 0.0) {
        return Err(GenerationError::InvalidParameters(format!(
            "footprint size {} is not positive",
            desc.size
        )));
    }

    let spacing = desc.size / (res - 1) as f32;
    let eps = spacing;
    let mut vertices = Vec::with_capacity((res * res) as usize);

    for row in 0..res {
        if cancel.is_some_and(TaskHandle::is_cancelled) {
            return Err(GenerationError::Cancelled(desc.key));
        }
        let wz = desc.origin.y + row as f32 * spacing;
        for col in 0..res {
            let wx = desc.origin.x + col as f32 * spacing;
            let h = heights.height(wx, wz);

            // Central differences over four neighbours
            let left = heights.height(wx - eps, wz);
            let right = heights.height(wx + eps, wz);
            let down = heights.height(wx, wz - eps);
            let up = heights.height(wx, wz + eps);
            let normal = Vec3::new(left - right, 2.0 * eps, down - up).normalize();
            if !h.is_finite() || !normal.is_finite() {
                return Err(GenerationError::NonFiniteHeight { x: wx, z: wz });
            }

            let tangent = tangent_for_normal(normal);
            let slope = 1.0 - normal.y;
            let color = settings.colors.classify(h, slope, heights.variation(wx, wz));

            vertices.push(TerrainVertex {
                position: [wx, h, wz],
                normal: normal.to_array(),
                tangent: tangent.to_array(),
                color,
            });
        }
    }

    let bounds = sample_bounds(desc, heights, settings)?;

    Ok(GeneratedMesh {
        mesh: MeshData {
            vertices,
            indices: MeshData::grid_indices(res),
            resolution: res,
        },
        bounds,
    })
}

/// Samples a coarse grid over the footprint and pads it with the margin.
fn sample_bounds(
    desc: &TileDesc,
    heights: &dyn HeightSource,
    settings: &MeshSettings,
) -> Result<HeightBounds, GenerationError> {
    let samples = settings.bounds_samples.max(2);
    let step = desc.size / (samples - 1) as f32;
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for j in 0..samples {
        for i in 0..samples {
            let x = desc.origin.x + i as f32 * step;
            let z = desc.origin.y + j as f32 * step;
            let h = heights.height(x, z);
            if !h.is_finite() {
                return Err(GenerationError::NonFiniteHeight { x, z });
            }
            min = min.min(h);
            max = max.max(h);
        }
    }
    let margin = settings.bounds_margin.max(0.0);
    Ok(HeightBounds {
        min: min - margin,
        max: max + margin,
    })
}

/// Output of a generation job, handed to the completion callback.
#[derive(Debug)]
pub struct GenerationOutcome {
    /// Tile the job was for
    pub key: ChunkKey,
    /// Ticket the tile was issued when the job started
    pub ticket: u64,
    /// Generated mesh or the reason there is none
    pub result: Result<GeneratedMesh, GenerationError>,
}

/// A detached, cancellable generation task for one tile.
pub struct GenerationJob {
    desc: TileDesc,
    ticket: u64,
    handle: TaskHandle,
    heights: Arc<dyn HeightSource>,
    settings: Arc<MeshSettings>,
}

impl GenerationJob {
    /// Tile the job builds.
    #[must_use]
    pub const fn key(&self) -> ChunkKey {
        self.desc.key
    }

    /// Ticket matched against the tile on completion.
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Cancellation handle shared with the tile.
    #[must_use]
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    /// Runs the job on the current thread, converting panics into errors.
    #[must_use]
    pub fn run(self) -> GenerationOutcome {
        let Self {
            desc,
            ticket,
            handle,
            heights,
            settings,
        } = self;
        let result = if handle.is_cancelled() {
            Err(GenerationError::Cancelled(desc.key))
        } else {
            panic::catch_unwind(AssertUnwindSafe(|| {
                build_mesh(&desc, heights.as_ref(), &settings, Some(&handle))
            }))
            .unwrap_or_else(|payload| Err(GenerationError::WorkerPanic(panic_message(&payload))))
        };
        GenerationOutcome {
            key: desc.key,
            ticket,
            result,
        }
    }

    /// Submits the job to a pool; `on_complete` runs on the worker thread.
    pub fn spawn<F>(self, pool: &WorkerPool, on_complete: F) -> Result<(), PoolError>
    where
        F: FnOnce(GenerationOutcome) + Send + 'static,
    {
        pool.submit(move || on_complete(self.run()))
    }
}

impl std::fmt::Debug for GenerationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationJob")
            .field("key", &self.desc.key)
            .field("ticket", &self.ticket)
            .field("cancelled", &self.handle.is_cancelled())
            .finish()
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// One terrain mesh instance covering a square footprint at one LOD level.
pub struct Tile {
    /// Identity
    key: ChunkKey,
    /// World-space minimum X/Z corner
    origin: Vec2,
    /// Footprint side length
    size: f32,
    /// Vertices per side
    resolution: u32,
    /// Lifecycle state
    state: TileState,
    /// Culling bounds, known once generated
    bounds: Option<HeightBounds>,
    /// CPU mesh, released after upload
    mesh: Option<MeshData>,
    /// GPU mesh
    gpu: Option<MeshHandle>,
    /// Index count of the uploaded mesh
    index_count: usize,
    /// Visible this frame
    visible: bool,
    /// Ticket of the current generation attempt
    ticket: u64,
    /// In-flight generation
    task: Option<TaskHandle>,
    /// Why generation failed, if it did
    error: Option<GenerationError>,
    /// Owner's live-tile counter
    live_counter: Option<Arc<AtomicUsize>>,
}

impl Tile {
    /// Creates a tile in the `Generating` state.
    #[must_use]
    pub fn new(desc: TileDesc) -> Self {
        Self {
            key: desc.key,
            origin: desc.origin,
            size: desc.size,
            resolution: desc.resolution,
            state: TileState::Generating,
            bounds: None,
            mesh: None,
            gpu: None,
            index_count: 0,
            visible: false,
            ticket: 0,
            task: None,
            error: None,
            live_counter: None,
        }
    }

    /// Creates a tile that is counted in `counter` until it is retired.
    #[must_use]
    pub fn with_counter(desc: TileDesc, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        let mut tile = Self::new(desc);
        tile.live_counter = Some(counter);
        tile
    }

    /// Tile identity.
    #[must_use]
    pub const fn key(&self) -> ChunkKey {
        self.key
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> TileState {
        self.state
    }

    /// Description used to build the mesh.
    #[must_use]
    pub const fn desc(&self) -> TileDesc {
        TileDesc {
            key: self.key,
            origin: self.origin,
            size: self.size,
            resolution: self.resolution,
        }
    }

    /// World-space minimum X/Z corner.
    #[must_use]
    pub const fn origin(&self) -> Vec2 {
        self.origin
    }

    /// Footprint side length.
    #[must_use]
    pub const fn size(&self) -> f32 {
        self.size
    }

    /// Vertices per side.
    #[must_use]
    pub const fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Footprint center on the X/Z plane.
    #[must_use]
    pub fn center(&self) -> Vec2 {
        self.origin + Vec2::splat(self.size * 0.5)
    }

    /// Horizontal distance from a world position to the footprint center.
    #[must_use]
    pub fn distance_to(&self, position: Vec3) -> f32 {
        horizon_common::horizontal_distance(position, self.center())
    }

    /// Culling bounds, if generated.
    #[must_use]
    pub const fn bounds(&self) -> Option<HeightBounds> {
        self.bounds
    }

    /// Resident CPU mesh, if any.
    #[must_use]
    pub fn mesh(&self) -> Option<&MeshData> {
        self.mesh.as_ref()
    }

    /// GPU mesh handle, if buffered.
    #[must_use]
    pub const fn mesh_handle(&self) -> Option<MeshHandle> {
        self.gpu
    }

    /// Index count of the uploaded mesh.
    #[must_use]
    pub const fn index_count(&self) -> usize {
        self.index_count
    }

    /// Generation failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<&GenerationError> {
        self.error.as_ref()
    }

    /// Ticket of the current generation attempt.
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Whether the tile was marked visible this frame.
    #[must_use]
    pub const fn is_marked_visible(&self) -> bool {
        self.visible
    }

    /// Marks the tile visible or hidden.
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Whether the mesh is on the GPU.
    #[must_use]
    pub fn is_buffered(&self) -> bool {
        self.state == TileState::Buffered
    }

    /// Whether the footprint contains an X/Z point.
    #[must_use]
    pub fn contains_point(&self, x: f32, z: f32) -> bool {
        x >= self.origin.x
            && x < self.origin.x + self.size
            && z >= self.origin.y
            && z < self.origin.y + self.size
    }

    /// Whether the footprint intersects a circle on the X/Z plane.
    #[must_use]
    pub fn intersects_circle(&self, center: Vec2, radius: f32) -> bool {
        let closest = center.clamp(self.origin, self.origin + Vec2::splat(self.size));
        closest.distance(center) <= radius.max(0.0)
    }

    /// Generates the mesh on the current thread.
    ///
    /// Does nothing unless the tile is `Generating`. A failure moves the tile
    /// to `Failed`.
    pub fn generate(
        &mut self,
        heights: &dyn HeightSource,
        settings: &MeshSettings,
    ) -> Result<(), GenerationError> {
        if self.state != TileState::Generating {
            return Ok(());
        }
        match build_mesh(&self.desc(), heights, settings, None) {
            Ok(generated) => {
                self.install(generated);
                Ok(())
            },
            Err(err) => {
                self.mark_failed(err.clone());
                Err(err)
            },
        }
    }

    /// Prepares an off-thread generation attempt under `ticket`.
    ///
    /// The returned job shares a cancellation handle with this tile.
    pub fn begin_generation(
        &mut self,
        ticket: u64,
        heights: Arc<dyn HeightSource>,
        settings: Arc<MeshSettings>,
    ) -> GenerationJob {
        if let Some(previous) = self.task.take() {
            previous.cancel();
        }
        let handle = TaskHandle::new();
        self.ticket = ticket;
        self.task = Some(handle.clone());
        GenerationJob {
            desc: self.desc(),
            ticket,
            handle,
            heights,
            settings,
        }
    }

    /// Applies a finished generation attempt.
    ///
    /// Returns `false` when the result is stale (wrong ticket, tile no longer
    /// generating, or cancelled) and was discarded.
    pub fn complete(&mut self, ticket: u64, result: Result<GeneratedMesh, GenerationError>) -> bool {
        if ticket != self.ticket || self.state != TileState::Generating {
            return false;
        }
        match result {
            Ok(generated) => {
                self.install(generated);
                true
            },
            Err(GenerationError::Cancelled(_)) => false,
            Err(err) => {
                self.mark_failed(err);
                true
            },
        }
    }

    fn install(&mut self, generated: GeneratedMesh) {
        self.bounds = Some(generated.bounds);
        self.mesh = Some(generated.mesh);
        self.task = None;
        self.state = TileState::Generated;
    }

    fn mark_failed(&mut self, err: GenerationError) {
        warn!("Generation of tile {} failed: {err}", self.key);
        self.task = None;
        self.error = Some(err);
        self.state = TileState::Failed;
    }

    /// Uploads the mesh to the GPU. Render thread only.
    ///
    /// Idempotent once buffered. On failure nothing stays allocated and the
    /// tile remains `Generated` for another attempt. On success the CPU mesh
    /// is released.
    pub fn create_buffers(&mut self, backend: &mut dyn MeshBackend) -> Result<(), UploadError> {
        match self.state {
            TileState::Buffered => return Ok(()),
            TileState::Generating => return Err(UploadError::Pending(self.key)),
            TileState::Failed | TileState::Retired => return Err(UploadError::NotGenerated(self.key)),
            TileState::Generated => {},
        }
        let mesh = self.mesh.as_ref().ok_or(UploadError::NotGenerated(self.key))?;
        let label = format!("Terrain tile {}", self.key);
        let handle = backend
            .create_buffer(&label, &mesh.vertices, &mesh.indices)
            .map_err(|source| UploadError::Failed {
                key: self.key,
                source,
            })?;

        self.index_count = mesh.indices.len();
        self.gpu = Some(handle);
        self.mesh = None;
        self.state = TileState::Buffered;
        debug!("Tile {} buffered ({} indices)", self.key, self.index_count);
        Ok(())
    }

    /// Box used for culling.
    ///
    /// Before generation the vertical extent is unknown and the box is
    /// flattened to the viewer's height, making the test purely horizontal.
    fn culling_box(&self, viewer_y: f32) -> Aabb {
        let (min_y, max_y) = self
            .bounds
            .map_or((viewer_y, viewer_y), |b| (b.min, b.max));
        Aabb::new(
            Vec3::new(self.origin.x, min_y, self.origin.y),
            Vec3::new(self.origin.x + self.size, max_y, self.origin.y + self.size),
        )
    }

    /// Distance and view-cone test against the height-bound box.
    #[must_use]
    pub fn is_visible(&self, view: &CameraView) -> bool {
        let aabb = self.culling_box(view.position.y);
        let distance = aabb.distance_to(view.position);
        if distance > view.far {
            return false;
        }
        if distance <= view.near {
            return true;
        }
        let Some(forward) = view.direction() else {
            return true;
        };

        let to_center = aabb.center() - view.position;
        let center_distance = to_center.length();
        let radius = aabb.radius();
        if center_distance <= radius {
            return true;
        }
        let cos_angle = forward.dot(to_center / center_distance).clamp(-1.0, 1.0);
        let angle = cos_angle.acos();
        let extent = (radius / center_distance).clamp(0.0, 1.0).asin();
        angle <= view.fov * 0.5 + extent
    }

    /// Terrain height at a world position inside (or near) this tile.
    ///
    /// Interpolates the resident vertex grid. Once the CPU mesh has been
    /// released after upload it falls back to the height source, which can
    /// differ slightly from the coarser rendered mesh at high LOD levels.
    #[must_use]
    pub fn height_at(&self, x: f32, z: f32, heights: &dyn HeightSource) -> f32 {
        match &self.mesh {
            Some(mesh) if mesh.resolution >= 2 && !mesh.vertices.is_empty() => {
                bilinear(mesh, self.origin, self.size, x, z)
            },
            _ => heights.height(x, z),
        }
    }

    /// Cancels generation, releases GPU buffers and retires the tile.
    /// Render thread only.
    pub fn cleanup(&mut self, backend: &mut dyn MeshBackend) {
        if let Some(task) = self.task.take() {
            task.cancel();
        }
        if let Some(handle) = self.gpu.take() {
            backend.delete_buffer(handle);
        }
        self.mesh = None;
        self.visible = false;
        self.retire();
    }

    fn retire(&mut self) {
        if self.state == TileState::Retired {
            return;
        }
        self.state = TileState::Retired;
        if let Some(counter) = &self.live_counter {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

fn bilinear(mesh: &MeshData, origin: Vec2, size: f32, x: f32, z: f32) -> f32 {
    let last = (mesh.resolution - 1) as f32;
    let spacing = size / last;
    let u = ((x - origin.x) / spacing).clamp(0.0, last);
    let v = ((z - origin.y) / spacing).clamp(0.0, last);
    let col = (u.floor() as u32).min(mesh.resolution - 2);
    let row = (v.floor() as u32).min(mesh.resolution - 2);
    let fu = u - col as f32;
    let fv = v - row as f32;

    let h = |c: u32, r: u32| mesh.vertex(c, r).map_or(0.0, |vertex| vertex.position[1]);
    let top = h(col, row) * (1.0 - fu) + h(col + 1, row) * fu;
    let bottom = h(col, row + 1) * (1.0 - fu) + h(col + 1, row + 1) * fu;
    top * (1.0 - fv) + bottom * fv
}

impl Drop for Tile {
    fn drop(&mut self) {
        if self.gpu.is_some() {
            warn!("Tile {} dropped while still holding GPU buffers", self.key);
        }
        if let Some(task) = self.task.take() {
            task.cancel();
        }
        self.retire();
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("resolution", &self.resolution)
            .field("visible", &self.visible)
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}
