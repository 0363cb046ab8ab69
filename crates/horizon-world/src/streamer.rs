//! Camera-driven terrain tile streaming.
//!
//! The [`ChunkStreamer`] keeps a bounded working set of tiles around a moving
//! camera. Each tick it:
//! 1. Tracks camera position and velocity
//! 2. Decides whether a need-scan is due (moved, stale, or forced)
//! 3. Scans cells within view distance and starts generation for missing keys
//! 4. Re-tests visibility and retires far invisible tiles
//! 5. Truncates the visible set to the nearest `max_visible_tiles`
//! 6. Uploads a limited number of finished meshes, then retires tiles whose
//!    cell has a buffered replacement at another LOD
//! 7. Hard-evicts anything beyond the outer radius
//!
//! Generation runs on a [`WorkerPool`]; completion callbacks take the shared
//! lock, check the tile's ticket and push the key onto the upload queue. All
//! GPU work stays on the thread that calls [`ChunkStreamer::update`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use glam::{Vec2, Vec3};
use horizon_common::{ChunkKey, ConfigError, GridCell};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::camera::CameraView;
use crate::config::TerrainConfig;
use crate::gpu::{MeshBackend, MeshHandle};
use crate::height::{HeightField, HeightSource};
use crate::lod::LodConfig;
use crate::pool::WorkerPool;
use crate::tile::{GenerationJob, GenerationOutcome, MeshSettings, Tile, TileDesc, TileState};

/// Streaming budgets and distances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Tile footprint side length in world units
    pub tile_size: f32,
    /// Cells within this distance of the camera are requested
    pub view_distance: f32,
    /// Hard cap on live tiles
    pub max_active_tiles: usize,
    /// Hard cap on tiles marked visible
    pub max_visible_tiles: usize,
    /// GPU uploads attempted per tick
    pub uploads_per_tick: usize,
    /// Camera movement that triggers a new scan
    pub rescan_distance: f32,
    /// Seconds after which a scan runs even without movement
    pub rescan_interval: f32,
    /// Upper bound on the scan radius in cells
    pub max_scan_radius: u32,
    /// Far culling distance as a multiple of view distance
    pub visible_range_multiplier: f32,
    /// Invisible tiles beyond this multiple of view distance are retired
    pub evict_distance_multiplier: f32,
    /// Every tile beyond this multiple of view distance is retired
    pub hard_evict_multiplier: f32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            tile_size: 64.0,
            view_distance: 600.0,
            max_active_tiles: 512,
            max_visible_tiles: 256,
            uploads_per_tick: 2,
            rescan_distance: 16.0,
            rescan_interval: 0.5,
            max_scan_radius: 32,
            visible_range_multiplier: 1.5,
            evict_distance_multiplier: 1.8,
            hard_evict_multiplier: 2.5,
        }
    }
}

impl StreamerConfig {
    /// Checks that budgets and distances are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tile_size.is_finite() && self.tile_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tile_size must be positive, got {}",
                self.tile_size
            )));
        }
        if !(self.view_distance.is_finite() && self.view_distance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "view_distance must be positive, got {}",
                self.view_distance
            )));
        }
        if self.max_active_tiles == 0 {
            return Err(ConfigError::Invalid("max_active_tiles must be at least 1".into()));
        }
        if self.uploads_per_tick == 0 {
            return Err(ConfigError::Invalid(
                "uploads_per_tick must be at least 1".into(),
            ));
        }
        if self.visible_range_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "visible_range_multiplier must be at least 1".into(),
            ));
        }
        if self.evict_distance_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "evict_distance_multiplier must be at least 1".into(),
            ));
        }
        if self.hard_evict_multiplier < self.evict_distance_multiplier {
            return Err(ConfigError::Invalid(format!(
                "hard_evict_multiplier ({}) is below evict_distance_multiplier ({})",
                self.hard_evict_multiplier, self.evict_distance_multiplier
            )));
        }
        Ok(())
    }

    /// Scan radius in cells.
    #[must_use]
    pub fn scan_radius(&self) -> i32 {
        let cells = (self.view_distance / self.tile_size).ceil().max(0.0) as u32;
        cells.min(self.max_scan_radius) as i32
    }
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamerStats {
    /// Tiles in the active table
    pub active: usize,
    /// Tiles in the visible set
    pub visible: usize,
    /// Tiles drawn by the last `render`
    pub drawn_last_frame: usize,
    /// Tiles created and not yet retired
    pub live_tiles: usize,
    /// Entries waiting in the upload queue
    pub pending_uploads: usize,
    /// Tiles still generating
    pub generating: usize,
    /// Tiles resident on the GPU
    pub buffered: usize,
    /// Tiles whose generation failed
    pub failed: usize,
    /// Uploads that succeeded in the last tick
    pub uploads_last_tick: usize,
    /// Tiles retired in the last tick
    pub evictions_last_tick: usize,
    /// Need-scans run so far
    pub scans: u64,
    /// Generation jobs started so far
    pub generations_started: u64,
}

/// State touched by both the tick and generation callbacks.
#[derive(Debug, Default)]
struct StreamState {
    /// Owned tiles by key
    tiles: AHashMap<ChunkKey, Tile>,
    /// Keys marked visible, nearest first
    visible: Vec<ChunkKey>,
    /// Keys whose generation finished, in completion order
    upload_queue: VecDeque<ChunkKey>,
}

impl StreamState {
    fn retire(&mut self, key: ChunkKey, backend: &mut dyn MeshBackend) -> bool {
        match self.tiles.remove(&key) {
            Some(mut tile) => {
                tile.cleanup(backend);
                true
            },
            None => false,
        }
    }
}

/// Keeps terrain tiles resident around a moving camera.
pub struct ChunkStreamer<B: MeshBackend> {
    /// Budgets and distances
    config: StreamerConfig,
    /// LOD tiers
    lod: LodConfig,
    /// Height function shared with workers
    heights: Arc<dyn HeightSource>,
    /// Mesh settings shared with workers
    settings: Arc<MeshSettings>,
    /// Generation workers
    pool: Arc<WorkerPool>,
    /// Render-thread GPU backend
    backend: B,
    /// Shared working set
    state: Arc<Mutex<StreamState>>,
    /// Tiles created and not yet retired
    live_tiles: Arc<AtomicUsize>,
    /// Desired LOD per cell from the last scan
    desired: AHashMap<GridCell, u8>,
    /// Next generation ticket
    next_ticket: u64,
    /// Camera position from the last tick
    position: Option<Vec3>,
    /// Finite-difference velocity estimate
    velocity: Vec3,
    /// Camera position at the last scan
    last_scan_position: Option<Vec3>,
    /// Seconds since the last scan
    since_scan: f32,
    /// Scan on the next tick regardless of movement
    force_rescan: bool,
    /// Counters
    stats: StreamerStats,
}

impl<B: MeshBackend> ChunkStreamer<B> {
    /// Creates a streamer from explicit collaborators.
    #[must_use]
    pub fn new(
        config: StreamerConfig,
        lod: LodConfig,
        heights: Arc<dyn HeightSource>,
        settings: MeshSettings,
        pool: Arc<WorkerPool>,
        backend: B,
    ) -> Self {
        debug!(
            "Chunk streamer: tile size {}, view distance {}, {} workers",
            config.tile_size,
            config.view_distance,
            pool.thread_count()
        );
        Self {
            config,
            lod,
            heights,
            settings: Arc::new(settings),
            pool,
            backend,
            state: Arc::new(Mutex::new(StreamState::default())),
            live_tiles: Arc::new(AtomicUsize::new(0)),
            desired: AHashMap::new(),
            next_ticket: 1,
            position: None,
            velocity: Vec3::ZERO,
            last_scan_position: None,
            since_scan: 0.0,
            force_rescan: false,
            stats: StreamerStats::default(),
        }
    }

    /// Creates a streamer with a [`HeightField`] built from the terrain config.
    #[must_use]
    pub fn from_config(config: &TerrainConfig, pool: Arc<WorkerPool>, backend: B) -> Self {
        Self::new(
            config.streaming.clone(),
            config.lod.clone(),
            Arc::new(HeightField::new(config.noise.clone())),
            config.mesh.clone(),
            pool,
            backend,
        )
    }

    /// Advances one tick for an unoriented camera at `position`.
    pub fn update(&mut self, position: Vec3, dt: f32) {
        self.update_view(&CameraView::at(position), dt);
    }

    /// Advances one tick.
    pub fn update_view(&mut self, view: &CameraView, dt: f32) {
        let position = view.position;

        // 1. Camera tracking
        if let Some(previous) = self.position {
            if dt > 0.0 {
                self.velocity = (position - previous) / dt;
            }
        }
        self.position = Some(position);
        self.since_scan += dt.max(0.0);

        // 2-3. Need-scan
        if self.scan_due(position) {
            self.scan(position);
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let mut evicted = 0;

        // 4. Visibility and soft eviction
        let mut cull = *view;
        cull.far = cull
            .far
            .min(self.config.view_distance * self.config.visible_range_multiplier);
        let evict_distance = self.config.view_distance * self.config.evict_distance_multiplier;

        let mut candidates = Vec::new();
        let mut to_retire = Vec::new();
        for (key, tile) in &state.tiles {
            let distance = tile.distance_to(position);
            let visible = tile.state() != TileState::Failed && tile.is_visible(&cull);
            if !visible && distance > evict_distance {
                to_retire.push(*key);
            } else if visible {
                candidates.push((distance, *key));
            }
        }
        for key in to_retire {
            if state.retire(key, &mut self.backend) {
                evicted += 1;
            }
        }

        // 5. Nearest-first truncation
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        for tile in state.tiles.values_mut() {
            tile.set_visible(false);
        }
        state.visible.clear();
        for (_, key) in candidates.into_iter().take(self.config.max_visible_tiles) {
            if let Some(tile) = state.tiles.get_mut(&key) {
                tile.set_visible(true);
                state.visible.push(key);
            }
        }

        // 6. Rate-limited uploads
        let mut attempts = 0;
        let mut uploaded = 0;
        let mut retry = Vec::new();
        while attempts < self.config.uploads_per_tick {
            let Some(key) = state.upload_queue.pop_front() else {
                break;
            };
            let Some(tile) = state.tiles.get_mut(&key) else {
                continue;
            };
            if tile.state() != TileState::Generated {
                continue;
            }
            attempts += 1;
            match tile.create_buffers(&mut self.backend) {
                Ok(()) => uploaded += 1,
                Err(e) if e.is_retryable() => {
                    warn!("{e}, retrying next slot");
                    retry.push(key);
                },
                Err(e) => debug!("Dropping upload: {e}"),
            }
        }
        state.upload_queue.extend(retry);

        // Retire LOD predecessors only after this tick's uploads so a cell
        // never draws two levels in one frame
        let superseded: Vec<ChunkKey> = state
            .tiles
            .keys()
            .copied()
            .filter(|key| self.superseded(*key, &state.tiles))
            .collect();
        for key in superseded {
            if state.retire(key, &mut self.backend) {
                evicted += 1;
            }
        }

        // 7. Hard eviction
        let hard_distance = self.config.view_distance * self.config.hard_evict_multiplier;
        let far_keys: Vec<ChunkKey> = state
            .tiles
            .iter()
            .filter(|(_, tile)| tile.distance_to(position) > hard_distance)
            .map(|(key, _)| *key)
            .collect();
        for key in far_keys {
            if state.retire(key, &mut self.backend) {
                evicted += 1;
            }
        }
        let tiles = &state.tiles;
        state.visible.retain(|key| tiles.contains_key(key));

        self.stats.uploads_last_tick = uploaded;
        self.stats.evictions_last_tick = evicted;
        if uploaded > 0 || evicted > 0 {
            trace!(
                "Tick: {} active, {} visible, {uploaded} uploaded, {evicted} evicted",
                state.tiles.len(),
                state.visible.len()
            );
        }
    }

    fn scan_due(&self, position: Vec3) -> bool {
        self.force_rescan
            || self.since_scan >= self.config.rescan_interval
            || self
                .last_scan_position
                .map_or(true, |last| last.distance(position) > self.config.rescan_distance)
    }

    /// Ensures every cell within view distance has a tile at its LOD.
    fn scan(&mut self, position: Vec3) {
        self.force_rescan = false;
        self.since_scan = 0.0;
        self.last_scan_position = Some(position);
        self.stats.scans += 1;

        let tile_size = self.config.tile_size;
        let center = GridCell::from_world_pos(position.x, position.z, tile_size);
        let radius = self.config.scan_radius();

        let mut cells = Vec::new();
        for dz in -radius..=radius {
            for dx in -radius..=radius {
                // Cells past the edge of the i32 grid do not exist
                let (Some(x), Some(z)) = (center.x.checked_add(dx), center.z.checked_add(dz)) else {
                    continue;
                };
                let cell = GridCell { x, z };
                let distance =
                    horizon_common::horizontal_distance(position, cell.world_center(tile_size));
                if distance <= self.config.view_distance {
                    cells.push((distance, cell));
                }
            }
        }
        // Nearest first so the active cap drops the farthest requests
        cells.sort_by(|a, b| a.0.total_cmp(&b.0));

        self.desired.clear();
        let mut jobs = Vec::new();
        {
            let mut state = self.state.lock();
            for (distance, cell) in cells {
                let level = self.lod.level_for_distance(distance);
                self.desired.insert(cell, level);
                let key = ChunkKey::new(cell.x, cell.z, level);
                if state.tiles.contains_key(&key) {
                    continue;
                }
                if state.tiles.len() >= self.config.max_active_tiles {
                    continue;
                }
                let desc = TileDesc {
                    key,
                    origin: cell.world_origin(tile_size),
                    size: tile_size,
                    resolution: self.lod.resolution(level),
                };
                let mut tile = Tile::with_counter(desc, Arc::clone(&self.live_tiles));
                let ticket = self.next_ticket;
                self.next_ticket += 1;
                jobs.push(tile.begin_generation(
                    ticket,
                    Arc::clone(&self.heights),
                    Arc::clone(&self.settings),
                ));
                state.tiles.insert(key, tile);
            }
        }

        debug!(
            "Scan at cell ({}, {}): {} cells wanted, {} new tiles",
            center.x,
            center.z,
            self.desired.len(),
            jobs.len()
        );

        // Inline pools run the callback during submit, so the lock must be free
        for job in jobs {
            self.submit(job);
        }
    }

    fn submit(&mut self, job: GenerationJob) {
        let key = job.key();
        let shared = Arc::clone(&self.state);
        self.stats.generations_started += 1;
        let result = job.spawn(&self.pool, move |outcome| complete_generation(&shared, outcome));
        if let Err(e) = result {
            warn!("Could not schedule generation of {key}: {e}");
            self.state.lock().retire(key, &mut self.backend);
        }
    }

    /// Whether a tile's cell now wants another LOD whose tile can replace it.
    fn superseded(&self, key: ChunkKey, tiles: &AHashMap<ChunkKey, Tile>) -> bool {
        let Some(&level) = self.desired.get(&key.cell()) else {
            return false;
        };
        level != key.level
            && tiles.get(&key.with_level(level)).is_some_and(|replacement| {
                matches!(replacement.state(), TileState::Buffered | TileState::Failed)
            })
    }

    /// Draws visible buffered tiles front to back and returns how many.
    ///
    /// At most one tile per cell is drawn, preferring the level the last scan
    /// asked for.
    pub fn render(&mut self) -> usize {
        let position = self.position.unwrap_or(Vec3::ZERO);
        let mut draws: Vec<(f32, bool, GridCell, MeshHandle)> = {
            let state = self.state.lock();
            state
                .visible
                .iter()
                .filter_map(|key| state.tiles.get(key))
                .filter(|tile| tile.is_buffered() && tile.is_marked_visible())
                .filter_map(|tile| {
                    let key = tile.key();
                    let undesired = self.desired.get(&key.cell()) != Some(&key.level);
                    tile.mesh_handle()
                        .map(|h| (tile.distance_to(position), undesired, key.cell(), h))
                })
                .collect()
        };
        draws.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut drawn_cells = AHashSet::with_capacity(draws.len());
        for (_, _, cell, handle) in draws {
            if drawn_cells.insert(cell) {
                self.backend.draw_indexed(handle);
            }
        }
        self.stats.drawn_last_frame = drawn_cells.len();
        drawn_cells.len()
    }

    /// Terrain height at world X/Z.
    ///
    /// Uses the level-0 tile of the containing cell when present, otherwise
    /// the height source.
    #[must_use]
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let key = ChunkKey::from_world_pos(x, z, self.config.tile_size, 0);
        let state = self.state.lock();
        match state.tiles.get(&key) {
            Some(tile) => tile.height_at(x, z, self.heights.as_ref()),
            None => self.heights.height(x, z),
        }
    }

    /// Retires every tile whose footprint intersects the circle and forces a
    /// rescan on the next tick. Returns the number of tiles retired.
    pub fn invalidate_area(&mut self, center: Vec2, radius: f32) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<ChunkKey> = state
            .tiles
            .iter()
            .filter(|(_, tile)| tile.intersects_circle(center, radius))
            .map(|(key, _)| *key)
            .collect();
        let mut retired = 0;
        for key in keys {
            if state.retire(key, &mut self.backend) {
                retired += 1;
            }
        }
        let state = &mut *state;
        let tiles = &state.tiles;
        state.visible.retain(|key| tiles.contains_key(key));
        self.force_rescan = true;
        debug!("Invalidated {retired} tiles around ({}, {})", center.x, center.y);
        retired
    }

    /// Retires every tile and releases all GPU buffers.
    pub fn shutdown(&mut self) {
        let mut state = self.state.lock();
        let count = state.tiles.len();
        for (_, mut tile) in state.tiles.drain() {
            tile.cleanup(&mut self.backend);
        }
        state.visible.clear();
        state.upload_queue.clear();
        self.desired.clear();
        self.force_rescan = true;
        if count > 0 {
            debug!("Chunk streamer shut down, retired {count} tiles");
        }
    }

    /// Current diagnostic counters.
    #[must_use]
    pub fn stats(&self) -> StreamerStats {
        let state = self.state.lock();
        let mut stats = self.stats;
        stats.active = state.tiles.len();
        stats.visible = state.visible.len();
        stats.live_tiles = self.live_tiles.load(Ordering::Relaxed);
        stats.pending_uploads = state.upload_queue.len();
        stats.generating = 0;
        stats.buffered = 0;
        stats.failed = 0;
        for tile in state.tiles.values() {
            match tile.state() {
                TileState::Generating => stats.generating += 1,
                TileState::Buffered => stats.buffered += 1,
                TileState::Failed => stats.failed += 1,
                TileState::Generated | TileState::Retired => {},
            }
        }
        stats
    }

    /// Keys in the active table.
    #[must_use]
    pub fn active_keys(&self) -> Vec<ChunkKey> {
        self.state.lock().tiles.keys().copied().collect()
    }

    /// Keys in the visible set, nearest first.
    #[must_use]
    pub fn visible_keys(&self) -> Vec<ChunkKey> {
        self.state.lock().visible.clone()
    }

    /// Keys waiting for upload, in queue order.
    #[must_use]
    pub fn pending_uploads(&self) -> Vec<ChunkKey> {
        self.state.lock().upload_queue.iter().copied().collect()
    }

    /// Whether a key is in the active table.
    #[must_use]
    pub fn contains(&self, key: ChunkKey) -> bool {
        self.state.lock().tiles.contains_key(&key)
    }

    /// Runs `f` against a tile while holding the state lock.
    pub fn with_tile<R>(&self, key: ChunkKey, f: impl FnOnce(&Tile) -> R) -> Option<R> {
        self.state.lock().tiles.get(&key).map(f)
    }

    /// Last estimated camera velocity.
    #[must_use]
    pub const fn velocity(&self) -> Vec3 {
        self.velocity
    }

    /// Streaming configuration.
    #[must_use]
    pub const fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Worker pool used for generation.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// GPU backend.
    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// GPU backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

/// Installs a finished mesh if its ticket is still current.
///
/// Runs on worker threads.
fn complete_generation(shared: &Mutex<StreamState>, outcome: GenerationOutcome) {
    let GenerationOutcome {
        key,
        ticket,
        result,
    } = outcome;
    let mut state = shared.lock();
    let state = &mut *state;
    let Some(tile) = state.tiles.get_mut(&key) else {
        trace!("Discarding result for retired tile {key}");
        return;
    };
    if tile.complete(ticket, result) && tile.state() == TileState::Generated {
        state.upload_queue.push_back(key);
    }
}

impl<B: MeshBackend> Drop for ChunkStreamer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<B: MeshBackend> std::fmt::Debug for ChunkStreamer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStreamer")
            .field("config", &self.config)
            .field("position", &self.position)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessBackend;
    use crate::height::FlatHeight;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn small_lod() -> LodConfig {
        LodConfig {
            max_resolution: 8,
            min_resolution: 2,
            max_level: 2,
            lod_distances: vec![150.0, 300.0],
        }
    }

    fn config() -> StreamerConfig {
        StreamerConfig {
            tile_size: 64.0,
            view_distance: 200.0,
            uploads_per_tick: 2,
            rescan_interval: 1_000.0,
            ..Default::default()
        }
    }

    fn streamer_with(
        config: StreamerConfig,
        heights: Arc<dyn HeightSource>,
        pool: WorkerPool,
    ) -> ChunkStreamer<HeadlessBackend> {
        ChunkStreamer::new(
            config,
            small_lod(),
            heights,
            MeshSettings::default(),
            Arc::new(pool),
            HeadlessBackend::new(),
        )
    }

    fn streamer(config: StreamerConfig) -> ChunkStreamer<HeadlessBackend> {
        streamer_with(config, Arc::new(FlatHeight(0.0)), WorkerPool::inline())
    }

    fn assert_visible_invariants(s: &ChunkStreamer<HeadlessBackend>) {
        let active: HashSet<ChunkKey> = s.active_keys().into_iter().collect();
        let visible = s.visible_keys();
        assert!(visible.len() <= s.config().max_visible_tiles);
        assert!(active.len() <= s.config().max_active_tiles);
        assert!(visible.iter().all(|k| active.contains(k)));
    }

    #[test]
    fn test_origin_scan_creates_center_and_neighbours() {
        let mut s = streamer(config());
        s.update(Vec3::ZERO, 0.016);

        assert!(s.contains(ChunkKey::new(0, 0, 0)));
        for (x, z) in [(-1, -1), (-1, 0), (0, -1), (1, 0), (0, 1), (1, 1), (-1, 1), (1, -1)] {
            assert!(s.contains(ChunkKey::new(x, z, 0)), "missing neighbour ({x}, {z})");
        }
        let stats = s.stats();
        assert_eq!(stats.scans, 1);
        assert_eq!(stats.live_tiles, stats.active);
        assert_visible_invariants(&s);
    }

    #[test]
    fn test_far_tile_evicted() {
        let mut s = streamer(config());
        s.update(Vec3::ZERO, 0.016);
        let key = ChunkKey::new(0, 0, 0);
        assert!(s.contains(key));

        // Tile center (32, 32) ends up exactly 3x view distance away
        s.update(Vec3::new(632.0, 0.0, 32.0), 0.016);
        assert!(!s.contains(key));
        assert!(s.stats().evictions_last_tick > 0);
        assert_eq!(s.stats().live_tiles, s.stats().active);
    }

    #[test]
    fn test_active_cap_is_silent() {
        let mut s = streamer(StreamerConfig {
            max_active_tiles: 5,
            ..config()
        });
        s.update(Vec3::ZERO, 0.016);
        assert_eq!(s.active_keys().len(), 5);
        assert!(s.contains(ChunkKey::new(0, 0, 0)));

        s.update(Vec3::new(1.0, 0.0, 1.0), 0.016);
        assert_eq!(s.active_keys().len(), 5);
    }

    #[test]
    fn test_uploads_are_rate_limited_in_completion_order() {
        let mut s = streamer(StreamerConfig {
            max_active_tiles: 10,
            ..config()
        });
        s.update(Vec3::ZERO, 0.016);
        assert_eq!(s.stats().active, 10);
        assert_eq!(s.stats().buffered, 2);

        let queued = s.pending_uploads();
        assert_eq!(queued.len(), 8);

        for tick in 0..4 {
            s.update(Vec3::ZERO, 0.016);
            assert_eq!(s.stats().uploads_last_tick, 2);
            assert_eq!(s.stats().buffered, 4 + tick * 2);
            for key in &queued[tick * 2..tick * 2 + 2] {
                assert_eq!(s.with_tile(*key, Tile::state), Some(TileState::Buffered));
            }
        }
        assert_eq!(s.stats().pending_uploads, 0);
        assert_eq!(s.backend().live_buffers(), 10);
    }

    #[test]
    fn test_uploads_follow_completion_not_request_order() {
        let mut s = streamer(StreamerConfig {
            max_active_tiles: 10,
            ..config()
        });

        // Ten tiles near the origin, requested in grid order
        let requested: Vec<ChunkKey> = (-2..=1)
            .flat_map(|z| (-2..=1).map(move |x| ChunkKey::new(x, z, 0)))
            .take(10)
            .collect();
        let jobs: Vec<GenerationJob> = {
            let mut state = s.state.lock();
            requested
                .iter()
                .enumerate()
                .map(|(i, key)| {
                    let desc = TileDesc {
                        key: *key,
                        origin: key.world_origin(64.0),
                        size: 64.0,
                        resolution: 4,
                    };
                    let mut tile = Tile::with_counter(desc, Arc::clone(&s.live_tiles));
                    let job = tile.begin_generation(
                        i as u64 + 1,
                        Arc::clone(&s.heights),
                        Arc::clone(&s.settings),
                    );
                    state.tiles.insert(*key, tile);
                    job
                })
                .collect()
        };
        s.next_ticket = requested.len() as u64 + 1;

        // Workers finish in the opposite order
        let mut outcomes: Vec<GenerationOutcome> = jobs.into_iter().map(GenerationJob::run).collect();
        outcomes.reverse();
        for outcome in outcomes {
            complete_generation(&s.state, outcome);
        }
        let completed: Vec<ChunkKey> = requested.iter().rev().copied().collect();
        assert_eq!(s.pending_uploads(), completed);

        for tick in 0..5 {
            s.update(Vec3::ZERO, 0.016);
            let stats = s.stats();
            assert_eq!(stats.active, 10);
            assert_eq!(stats.uploads_last_tick, 2);
            assert_eq!(stats.buffered, (tick + 1) * 2);
            for key in &completed[..(tick + 1) * 2] {
                assert_eq!(s.with_tile(*key, Tile::state), Some(TileState::Buffered));
            }
            for key in &completed[(tick + 1) * 2..] {
                assert_eq!(s.with_tile(*key, Tile::state), Some(TileState::Generated));
            }
        }
        assert_eq!(s.stats().generations_started, 0);
    }

    #[test]
    fn test_invalidate_area_zero_radius() {
        let mut s = streamer(config());
        s.update(Vec3::ZERO, 0.016);
        let key = ChunkKey::new(0, 0, 0);
        assert!(s.contains(key));

        let retired = s.invalidate_area(Vec2::new(10.0, 20.0), 0.0);
        assert!(retired >= 1);
        assert!(!s.contains(key));
        assert_visible_invariants(&s);

        // Forced rescan brings the area back
        s.update(Vec3::ZERO, 0.016);
        assert!(s.contains(key));
    }

    #[test]
    fn test_no_duplicate_generation() {
        let mut s = streamer_with(
            StreamerConfig {
                rescan_distance: 0.0,
                rescan_interval: 0.0,
                ..config()
            },
            Arc::new(FlatHeight(0.0)),
            WorkerPool::new(2),
        );
        for _ in 0..10 {
            s.update(Vec3::new(0.1, 0.0, 0.1), 0.016);
        }
        assert!(s.pool().wait_idle_timeout(Duration::from_secs(30)));
        let stats = s.stats();
        assert!(stats.scans >= 10);
        assert_eq!(stats.generations_started as usize, stats.active);
    }

    #[test]
    fn test_threaded_pool_completes_and_uploads() {
        let mut s = streamer_with(
            StreamerConfig {
                uploads_per_tick: 1_000,
                ..config()
            },
            Arc::new(FlatHeight(2.0)),
            WorkerPool::new(2),
        );
        s.update(Vec3::ZERO, 0.016);
        assert!(s.pool().wait_idle_timeout(Duration::from_secs(30)));
        s.update(Vec3::ZERO, 0.016);

        let stats = s.stats();
        assert_eq!(stats.generating, 0);
        assert_eq!(stats.buffered, stats.active);
        assert_eq!(s.render(), stats.visible);
    }

    #[test]
    fn test_render_front_to_back() {
        let mut s = streamer(StreamerConfig {
            uploads_per_tick: 1_000,
            ..config()
        });
        let eye = Vec3::new(10.0, 0.0, 10.0);
        s.update(eye, 0.016);
        let drawn = s.render();
        assert!(drawn > 0);
        assert_eq!(s.stats().drawn_last_frame, drawn);

        let distances: AHashMap<MeshHandle, f32> = s
            .active_keys()
            .into_iter()
            .filter_map(|key| {
                s.with_tile(key, |t| t.mesh_handle().map(|h| (h, t.distance_to(eye))))
                    .flatten()
            })
            .collect();
        let draws = s.backend_mut().take_draws();
        assert_eq!(draws.len(), drawn);
        let ordered: Vec<f32> = draws
            .iter()
            .map(|h| *distances.get(h).expect("drawn tile is active"))
            .collect();
        assert!(ordered.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_visible_cap_keeps_nearest() {
        let mut s = streamer(StreamerConfig {
            max_visible_tiles: 4,
            ..config()
        });
        s.update(Vec3::new(32.0, 0.0, 32.0), 0.016);
        let visible = s.visible_keys();
        assert_eq!(visible.len(), 4);
        assert_eq!(visible[0], ChunkKey::new(0, 0, 0));
        assert_visible_invariants(&s);
    }

    #[test]
    fn test_failed_upload_retried_next_tick() {
        let mut s = streamer(StreamerConfig {
            max_active_tiles: 1,
            uploads_per_tick: 1,
            ..config()
        });
        s.backend_mut().fail_next_uploads(1);
        let center = Vec3::new(32.0, 0.0, 32.0);
        s.update(center, 0.016);
        let key = ChunkKey::new(0, 0, 0);
        assert_eq!(s.with_tile(key, Tile::state), Some(TileState::Generated));
        assert_eq!(s.pending_uploads(), vec![key]);

        s.update(center, 0.016);
        assert_eq!(s.with_tile(key, Tile::state), Some(TileState::Buffered));
    }

    #[test]
    fn test_generation_failure_is_not_retried() {
        struct Broken;
        impl HeightSource for Broken {
            fn height(&self, _x: f32, _z: f32) -> f32 {
                f32::NAN
            }
        }
        let mut s = streamer_with(
            StreamerConfig {
                rescan_interval: 0.0,
                ..config()
            },
            Arc::new(Broken),
            WorkerPool::inline(),
        );
        s.update(Vec3::ZERO, 0.016);
        let started = s.stats().generations_started;
        s.update(Vec3::ZERO, 0.016);

        let stats = s.stats();
        assert_eq!(stats.failed, stats.active);
        assert_eq!(stats.generations_started, started);
        assert_eq!(stats.pending_uploads, 0);
        assert_eq!(stats.visible, 0);
        assert_eq!(s.backend().upload_count(), 0);
    }

    /// Renders a frame and checks no cell was drawn at two levels.
    fn render_one_level_per_cell(s: &mut ChunkStreamer<HeadlessBackend>) -> HashSet<ChunkKey> {
        let owners: AHashMap<MeshHandle, ChunkKey> = s
            .active_keys()
            .into_iter()
            .filter_map(|key| s.with_tile(key, |t| t.mesh_handle().map(|h| (h, key))).flatten())
            .collect();
        s.render();
        let mut cells = HashSet::new();
        let mut drawn = HashSet::new();
        for handle in s.backend_mut().take_draws() {
            let key = *owners.get(&handle).expect("drawn tile is active");
            assert!(cells.insert(key.cell()), "cell of {key} drawn twice");
            drawn.insert(key);
        }
        drawn
    }

    #[test]
    fn test_lod_swap_retires_superseded_tile() {
        let mut s = streamer(StreamerConfig {
            uploads_per_tick: 1_000,
            view_distance: 300.0,
            ..config()
        });
        s.update(Vec3::ZERO, 0.016);
        render_one_level_per_cell(&mut s);
        // Cell (3, 0) has its center about 226 units away
        let coarse = ChunkKey::new(3, 0, 1);
        assert!(s.contains(coarse));

        // Replacement uploads and the old level retires within one tick
        let near = Vec3::new(224.0, 0.0, 32.0);
        s.update(near, 0.016);
        let fine = ChunkKey::new(3, 0, 0);
        assert_eq!(s.with_tile(fine, Tile::state), Some(TileState::Buffered));
        assert!(!s.contains(coarse));
        let drawn = render_one_level_per_cell(&mut s);
        assert!(drawn.contains(&fine));

        for _ in 0..3 {
            s.update(near, 0.016);
            render_one_level_per_cell(&mut s);
        }
    }

    #[test]
    fn test_lod_swap_keeps_old_level_until_replacement_buffered() {
        let mut s = streamer(StreamerConfig {
            uploads_per_tick: 1_000,
            view_distance: 300.0,
            ..config()
        });
        s.update(Vec3::ZERO, 0.016);
        let coarse = ChunkKey::new(3, 0, 1);
        let fine = ChunkKey::new(3, 0, 0);

        // The nearest new tile completes first, so its upload is the one that fails
        s.backend_mut().fail_next_uploads(1);
        let near = Vec3::new(224.0, 0.0, 32.0);
        s.update(near, 0.016);
        assert_eq!(s.with_tile(fine, Tile::state), Some(TileState::Generated));
        assert_eq!(s.with_tile(coarse, Tile::state), Some(TileState::Buffered));
        let drawn = render_one_level_per_cell(&mut s);
        assert!(drawn.contains(&coarse));
        assert!(!drawn.contains(&fine));

        s.update(near, 0.016);
        assert!(!s.contains(coarse));
        let drawn = render_one_level_per_cell(&mut s);
        assert!(drawn.contains(&fine));
    }

    #[test]
    fn test_height_at_falls_back_to_source() {
        let mut s = streamer_with(config(), Arc::new(FlatHeight(3.0)), WorkerPool::inline());
        assert!((s.height_at(5000.0, 5000.0) - 3.0).abs() < f32::EPSILON);
        s.update(Vec3::ZERO, 0.016);
        assert!((s.height_at(10.0, 10.0) - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut s = streamer(StreamerConfig {
            uploads_per_tick: 1_000,
            ..config()
        });
        s.update(Vec3::ZERO, 0.016);
        assert!(s.backend().live_buffers() > 0);
        s.shutdown();
        assert_eq!(s.backend().live_buffers(), 0);
        assert_eq!(s.stats().live_tiles, 0);
        assert!(s.active_keys().is_empty());
    }

    #[test]
    fn test_rescan_triggers() {
        let mut s = streamer(StreamerConfig {
            rescan_distance: 16.0,
            rescan_interval: 1.0,
            ..config()
        });
        s.update(Vec3::ZERO, 0.1);
        s.update(Vec3::new(5.0, 0.0, 0.0), 0.1);
        assert_eq!(s.stats().scans, 1);

        s.update(Vec3::new(30.0, 0.0, 0.0), 0.1);
        assert_eq!(s.stats().scans, 2);

        // Stale after one second even without movement
        for _ in 0..15 {
            s.update(Vec3::new(30.0, 0.0, 0.0), 0.1);
        }
        assert_eq!(s.stats().scans, 3);
    }

    #[test]
    fn test_scan_at_grid_edge_does_not_overflow() {
        let mut s = streamer(config());
        s.update(Vec3::new(1.0e12, 0.0, -1.0e12), 0.016);
        s.update(Vec3::new(-1.0e12, 0.0, 1.0e12), 0.016);
        assert_visible_invariants(&s);
        assert_eq!(s.stats().live_tiles, s.stats().active);

        // Just inside the grid the scan still creates tiles
        let edge = (i32::MAX - 1) as f32 * 64.0;
        s.update(Vec3::new(edge, 0.0, 0.0), 0.016);
        assert!(s.stats().active > 0);
        assert_visible_invariants(&s);
        assert!(s.height_at(edge, 0.0).is_finite());
    }

    #[test]
    fn test_velocity_estimate() {
        let mut s = streamer(config());
        s.update(Vec3::ZERO, 0.5);
        s.update(Vec3::new(10.0, 0.0, 0.0), 0.5);
        assert!((s.velocity() - Vec3::new(20.0, 0.0, 0.0)).length() < 1e-4);
    }

    #[test]
    fn test_config_validation() {
        assert!(StreamerConfig::default().validate().is_ok());
        let bad = StreamerConfig {
            hard_evict_multiplier: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = StreamerConfig {
            tile_size: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = StreamerConfig {
            uploads_per_tick: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Invalid(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_visible_set_invariants(
            path in prop::collection::vec((-800.0f32..800.0, -800.0f32..800.0, 0.0f32..0.5), 1..12),
            max_visible in 1usize..40,
            max_active in 1usize..60,
        ) {
            let mut s = streamer(StreamerConfig {
                max_visible_tiles: max_visible,
                max_active_tiles: max_active,
                rescan_interval: 0.25,
                ..config()
            });
            for (x, z, dt) in path {
                s.update(Vec3::new(x, 0.0, z), dt);
                let active: HashSet<ChunkKey> = s.active_keys().into_iter().collect();
                let visible = s.visible_keys();
                prop_assert!(visible.len() <= max_visible);
                prop_assert!(active.len() <= max_active);
                prop_assert!(visible.iter().all(|k| active.contains(k)));
                prop_assert_eq!(s.stats().live_tiles, active.len());
            }
        }
    }
}
