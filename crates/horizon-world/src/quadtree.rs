//! Fixed-depth quadtree over a bounded terrain region.
//!
//! A simpler alternative to the streamer for small worlds: the tree shape is
//! fixed at construction, every leaf owns exactly one tile, and nothing is
//! ever evicted. Leaves generate synchronously when the camera comes within
//! a multiple of their size.

use std::sync::Arc;

use glam::Vec2;
use horizon_common::{ChunkKey, ConfigError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::camera::CameraView;
use crate::gpu::MeshBackend;
use crate::height::HeightSource;
use crate::tile::{MeshSettings, Tile, TileDesc, TileState};

/// Deepest tree allowed.
pub const MAX_DEPTH: u8 = 8;

/// Spatial index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialIndexConfig {
    /// Center of the covered square on the X/Z plane
    pub center: [f32; 2],
    /// Side length of the covered square
    pub world_size: f32,
    /// Tree depth; there are `4^depth` leaves
    pub depth: u8,
    /// Vertices per side of every leaf tile
    pub resolution: u32,
    /// Leaves generate within this multiple of their size
    pub generate_multiplier: f32,
    /// Leaves are visible within this multiple of their size
    pub visible_multiplier: f32,
}

impl Default for SpatialIndexConfig {
    fn default() -> Self {
        Self {
            center: [0.0, 0.0],
            world_size: 1024.0,
            depth: 3,
            resolution: 64,
            generate_multiplier: 3.0,
            visible_multiplier: 2.5,
        }
    }
}

impl SpatialIndexConfig {
    /// Checks the tree can be built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.depth > MAX_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "spatial index depth {} exceeds {MAX_DEPTH}",
                self.depth
            )));
        }
        if !(self.world_size.is_finite() && self.world_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "world_size must be positive, got {}",
                self.world_size
            )));
        }
        if self.resolution < 2 {
            return Err(ConfigError::Invalid("leaf resolution must be at least 2".into()));
        }
        Ok(())
    }

    /// Side length of one leaf.
    #[must_use]
    pub fn leaf_size(&self) -> f32 {
        self.world_size / f32::from(1u16 << self.depth.min(MAX_DEPTH))
    }
}

/// Counters over all leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpatialIndexStats {
    /// Leaf count
    pub leaves: usize,
    /// Leaves with a CPU mesh not yet uploaded
    pub generated: usize,
    /// Leaves resident on the GPU
    pub buffered: usize,
    /// Leaves marked visible
    pub visible: usize,
    /// Leaves whose generation failed
    pub failed: usize,
}

enum NodeContent {
    /// NW, NE, SW, SE
    Branch(Box<[QuadNode; 4]>),
    Leaf(Tile),
}

struct QuadNode {
    center: Vec2,
    size: f32,
    depth: u8,
    content: NodeContent,
}

/// Shared inputs for building and updating leaves.
struct LeafContext<'a> {
    heights: &'a dyn HeightSource,
    settings: &'a MeshSettings,
    config: &'a SpatialIndexConfig,
}

impl QuadNode {
    fn build(center: Vec2, size: f32, depth: u8, config: &SpatialIndexConfig, world_min: Vec2) -> Self {
        let content = if depth == config.depth {
            let origin = center - Vec2::splat(size * 0.5);
            let index = ((origin - world_min) / size).round();
            let desc = TileDesc {
                key: ChunkKey::new(index.x as i32, index.y as i32, 0),
                origin,
                size,
                resolution: config.resolution,
            };
            NodeContent::Leaf(Tile::new(desc))
        } else {
            let quarter = size * 0.25;
            let half = size * 0.5;
            let child = |dx: f32, dz: f32| {
                Self::build(
                    center + Vec2::new(dx * quarter, dz * quarter),
                    half,
                    depth + 1,
                    config,
                    world_min,
                )
            };
            NodeContent::Branch(Box::new([
                child(-1.0, -1.0),
                child(1.0, -1.0),
                child(-1.0, 1.0),
                child(1.0, 1.0),
            ]))
        };
        Self {
            center,
            size,
            depth,
            content,
        }
    }

    fn contains(&self, x: f32, z: f32) -> bool {
        let half = self.size * 0.5;
        x >= self.center.x - half
            && x < self.center.x + half
            && z >= self.center.y - half
            && z < self.center.y + half
    }

    fn update(&mut self, view: &CameraView, ctx: &LeafContext<'_>, backend: &mut dyn MeshBackend) {
        match &mut self.content {
            NodeContent::Branch(children) => {
                for child in children.iter_mut() {
                    child.update(view, ctx, backend);
                }
            },
            NodeContent::Leaf(tile) => {
                let distance = tile.distance_to(view.position);
                if distance <= ctx.config.generate_multiplier * self.size
                    && tile.state() == TileState::Generating
                {
                    // Failures are logged by the tile and leave it Failed
                    let _ = tile.generate(ctx.heights, ctx.settings);
                }
                if tile.state() == TileState::Generated {
                    if let Err(e) = tile.create_buffers(backend) {
                        warn!("Spatial index leaf {}: {e}", tile.key());
                    }
                }
                let visible = tile.is_buffered()
                    && distance <= ctx.config.visible_multiplier * self.size
                    && tile.is_visible(view);
                tile.set_visible(visible);
            },
        }
    }

    fn render(&self, backend: &mut dyn MeshBackend) -> usize {
        match &self.content {
            NodeContent::Branch(children) => children.iter().map(|c| c.render(backend)).sum(),
            NodeContent::Leaf(tile) => match tile.mesh_handle() {
                Some(handle) if tile.is_marked_visible() => {
                    backend.draw_indexed(handle);
                    1
                },
                _ => 0,
            },
        }
    }

    fn leaf_at(&self, x: f32, z: f32) -> Option<&Tile> {
        if !self.contains(x, z) {
            return None;
        }
        match &self.content {
            NodeContent::Branch(children) => children.iter().find_map(|c| c.leaf_at(x, z)),
            NodeContent::Leaf(tile) => Some(tile),
        }
    }

    fn for_each_leaf(&self, f: &mut impl FnMut(&Tile)) {
        match &self.content {
            NodeContent::Branch(children) => children.iter().for_each(|c| c.for_each_leaf(f)),
            NodeContent::Leaf(tile) => f(tile),
        }
    }

    fn release(&mut self, backend: &mut dyn MeshBackend) {
        match &mut self.content {
            NodeContent::Branch(children) => {
                for child in children.iter_mut() {
                    child.release(backend);
                }
            },
            NodeContent::Leaf(tile) => {
                tile.cleanup(backend);
                *tile = Tile::new(tile.desc());
            },
        }
    }
}

/// Fixed-depth quadtree where each leaf owns one terrain tile.
pub struct SpatialIndex {
    /// Tree parameters
    config: SpatialIndexConfig,
    /// Root node covering the whole region
    root: QuadNode,
    /// Height function
    heights: Arc<dyn HeightSource>,
    /// Mesh settings
    settings: MeshSettings,
}

impl SpatialIndex {
    /// Builds the full tree.
    pub fn new(
        config: SpatialIndexConfig,
        heights: Arc<dyn HeightSource>,
        settings: MeshSettings,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let center = Vec2::from(config.center);
        let world_min = center - Vec2::splat(config.world_size * 0.5);
        let root = QuadNode::build(center, config.world_size, 0, &config, world_min);
        debug!(
            "Spatial index: {} leaves of size {} at depth {}",
            4usize.pow(u32::from(config.depth)),
            config.leaf_size(),
            config.depth
        );
        Ok(Self {
            config,
            root,
            heights,
            settings,
        })
    }

    /// Generates, uploads and culls leaves around the camera. Render thread only.
    pub fn update(&mut self, view: &CameraView, backend: &mut dyn MeshBackend) {
        let ctx = LeafContext {
            heights: self.heights.as_ref(),
            settings: &self.settings,
            config: &self.config,
        };
        self.root.update(view, &ctx, backend);
    }

    /// Draws visible leaves depth first and returns how many.
    pub fn render(&self, backend: &mut dyn MeshBackend) -> usize {
        self.root.render(backend)
    }

    /// Terrain height at world X/Z, using the containing leaf when inside the
    /// region.
    #[must_use]
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        self.root.leaf_at(x, z).map_or_else(
            || self.heights.height(x, z),
            |tile| tile.height_at(x, z, self.heights.as_ref()),
        )
    }

    /// Key of the leaf containing a world position.
    #[must_use]
    pub fn leaf_key(&self, x: f32, z: f32) -> Option<ChunkKey> {
        self.root.leaf_at(x, z).map(Tile::key)
    }

    /// Releases every leaf's GPU buffers and resets the leaves to ungenerated.
    pub fn release(&mut self, backend: &mut dyn MeshBackend) {
        self.root.release(backend);
    }

    /// Number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        let mut count = 0;
        self.root.for_each_leaf(&mut |_| count += 1);
        count
    }

    /// Counters over all leaves.
    #[must_use]
    pub fn stats(&self) -> SpatialIndexStats {
        let mut stats = SpatialIndexStats::default();
        self.root.for_each_leaf(&mut |tile| {
            stats.leaves += 1;
            match tile.state() {
                TileState::Generated => stats.generated += 1,
                TileState::Buffered => stats.buffered += 1,
                TileState::Failed => stats.failed += 1,
                TileState::Generating | TileState::Retired => {},
            }
            if tile.is_marked_visible() {
                stats.visible += 1;
            }
        });
        stats
    }

    /// Tree parameters.
    #[must_use]
    pub const fn config(&self) -> &SpatialIndexConfig {
        &self.config
    }

    /// Depth of the deepest leaf.
    #[must_use]
    pub fn depth(&self) -> u8 {
        let mut node = &self.root;
        while let NodeContent::Branch(children) = &node.content {
            node = &children[0];
        }
        node.depth
    }
}

impl std::fmt::Debug for SpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpatialIndex")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessBackend;
    use crate::height::FlatHeight;
    use glam::Vec3;
    use std::collections::HashSet;

    fn index(depth: u8) -> SpatialIndex {
        SpatialIndex::new(
            SpatialIndexConfig {
                world_size: 512.0,
                depth,
                resolution: 5,
                ..Default::default()
            },
            Arc::new(FlatHeight(1.0)),
            MeshSettings::default(),
        )
        .expect("valid config")
    }

    #[test]
    fn test_leaf_count_and_depth() {
        for depth in 0..=3 {
            let idx = index(depth);
            assert_eq!(idx.leaf_count(), 4usize.pow(u32::from(depth)));
            assert_eq!(idx.depth(), depth);
        }
    }

    #[test]
    fn test_depth_bound() {
        let result = SpatialIndex::new(
            SpatialIndexConfig {
                depth: MAX_DEPTH + 1,
                ..Default::default()
            },
            Arc::new(FlatHeight(0.0)),
            MeshSettings::default(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_leaf_keys_unique_and_located() {
        let idx = index(2);
        let mut keys = HashSet::new();
        idx.root.for_each_leaf(&mut |tile| {
            assert!(keys.insert(tile.key()));
        });
        assert_eq!(keys.len(), 16);
        // Leaf size 128, region starts at -256
        assert_eq!(idx.leaf_key(-256.0, -256.0), Some(ChunkKey::new(0, 0, 0)));
        assert_eq!(idx.leaf_key(255.0, 0.0), Some(ChunkKey::new(3, 2, 0)));
        assert_eq!(idx.leaf_key(300.0, 0.0), None);
    }

    #[test]
    fn test_update_generates_only_near_leaves() {
        let mut idx = index(3);
        let mut backend = HeadlessBackend::new();
        idx.update(&CameraView::at(Vec3::new(-256.0, 10.0, -256.0)), &mut backend);

        let stats = idx.stats();
        assert!(stats.buffered > 0);
        assert!(stats.buffered < stats.leaves);
        assert_eq!(backend.live_buffers(), stats.buffered);

        let drawn = idx.render(&mut backend);
        assert_eq!(drawn, stats.visible);
        assert_eq!(backend.take_draws().len(), drawn);
    }

    #[test]
    fn test_far_camera_generates_nothing() {
        let mut idx = index(2);
        let mut backend = HeadlessBackend::new();
        idx.update(&CameraView::at(Vec3::new(10_000.0, 0.0, 10_000.0)), &mut backend);
        assert_eq!(idx.stats().buffered, 0);
        assert_eq!(idx.render(&mut backend), 0);
    }

    #[test]
    fn test_failed_upload_retried_on_next_update() {
        let mut idx = index(0);
        let mut backend = HeadlessBackend::new();
        backend.fail_next_uploads(1);
        let view = CameraView::at(Vec3::ZERO);
        idx.update(&view, &mut backend);
        assert_eq!(idx.stats().generated, 1);
        idx.update(&view, &mut backend);
        assert_eq!(idx.stats().buffered, 1);
        idx.release(&mut backend);
    }

    #[test]
    fn test_height_at_inside_and_outside() {
        let mut idx = index(1);
        let mut backend = HeadlessBackend::new();
        assert!((idx.height_at(0.0, 0.0) - 1.0).abs() < f32::EPSILON);
        idx.update(&CameraView::at(Vec3::ZERO), &mut backend);
        assert!((idx.height_at(10.0, -10.0) - 1.0).abs() < 1e-5);
        assert!((idx.height_at(9_999.0, 0.0) - 1.0).abs() < f32::EPSILON);
        idx.release(&mut backend);
    }

    #[test]
    fn test_release_frees_buffers_and_allows_regeneration() {
        let mut idx = index(2);
        let mut backend = HeadlessBackend::new();
        let view = CameraView::at(Vec3::ZERO);
        idx.update(&view, &mut backend);
        assert!(backend.live_buffers() > 0);

        idx.release(&mut backend);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(idx.stats().buffered, 0);

        idx.update(&view, &mut backend);
        assert!(backend.live_buffers() > 0);
        idx.release(&mut backend);
    }
}
