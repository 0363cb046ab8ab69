//! Coordinate types for the tile grid and world space.
//!
//! The world is a horizontal X/Z plane with Y up. Tiles cover square
//! footprints of `tile_size` world units on a uniform grid; the LOD level only
//! changes mesh resolution, never the footprint.

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Identity of one terrain tile: grid cell plus LOD level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    /// Grid X coordinate
    pub x: i32,
    /// Grid Z coordinate
    pub z: i32,
    /// LOD level (0 = finest)
    pub level: u8,
}

impl ChunkKey {
    /// Creates a new chunk key.
    #[must_use]
    pub const fn new(x: i32, z: i32, level: u8) -> Self {
        Self { x, z, level }
    }

    /// Returns the key of the grid cell containing a world position.
    #[must_use]
    pub fn from_world_pos(world_x: f32, world_z: f32, tile_size: f32, level: u8) -> Self {
        let cell = GridCell::from_world_pos(world_x, world_z, tile_size);
        Self::new(cell.x, cell.z, level)
    }

    /// Returns the grid cell of this key, ignoring the level.
    #[must_use]
    pub const fn cell(self) -> GridCell {
        GridCell::new(self.x, self.z)
    }

    /// Returns the same cell at a different LOD level.
    #[must_use]
    pub const fn with_level(self, level: u8) -> Self {
        Self::new(self.x, self.z, level)
    }

    /// World-space origin (minimum X/Z corner) of the footprint.
    #[must_use]
    pub fn world_origin(self, tile_size: f32) -> Vec2 {
        self.cell().world_origin(tile_size)
    }

    /// World-space center of the footprint.
    #[must_use]
    pub fn world_center(self, tile_size: f32) -> Vec2 {
        self.cell().world_center(tile_size)
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, L{})", self.x, self.z, self.level)
    }
}

/// A grid cell without an LOD level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridCell {
    /// Grid X coordinate
    pub x: i32,
    /// Grid Z coordinate
    pub z: i32,
}

impl GridCell {
    /// Creates a new grid cell.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Returns the cell containing a world position.
    #[must_use]
    pub fn from_world_pos(world_x: f32, world_z: f32, tile_size: f32) -> Self {
        Self {
            x: (world_x / tile_size).floor() as i32,
            z: (world_z / tile_size).floor() as i32,
        }
    }

    /// World-space origin (minimum X/Z corner) of the cell.
    #[must_use]
    pub fn world_origin(self, tile_size: f32) -> Vec2 {
        Vec2::new(self.x as f32 * tile_size, self.z as f32 * tile_size)
    }

    /// World-space center of the cell.
    #[must_use]
    pub fn world_center(self, tile_size: f32) -> Vec2 {
        self.world_origin(tile_size) + Vec2::splat(tile_size * 0.5)
    }
}

/// Axis-aligned bounding box in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner
    pub min: Vec3,
    /// Maximum corner
    pub max: Vec3,
}

impl Aabb {
    /// Creates a box from two corners.
    #[must_use]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Center of the box.
    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half the box diagonal; radius of the bounding sphere.
    #[must_use]
    pub fn radius(&self) -> f32 {
        (self.max - self.min).length() * 0.5
    }

    /// Closest point of the box to `point` (the point itself when inside).
    #[must_use]
    pub fn closest_point(&self, point: Vec3) -> Vec3 {
        point.clamp(self.min, self.max)
    }

    /// Distance from `point` to the box surface, zero when inside.
    #[must_use]
    pub fn distance_to(&self, point: Vec3) -> f32 {
        self.closest_point(point).distance(point)
    }

    /// Checks if the box contains a point (inclusive).
    #[must_use]
    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

/// Distance on the X/Z plane between a world position and a 2D point.
#[must_use]
pub fn horizontal_distance(position: Vec3, point: Vec2) -> f32 {
    Vec2::new(position.x, position.z).distance(point)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_world_pos() {
        let tile = 64.0;
        assert_eq!(ChunkKey::from_world_pos(0.0, 0.0, tile, 0), ChunkKey::new(0, 0, 0));
        assert_eq!(ChunkKey::from_world_pos(63.9, 10.0, tile, 2), ChunkKey::new(0, 0, 2));
        assert_eq!(ChunkKey::from_world_pos(64.0, 128.0, tile, 0), ChunkKey::new(1, 2, 0));

        // Negative coordinates floor toward negative infinity
        assert_eq!(ChunkKey::from_world_pos(-0.5, -64.0, tile, 0), ChunkKey::new(-1, -1, 0));
        assert_eq!(ChunkKey::from_world_pos(-64.5, 0.0, tile, 0), ChunkKey::new(-2, 0, 0));
    }

    #[test]
    fn test_origin_and_center() {
        let key = ChunkKey::new(-1, 2, 3);
        assert_eq!(key.world_origin(64.0), Vec2::new(-64.0, 128.0));
        assert_eq!(key.world_center(64.0), Vec2::new(-32.0, 160.0));
        assert_eq!(key.with_level(0).cell(), key.cell());
    }

    #[test]
    fn test_aabb_distance() {
        let aabb = Aabb::new(Vec3::new(0.0, -10.0, 0.0), Vec3::new(64.0, 10.0, 64.0));
        assert!(aabb.contains(Vec3::new(32.0, 0.0, 32.0)));
        assert!(aabb.distance_to(Vec3::new(32.0, 0.0, 32.0)).abs() < f32::EPSILON);
        assert!((aabb.distance_to(Vec3::new(74.0, 0.0, 32.0)) - 10.0).abs() < 1e-5);
        assert!((aabb.distance_to(Vec3::new(32.0, 30.0, 32.0)) - 20.0).abs() < 1e-5);
    }

    #[test]
    fn test_aabb_corners_normalized() {
        let aabb = Aabb::new(Vec3::ONE, Vec3::ZERO);
        assert_eq!(aabb.min, Vec3::ZERO);
        assert_eq!(aabb.max, Vec3::ONE);
    }
}
