//! Level-of-detail tiers.
//!
//! Every LOD level covers the same footprint; higher levels halve the vertex
//! grid resolution until it reaches the configured floor.

use serde::{Deserialize, Serialize};

/// Default vertices per side at level 0.
pub const DEFAULT_MAX_RESOLUTION: u32 = 128;

/// Default minimum vertices per side.
pub const DEFAULT_MIN_RESOLUTION: u32 = 16;

/// Default coarsest LOD level.
pub const DEFAULT_MAX_LEVEL: u8 = 4;

/// LOD configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Vertices per grid side at level 0
    pub max_resolution: u32,
    /// Floor for vertices per grid side
    pub min_resolution: u32,
    /// Coarsest level
    pub max_level: u8,
    /// Upper distance bound of each level, nearest first.
    ///
    /// Distances beyond the last entry (or beyond `max_level` entries) map to
    /// `max_level`.
    pub lod_distances: Vec<f32>,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            max_resolution: DEFAULT_MAX_RESOLUTION,
            min_resolution: DEFAULT_MIN_RESOLUTION,
            max_level: DEFAULT_MAX_LEVEL,
            lod_distances: vec![150.0, 300.0, 500.0, 800.0],
        }
    }
}

impl LodConfig {
    /// Vertex-grid side length for a level.
    ///
    /// Halved per level from `max_resolution`, never below `min_resolution`
    /// and never below 2 (a single quad).
    #[must_use]
    pub fn resolution(&self, level: u8) -> u32 {
        let floor = self.min_resolution.max(2);
        let ceiling = self.max_resolution.max(floor);
        let shifted = ceiling.checked_shr(u32::from(level)).unwrap_or(0);
        shifted.clamp(floor, ceiling)
    }

    /// Picks the LOD level for a distance from the camera.
    #[must_use]
    pub fn level_for_distance(&self, distance: f32) -> u8 {
        let level = self
            .lod_distances
            .iter()
            .position(|&limit| distance < limit)
            .unwrap_or(self.lod_distances.len());
        (level.min(usize::from(self.max_level))) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resolution_halves_then_floors() {
        let lod = LodConfig::default();
        assert_eq!(lod.resolution(0), 128);
        assert_eq!(lod.resolution(1), 64);
        assert_eq!(lod.resolution(2), 32);
        assert_eq!(lod.resolution(3), 16);
        assert_eq!(lod.resolution(4), 16);
        assert_eq!(lod.resolution(200), 16);
    }

    #[test]
    fn test_level_for_distance_bands() {
        let lod = LodConfig::default();
        assert_eq!(lod.level_for_distance(0.0), 0);
        assert_eq!(lod.level_for_distance(149.9), 0);
        assert_eq!(lod.level_for_distance(150.0), 1);
        assert_eq!(lod.level_for_distance(450.0), 2);
        assert_eq!(lod.level_for_distance(700.0), 3);
        assert_eq!(lod.level_for_distance(10_000.0), 4);
    }

    #[test]
    fn test_level_capped_by_max_level() {
        let lod = LodConfig {
            max_level: 1,
            ..Default::default()
        };
        assert_eq!(lod.level_for_distance(10_000.0), 1);
    }

    proptest! {
        #[test]
        fn prop_resolution_non_increasing_and_bounded(
            max_res in 2u32..1024,
            min_res in 2u32..256,
            max_level in 0u8..12,
        ) {
            let lod = LodConfig {
                max_resolution: max_res,
                min_resolution: min_res,
                max_level,
                ..Default::default()
            };
            let floor = min_res.min(max_res);
            let mut previous = u32::MAX;
            for level in 0..=max_level {
                let res = lod.resolution(level);
                prop_assert!(res <= previous);
                prop_assert!(res >= floor.max(2));
                prop_assert!(res <= max_res.max(min_res));
                previous = res;
            }
        }
    }
}
