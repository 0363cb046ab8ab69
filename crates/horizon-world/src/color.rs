//! Height/slope banded vertex coloring.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Color bands for terrain classification.
///
/// Heights are absolute world heights. Steep slopes pull the color toward rock
/// regardless of height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorBands {
    /// Height below which the surface is water
    pub water_level: f32,
    /// Height where grass is fully established above the shoreline
    pub grass_level: f32,
    /// Height where grass turns to rock
    pub rock_level: f32,
    /// Height where rock turns to snow
    pub snow_level: f32,
    /// Width of the blend zone around each band edge
    pub blend_width: f32,
    /// Slope (1 - normal.y) at which rock fully takes over
    pub rock_slope: f32,
    /// Strength of the multiplicative variation (0 = none)
    pub variation: f32,
    /// Water color
    pub water_color: [f32; 3],
    /// Shoreline sand color
    pub sand_color: [f32; 3],
    /// Grass color
    pub grass_color: [f32; 3],
    /// Rock color
    pub rock_color: [f32; 3],
    /// Snow color
    pub snow_color: [f32; 3],
}

impl Default for ColorBands {
    fn default() -> Self {
        Self {
            water_level: 0.0,
            grass_level: 3.0,
            rock_level: 35.0,
            snow_level: 60.0,
            blend_width: 4.0,
            rock_slope: 0.45,
            variation: 0.08,
            water_color: [0.10, 0.25, 0.45],
            sand_color: [0.76, 0.70, 0.50],
            grass_color: [0.22, 0.48, 0.16],
            rock_color: [0.45, 0.42, 0.38],
            snow_color: [0.95, 0.95, 0.97],
        }
    }
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge1 <= edge0 {
        return if x < edge0 { 0.0 } else { 1.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

impl ColorBands {
    /// Blend weight of the band starting at `level`.
    fn band(&self, level: f32, height: f32) -> f32 {
        let half = self.blend_width * 0.5;
        smoothstep(level - half, level + half, height)
    }

    /// Classifies a vertex into a color.
    ///
    /// `slope` is `1 - normal.y` (0 = flat, 1 = vertical). `variation` is a
    /// noise sample in `[-1, 1]` scaled by [`ColorBands::variation`].
    #[must_use]
    pub fn classify(&self, height: f32, slope: f32, variation: f32) -> [f32; 3] {
        if height < self.water_level {
            return self.water_color;
        }

        let sand = Vec3::from(self.sand_color);
        let grass = Vec3::from(self.grass_color);
        let rock = Vec3::from(self.rock_color);
        let snow = Vec3::from(self.snow_color);

        let mut color = sand.lerp(grass, self.band(self.grass_level, height));
        color = color.lerp(rock, self.band(self.rock_level, height));

        // Snow does not stick to steep faces
        let snow_weight = self.band(self.snow_level, height) * (1.0 - smoothstep(0.3, 0.6, slope));
        color = color.lerp(snow, snow_weight);

        // Steep ground shows bare rock below the snow line
        let rock_weight = smoothstep(self.rock_slope * 0.5, self.rock_slope, slope) * (1.0 - snow_weight);
        color = color.lerp(rock, rock_weight);

        let scale = 1.0 + variation.clamp(-1.0, 1.0) * self.variation;
        (color * scale).clamp(Vec3::ZERO, Vec3::ONE).to_array()
    }
}
