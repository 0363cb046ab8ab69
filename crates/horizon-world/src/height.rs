//! Procedural height field.
//!
//! Heights are a sum of several noise layers sampled at world X/Z:
//! - fBm octaves for the base landform
//! - a ridged term (`1 - |n|`) at very low frequency for mountain ridges
//! - a billowy term (`|n|`) at mid frequency for rolling hills
//! - a fine detail term at high frequency
//!
//! Every layer uses its own seeded Perlin basis, so the whole function is a
//! pure, deterministic mapping that can be sampled from any thread.

use noise::{NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

/// Anything that can answer height queries for world X/Z.
///
/// Implementations must be deterministic and safe to call concurrently.
pub trait HeightSource: Send + Sync {
    /// Terrain height at world position (x, z).
    fn height(&self, x: f32, z: f32) -> f32;

    /// Low-amplitude noise in `[-1, 1]` used to break up vertex colors.
    fn variation(&self, _x: f32, _z: f32) -> f32 {
        0.0
    }
}

/// Parameters for the height field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseParams {
    /// World seed
    pub seed: u32,
    /// Number of fBm octaves
    pub octaves: u32,
    /// Amplitude multiplier per octave (< 1)
    pub persistence: f32,
    /// Frequency multiplier per octave (> 1)
    pub lacunarity: f32,
    /// Amplitude of the first octave
    pub base_amplitude: f32,
    /// Frequency of the first octave
    pub base_frequency: f32,
    /// Amplitude of the ridged mountain term
    pub ridge_amplitude: f32,
    /// Frequency of the ridged mountain term
    pub ridge_frequency: f32,
    /// Amplitude of the billowy hill term
    pub billow_amplitude: f32,
    /// Frequency of the billowy hill term
    pub billow_frequency: f32,
    /// Amplitude of the fine detail term
    pub detail_amplitude: f32,
    /// Frequency of the fine detail term
    pub detail_frequency: f32,
    /// Frequency of the color variation noise
    pub variation_frequency: f32,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            seed: 12345,
            octaves: 7,
            persistence: 0.55,
            lacunarity: 2.1,
            base_amplitude: 30.0,
            base_frequency: 0.005,
            ridge_amplitude: 40.0,
            ridge_frequency: 0.0012,
            billow_amplitude: 8.0,
            billow_frequency: 0.02,
            detail_amplitude: 1.5,
            detail_frequency: 0.15,
            variation_frequency: 0.3,
        }
    }
}

impl NoiseParams {
    /// Upper bound on `|height|` for these parameters.
    ///
    /// Perlin output stays within `[-1, 1]`, so the bound is the sum of the
    /// absolute amplitudes of every layer.
    #[must_use]
    pub fn max_abs_height(&self) -> f32 {
        let mut fbm = 0.0;
        let mut amplitude = self.base_amplitude.abs();
        for _ in 0..self.octaves {
            fbm += amplitude;
            amplitude *= self.persistence;
        }
        fbm + self.ridge_amplitude.abs() + self.billow_amplitude.abs() + self.detail_amplitude.abs()
    }
}

/// Samples a basis, clamped to its nominal `[-1, 1]` range.
fn sample(basis: &Perlin, x: f64, z: f64) -> f64 {
    basis.get([x, z]).clamp(-1.0, 1.0)
}

/// Deterministic multi-layer noise height field.
#[derive(Debug, Clone)]
pub struct HeightField {
    /// Parameters
    params: NoiseParams,
    /// fBm basis
    base: Perlin,
    /// Ridged mountain basis
    ridge: Perlin,
    /// Billowy hill basis
    billow: Perlin,
    /// Fine detail basis
    detail: Perlin,
    /// Color variation basis
    variation: Perlin,
}

impl HeightField {
    /// Creates a height field with the given parameters.
    #[must_use]
    pub fn new(params: NoiseParams) -> Self {
        let seed = params.seed;
        Self {
            base: Perlin::new(seed),
            ridge: Perlin::new(seed.wrapping_add(1)),
            billow: Perlin::new(seed.wrapping_add(2)),
            detail: Perlin::new(seed.wrapping_add(3)),
            variation: Perlin::new(seed.wrapping_add(4)),
            params,
        }
    }

    /// Creates a height field with default parameters and the given seed.
    #[must_use]
    pub fn with_seed(seed: u32) -> Self {
        Self::new(NoiseParams {
            seed,
            ..Default::default()
        })
    }

    /// Returns the parameters.
    #[must_use]
    pub const fn params(&self) -> &NoiseParams {
        &self.params
    }

    /// Fractal Brownian motion over the base basis.
    fn fbm(&self, x: f64, z: f64) -> f64 {
        let p = &self.params;
        let mut amplitude = f64::from(p.base_amplitude);
        let mut frequency = f64::from(p.base_frequency);
        let mut sum = 0.0;
        for _ in 0..p.octaves {
            sum += sample(&self.base, x * frequency, z * frequency) * amplitude;
            amplitude *= f64::from(p.persistence);
            frequency *= f64::from(p.lacunarity);
        }
        sum
    }

    /// Sharp-crested ridges: high where the basis crosses zero.
    fn ridged(&self, x: f64, z: f64) -> f64 {
        let f = f64::from(self.params.ridge_frequency);
        let n = 1.0 - sample(&self.ridge, x * f, z * f).abs();
        // Squaring sharpens the crests and flattens the valleys
        n * n * f64::from(self.params.ridge_amplitude)
    }

    /// Rounded, rolling hills.
    fn billowy(&self, x: f64, z: f64) -> f64 {
        let f = f64::from(self.params.billow_frequency);
        sample(&self.billow, x * f, z * f).abs() * f64::from(self.params.billow_amplitude)
    }

    /// High-frequency surface roughness.
    fn fine_detail(&self, x: f64, z: f64) -> f64 {
        let f = f64::from(self.params.detail_frequency);
        sample(&self.detail, x * f, z * f) * f64::from(self.params.detail_amplitude)
    }
}

impl Default for HeightField {
    fn default() -> Self {
        Self::new(NoiseParams::default())
    }
}

impl HeightSource for HeightField {
    fn height(&self, x: f32, z: f32) -> f32 {
        let (x, z) = (f64::from(x), f64::from(z));
        (self.fbm(x, z) + self.ridged(x, z) + self.billowy(x, z) + self.fine_detail(x, z)) as f32
    }

    fn variation(&self, x: f32, z: f32) -> f32 {
        let f = f64::from(self.params.variation_frequency);
        sample(&self.variation, f64::from(x) * f, f64::from(z) * f) as f32
    }
}

/// A perfectly flat height source, mostly useful for tests and previews.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlatHeight(pub f32);

impl HeightSource for FlatHeight {
    fn height(&self, _x: f32, _z: f32) -> f32 {
        self.0
    }
}
