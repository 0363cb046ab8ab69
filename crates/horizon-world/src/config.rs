//! Terrain configuration.
//!
//! One TOML file holds every tunable: noise parameters, LOD tiers, mesh
//! coloring, streaming budgets and the spatial index layout. Missing fields
//! take their defaults.

use std::fs;
use std::path::Path;

use horizon_common::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::height::NoiseParams;
use crate::lod::LodConfig;
use crate::quadtree::SpatialIndexConfig;
use crate::streamer::StreamerConfig;
use crate::tile::MeshSettings;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "horizon.toml";

/// Complete terrain configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// Height field parameters
    pub noise: NoiseParams,
    /// LOD tiers
    pub lod: LodConfig,
    /// Mesh coloring and bounds
    pub mesh: MeshSettings,
    /// Streamer budgets and distances
    pub streaming: StreamerConfig,
    /// Spatial index layout
    pub index: SpatialIndexConfig,
}

impl TerrainConfig {
    /// Loads configuration from a TOML file.
    ///
    /// A missing file yields the defaults; an unreadable or malformed one is
    /// an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Saves configuration as pretty TOML, creating parent directories.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, contents)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Rejects inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let noise = &self.noise;
        if noise.octaves == 0 || noise.octaves > 16 {
            return Err(ConfigError::Invalid(format!(
                "octaves must be in 1..=16, got {}",
                noise.octaves
            )));
        }
        if !(noise.persistence > 0.0 && noise.persistence < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "persistence must be in (0, 1), got {}",
                noise.persistence
            )));
        }
        if noise.lacunarity <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "lacunarity must exceed 1, got {}",
                noise.lacunarity
            )));
        }

        let lod = &self.lod;
        if lod.min_resolution < 2 || lod.min_resolution > lod.max_resolution {
            return Err(ConfigError::Invalid(format!(
                "resolution range {}..={} is empty or below 2",
                lod.min_resolution, lod.max_resolution
            )));
        }
        if lod.lod_distances.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::Invalid("lod_distances must be increasing".into()));
        }

        self.streaming.validate()?;
        self.index.validate()
    }
}
