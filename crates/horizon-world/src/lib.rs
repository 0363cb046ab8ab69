//! # Horizon World
//!
//! Procedural terrain tiles for Horizon.
//!
//! This crate handles:
//! - Deterministic height-field generation
//! - Per-tile mesh construction with normals, tangents and vertex colors
//! - Distance-based LOD selection
//! - Off-thread generation on an explicit worker pool
//! - Camera-driven streaming with upload budgets and eviction
//! - A fixed-depth spatial index for bounded worlds

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod camera;
pub mod color;
pub mod config;
pub mod gpu;
pub mod height;
pub mod lod;
pub mod mesh;
pub mod pool;
pub mod quadtree;
pub mod streamer;
pub mod tile;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::camera::*;
    pub use crate::color::*;
    pub use crate::config::*;
    pub use crate::gpu::*;
    pub use crate::height::*;
    pub use crate::lod::*;
    pub use crate::mesh::*;
    pub use crate::pool::*;
    pub use crate::quadtree::*;
    pub use crate::streamer::*;
    pub use crate::tile::*;
}

pub use prelude::*;
