//! # Horizon Kernel
//!
//! GPU side of Horizon terrain rendering.
//!
//! This crate provides:
//! - A wgpu [`MeshBackend`](horizon_world::MeshBackend) that owns tile vertex
//!   and index buffers
//! - An offscreen render pass that draws the recorded tiles
//! - Device setup with validation in debug builds
//!
//! ## Threading
//!
//! Every type here must stay on the thread that owns the `wgpu::Device`.
//! Terrain generation happens elsewhere; only finished meshes reach this
//! crate, through `MeshBackend::create_buffer`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod mesh_buffer;
pub mod render;
pub mod validation;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::mesh_buffer::*;
    pub use crate::render::*;
    pub use crate::validation::*;
}

pub use prelude::*;
