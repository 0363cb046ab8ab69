//! # Horizon Common
//!
//! Common types and shared abstractions for Horizon terrain streaming.
//!
//! This crate provides foundational types used across all Horizon crates:
//! - Tile identity and grid/world coordinate math
//! - Axis-aligned bounds used for culling
//! - Common error types
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod coords;
pub mod error;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::coords::*;
    pub use crate::error::*;
}

pub use prelude::*;
