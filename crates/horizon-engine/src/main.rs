//! # Horizon Engine
//!
//! Headless driver for Horizon terrain streaming.
//!
//! Flies a scripted camera over procedurally generated terrain and reports
//! what the chunk streamer (or the fixed spatial index) did each frame:
//! - World: height field, tiles, streaming, spatial index
//! - Kernel: wgpu buffers and an offscreen terrain pass

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod app;
mod flythrough;
mod perf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("horizon=info".parse()?))
        .init();

    info!("Horizon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let options = app::Options::parse();
    let summary = app::run(&options)?;

    info!(
        "Horizon finished: {} frames, {} draws ({} in the last frame), {:.2} ms average update",
        summary.frames, summary.total_draws, summary.last_frame_draws, summary.avg_update_ms
    );
    Ok(())
}
