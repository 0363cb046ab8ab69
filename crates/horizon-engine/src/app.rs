//! Headless run loop.
//!
//! Flies a camera over the terrain for a fixed number of frames, driving
//! either the chunk streamer or the spatial index, and reports streaming
//! statistics. Uses the wgpu backend when an adapter is available and the
//! bookkeeping backend otherwise.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use glam::{Mat4, Vec3};
use horizon_kernel::{
    request_headless_device, OffscreenTarget, TerrainCameraUniform, TerrainPass, WgpuMeshBackend,
};
use horizon_world::{
    CameraView, ChunkStreamer, HeadlessBackend, HeightField, HeightSource, MeshBackend,
    SpatialIndex, TerrainConfig, WorkerPool, CONFIG_FILE,
};
use tracing::{info, warn};

use crate::flythrough::{FlyPath, FlyThrough};
use crate::perf::PerfMetrics;

/// Fixed simulation step.
const FRAME_DT: f32 = 1.0 / 60.0;

/// Which terrain structure to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Open-world chunk streamer
    Streamer,
    /// Bounded fixed-depth quadtree
    Index,
}

/// Flies a camera over procedural terrain and reports streaming statistics.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(name = "horizon", version)]
pub struct Options {
    /// Terrain config path
    #[arg(default_value = CONFIG_FILE)]
    pub config_path: PathBuf,
    /// Structure to drive
    #[arg(short, long, value_enum, default_value_t = Mode::Streamer)]
    pub mode: Mode,
    /// Frames to simulate
    #[arg(short, long, default_value_t = 600)]
    pub frames: u32,
    /// Skip GPU setup entirely
    #[arg(long)]
    pub headless: bool,
    /// Worker threads (0 = half the hardware threads)
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,
    /// Seed for the camera wobble
    #[arg(short, long, default_value_t = 1)]
    pub seed: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(CONFIG_FILE),
            mode: Mode::Streamer,
            frames: 600,
            headless: false,
            workers: 0,
            seed: 1,
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunSummary {
    /// Frames simulated
    pub frames: u32,
    /// Draws over all frames
    pub total_draws: usize,
    /// Tiles drawn in the last frame
    pub last_frame_draws: usize,
    /// Average update time in milliseconds
    pub avg_update_ms: f32,
}

/// GPU objects needed to turn recorded draws into pixels.
struct GpuFrame {
    queue: wgpu::Queue,
    pass: TerrainPass,
    target: OffscreenTarget,
}

/// Loads configuration and runs the fly-through.
pub fn run(options: &Options) -> Result<RunSummary> {
    let config = TerrainConfig::load_from(&options.config_path)
        .with_context(|| format!("Loading {}", options.config_path.display()))?;
    config.validate()?;

    let threads = if options.workers == 0 {
        WorkerPool::default_size()
    } else {
        options.workers
    };
    let pool = Arc::new(WorkerPool::new(threads));
    info!(
        "Running {:?} mode for {} frames with {} workers",
        options.mode,
        options.frames,
        pool.thread_count()
    );

    let gpu = if options.headless {
        None
    } else {
        match request_headless_device(false) {
            Ok((device, queue)) => Some((device, queue)),
            Err(e) => {
                warn!("No GPU available ({e}), using headless backend");
                None
            },
        }
    };

    match gpu {
        Some((device, queue)) => {
            let frame = GpuFrame {
                pass: TerrainPass::new(&device),
                target: OffscreenTarget::new(&device, 640, 360),
                queue,
            };
            let backend = WgpuMeshBackend::new(device);
            drive(&config, options, pool, backend, |backend, view| {
                frame
                    .pass
                    .render(&frame.queue, backend, &frame.target, &camera_uniform(view, &frame.target))
            })
        },
        None => drive(&config, options, pool, HeadlessBackend::new(), |backend, _| {
            backend.take_draws().len()
        }),
    }
}

fn camera_uniform(view: &CameraView, target: &OffscreenTarget) -> TerrainCameraUniform {
    let forward = view.direction().unwrap_or(Vec3::NEG_Z);
    let far = if view.far.is_finite() { view.far } else { 10_000.0 };
    let view_proj = Mat4::perspective_rh(view.fov, target.aspect(), view.near.max(0.01), far)
        * Mat4::look_to_rh(view.position, forward, Vec3::Y);
    TerrainCameraUniform::new(view_proj, Vec3::new(0.4, -1.0, 0.3))
}

/// Runs the frame loop on any backend.
///
/// `present` turns the draws recorded during `render` into a frame and returns
/// how many meshes it drew.
fn drive<B, P>(
    config: &TerrainConfig,
    options: &Options,
    pool: Arc<WorkerPool>,
    backend: B,
    present: P,
) -> Result<RunSummary>
where
    B: MeshBackend,
    P: FnMut(&mut B, &CameraView) -> usize,
{
    let heights: Arc<dyn HeightSource> = Arc::new(HeightField::new(config.noise.clone()));
    let path = FlyPath {
        far: config.streaming.view_distance * config.streaming.visible_range_multiplier,
        ..Default::default()
    };
    let fly = FlyThrough::new(path, options.seed);

    match options.mode {
        Mode::Streamer => {
            let streamer = ChunkStreamer::new(
                config.streaming.clone(),
                config.lod.clone(),
                heights,
                config.mesh.clone(),
                pool,
                backend,
            );
            run_streamer(streamer, fly, options.frames, present)
        },
        Mode::Index => {
            let index = SpatialIndex::new(config.index.clone(), heights, config.mesh.clone())?;
            run_index(index, backend, fly, options.frames, present)
        },
    }
}

fn run_streamer<B, P>(
    mut streamer: ChunkStreamer<B>,
    mut fly: FlyThrough,
    frames: u32,
    mut present: P,
) -> Result<RunSummary>
where
    B: MeshBackend,
    P: FnMut(&mut B, &CameraView) -> usize,
{
    let mut perf = PerfMetrics::default();
    let mut summary = RunSummary::default();

    for frame in 0..frames {
        let view = fly.step(FRAME_DT, |x, z| streamer.height_at(x, z));

        let update_start = Instant::now();
        streamer.update_view(&view, FRAME_DT);
        let update_time = update_start.elapsed().as_secs_f32();

        let render_start = Instant::now();
        streamer.render();
        let drawn = present(streamer.backend_mut(), &view);
        perf.record_frame(update_time, render_start.elapsed().as_secs_f32());

        summary.total_draws += drawn;
        summary.last_frame_draws = drawn;
        if frame % 120 == 0 {
            let stats = streamer.stats();
            info!(
                "Frame {frame}: {} active, {} visible, {} drawn, {} generating, {} queued, {:.2} ms update",
                stats.active,
                stats.visible,
                drawn,
                stats.generating,
                stats.pending_uploads,
                perf.avg_update_ms()
            );
        }
    }

    let stats = streamer.stats();
    info!(
        "Streamer finished after {} frames ({:.2} rad flown): {} scans, {} generations, {} failed, worst update {:.2} ms, {:.2} ms render",
        perf.frames(),
        fly.angle(),
        stats.scans,
        stats.generations_started,
        stats.failed,
        perf.worst_update_ms(),
        perf.avg_render_ms()
    );
    streamer.shutdown();

    summary.frames = frames;
    summary.avg_update_ms = perf.avg_update_ms();
    Ok(summary)
}

fn run_index<B, P>(
    mut index: SpatialIndex,
    mut backend: B,
    mut fly: FlyThrough,
    frames: u32,
    mut present: P,
) -> Result<RunSummary>
where
    B: MeshBackend,
    P: FnMut(&mut B, &CameraView) -> usize,
{
    let mut perf = PerfMetrics::default();
    let mut summary = RunSummary::default();

    for frame in 0..frames {
        let view = fly.step(FRAME_DT, |x, z| index.height_at(x, z));

        let update_start = Instant::now();
        index.update(&view, &mut backend);
        let update_time = update_start.elapsed().as_secs_f32();

        let render_start = Instant::now();
        index.render(&mut backend);
        let drawn = present(&mut backend, &view);
        perf.record_frame(update_time, render_start.elapsed().as_secs_f32());

        summary.total_draws += drawn;
        summary.last_frame_draws = drawn;
        if frame % 120 == 0 {
            let stats = index.stats();
            info!(
                "Frame {frame}: {} of {} leaves buffered, {} drawn, {:.2} ms update",
                stats.buffered,
                stats.leaves,
                drawn,
                perf.avg_update_ms()
            );
        }
    }

    info!(
        "Index finished after {} frames ({:.2} rad flown): worst update {:.2} ms, {:.2} ms render",
        perf.frames(),
        fly.angle(),
        perf.worst_update_ms(),
        perf.avg_render_ms()
    );
    index.release(&mut backend);
    summary.frames = frames;
    summary.avg_update_ms = perf.avg_update_ms();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_parse_defaults() {
        let options = Options::try_parse_from(["horizon"]).expect("parse failed");
        assert_eq!(options, Options::default());
        assert_eq!(options.config_path, PathBuf::from("horizon.toml"));
    }

    #[test]
    fn test_parse_flags() {
        let options = Options::try_parse_from([
            "horizon",
            "custom.toml",
            "--mode",
            "index",
            "--headless",
            "--frames",
            "12",
            "-w",
            "3",
        ])
        .expect("parse failed");
        assert_eq!(options.config_path, PathBuf::from("custom.toml"));
        assert_eq!(options.mode, Mode::Index);
        assert!(options.headless);
        assert_eq!(options.frames, 12);
        assert_eq!(options.workers, 3);
        assert_eq!(options.seed, 1);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Options::try_parse_from(["horizon", "--frames"]).is_err());
        assert!(Options::try_parse_from(["horizon", "--frames", "many"]).is_err());
        assert!(Options::try_parse_from(["horizon", "--mode", "octree"]).is_err());
        assert!(Options::try_parse_from(["horizon", "--bogus"]).is_err());
    }

    #[test]
    fn test_cli_definition() {
        Options::command().debug_assert();
    }

    fn small_config(dir: &TempDir) -> PathBuf {
        let mut config = TerrainConfig::default();
        config.lod.max_resolution = 8;
        config.lod.min_resolution = 4;
        config.streaming.view_distance = 160.0;
        config.streaming.uploads_per_tick = 16;
        config.index.depth = 2;
        config.index.resolution = 8;
        let path = dir.path().join("horizon.toml");
        config.save_to(&path).expect("save failed");
        path
    }

    #[test]
    fn test_headless_streamer_run() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let options = Options {
            config_path: small_config(&dir),
            frames: 30,
            headless: true,
            workers: 2,
            ..Default::default()
        };
        let summary = run(&options).expect("run failed");
        assert_eq!(summary.frames, 30);
        assert!(summary.last_frame_draws <= summary.total_draws);
    }

    #[test]
    fn test_headless_index_run() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let options = Options {
            config_path: small_config(&dir),
            mode: Mode::Index,
            frames: 5,
            headless: true,
            ..Default::default()
        };
        let summary = run(&options).expect("run failed");
        assert_eq!(summary.frames, 5);
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[streaming]\ntile_size = -1.0\n").expect("write failed");
        let options = Options {
            config_path: path,
            headless: true,
            ..Default::default()
        };
        assert!(run(&options).is_err());
    }
}
