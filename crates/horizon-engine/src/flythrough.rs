//! Scripted camera path for headless runs.
//!
//! The camera circles the origin at a fixed height above the terrain, looking
//! along its direction of travel with a slight downward pitch. A small random
//! wobble keeps the streamer's rescan thresholds honest.

use glam::Vec3;
use horizon_world::camera::{CameraView, DEFAULT_FOV, DEFAULT_NEAR};

/// Parameters of the circular fly-through.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlyPath {
    /// Orbit radius in world units
    pub radius: f32,
    /// Travel speed in world units per second
    pub speed: f32,
    /// Height above the terrain
    pub altitude: f32,
    /// Downward pitch in radians
    pub pitch: f32,
    /// Maximum random offset per frame
    pub jitter: f32,
    /// Far plane
    pub far: f32,
}

impl Default for FlyPath {
    fn default() -> Self {
        Self {
            radius: 400.0,
            speed: 40.0,
            altitude: 30.0,
            pitch: 0.2,
            jitter: 0.5,
            far: 2_000.0,
        }
    }
}

/// Walks a [`FlyPath`] frame by frame.
#[derive(Debug)]
pub struct FlyThrough {
    path: FlyPath,
    angle: f32,
    rng: fastrand::Rng,
}

impl FlyThrough {
    /// Starts at angle zero with a seeded wobble.
    #[must_use]
    pub fn new(path: FlyPath, seed: u64) -> Self {
        Self {
            path,
            angle: 0.0,
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Advances by `dt` seconds and returns the camera.
    ///
    /// `ground` is the terrain height below the new position.
    pub fn step(&mut self, dt: f32, ground: impl Fn(f32, f32) -> f32) -> CameraView {
        let radius = self.path.radius.max(1.0);
        self.angle += self.path.speed * dt / radius;

        let (sin, cos) = self.angle.sin_cos();
        let wobble = self.path.jitter * (self.rng.f32() * 2.0 - 1.0);
        let x = cos * radius + wobble;
        let z = sin * radius - wobble;
        let y = ground(x, z) + self.path.altitude;

        // Tangent of the circle, tipped down by the pitch
        let (pitch_sin, pitch_cos) = self.path.pitch.sin_cos();
        let forward = Vec3::new(-sin * pitch_cos, -pitch_sin, cos * pitch_cos);

        CameraView::looking(Vec3::new(x, y, z), forward, DEFAULT_FOV, DEFAULT_NEAR, self.path.far)
    }

    /// Current angle around the orbit in radians.
    #[must_use]
    pub const fn angle(&self) -> f32 {
        self.angle
    }
}
