//! Camera input for culling and streaming.

use glam::Vec3;

/// Default full view-cone angle in radians (about 100 degrees).
pub const DEFAULT_FOV: f32 = 1.75;

/// Default near distance below which tiles are never culled.
pub const DEFAULT_NEAR: f32 = 0.1;

/// What the terrain needs to know about the viewer each frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraView {
    /// World-space position
    pub position: Vec3,
    /// View direction; `None` disables the cone test
    pub forward: Option<Vec3>,
    /// Full view-cone angle in radians
    pub fov: f32,
    /// Tiles closer than this are always visible
    pub near: f32,
    /// Tiles farther than this are never visible
    pub far: f32,
}

impl CameraView {
    /// A camera with no orientation and unlimited range.
    #[must_use]
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            forward: None,
            fov: DEFAULT_FOV,
            near: DEFAULT_NEAR,
            far: f32::INFINITY,
        }
    }

    /// A camera looking along `forward`.
    #[must_use]
    pub fn looking(position: Vec3, forward: Vec3, fov: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            forward: Some(forward),
            fov,
            near,
            far,
        }
    }

    /// Returns a copy with a different far distance.
    #[must_use]
    pub fn with_far(mut self, far: f32) -> Self {
        self.far = far;
        self
    }

    /// Unit forward vector, if the camera has a usable orientation.
    #[must_use]
    pub fn direction(&self) -> Option<Vec3> {
        self.forward.and_then(Vec3::try_normalize)
    }
}
