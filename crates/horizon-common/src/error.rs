//! Error types for Horizon.

use thiserror::Error;

use crate::coords::ChunkKey;

/// Top-level error type for terrain operations.
#[derive(Debug, Error)]
pub enum TerrainError {
    /// Tile generation errors
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// GPU upload errors
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    /// GPU-related errors
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while building a tile mesh.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationError {
    /// The height source produced NaN or infinity
    #[error("Non-finite height at ({x}, {z})")]
    NonFiniteHeight {
        /// World X coordinate
        x: f32,
        /// World Z coordinate
        z: f32,
    },

    /// Generation was cancelled before completion
    #[error("Generation of {0} cancelled")]
    Cancelled(ChunkKey),

    /// The worker running the job panicked
    #[error("Worker panicked: {0}")]
    WorkerPanic(String),

    /// Tile parameters cannot produce a mesh
    #[error("Invalid tile parameters: {0}")]
    InvalidParameters(String),
}

/// GPU-specific errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GpuError {
    /// Buffer allocation failed
    #[error("Buffer allocation failed: {0}")]
    BufferAlloc(String),

    /// GPU validation error
    #[error("GPU validation error: {0}")]
    ValidationError(String),

    /// The device was lost
    #[error("GPU device lost")]
    DeviceLost,
}

/// Errors returned when uploading a tile to the GPU.
///
/// `Pending` is the expected "not ready yet" outcome and carries no failure;
/// callers retry it later. The other variants describe a genuine failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UploadError {
    /// Generation is still in flight
    #[error("Tile {0} is still generating")]
    Pending(ChunkKey),

    /// The tile has no mesh to upload (failed or retired)
    #[error("Tile {0} has no generated mesh")]
    NotGenerated(ChunkKey),

    /// The GPU rejected the buffers; partial allocations were released
    #[error("Upload of {key} failed: {source}")]
    Failed {
        /// Tile being uploaded
        key: ChunkKey,
        /// Underlying GPU error
        #[source]
        source: GpuError,
    },
}

impl UploadError {
    /// Whether the same upload may succeed if attempted again later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Pending(_) | Self::Failed { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for the expected schema
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// Values are individually valid but inconsistent
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type alias for terrain operations.
pub type TerrainResult<T> = Result<T, TerrainError>;
