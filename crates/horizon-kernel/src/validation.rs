//! Device setup with wgpu validation.
//!
//! Debug builds enable the validation layer so buffer misuse surfaces as
//! errors during upload instead of undefined behavior later.

use horizon_common::GpuError;
use tracing::{error, info};

/// Returns wgpu instance flags with validation enabled for debug builds.
#[must_use]
pub fn gpu_instance_flags() -> wgpu::InstanceFlags {
    if cfg!(debug_assertions) {
        info!("GPU validation layer enabled (debug build)");
        wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::DEBUG
    } else {
        wgpu::InstanceFlags::empty()
    }
}

/// Creates a wgpu instance with appropriate validation settings.
#[must_use]
pub fn create_validated_instance() -> wgpu::Instance {
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: gpu_instance_flags(),
        ..Default::default()
    })
}

/// Logs uncaptured device errors.
///
/// Use with `device.on_uncaptured_error()`.
pub fn handle_device_error(error: &wgpu::Error) {
    error!("GPU device error: {error}");
}

/// Requests a device without a surface, for offscreen rendering and tests.
///
/// Set `allow_fallback` to accept a software adapter.
pub fn request_headless_device(
    allow_fallback: bool,
) -> Result<(wgpu::Device, wgpu::Queue), GpuError> {
    let instance = create_validated_instance();
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::LowPower,
        compatible_surface: None,
        force_fallback_adapter: allow_fallback,
    }))
    .ok_or(GpuError::DeviceLost)?;

    let adapter_info = adapter.get_info();
    info!(
        "Using GPU adapter {} ({:?})",
        adapter_info.name, adapter_info.backend
    );

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("Horizon Device"),
            ..Default::default()
        },
        None,
    ))
    .map_err(|e| GpuError::ValidationError(e.to_string()))?;

    device.on_uncaptured_error(Box::new(|e| handle_device_error(&e)));
    Ok((device, queue))
}
