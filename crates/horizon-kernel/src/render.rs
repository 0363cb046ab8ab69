//! Offscreen terrain render pass.
//!
//! Draws whatever the streamer or spatial index recorded on a
//! [`WgpuMeshBackend`] into a color + depth target, lit by a single
//! directional light.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use tracing::info;
use wgpu::util::DeviceExt;

use crate::mesh_buffer::{terrain_vertex_layout, WgpuMeshBackend};

/// Color format of the offscreen target.
pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Depth format of the offscreen target.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const TERRAIN_SHADER: &str = r"
struct Camera {
    view_proj: mat4x4<f32>,
    light_dir: vec4<f32>,
};

@group(0) @binding(0) var<uniform> camera: Camera;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) tangent: vec3<f32>,
    @location(3) color: vec3<f32>,
};

struct VertexOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) normal: vec3<f32>,
    @location(1) color: vec3<f32>,
};

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip = camera.view_proj * vec4<f32>(in.position, 1.0);
    out.normal = in.normal;
    out.color = in.color;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let diffuse = max(dot(normalize(in.normal), -normalize(camera.light_dir.xyz)), 0.0);
    return vec4<f32>(in.color * (0.3 + 0.7 * diffuse), 1.0);
}
";

/// Uniform block shared by the terrain shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct TerrainCameraUniform {
    /// Combined view-projection matrix
    pub view_proj: [[f32; 4]; 4],
    /// Light direction (xyz), w unused
    pub light_dir: [f32; 4],
}

impl TerrainCameraUniform {
    /// Builds the uniform from a matrix and a light direction.
    #[must_use]
    pub fn new(view_proj: Mat4, light_dir: Vec3) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
            light_dir: light_dir.extend(0.0).to_array(),
        }
    }
}

/// Color and depth textures to render into.
pub struct OffscreenTarget {
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    width: u32,
    height: u32,
}

impl OffscreenTarget {
    /// Creates a target of the given size.
    #[must_use]
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let size = wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        };
        let texture = |label: &str, format: wgpu::TextureFormat| {
            device
                .create_texture(&wgpu::TextureDescriptor {
                    label: Some(label),
                    size,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    view_formats: &[],
                })
                .create_view(&wgpu::TextureViewDescriptor::default())
        };
        Self {
            color_view: texture("Terrain Color Target", COLOR_FORMAT),
            depth_view: texture("Terrain Depth Target", DEPTH_FORMAT),
            width: size.width,
            height: size.height,
        }
    }

    /// Width over height.
    #[must_use]
    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// Render pipeline for terrain tiles.
pub struct TerrainPass {
    pipeline: wgpu::RenderPipeline,
    camera_buffer: wgpu::Buffer,
    camera_bind_group: wgpu::BindGroup,
}

impl TerrainPass {
    /// Compiles the shader and builds the pipeline.
    #[must_use]
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Terrain Shader"),
            source: wgpu::ShaderSource::Wgsl(TERRAIN_SHADER.into()),
        });
        let camera_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Terrain Camera Layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Terrain Pipeline Layout"),
            bind_group_layouts: &[&camera_bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Terrain Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[terrain_vertex_layout()],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: COLOR_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: Some(wgpu::Face::Back),
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        let camera_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Terrain Camera Buffer"),
            contents: bytemuck::bytes_of(&TerrainCameraUniform::new(
                Mat4::IDENTITY,
                Vec3::NEG_Y,
            )),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let camera_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Terrain Camera Bind Group"),
            layout: &camera_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: camera_buffer.as_entire_binding(),
            }],
        });
        info!("Terrain render pass initialized");
        Self {
            pipeline,
            camera_buffer,
            camera_bind_group,
        }
    }

    /// Encodes and submits one frame of the draws recorded on `backend`.
    ///
    /// Returns the number of meshes drawn.
    pub fn render(
        &self,
        queue: &wgpu::Queue,
        backend: &mut WgpuMeshBackend,
        target: &OffscreenTarget,
        camera: &TerrainCameraUniform,
    ) -> usize {
        queue.write_buffer(&self.camera_buffer, 0, bytemuck::bytes_of(camera));

        let mut encoder = backend
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Terrain Encoder"),
            });
        let drawn = {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Terrain Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.color_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.55,
                            g: 0.7,
                            b: 0.9,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.camera_bind_group, &[]);
            backend.encode_draws(&mut pass)
        };
        queue.submit(std::iter::once(encoder.finish()));
        drawn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::request_headless_device;
    use horizon_world::{
        CameraView, ChunkStreamer, FlatHeight, LodConfig, MeshSettings, StreamerConfig, WorkerPool,
    };
    use std::sync::Arc;

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<TerrainCameraUniform>(), 80);
        let uniform = TerrainCameraUniform::new(Mat4::IDENTITY, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(uniform.light_dir, [1.0, 2.0, 3.0, 0.0]);
        assert_eq!(uniform.view_proj[0], [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_streamed_frame_renders() {
        let Ok((device, queue)) = request_headless_device(true) else {
            return;
        };
        let pass = TerrainPass::new(&device);
        let target = OffscreenTarget::new(&device, 64, 64);
        let mut streamer = ChunkStreamer::new(
            StreamerConfig {
                view_distance: 96.0,
                uploads_per_tick: 64,
                ..Default::default()
            },
            LodConfig {
                max_resolution: 8,
                min_resolution: 2,
                ..Default::default()
            },
            Arc::new(FlatHeight(0.0)),
            MeshSettings::default(),
            Arc::new(WorkerPool::inline()),
            WgpuMeshBackend::new(device),
        );

        let eye = Vec3::new(0.0, 20.0, 0.0);
        streamer.update_view(&CameraView::at(eye), 0.016);
        let recorded = streamer.render();
        assert!(recorded > 0);

        let view_proj = Mat4::perspective_rh(1.0, target.aspect(), 0.1, 500.0)
            * Mat4::look_at_rh(eye, Vec3::new(32.0, 0.0, 32.0), Vec3::Y);
        let camera = TerrainCameraUniform::new(view_proj, Vec3::new(0.3, -1.0, 0.2));
        let drawn = pass.render(&queue, streamer.backend_mut(), &target, &camera);
        assert_eq!(drawn, recorded);
    }
}
