//! Headless wgpu rasterizer: draws particles as points into an offscreen
//! RGBA target.
//!
//! The vertex buffers it creates are also storage buffers, so a
//! [`WgpuBackend`](super::WgpuBackend) context built from its share group can
//! bind them directly as kernel arguments.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::info;
use wgpu::util::DeviceExt;

use super::{scoped, AdapterKey, WgpuShareGroup, WgpuSharedBuffer};
use crate::backend::{RasterError, RasterSession};
use crate::error::Status;
use crate::particle::RECORD_SIZE;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const POSITION_ATTRIBS: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x4];
const COLOR_ATTRIBS: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Float32x4];

/// Offscreen point renderer on one adapter.
pub struct WgpuRaster {
    group: WgpuShareGroup,
    target: wgpu::Texture,
    view: wgpu::TextureView,
    pipeline: wgpu::RenderPipeline,
    width: u32,
    height: u32,
    draws: u64,
}

impl WgpuRaster {
    /// Open a device on `adapter` and build the point pipeline.
    pub fn new(adapter: &wgpu::Adapter, width: u32, height: u32) -> Result<Self, RasterError> {
        if width == 0 || height == 0 {
            return Err(RasterError::BufferCreation(format!("invalid viewport {width}x{height}")));
        }
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("raster_device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| RasterError::BufferCreation(format!("failed to create raster device: {e}")))?;

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("raster_target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = target.create_view(&wgpu::TextureViewDescriptor::default());

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("points"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/points.wgsl").into()),
        });

        let vec4_layout = |attributes: &'static [wgpu::VertexAttribute]| wgpu::VertexBufferLayout {
            array_stride: RECORD_SIZE as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes,
        };

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("points"),
            layout: None,
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                compilation_options: Default::default(),
                buffers: &[vec4_layout(&POSITION_ATTRIBS), vec4_layout(&COLOR_ATTRIBS)],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::PointList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        info!(adapter = %adapter.get_info().name, width, height, "raster session opened");

        Ok(Self {
            group: WgpuShareGroup {
                device: Arc::new(device),
                queue: Arc::new(queue),
                adapter: AdapterKey::of(adapter),
            },
            target,
            view,
            pipeline,
            width,
            height,
            draws: 0,
        })
    }

    pub fn viewport(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Copy the render target back as tightly packed RGBA8 rows.
    pub fn read_pixels(&self) -> Result<Vec<u8>, RasterError> {
        let device = &self.group.device;
        let unpadded = self.width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded = unpadded.div_ceil(align) * align;

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pixel_staging"),
            size: (padded * self.height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("read_pixels"),
        });
        encoder.copy_texture_to_buffer(
            self.target.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        self.group.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            _ => return Err(RasterError::Draw("pixel readback failed".into())),
        }

        let data = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded * self.height) as usize);
        for row in data.chunks(padded as usize) {
            pixels.extend_from_slice(&row[..unpadded as usize]);
        }
        drop(data);
        staging.unmap();
        Ok(pixels)
    }
}

impl RasterSession for WgpuRaster {
    type ShareGroup = WgpuShareGroup;
    type SharedBuffer = WgpuSharedBuffer;

    fn share_group(&self) -> &WgpuShareGroup {
        &self.group
    }

    fn create_vertex_buffer(&mut self, label: &str, data: &[u8]) -> Result<WgpuSharedBuffer, RasterError> {
        if data.is_empty() || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(RasterError::BufferCreation(format!("{label}: invalid size {}", data.len())));
        }
        let device = &self.group.device;
        let buffer = scoped(device, Status::MemObjectAllocationFailure, || {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage: wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            })
        })
        .map_err(|e| RasterError::BufferCreation(e.message))?;

        Ok(WgpuSharedBuffer {
            buffer: Arc::new(buffer),
            device: device.clone(),
            acquired: Arc::new(AtomicBool::new(false)),
            label: label.to_string(),
        })
    }

    fn update_vertex_buffer(&mut self, buffer: &WgpuSharedBuffer, data: &[u8]) -> Result<(), RasterError> {
        if buffer.compute_owned() {
            return Err(RasterError::BufferUpdate(format!("`{}` is owned by compute", buffer.label)));
        }
        if data.len() as u64 != buffer.size() {
            return Err(RasterError::BufferUpdate(format!(
                "{} bytes does not match buffer size {}",
                data.len(),
                buffer.size()
            )));
        }
        self.group.queue.write_buffer(&buffer.buffer, 0, data);
        self.group.queue.submit(std::iter::empty());
        Ok(())
    }

    fn finish(&mut self) {
        self.group.device.poll(wgpu::Maintain::Wait);
    }

    fn draw_points(
        &mut self,
        position: &WgpuSharedBuffer,
        color: &WgpuSharedBuffer,
        count: usize,
    ) -> Result<(), RasterError> {
        for buf in [position, color] {
            if buf.compute_owned() {
                return Err(RasterError::Draw(format!("`{}` is owned by compute", buf.label)));
            }
        }
        let device = &self.group.device;
        scoped(device, Status::InvalidOperation, || {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("draw_points"),
            });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("points"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &self.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_vertex_buffer(0, position.buffer.slice(..));
                pass.set_vertex_buffer(1, color.buffer.slice(..));
                pass.draw(0..count as u32, 0..1);
            }
            self.group.queue.submit(std::iter::once(encoder.finish()));
        })
        .map_err(|e| RasterError::Draw(e.message))?;
        self.draws += 1;
        Ok(())
    }
}
