use std::num::NonZeroU32;
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};

use super::CompositeBackend;
use crate::error::{CaptionError, CaptionResult};
use crate::glyph_atlas::GlyphAtlas;
use crate::mesh::{Vertex, VERTEX_STRIDE};
use crate::style::Rgba;

const BLIT_SHADER: &str = r#"
@group(0) @binding(0) var source_tex: texture_2d<f32>;

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
  var positions = array<vec2<f32>, 3>(
    vec2<f32>(-1.0, -3.0),
    vec2<f32>(-1.0, 1.0),
    vec2<f32>(3.0, 1.0)
  );
  return vec4<f32>(positions[vertex_index], 0.0, 1.0);
}

@fragment
fn fs_main(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
  return textureLoad(source_tex, vec2<i32>(floor(position.xy)), 0);
}
"#;

const TEXT_SHADER: &str = r#"
struct TextUniform {
  viewport: vec2<f32>,
  _pad0: vec2<f32>,
  tint: vec4<f32>,
}

@group(0) @binding(0) var atlas_tex: texture_2d<f32>;
@group(0) @binding(1) var atlas_sampler: sampler;
@group(0) @binding(2) var<uniform> text: TextUniform;

struct VertexInput {
  @location(0) position: vec2<f32>,
  @location(1) uv: vec2<f32>,
}

struct VertexOutput {
  @builtin(position) position: vec4<f32>,
  @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
  var out: VertexOutput;
  let clip = vec2<f32>(
    input.position.x / text.viewport.x * 2.0 - 1.0,
    1.0 - input.position.y / text.viewport.y * 2.0
  );
  out.position = vec4<f32>(clip, 0.0, 1.0);
  out.uv = input.uv;
  return out;
}

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
  let coverage = textureSample(atlas_tex, atlas_sampler, input.uv).a;
  return vec4<f32>(text.tint.rgb, text.tint.a * coverage);
}
"#;

/// `rgb = src.rgb * src.a + dst.rgb * (1 - src.a)`, `a = src.a + dst.a * (1 - src.a)`.
const CAPTION_BLEND: wgpu::BlendState = wgpu::BlendState {
    color: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::SrcAlpha,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
    alpha: wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
        operation: wgpu::BlendOperation::Add,
    },
};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
struct TextUniform {
    viewport: [f32; 2],
    _padding: [f32; 2],
    tint: [f32; 4],
}

/// wgpu backend: uploads the source frame, copies it into the render target
/// with a full-screen triangle, then blends each glyph chunk from its own
/// vertex buffer before reading the target back.
pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    width: u32,
    height: u32,
    source_texture: wgpu::Texture,
    output_texture: wgpu::Texture,
    output_view: wgpu::TextureView,
    readback_buffer: wgpu::Buffer,
    unpadded_bytes_per_row: u32,
    padded_bytes_per_row: u32,
    blit_pipeline: wgpu::RenderPipeline,
    blit_bind_group: wgpu::BindGroup,
    text_pipeline: wgpu::RenderPipeline,
    text_bind_group: wgpu::BindGroup,
    uniform_buffer: wgpu::Buffer,
    last_uniform: Option<TextUniform>,
    chunk_capacity: u64,
    chunk_buffers: Vec<wgpu::Buffer>,
    pending_draws: Vec<u32>,
    frame_open: bool,
}

impl GpuBackend {
    pub fn new_blocking(
        atlas: &GlyphAtlas,
        width: u32,
        height: u32,
        max_chunk_bytes: usize,
    ) -> CaptionResult<Self> {
        pollster::block_on(Self::new(atlas, width, height, max_chunk_bytes))
    }

    pub async fn new(
        atlas: &GlyphAtlas,
        width: u32,
        height: u32,
        max_chunk_bytes: usize,
    ) -> CaptionResult<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| CaptionError::renderer_init("no suitable GPU adapter found"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("caption-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|error| {
                CaptionError::renderer_init(format!("failed to request wgpu device: {error}"))
            })?;

        let max_dimension = device.limits().max_texture_dimension_2d;
        for (what, w, h) in [
            ("frame", width, height),
            ("glyph atlas", atlas.width(), atlas.height()),
        ] {
            if w == 0 || h == 0 || w > max_dimension || h > max_dimension {
                return Err(CaptionError::renderer_init(format!(
                    "{what} size {w}x{h} is outside the device limit of {max_dimension}"
                )));
            }
        }

        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let source_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("caption-source-frame"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let source_view = source_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let output_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("caption-render-target"),
            size: extent(width, height),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let output_view = output_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let unpadded_bytes_per_row = width.checked_mul(4).ok_or_else(|| {
            CaptionError::renderer_init("frame width overflow when computing row bytes")
        })?;
        let padded_bytes_per_row =
            align_to(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("caption-readback-buffer"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let atlas_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("caption-glyph-atlas"),
            size: extent(atlas.width(), atlas.height()),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        write_rgba(&queue, &atlas_texture, atlas.pixels(), atlas.width(), atlas.height())?;
        let atlas_view = atlas_texture.create_view(&wgpu::TextureViewDescriptor::default());

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("caption-atlas-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("caption-text-uniform"),
            size: std::mem::size_of::<TextUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let blit_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("caption-blit-bind-group-layout"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                }],
            });

        let text_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("caption-text-bind-group-layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: wgpu::BufferSize::new(
                                std::mem::size_of::<TextUniform>() as u64,
                            ),
                        },
                        count: None,
                    },
                ],
            });

        let blit_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("caption-blit-bind-group"),
            layout: &blit_bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&source_view),
            }],
        });

        let text_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("caption-text-bind-group"),
            layout: &text_bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&atlas_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let blit_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("caption-blit-shader"),
            source: wgpu::ShaderSource::Wgsl(BLIT_SHADER.into()),
        });
        let text_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("caption-text-shader"),
            source: wgpu::ShaderSource::Wgsl(TEXT_SHADER.into()),
        });

        let blit_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("caption-blit-pipeline-layout"),
                bind_group_layouts: &[&blit_bind_group_layout],
                push_constant_ranges: &[],
            });

        let blit_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("caption-blit-pipeline"),
            layout: Some(&blit_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &blit_shader,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &blit_shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
        });

        let text_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("caption-text-pipeline-layout"),
                bind_group_layouts: &[&text_bind_group_layout],
                push_constant_ranges: &[],
            });

        let text_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("caption-text-pipeline"),
            layout: Some(&text_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &text_shader,
                entry_point: "vs_main",
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: VERTEX_STRIDE as wgpu::BufferAddress,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2],
                }],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &text_shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(CAPTION_BLEND),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
        });

        if let Some(error) = device.pop_error_scope().await {
            return Err(CaptionError::renderer_init(format!(
                "failed to build caption pipelines: {error}"
            )));
        }

        let info = adapter.get_info();
        info!(
            adapter = %info.name,
            backend = ?info.backend,
            width,
            height,
            "initialized GPU compositor"
        );

        Ok(Self {
            device,
            queue,
            width,
            height,
            source_texture,
            output_texture,
            output_view,
            readback_buffer,
            unpadded_bytes_per_row,
            padded_bytes_per_row,
            blit_pipeline,
            blit_bind_group,
            text_pipeline,
            text_bind_group,
            uniform_buffer,
            last_uniform: None,
            chunk_capacity: max_chunk_bytes as u64,
            chunk_buffers: Vec::new(),
            pending_draws: Vec::new(),
            frame_open: false,
        })
    }

    fn ensure_chunk_buffers(&mut self, count: usize) {
        while self.chunk_buffers.len() < count {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("caption-glyph-chunk"),
                size: self.chunk_capacity,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.chunk_buffers.push(buffer);
            debug!(pooled = self.chunk_buffers.len(), "allocated glyph chunk buffer");
        }
    }

    fn submit(&mut self) -> CaptionResult<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("caption-render-encoder"),
            });

        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("caption-render-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.output_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            render_pass.set_pipeline(&self.blit_pipeline);
            render_pass.set_bind_group(0, &self.blit_bind_group, &[]);
            render_pass.draw(0..3, 0..1);

            if !self.pending_draws.is_empty() {
                render_pass.set_pipeline(&self.text_pipeline);
                render_pass.set_bind_group(0, &self.text_bind_group, &[]);
                for (buffer, &count) in self.chunk_buffers.iter().zip(&self.pending_draws) {
                    let bytes = u64::from(count) * VERTEX_STRIDE as u64;
                    render_pass.set_vertex_buffer(0, buffer.slice(..bytes));
                    render_pass.draw(0..count, 0..1);
                }
            }
        }

        let padded_bytes_per_row = NonZeroU32::new(self.padded_bytes_per_row).ok_or_else(|| {
            CaptionError::frame_buffer(format!("invalid padded row size {}", self.padded_bytes_per_row))
        })?;
        let rows_per_image = NonZeroU32::new(self.height).ok_or_else(|| {
            CaptionError::frame_buffer(format!("invalid render height {}", self.height))
        })?;

        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.output_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.readback_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row.get()),
                    rows_per_image: Some(rows_per_image.get()),
                },
            },
            extent(self.width, self.height),
        );

        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_buffer(&mut self) -> CaptionResult<Vec<u8>> {
        let buffer_slice = self.readback_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();

        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| CaptionError::frame_buffer("failed receiving GPU map callback"))?
            .map_err(|error| CaptionError::frame_buffer(format!("GPU buffer mapping failed: {error}")))?;

        let mapped = buffer_slice.get_mapped_range();
        let mut frame = vec![0_u8; (self.unpadded_bytes_per_row * self.height) as usize];

        for (row_index, chunk) in mapped
            .chunks(self.padded_bytes_per_row as usize)
            .take(self.height as usize)
            .enumerate()
        {
            let dst_start = row_index * self.unpadded_bytes_per_row as usize;
            let dst_end = dst_start + self.unpadded_bytes_per_row as usize;
            frame[dst_start..dst_end]
                .copy_from_slice(&chunk[..self.unpadded_bytes_per_row as usize]);
        }

        drop(mapped);
        self.readback_buffer.unmap();
        Ok(frame)
    }
}

impl CompositeBackend for GpuBackend {
    fn label(&self) -> &'static str {
        "gpu"
    }

    fn begin_frame(&mut self, rgba: &[u8], tint: Rgba) -> CaptionResult<()> {
        let expected = self.width as usize * self.height as usize * 4;
        if rgba.len() != expected {
            return Err(CaptionError::frame_buffer(format!(
                "frame is {} bytes, render target {}x{} needs {}",
                rgba.len(),
                self.width,
                self.height,
                expected
            )));
        }
        write_rgba(&self.queue, &self.source_texture, rgba, self.width, self.height)?;

        let uniform = TextUniform {
            viewport: [self.width as f32, self.height as f32],
            _padding: [0.0; 2],
            tint: tint.as_array(),
        };
        if self.last_uniform != Some(uniform) {
            self.queue
                .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniform));
            self.last_uniform = Some(uniform);
        }

        self.pending_draws.clear();
        self.frame_open = true;
        Ok(())
    }

    fn draw(&mut self, chunk: &[Vertex]) -> CaptionResult<()> {
        if !self.frame_open {
            return Err(CaptionError::frame_buffer("draw issued outside of a frame"));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        let bytes = bytemuck::cast_slice::<Vertex, u8>(chunk);
        if bytes.len() as u64 > self.chunk_capacity {
            return Err(CaptionError::frame_buffer(format!(
                "glyph chunk of {} bytes exceeds the {} byte draw limit",
                bytes.len(),
                self.chunk_capacity
            )));
        }
        let count = u32::try_from(chunk.len())
            .map_err(|_| CaptionError::frame_buffer("glyph chunk vertex count overflow"))?;
        let index = self.pending_draws.len();
        self.ensure_chunk_buffers(index + 1);
        self.queue.write_buffer(&self.chunk_buffers[index], 0, bytes);
        self.pending_draws.push(count);
        Ok(())
    }

    fn finish_frame(&mut self) -> CaptionResult<Vec<u8>> {
        if !self.frame_open {
            return Err(CaptionError::frame_buffer("finish_frame without begin_frame"));
        }
        self.frame_open = false;
        self.submit()?;
        self.read_buffer()
    }
}

fn write_rgba(
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    pixels: &[u8],
    width: u32,
    height: u32,
) -> CaptionResult<()> {
    let bytes_per_row = NonZeroU32::new(width.saturating_mul(4))
        .ok_or_else(|| CaptionError::frame_buffer(format!("invalid texture width {width}")))?;
    let rows_per_image = NonZeroU32::new(height)
        .ok_or_else(|| CaptionError::frame_buffer(format!("invalid texture height {height}")))?;

    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        pixels,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(bytes_per_row.get()),
            rows_per_image: Some(rows_per_image.get()),
        },
        extent(width, height),
    );
    Ok(())
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}
