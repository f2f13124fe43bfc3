//! Per-frame caption compositing.
//!
//! A [`RenderJob`] owns everything one export needs: the backend (GPU device,
//! queue and pipelines, or the CPU rasterizer), the shared read-only glyph
//! atlas, the style, the sorted segment track and the asset's orientation.
//! It is driven with one [`RenderJob::composite`] call per frame, in strictly
//! increasing timestamp order, and nothing in it is shared mutably across jobs.

mod gpu;
mod software;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub use gpu::GpuBackend;
pub use software::SoftwareBackend;

use crate::error::{CaptionError, CaptionResult};
use crate::glyph_atlas::GlyphAtlas;
use crate::media_time::MediaTime;
use crate::mesh::{draw_chunks, max_chunk_vertices, Alignment, Vertex, Viewport, VERTICES_PER_GLYPH};
use crate::orientation::{to_display_rgba, Orientation, PixelFormat};
use crate::segment::{CaptionSegment, SegmentTrack};
use crate::style::{Rgba, SubtitleStyle};

/// Draw target for one job. Frames are bracketed by `begin_frame` and
/// `finish_frame`; every `draw` in between issues exactly one draw call.
pub trait CompositeBackend: Send {
    fn label(&self) -> &'static str;

    /// Loads the display-oriented RGBA source frame as the render target contents.
    fn begin_frame(&mut self, rgba: &[u8], tint: Rgba) -> CaptionResult<()>;

    /// Blends one chunk of glyph triangles over the target.
    fn draw(&mut self, chunk: &[Vertex]) -> CaptionResult<()>;

    /// Returns the composited RGBA frame once all draws have completed.
    fn finish_frame(&mut self) -> CaptionResult<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Gpu,
    Software,
}

/// Caption placement relative to the frame.
///
/// The display scale is `(H + R/2) / (1.5 R)` for frame height `H` and
/// reference height `R`: exactly 1.0 at the reference height, shrinking
/// more slowly than `H` below it so small frames keep readable captions.
/// The bottom line's baseline sits `H * bottom_margin_fraction` plus
/// `font_size * scale * descent_factor` above the bottom edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LayoutConfig {
    pub side_margin: f32,
    pub reference_height: u32,
    pub bottom_margin_fraction: f32,
    pub descent_factor: f32,
    pub line_spacing: f32,
    pub alignment: Alignment,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            side_margin: 16.0,
            reference_height: 1920,
            bottom_margin_fraction: 0.05,
            descent_factor: 0.8,
            line_spacing: 1.2,
            alignment: Alignment::Center,
        }
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reference_height == 0 {
            anyhow::bail!("layout.reference_height must be > 0");
        }
        if !self.side_margin.is_finite() || self.side_margin < 0.0 {
            anyhow::bail!("layout.side_margin must be >= 0");
        }
        if !(0.0..1.0).contains(&self.bottom_margin_fraction) {
            anyhow::bail!("layout.bottom_margin_fraction must be within [0, 1)");
        }
        if !self.descent_factor.is_finite() || self.descent_factor < 0.0 {
            anyhow::bail!("layout.descent_factor must be >= 0");
        }
        if !self.line_spacing.is_finite() || self.line_spacing <= 0.0 {
            anyhow::bail!("layout.line_spacing must be > 0");
        }
        Ok(())
    }

    pub fn display_scale(&self, frame_height: u32) -> f32 {
        let reference = self.reference_height as f32;
        (frame_height as f32 + reference / 2.0) / (reference * 1.5)
    }

    pub fn bottom_baseline(&self, frame_height: u32, font_size: f32) -> f32 {
        let height = frame_height as f32;
        let scale = self.display_scale(frame_height);
        height - height * self.bottom_margin_fraction - font_size * scale * self.descent_factor
    }
}

/// A decoded frame in stored orientation.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub timestamp: MediaTime,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub segment_id: Option<Uuid>,
    pub vertex_count: usize,
    pub chunk_sizes: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct CompositedFrame {
    pub timestamp: MediaTime,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub stats: FrameStats,
}

/// Everything a [`RenderJob`] is set up from, besides its backend.
#[derive(Debug, Clone)]
pub struct RenderJobSetup {
    pub atlas: Arc<GlyphAtlas>,
    pub style: SubtitleStyle,
    pub segments: Vec<CaptionSegment>,
    pub layout: LayoutConfig,
    pub max_chunk_bytes: usize,
    pub orientation: Orientation,
    /// Stored (pre-rotation) frame size.
    pub natural_size: (u32, u32),
    /// Composition frame rate. Fades are sampled mid-frame; 0 samples at the timestamp.
    pub fps: u32,
}

impl RenderJobSetup {
    pub fn render_size(&self) -> (u32, u32) {
        self.orientation.render_size(self.natural_size)
    }
}

pub struct RenderJob {
    backend: Box<dyn CompositeBackend>,
    atlas: Arc<GlyphAtlas>,
    style: SubtitleStyle,
    track: SegmentTrack,
    layout: LayoutConfig,
    orientation: Orientation,
    natural_size: (u32, u32),
    render_size: (u32, u32),
    max_vertices: usize,
    half_frame: f64,
    last_timestamp: Option<MediaTime>,
}

impl RenderJob {
    pub fn new(backend: Box<dyn CompositeBackend>, setup: RenderJobSetup) -> CaptionResult<Self> {
        let max_vertices = max_chunk_vertices(setup.max_chunk_bytes);
        if max_vertices < VERTICES_PER_GLYPH {
            return Err(CaptionError::renderer_init(format!(
                "max_chunk_bytes {} cannot hold a single glyph",
                setup.max_chunk_bytes
            )));
        }
        let (width, height) = setup.natural_size;
        if width == 0 || height == 0 {
            return Err(CaptionError::renderer_init(format!(
                "asset natural size {}x{} is empty",
                width, height
            )));
        }
        let render_size = setup.render_size();
        let track = SegmentTrack::new(setup.segments);
        info!(
            backend = backend.label(),
            width = render_size.0,
            height = render_size.1,
            segments = track.len(),
            orientation = ?setup.orientation,
            "render job ready"
        );
        Ok(Self {
            backend,
            atlas: setup.atlas,
            style: setup.style,
            track,
            layout: setup.layout,
            orientation: setup.orientation,
            natural_size: setup.natural_size,
            render_size,
            max_vertices,
            half_frame: if setup.fps > 0 {
                0.5 / f64::from(setup.fps)
            } else {
                0.0
            },
            last_timestamp: None,
        })
    }

    /// Job on the wgpu backend; fails with `RendererInit` when no device is usable.
    pub fn gpu(setup: RenderJobSetup) -> CaptionResult<Self> {
        let (width, height) = setup.render_size();
        let backend = GpuBackend::new_blocking(&setup.atlas, width, height, setup.max_chunk_bytes)?;
        Self::new(Box::new(backend), setup)
    }

    pub fn software(setup: RenderJobSetup) -> CaptionResult<Self> {
        let (width, height) = setup.render_size();
        let backend = SoftwareBackend::new(Arc::clone(&setup.atlas), width, height)?;
        Self::new(Box::new(backend), setup)
    }

    pub fn with_backend_kind(kind: BackendKind, setup: RenderJobSetup) -> CaptionResult<Self> {
        match kind {
            BackendKind::Gpu => Self::gpu(setup),
            BackendKind::Software => Self::software(setup),
        }
    }

    pub fn backend_label(&self) -> &'static str {
        self.backend.label()
    }

    pub fn render_size(&self) -> (u32, u32) {
        self.render_size
    }

    pub fn track(&self) -> &SegmentTrack {
        &self.track
    }

    pub fn active_segment(&self, t: MediaTime) -> Option<&CaptionSegment> {
        self.track.active_at(t)
    }

    /// Full vertex list for `text` on a frame of the job's render size.
    pub fn caption_mesh(&self, text: &str) -> Vec<Vertex> {
        let (width, height) = self.render_size;
        let scale = self.layout.display_scale(height);
        let max_line_width = width as f32 - self.layout.side_margin * 2.0;
        let lines = self.atlas.wrap(text, max_line_width, scale);
        let line_height = self.atlas.line_height(scale, self.layout.line_spacing);
        let viewport = Viewport::new(width, height);

        let mut baseline = self.layout.bottom_baseline(height, self.style.font_size);
        let mut vertices = Vec::new();
        for line in lines.iter().rev() {
            vertices.extend(self.atlas.layout(
                line,
                viewport,
                baseline,
                scale,
                self.layout.alignment,
            ));
            baseline -= line_height;
        }
        vertices
    }

    /// Text alpha multiplier for the fade in/out at time `t`.
    fn fade_factor(&self, segment: &CaptionSegment, t: MediaTime) -> f32 {
        let transition = self.style.transition_duration;
        if transition <= 0.0 {
            return 1.0;
        }
        let length = segment.end().seconds() - segment.start().seconds();
        let ramp = transition.min(length / 2.0);
        if ramp <= 0.0 {
            return 1.0;
        }
        let (Some(since_start), Some(until_end)) =
            (t.checked_sub(&segment.start()), segment.end().checked_sub(&t))
        else {
            return 1.0;
        };
        let since_start = since_start.seconds() + self.half_frame;
        let until_end = until_end.seconds() - self.half_frame;
        (since_start.min(until_end) / ramp).clamp(0.0, 1.0) as f32
    }

    pub fn composite(&mut self, frame: &SourceFrame) -> CaptionResult<CompositedFrame> {
        if let Some(previous) = self.last_timestamp {
            if frame.timestamp <= previous {
                return Err(CaptionError::frame_buffer(format!(
                    "frame at {} arrived after frame at {}; frames must be strictly increasing",
                    frame.timestamp, previous
                )));
            }
        }
        if (frame.width, frame.height) != self.natural_size {
            return Err(CaptionError::frame_buffer(format!(
                "source frame is {}x{} but the job was set up for {}x{}",
                frame.width, frame.height, self.natural_size.0, self.natural_size.1
            )));
        }

        let (width, height, display) = to_display_rgba(
            &frame.pixels,
            frame.width,
            frame.height,
            frame.format,
            self.orientation,
        )?;

        let active = self
            .track
            .active_at(frame.timestamp)
            .map(|segment| (segment.id(), segment.text().to_owned(), self.fade_factor(segment, frame.timestamp)));

        let mut stats = FrameStats::default();
        let tint = match &active {
            Some((_, _, fade)) => self.style.text_color.with_alpha_scaled(*fade),
            None => self.style.text_color,
        };
        self.backend.begin_frame(&display, tint)?;

        if let Some((id, text, _)) = active {
            let vertices = self.caption_mesh(&text);
            stats.segment_id = Some(id);
            stats.vertex_count = vertices.len();
            for chunk in draw_chunks(&vertices, self.max_vertices) {
                self.backend.draw(chunk)?;
                stats.chunk_sizes.push(chunk.len());
            }
            debug!(
                timestamp = %frame.timestamp,
                vertices = stats.vertex_count,
                draws = stats.chunk_sizes.len(),
                "composited caption"
            );
        }

        let pixels = self.backend.finish_frame()?;
        self.last_timestamp = Some(frame.timestamp);
        Ok(CompositedFrame {
            timestamp: frame.timestamp,
            width,
            height,
            pixels,
            stats,
        })
    }
}
