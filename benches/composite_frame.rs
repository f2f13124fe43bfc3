//! Per-frame caption compositing on the software backend.
//! Run: cargo bench
//!
//! The GPU backend is exercised by tests/gpu_smoke.rs.

use std::sync::Arc;

use caption_burn::compositor::LayoutConfig;
use caption_burn::glyph_atlas::{AtlasGrid, GlyphRasterizer, LineMetrics, RasterizedGlyph};
use caption_burn::mesh::Alignment;
use caption_burn::orientation::{Orientation, PixelFormat};
use caption_burn::{
    CaptionResult, CaptionSegment, GlyphAtlas, MediaTime, RenderJob, RenderJobSetup, SourceFrame,
    SubtitleStyle,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

struct BoxRasterizer;

impl GlyphRasterizer for BoxRasterizer {
    fn line_metrics(&self) -> CaptionResult<LineMetrics> {
        Ok(LineMetrics {
            ascent: 36.0,
            descent: -12.0,
        })
    }

    fn rasterize(&self, ch: char) -> Option<RasterizedGlyph> {
        let width = if ch == ' ' { 0 } else { 24 };
        Some(RasterizedGlyph {
            advance_width: 28.0,
            xmin: 2,
            ymin: 0,
            width,
            height: 30,
            coverage: vec![200; width * 30],
        })
    }
}

fn job(width: u32, height: u32) -> RenderJob {
    let grid = AtlasGrid::default();
    let atlas = Arc::new(GlyphAtlas::build(&BoxRasterizer, grid).expect("atlas"));
    let mut style = SubtitleStyle::default();
    style.transition_duration = 0.0;
    let segments = vec![CaptionSegment::new(
        MediaTime::zero(),
        MediaTime::new(1_000_000, 1),
        "The quick brown fox jumps over the lazy dog while the captions keep rolling",
    )
    .expect("segment")];
    RenderJob::software(RenderJobSetup {
        atlas,
        style,
        segments,
        layout: LayoutConfig {
            alignment: Alignment::Center,
            ..LayoutConfig::default()
        },
        max_chunk_bytes: 4096,
        orientation: Orientation::Identity,
        natural_size: (width, height),
        fps: 30,
    })
    .expect("render job")
}

fn bench_software_composite(c: &mut Criterion) {
    let (width, height) = (1280, 720);
    let mut render_job = job(width, height);
    let mut frame = SourceFrame {
        timestamp: MediaTime::zero(),
        width,
        height,
        format: PixelFormat::Bgra8,
        pixels: vec![64; (width * height * 4) as usize],
    };

    let mut group = c.benchmark_group("composite_frame");
    group.sample_size(30);

    let mut tick = 0_i64;
    group.bench_function("software_720p_caption", |b| {
        b.iter(|| {
            tick += 1;
            frame.timestamp = MediaTime::new(tick, 30);
            black_box(render_job.composite(&frame).expect("composite"))
        });
    });

    group.bench_function("caption_mesh_720p", |b| {
        b.iter(|| black_box(render_job.caption_mesh(black_box("Hello there, general captions"))));
    });

    group.finish();
}

criterion_group!(benches, bench_software_composite);
criterion_main!(benches);
