mod common;

use caption_burn::compositor::{FrameStats, LayoutConfig};
use caption_burn::mesh::{Alignment, VERTICES_PER_GLYPH};
use caption_burn::orientation::{Orientation, PixelFormat};
use caption_burn::{
    CaptionError, CaptionSegment, MediaTime, RenderJob, RenderJobSetup, SourceFrame,
    SubtitleStyle,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;
const SOURCE_PIXEL: [u8; 4] = [10, 20, 30, 255];

fn segment(start_ms: i64, end_ms: i64, text: &str) -> CaptionSegment {
    CaptionSegment::new(MediaTime::new(start_ms, 1000), MediaTime::new(end_ms, 1000), text)
        .expect("valid segment")
}

fn setup(segments: Vec<CaptionSegment>) -> RenderJobSetup {
    let mut style = SubtitleStyle::default();
    style.font_size = 16.0;
    style.transition_duration = 0.0;
    RenderJobSetup {
        atlas: common::solid_atlas(),
        style,
        segments,
        // Reference height equal to the frame height keeps the display scale at 1.
        layout: LayoutConfig {
            reference_height: HEIGHT,
            ..LayoutConfig::default()
        },
        max_chunk_bytes: 4096,
        orientation: Orientation::Identity,
        natural_size: (WIDTH, HEIGHT),
        fps: 30,
    }
}

fn source_frame(ms: i64, width: u32, height: u32) -> SourceFrame {
    SourceFrame {
        timestamp: MediaTime::new(ms, 1000),
        width,
        height,
        format: PixelFormat::Rgba8,
        pixels: SOURCE_PIXEL.repeat((width * height) as usize),
    }
}

fn pixel(frame: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let offset = ((y * width + x) * 4) as usize;
    [
        frame[offset],
        frame[offset + 1],
        frame[offset + 2],
        frame[offset + 3],
    ]
}

fn x_extent(job: &RenderJob, text: &str) -> (f32, f32) {
    let mesh = job.caption_mesh(text);
    mesh.iter().fold((f32::MAX, f32::MIN), |(min, max), vertex| {
        (min.min(vertex.position[0]), max.max(vertex.position[0]))
    })
}

#[test]
fn long_captions_are_split_into_whole_glyph_chunks() {
    let text = vec!["AAAAA"; 60].join(" ");
    let mut job = RenderJob::software(setup(vec![segment(0, 5000, &text)])).expect("job");

    let frame = job.composite(&source_frame(100, WIDTH, HEIGHT)).expect("frame");
    let FrameStats {
        vertex_count,
        chunk_sizes,
        ..
    } = frame.stats;

    assert_eq!(vertex_count, 300 * VERTICES_PER_GLYPH);
    // 4096 bytes of 16-byte vertices, rounded down to whole glyphs.
    assert!(chunk_sizes.iter().all(|size| *size <= 252));
    assert!(chunk_sizes.iter().all(|size| size % VERTICES_PER_GLYPH == 0));
    assert_eq!(chunk_sizes.iter().sum::<usize>(), vertex_count);
    assert_eq!(chunk_sizes.len(), vertex_count.div_ceil(252));
}

#[test]
fn frames_without_an_active_segment_pass_through_unchanged() {
    let mut job = RenderJob::software(setup(vec![segment(1000, 2000, "Hello")])).expect("job");

    let before = job.composite(&source_frame(500, WIDTH, HEIGHT)).expect("frame");
    assert_eq!(before.stats, FrameStats::default());
    assert_eq!(before.pixels, SOURCE_PIXEL.repeat((WIDTH * HEIGHT) as usize));

    // End is exclusive.
    let after = job.composite(&source_frame(2000, WIDTH, HEIGHT)).expect("frame");
    assert!(after.stats.segment_id.is_none());
    assert_eq!(after.pixels, before.pixels);
}

#[test]
fn active_segment_is_drawn_in_the_text_color() {
    let caption = segment(0, 1000, "A");
    let id = caption.id();
    let mut job = RenderJob::software(setup(vec![caption])).expect("job");

    let frame = job.composite(&source_frame(0, WIDTH, HEIGHT)).expect("frame");
    assert_eq!(frame.stats.segment_id, Some(id));
    assert_eq!(frame.stats.chunk_sizes, vec![VERTICES_PER_GLYPH]);

    // The glyph is centred horizontally just above the bottom margin.
    assert_eq!(pixel(&frame.pixels, WIDTH, WIDTH / 2, 320), [255, 255, 255, 255]);
    assert_eq!(pixel(&frame.pixels, WIDTH, 10, 10), SOURCE_PIXEL);
    assert_eq!(pixel(&frame.pixels, WIDTH, WIDTH / 2, 100), SOURCE_PIXEL);
}

#[test]
fn earliest_start_wins_when_segments_overlap() {
    let first = segment(0, 3000, "first");
    let second = segment(1000, 2000, "second");
    let first_id = first.id();
    let job = RenderJob::software(setup(vec![second, first])).expect("job");

    let active = job.active_segment(MediaTime::new(1500, 1000)).expect("active");
    assert_eq!(active.id(), first_id);
    assert_eq!(job.track().overlaps(), vec![(0, 1)]);
}

#[test]
fn alignment_positions_the_line() {
    let mut layout_setup = setup(vec![]);
    layout_setup.layout.alignment = Alignment::Left;
    let left = RenderJob::software(layout_setup.clone()).expect("job");
    let (min, _) = x_extent(&left, "AAAA");
    assert_eq!(min, 0.0);

    layout_setup.layout.alignment = Alignment::Right;
    let right = RenderJob::software(layout_setup.clone()).expect("job");
    let (_, max) = x_extent(&right, "AAAA");
    assert!((max - WIDTH as f32).abs() < 1e-4);

    layout_setup.layout.alignment = Alignment::Center;
    let center = RenderJob::software(layout_setup).expect("job");
    let (min, max) = x_extent(&center, "AAAA");
    assert!(((min + max) / 2.0 - WIDTH as f32 / 2.0).abs() < 1e-4);
    assert!((max - min - 32.0).abs() < 1e-4);
}

#[test]
fn quarter_turn_assets_render_at_display_size() {
    let mut rotated = setup(vec![segment(0, 1000, "A")]);
    rotated.natural_size = (HEIGHT, WIDTH);
    rotated.orientation = Orientation::Rotate90;
    let mut job = RenderJob::software(rotated).expect("job");
    assert_eq!(job.render_size(), (WIDTH, HEIGHT));

    let frame = job.composite(&source_frame(0, HEIGHT, WIDTH)).expect("frame");
    assert_eq!((frame.width, frame.height), (WIDTH, HEIGHT));
    assert_eq!(frame.pixels.len(), (WIDTH * HEIGHT * 4) as usize);

    // Stored size is what the job expects, not the display size.
    let error = job
        .composite(&source_frame(40, WIDTH, HEIGHT))
        .expect_err("display-sized source");
    assert!(matches!(error, CaptionError::FrameBuffer { .. }));
}

#[test]
fn compositing_is_deterministic() {
    let segments = vec![segment(0, 2000, "Hello there"), segment(2000, 4000, "General")];
    let timestamps = [0, 33, 1999, 2000, 3000];

    let render = |segments: Vec<CaptionSegment>| {
        let mut job = RenderJob::software(setup(segments)).expect("job");
        timestamps
            .iter()
            .map(|ms| {
                job.composite(&source_frame(*ms, WIDTH, HEIGHT))
                    .expect("frame")
                    .pixels
            })
            .collect::<Vec<_>>()
    };

    assert_eq!(render(segments.clone()), render(segments));
}
