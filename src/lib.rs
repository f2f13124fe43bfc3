//! Caption timing and glyph-atlas compositing for burning captions into video.

pub mod audio;
pub mod compositor;
pub mod config;
pub mod decoding;
pub mod encoding;
pub mod error;
pub mod font_assets;
pub mod glyph_atlas;
pub mod logging;
pub mod media_time;
pub mod mesh;
pub mod orientation;
pub mod pipeline;
pub mod segment;
pub mod style;
pub mod time_mapper;

pub use compositor::{CompositeBackend, CompositedFrame, RenderJob, RenderJobSetup, SourceFrame};
pub use error::{CaptionError, CaptionResult, PipelineError, PipelineStage};
pub use glyph_atlas::GlyphAtlas;
pub use media_time::MediaTime;
pub use segment::{CaptionSegment, RecognizedSpan, SegmentTrack};
pub use style::{Rgba, SubtitleStyle};
pub use time_mapper::SegmentTimeMapper;
