#![allow(dead_code)]

use std::sync::Arc;

use caption_burn::glyph_atlas::{AtlasGrid, GlyphRasterizer, LineMetrics, RasterizedGlyph};
use caption_burn::{CaptionResult, GlyphAtlas};

/// Every printable character is a solid `advance` x 10 block; space is 4px.
pub struct SolidRasterizer {
    pub advance: usize,
}

impl GlyphRasterizer for SolidRasterizer {
    fn line_metrics(&self) -> CaptionResult<LineMetrics> {
        Ok(LineMetrics {
            ascent: 12.0,
            descent: -4.0,
        })
    }

    fn rasterize(&self, ch: char) -> Option<RasterizedGlyph> {
        if ch == ' ' {
            return Some(RasterizedGlyph {
                advance_width: 4.0,
                xmin: 0,
                ymin: 0,
                width: 0,
                height: 0,
                coverage: Vec::new(),
            });
        }
        Some(RasterizedGlyph {
            advance_width: self.advance as f32,
            xmin: 0,
            ymin: 0,
            width: self.advance,
            height: 10,
            coverage: vec![255; self.advance * 10],
        })
    }
}

pub fn solid_atlas() -> Arc<GlyphAtlas> {
    let grid = AtlasGrid {
        columns: 16,
        rows: 6,
        cell_width: 16,
        cell_height: 20,
    };
    Arc::new(GlyphAtlas::build(&SolidRasterizer { advance: 8 }, grid).expect("atlas builds"))
}
