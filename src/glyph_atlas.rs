use anyhow::{bail, Result};
use image::{ImageBuffer, Rgba as ImageRgba, RgbaImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CaptionError, CaptionResult};
use crate::font_assets::FontdueRasterizer;
use crate::mesh::{push_quad, Alignment, Vertex, Viewport};
use crate::style::SubtitleStyle;

pub const ASCII_START: u8 = 32;
pub const ASCII_END: u8 = 126;
pub const GLYPH_COUNT: usize = (ASCII_END - ASCII_START + 1) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AtlasGrid {
    pub columns: u32,
    pub rows: u32,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl Default for AtlasGrid {
    fn default() -> Self {
        Self {
            columns: 16,
            rows: 6,
            cell_width: 64,
            cell_height: 64,
        }
    }
}

impl AtlasGrid {
    pub fn validate(&self) -> Result<()> {
        if self.columns == 0 || self.rows == 0 {
            bail!("atlas grid must have at least one column and row");
        }
        if self.cell_width == 0 || self.cell_height == 0 {
            bail!("atlas cells must be positive, got {}x{}", self.cell_width, self.cell_height);
        }
        let cells = u64::from(self.columns) * u64::from(self.rows);
        if cells < GLYPH_COUNT as u64 {
            bail!(
                "atlas grid {}x{} holds {} cells but {} glyphs are required",
                self.columns,
                self.rows,
                cells,
                GLYPH_COUNT
            );
        }
        Ok(())
    }

    pub fn with_cell(self, cell_width: u32, cell_height: u32) -> Self {
        Self {
            cell_width,
            cell_height,
            ..self
        }
    }

    pub fn texture_width(&self) -> u32 {
        self.columns * self.cell_width
    }

    pub fn texture_height(&self) -> u32 {
        self.rows * self.cell_height
    }
}

/// Pixel rectangle of one glyph's box inside the atlas texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlyphRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Vertical font metrics in pixels; `descent` is negative below the baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineMetrics {
    pub ascent: f32,
    pub descent: f32,
}

/// Coverage bitmap for one character. `xmin`/`ymin` place the bitmap's
/// bottom-left corner relative to the pen position on the baseline, y up.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterizedGlyph {
    pub advance_width: f32,
    pub xmin: i32,
    pub ymin: i32,
    pub width: usize,
    pub height: usize,
    pub coverage: Vec<u8>,
}

/// Rasterization backend the atlas is built from.
pub trait GlyphRasterizer {
    fn line_metrics(&self) -> CaptionResult<LineMetrics>;

    /// `None` when the font has no glyph for `ch`.
    fn rasterize(&self, ch: char) -> Option<RasterizedGlyph>;
}

/// One texture holding ASCII 32..=126 on a fixed grid, plus each glyph's box.
///
/// A glyph box spans the union of the pen advance and the drawn bitmap
/// horizontally, and the font's full ascent-to-descent height vertically, so
/// boxes placed side by side on a common baseline reproduce the font's
/// spacing without the empty cell padding around them.
#[derive(Debug, Clone)]
pub struct GlyphAtlas {
    grid: AtlasGrid,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    boxes: [Option<GlyphRect>; GLYPH_COUNT],
}

impl GlyphAtlas {
    pub fn build(rasterizer: &dyn GlyphRasterizer, grid: AtlasGrid) -> CaptionResult<Self> {
        grid.validate()
            .map_err(|error| CaptionError::rasterization(error.to_string()))?;

        let metrics = rasterizer.line_metrics()?;
        let ascent = metrics.ascent.ceil() as i32;
        let descent = (-metrics.descent).ceil().max(0.0) as i32;
        let box_height = ascent + descent;
        if box_height <= 0 {
            return Err(CaptionError::rasterization(format!(
                "font reports non-positive line height (ascent {}, descent {})",
                metrics.ascent, metrics.descent
            )));
        }
        if box_height as u32 > grid.cell_height {
            return Err(CaptionError::rasterization(format!(
                "font line height {}px exceeds {}px atlas cell",
                box_height, grid.cell_height
            )));
        }

        let width = grid.texture_width();
        let height = grid.texture_height();
        let mut pixels = vec![0_u8; width as usize * height as usize * 4];
        let mut boxes = [None; GLYPH_COUNT];

        for code in ASCII_START..=ASCII_END {
            let ch = char::from(code);
            let Some(glyph) = rasterizer.rasterize(ch) else {
                continue;
            };
            let index = usize::from(code - ASCII_START);
            let col = index as u32 % grid.columns;
            let row = index as u32 / grid.columns;

            let left = glyph.xmin.min(0);
            let right = (glyph.advance_width.ceil() as i32).max(glyph.xmin + glyph.width as i32);
            let box_width = (right - left).max(0);
            if box_width as u32 > grid.cell_width {
                return Err(CaptionError::rasterization(format!(
                    "glyph '{}' is {}px wide which exceeds {}px atlas cell",
                    ch, box_width, grid.cell_width
                )));
            }

            let box_x = col * grid.cell_width + (grid.cell_width - box_width as u32) / 2;
            let box_y = row * grid.cell_height + (grid.cell_height - box_height as u32) / 2;
            let pen_x = box_x as i32 - left;
            let baseline_y = box_y as i32 + ascent;
            let bitmap_left = pen_x + glyph.xmin;
            let bitmap_top = baseline_y - (glyph.ymin + glyph.height as i32);

            let cell_x0 = (col * grid.cell_width) as i32;
            let cell_y0 = (row * grid.cell_height) as i32;
            let cell_x1 = cell_x0 + grid.cell_width as i32;
            let cell_y1 = cell_y0 + grid.cell_height as i32;

            for y in 0..glyph.height {
                for x in 0..glyph.width {
                    let alpha = glyph.coverage[y * glyph.width + x];
                    if alpha == 0 {
                        continue;
                    }
                    let px = bitmap_left + x as i32;
                    let py = bitmap_top + y as i32;
                    if px < cell_x0 || px >= cell_x1 || py < cell_y0 || py >= cell_y1 {
                        continue;
                    }
                    let offset = (py as usize * width as usize + px as usize) * 4;
                    pixels[offset..offset + 4].copy_from_slice(&[255, 255, 255, alpha]);
                }
            }

            boxes[index] = Some(GlyphRect {
                x: box_x,
                y: box_y,
                width: box_width as u32,
                height: box_height as u32,
            });
        }

        let present = boxes.iter().filter(|slot| slot.is_some()).count();
        if present == 0 {
            return Err(CaptionError::rasterization(
                "font produced no glyphs in ASCII 32..=126",
            ));
        }
        debug!(width, height, glyphs = present, "built glyph atlas");

        Ok(Self {
            grid,
            width,
            height,
            pixels,
            boxes,
        })
    }

    /// Builds the atlas for `style` by rasterizing its font with fontdue.
    pub fn for_style(style: &SubtitleStyle, grid: AtlasGrid) -> CaptionResult<Self> {
        let rasterizer = FontdueRasterizer::for_style(style)?;
        Self::build(&rasterizer, grid)
    }

    pub fn grid(&self) -> AtlasGrid {
        self.grid
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// RGBA8 texels: white, with glyph coverage in alpha.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn glyph(&self, ch: char) -> Option<GlyphRect> {
        let code = u8::try_from(u32::from(ch)).ok()?;
        if !(ASCII_START..=ASCII_END).contains(&code) {
            return None;
        }
        self.boxes[usize::from(code - ASCII_START)]
    }

    pub fn line_height(&self, scale: f32, spacing: f32) -> f32 {
        self.grid.cell_height as f32 * scale * spacing
    }

    /// Sum of glyph box widths times `scale`; unsupported characters add nothing.
    pub fn text_width(&self, text: &str, scale: f32) -> f32 {
        text.chars()
            .filter_map(|ch| self.glyph(ch))
            .map(|rect| rect.width as f32 * scale)
            .sum()
    }

    /// Greedy word wrap.
    ///
    /// Explicit newlines always break. Words are appended to the current line
    /// until `width + space + word` would exceed `max_width`; a word wider than
    /// `max_width` on its own still gets a line to itself.
    pub fn wrap(&self, text: &str, max_width: f32, scale: f32) -> Vec<String> {
        let space_width = self.text_width(" ", scale);
        let mut lines = Vec::new();

        for raw_line in text.split('\n') {
            let mut current = String::new();
            let mut current_width = 0.0_f32;

            for word in raw_line.split(' ').filter(|word| !word.is_empty()) {
                let word_width = self.text_width(word, scale);
                if !current.is_empty() && current_width + space_width + word_width > max_width {
                    lines.push(std::mem::take(&mut current));
                    current_width = 0.0;
                }
                if !current.is_empty() {
                    current.push(' ');
                    current_width += space_width;
                }
                current.push_str(word);
                current_width += word_width;
            }
            lines.push(current);
        }

        lines
    }

    /// Glyph quads for one line, glyphs growing upward from `baseline_y`.
    pub fn layout(
        &self,
        line: &str,
        viewport: Viewport,
        baseline_y: f32,
        scale: f32,
        alignment: Alignment,
    ) -> Vec<Vertex> {
        let line_width = self.text_width(line, scale);
        let mut pen_x = match alignment {
            Alignment::Left => 0.0,
            Alignment::Center => (viewport.width - line_width) / 2.0,
            Alignment::Right => viewport.width - line_width,
        };

        let texture_width = self.width as f32;
        let texture_height = self.height as f32;
        let mut vertices = Vec::with_capacity(line.len() * crate::mesh::VERTICES_PER_GLYPH);
        for ch in line.chars() {
            let Some(rect) = self.glyph(ch) else {
                continue;
            };
            let glyph_width = rect.width as f32 * scale;
            let glyph_height = rect.height as f32 * scale;
            let uv = [
                rect.x as f32 / texture_width,
                rect.y as f32 / texture_height,
                (rect.x + rect.width) as f32 / texture_width,
                (rect.y + rect.height) as f32 / texture_height,
            ];
            push_quad(
                &mut vertices,
                [pen_x, baseline_y - glyph_height, pen_x + glyph_width, baseline_y],
                uv,
            );
            pen_x += glyph_width;
        }
        vertices
    }

    pub fn to_image(&self) -> Result<RgbaImage> {
        ImageBuffer::<ImageRgba<u8>, _>::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow::anyhow!("atlas pixel buffer does not match its dimensions"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Fixed-metric rasterizer: every printable glyph is a solid block of
    /// `advance` pixels, except characters listed in `missing`.
    pub(crate) struct BlockRasterizer {
        pub advance: usize,
        pub space_advance: usize,
        pub missing: &'static str,
    }

    impl GlyphRasterizer for BlockRasterizer {
        fn line_metrics(&self) -> CaptionResult<LineMetrics> {
            Ok(LineMetrics {
                ascent: 12.0,
                descent: -4.0,
            })
        }

        fn rasterize(&self, ch: char) -> Option<RasterizedGlyph> {
            if self.missing.contains(ch) {
                return None;
            }
            if ch == ' ' {
                return Some(RasterizedGlyph {
                    advance_width: self.space_advance as f32,
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

    pub(crate) fn block_atlas() -> GlyphAtlas {
        let rasterizer = BlockRasterizer {
            advance: 8,
            space_advance: 4,
            missing: "~",
        };
        GlyphAtlas::build(
            &rasterizer,
            AtlasGrid {
                columns: 16,
                rows: 6,
                cell_width: 16,
                cell_height: 20,
            },
        )
        .expect("block atlas builds")
    }

    #[test]
    fn boxes_are_tight_and_inside_their_cells() {
        let atlas = block_atlas();
        let a = atlas.glyph('A').expect("A present");
        assert_eq!((a.width, a.height), (8, 16));
        let index = (b'A' - ASCII_START) as u32;
        let cell_x = (index % 16) * 16;
        let cell_y = (index / 16) * 20;
        assert!(a.x >= cell_x && a.x + a.width <= cell_x + 16);
        assert!(a.y >= cell_y && a.y + a.height <= cell_y + 20);
        assert_eq!(atlas.glyph(' ').map(|r| r.width), Some(4));
    }

    #[test]
    fn unsupported_characters_have_no_box() {
        let atlas = block_atlas();
        assert!(atlas.glyph('~').is_none());
        assert!(atlas.glyph('é').is_none());
        assert!(atlas.glyph('\n').is_none());
        assert_eq!(atlas.text_width("A~é", 1.0), 8.0);
    }

    #[test]
    fn glyph_pixels_land_on_the_baseline() {
        let atlas = block_atlas();
        let a = atlas.glyph('A').expect("A present");
        // ascent 12: ink rows are the 10 rows directly above the baseline.
        let baseline = a.y + 12;
        let alpha = |x: u32, y: u32| atlas.pixels()[((y * atlas.width() + x) * 4 + 3) as usize];
        assert_eq!(alpha(a.x, baseline - 1), 255);
        assert_eq!(alpha(a.x, baseline - 10), 255);
        assert_eq!(alpha(a.x, baseline - 11), 0);
        assert_eq!(alpha(a.x, baseline), 0);
    }

    #[test]
    fn oversized_glyphs_fail_the_build() {
        let rasterizer = BlockRasterizer {
            advance: 40,
            space_advance: 4,
            missing: "",
        };
        let result = GlyphAtlas::build(&rasterizer, AtlasGrid::default().with_cell(32, 32));
        assert!(matches!(result, Err(CaptionError::Rasterization { .. })));
    }

    #[test]
    fn grid_too_small_for_the_character_set_fails() {
        let rasterizer = BlockRasterizer {
            advance: 8,
            space_advance: 4,
            missing: "",
        };
        let grid = AtlasGrid {
            columns: 8,
            rows: 8,
            ..AtlasGrid::default()
        };
        assert!(GlyphAtlas::build(&rasterizer, grid).is_err());
    }

    #[test]
    fn wrap_breaks_greedily_and_honours_newlines() {
        let atlas = block_atlas();
        // "ab" = 16px, space = 4px.
        let lines = atlas.wrap("ab ab ab\nab", 36.0, 1.0);
        assert_eq!(lines, vec!["ab ab", "ab", "ab"]);
        assert_eq!(atlas.wrap("", 10.0, 1.0), vec![""]);
        assert_eq!(atlas.wrap("a  b", 100.0, 1.0), vec!["a b"]);
    }

    #[test]
    fn overlong_word_keeps_its_own_line() {
        let atlas = block_atlas();
        let lines = atlas.wrap("a abcdefgh b", 20.0, 1.0);
        assert_eq!(lines, vec!["a", "abcdefgh", "b"]);
    }

    proptest! {
        #[test]
        fn wrapped_lines_fit_unless_a_single_word_overflows(
            text in "[a-zA-Z~ \n]{0,120}",
            max_width in 1.0_f32..240.0,
            scale in 0.25_f32..2.0,
        ) {
            let atlas = block_atlas();
            for line in atlas.wrap(&text, max_width, scale) {
                let width = atlas.text_width(&line, scale);
                let single_word = !line.contains(' ');
                prop_assert!(
                    width <= max_width + 1e-3 || single_word,
                    "line {:?} is {}px wide, limit {}", line, width, max_width
                );
            }
        }

        #[test]
        fn wrap_keeps_every_word_in_order(
            text in "[a-z ]{0,120}",
            max_width in 1.0_f32..240.0,
        ) {
            let atlas = block_atlas();
            let original = text.split(' ').filter(|w| !w.is_empty()).collect::<Vec<_>>();
            let lines = atlas.wrap(&text, max_width, 1.0);
            let rewrapped = lines
                .iter()
                .flat_map(|line| line.split(' ').filter(|w| !w.is_empty()))
                .collect::<Vec<_>>();
            prop_assert_eq!(original, rewrapped);
        }

        #[test]
        fn wrap_is_a_pure_function_of_its_inputs(
            text in "[ -~\n]{0,120}",
            max_width in 1.0_f32..240.0,
            scale in 0.25_f32..2.0,
        ) {
            let atlas = block_atlas();
            prop_assert_eq!(
                atlas.wrap(&text, max_width, scale),
                atlas.wrap(&text, max_width, scale)
            );
        }
    }

    #[test]
    fn layout_alignment_offsets() {
        let atlas = block_atlas();
        let viewport = Viewport::new(100, 50);
        // "AB" is 16px wide.
        let left = atlas.layout("AB", viewport, 40.0, 1.0, Alignment::Left);
        let center = atlas.layout("AB", viewport, 40.0, 1.0, Alignment::Center);
        let right = atlas.layout("AB", viewport, 40.0, 1.0, Alignment::Right);
        assert_eq!(left[0].position[0], 0.0);
        assert_eq!(center[0].position[0], 42.0);
        assert_eq!(right.last().map(|v| v.position[0]), Some(100.0));
        assert_eq!(left.len(), 12);
        // Glyphs grow upward from the baseline.
        assert_eq!(left[0].position[1], 40.0 - 16.0);
        assert_eq!(left[5].position[1], 40.0);
    }

    #[test]
    fn layout_skips_missing_glyphs_without_advancing() {
        let atlas = block_atlas();
        let mesh = atlas.layout("A~B", Viewport::new(100, 50), 40.0, 0.5, Alignment::Left);
        assert_eq!(mesh.len(), 12);
        assert_eq!(mesh[6].position[0], 4.0);
    }
}
