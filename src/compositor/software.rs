use std::sync::Arc;

use tiny_skia::{
    BlendMode, FilterQuality, Paint, Pattern, Pixmap, PixmapRef, Rect, SpreadMode, Transform,
};

use super::CompositeBackend;
use crate::error::{CaptionError, CaptionResult};
use crate::glyph_atlas::GlyphAtlas;
use crate::mesh::{Vertex, VERTICES_PER_GLYPH};
use crate::style::Rgba;

/// CPU compositor on a tiny-skia pixmap.
///
/// The atlas is pre-tinted into a premultiplied coverage pixmap and each glyph
/// quad is filled with a bilinear, edge-padded pattern mapped from its atlas
/// box. Blending is source-over, matching the GPU pipeline.
pub struct SoftwareBackend {
    atlas: Arc<GlyphAtlas>,
    canvas: Pixmap,
    coverage: Option<(TintKey, Pixmap)>,
    opacity: f32,
    frame_open: bool,
    draws: usize,
}

type TintKey = [u32; 3];

impl SoftwareBackend {
    pub fn new(atlas: Arc<GlyphAtlas>, width: u32, height: u32) -> CaptionResult<Self> {
        let canvas = Pixmap::new(width, height).ok_or_else(|| {
            CaptionError::renderer_init(format!("cannot allocate a {width}x{height} render target"))
        })?;
        Ok(Self {
            atlas,
            canvas,
            coverage: None,
            opacity: 0.0,
            frame_open: false,
            draws: 0,
        })
    }

    /// Draw calls issued since the last `begin_frame`.
    pub fn draws_this_frame(&self) -> usize {
        self.draws
    }

    fn tint_atlas(&mut self, tint: Rgba) -> CaptionResult<()> {
        let key = [tint.r.to_bits(), tint.g.to_bits(), tint.b.to_bits()];
        if matches!(&self.coverage, Some((cached, _)) if *cached == key) {
            return Ok(());
        }
        let mut pixmap = Pixmap::new(self.atlas.width(), self.atlas.height())
            .ok_or_else(|| CaptionError::frame_buffer("glyph atlas has no pixels"))?;
        let scale = |channel: f32, alpha: u8| (channel * f32::from(alpha)).round() as u8;
        for (texel, source) in pixmap
            .data_mut()
            .chunks_exact_mut(4)
            .zip(self.atlas.pixels().chunks_exact(4))
        {
            let alpha = source[3];
            texel.copy_from_slice(&[
                scale(tint.r, alpha),
                scale(tint.g, alpha),
                scale(tint.b, alpha),
                alpha,
            ]);
        }
        self.coverage = Some((key, pixmap));
        Ok(())
    }
}

/// Frame-space rect and atlas texel rect of one glyph quad.
fn quad_rects(quad: &[Vertex], atlas_size: (f32, f32)) -> Option<(Rect, [f32; 4])> {
    let first = quad.first()?;
    let opposite = quad.iter().find(|v| {
        v.position[0] != first.position[0] && v.position[1] != first.position[1]
    })?;
    let (low, high) = if first.position[0] < opposite.position[0] {
        (first, opposite)
    } else {
        (opposite, first)
    };
    let rect = Rect::from_ltrb(
        low.position[0].min(high.position[0]),
        low.position[1].min(high.position[1]),
        low.position[0].max(high.position[0]),
        low.position[1].max(high.position[1]),
    )?;
    let (width, height) = atlas_size;
    let (top, bottom) = if low.position[1] < high.position[1] {
        (low.uv[1], high.uv[1])
    } else {
        (high.uv[1], low.uv[1])
    };
    Some((
        rect,
        [low.uv[0] * width, top * height, high.uv[0] * width, bottom * height],
    ))
}

/// Maps the atlas texel box onto the quad rect.
fn atlas_to_quad(rect: Rect, texels: [f32; 4]) -> Option<Transform> {
    let [u0, v0, u1, v1] = texels;
    let span_x = u1 - u0;
    let span_y = v1 - v0;
    if span_x <= 0.0 || span_y <= 0.0 {
        return None;
    }
    let sx = rect.width() / span_x;
    let sy = rect.height() / span_y;
    Some(Transform::from_row(
        sx,
        0.0,
        0.0,
        sy,
        rect.left() - u0 * sx,
        rect.top() - v0 * sy,
    ))
}

fn fill_glyph(canvas: &mut Pixmap, coverage: PixmapRef<'_>, opacity: f32, quad: &[Vertex]) {
    let atlas_size = (coverage.width() as f32, coverage.height() as f32);
    let Some((rect, texels)) = quad_rects(quad, atlas_size) else {
        return;
    };
    let Some(transform) = atlas_to_quad(rect, texels) else {
        return;
    };
    let paint = Paint {
        shader: Pattern::new(
            coverage,
            SpreadMode::Pad,
            FilterQuality::Bilinear,
            opacity,
            transform,
        ),
        blend_mode: BlendMode::SourceOver,
        anti_alias: false,
        ..Paint::default()
    };
    canvas.fill_rect(rect, &paint, Transform::identity(), None);
}

impl CompositeBackend for SoftwareBackend {
    fn label(&self) -> &'static str {
        "software"
    }

    fn begin_frame(&mut self, rgba: &[u8], tint: Rgba) -> CaptionResult<()> {
        let expected = self.canvas.data().len();
        if rgba.len() != expected {
            return Err(CaptionError::frame_buffer(format!(
                "frame is {} bytes, render target {}x{} needs {}",
                rgba.len(),
                self.canvas.width(),
                self.canvas.height(),
                expected
            )));
        }
        self.tint_atlas(tint)?;
        self.canvas.data_mut().copy_from_slice(rgba);
        self.opacity = tint.a;
        self.frame_open = true;
        self.draws = 0;
        Ok(())
    }

    fn draw(&mut self, chunk: &[Vertex]) -> CaptionResult<()> {
        if !self.frame_open {
            return Err(CaptionError::frame_buffer("draw issued outside of a frame"));
        }
        let Some((_, coverage)) = &self.coverage else {
            return Err(CaptionError::frame_buffer("glyph atlas was not prepared"));
        };
        if self.opacity > 0.0 {
            for quad in chunk.chunks_exact(VERTICES_PER_GLYPH) {
                fill_glyph(&mut self.canvas, coverage.as_ref(), self.opacity, quad);
            }
        }
        self.draws += 1;
        Ok(())
    }

    fn finish_frame(&mut self) -> CaptionResult<Vec<u8>> {
        if !self.frame_open {
            return Err(CaptionError::frame_buffer("finish_frame without begin_frame"));
        }
        self.frame_open = false;
        Ok(self.canvas.data().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glyph_atlas::tests::block_atlas;
    use crate::mesh::push_quad;

    fn backend(width: u32, height: u32) -> SoftwareBackend {
        SoftwareBackend::new(Arc::new(block_atlas()), width, height).expect("backend")
    }

    /// A 4x4 texel window well inside the inked rows of the block 'A'.
    fn solid_uv(atlas: &GlyphAtlas) -> [f32; 4] {
        let rect = atlas.glyph('A').expect("A");
        let (w, h) = (atlas.width() as f32, atlas.height() as f32);
        let x = rect.x as f32 + 2.0;
        let y = rect.y as f32 + 4.0;
        [x / w, y / h, (x + 4.0) / w, (y + 4.0) / h]
    }

    fn close(actual: &[u8], expected: &[u8]) -> bool {
        actual.iter().zip(expected).all(|(a, b)| a.abs_diff(*b) <= 1)
    }

    #[test]
    fn quad_blends_each_covered_pixel_once() {
        let mut backend = backend(4, 4);
        let uv = solid_uv(&backend.atlas.clone());
        let mut mesh = Vec::new();
        push_quad(&mut mesh, [0.0, 0.0, 4.0, 4.0], uv);

        backend
            .begin_frame(&[0; 64], Rgba::new(1.0, 1.0, 1.0, 0.5))
            .expect("begin");
        backend.draw(&mesh).expect("draw");
        assert_eq!(backend.draws_this_frame(), 1);
        let out = backend.finish_frame().expect("finish");
        // A double blend would give 0.75 instead of 0.5.
        for pixel in out.chunks_exact(4) {
            assert!(close(pixel, &[128, 128, 128, 128]), "{pixel:?}");
        }
    }

    #[test]
    fn pixels_outside_the_quad_keep_the_source() {
        let mut backend = backend(4, 1);
        let uv = solid_uv(&backend.atlas.clone());
        let mut mesh = Vec::new();
        push_quad(&mut mesh, [0.0, 0.0, 2.0, 1.0], uv);

        let source = [10_u8, 20, 30, 255].repeat(4);
        backend.begin_frame(&source, Rgba::WHITE).expect("begin");
        backend.draw(&mesh).expect("draw");
        let out = backend.finish_frame().expect("finish");
        assert!(close(&out[0..4], &[255, 255, 255, 255]));
        assert_eq!(&out[8..16], &source[8..16]);
    }

    #[test]
    fn tint_colors_the_glyph() {
        let mut backend = backend(2, 2);
        let uv = solid_uv(&backend.atlas.clone());
        let mut mesh = Vec::new();
        push_quad(&mut mesh, [0.0, 0.0, 2.0, 2.0], uv);
        let source = [0_u8, 0, 0, 255].repeat(4);
        backend
            .begin_frame(&source, Rgba::new(1.0, 0.0, 0.0, 1.0))
            .expect("begin");
        backend.draw(&mesh).expect("draw");
        let out = backend.finish_frame().expect("finish");
        assert!(close(&out[0..4], &[255, 0, 0, 255]));
    }

    #[test]
    fn off_screen_geometry_is_clipped() {
        let mut backend = backend(2, 2);
        let uv = solid_uv(&backend.atlas.clone());
        let mut mesh = Vec::new();
        push_quad(&mut mesh, [-10.0, -10.0, 0.0, 0.0], uv);
        push_quad(&mut mesh, [1.0, 1.0, 50.0, 50.0], uv);
        backend.begin_frame(&[0; 16], Rgba::WHITE).expect("begin");
        backend.draw(&mesh).expect("draw");
        let out = backend.finish_frame().expect("finish");
        assert_eq!(&out[0..4], &[0, 0, 0, 0]);
        assert!(close(&out[12..16], &[255, 255, 255, 255]));
    }

    #[test]
    fn draw_outside_frame_is_an_error() {
        let mut backend = backend(1, 1);
        assert!(backend.draw(&[]).is_err());
        assert!(backend.begin_frame(&[0; 3], Rgba::WHITE).is_err());
    }

    #[test]
    fn empty_render_target_is_rejected() {
        assert!(SoftwareBackend::new(Arc::new(block_atlas()), 0, 4).is_err());
    }
}
