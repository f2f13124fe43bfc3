use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// One textured vertex in frame pixel space (origin top-left, y down).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

/// Two triangles per glyph.
pub const VERTICES_PER_GLYPH: usize = 6;

pub const VERTEX_STRIDE: usize = std::mem::size_of::<Vertex>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    Left,
    #[default]
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width as f32,
            height: height as f32,
        }
    }
}

/// Largest whole-glyph vertex count whose bytes fit in `max_chunk_bytes`.
pub fn max_chunk_vertices(max_chunk_bytes: usize) -> usize {
    let vertices = max_chunk_bytes / VERTEX_STRIDE;
    vertices - vertices % VERTICES_PER_GLYPH
}

/// Splits a glyph mesh into draw-call sized slices.
///
/// Every slice holds a multiple of six vertices and at most `max_vertices`;
/// the slices cover `vertices` exactly once, in order. A trailing incomplete
/// glyph (fewer than six vertices) is not emitted.
pub fn draw_chunks(vertices: &[Vertex], max_vertices: usize) -> DrawChunks<'_> {
    let max_vertices = max_vertices - max_vertices % VERTICES_PER_GLYPH;
    let whole = vertices.len() - vertices.len() % VERTICES_PER_GLYPH;
    DrawChunks {
        remaining: &vertices[..whole],
        max_vertices: max_vertices.max(VERTICES_PER_GLYPH),
    }
}

pub struct DrawChunks<'a> {
    remaining: &'a [Vertex],
    max_vertices: usize,
}

impl<'a> Iterator for DrawChunks<'a> {
    type Item = &'a [Vertex];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let take = self.max_vertices.min(self.remaining.len());
        let (chunk, rest) = self.remaining.split_at(take);
        self.remaining = rest;
        Some(chunk)
    }
}

/// Emits the six vertices of an axis-aligned glyph quad.
pub(crate) fn push_quad(out: &mut Vec<Vertex>, rect: [f32; 4], uv: [f32; 4]) {
    let [x0, y0, x1, y1] = rect;
    let [u0, v0, u1, v1] = uv;
    out.extend_from_slice(&[
        Vertex { position: [x0, y0], uv: [u0, v0] },
        Vertex { position: [x1, y0], uv: [u1, v0] },
        Vertex { position: [x0, y1], uv: [u0, v1] },
        Vertex { position: [x0, y1], uv: [u0, v1] },
        Vertex { position: [x1, y0], uv: [u1, v0] },
        Vertex { position: [x1, y1], uv: [u1, v1] },
    ]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glyphs(count: usize) -> Vec<Vertex> {
        let mut out = Vec::new();
        for i in 0..count {
            let x = i as f32;
            push_quad(&mut out, [x, 0.0, x + 1.0, 1.0], [0.0, 0.0, 1.0, 1.0]);
        }
        out
    }

    #[test]
    fn default_chunk_bound_matches_4k_payload() {
        assert_eq!(VERTEX_STRIDE, 16);
        assert_eq!(max_chunk_vertices(4096), 252);
        assert_eq!(max_chunk_vertices(100), 6);
    }

    #[test]
    fn chunks_conserve_vertices_in_whole_glyphs() {
        let mesh = glyphs(100);
        let chunks = draw_chunks(&mesh, 252).collect::<Vec<_>>();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), mesh.len());
        assert!(chunks.iter().all(|c| c.len() % 6 == 0 && c.len() <= 252));
        assert_eq!(chunks[2][0], mesh[504]);
    }

    #[test]
    fn odd_maximum_rounds_down_to_whole_glyphs() {
        let mesh = glyphs(5);
        let chunks = draw_chunks(&mesh, 13).collect::<Vec<_>>();
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![12, 12, 6]);
    }

    #[test]
    fn empty_mesh_issues_no_draws() {
        assert_eq!(draw_chunks(&[], 252).count(), 0);
    }
}
