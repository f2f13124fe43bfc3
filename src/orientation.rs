//! Per-asset orientation and pixel-format normalisation of source frames.

use serde::{Deserialize, Serialize};

use crate::error::{CaptionError, CaptionResult};

/// Clockwise rotation that turns stored frames into display orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    /// From a clockwise display rotation in degrees, snapped to quarter turns.
    pub fn from_clockwise_degrees(degrees: f64) -> Self {
        let quarter = (degrees / 90.0).round() as i64;
        match quarter.rem_euclid(4) {
            1 => Self::Rotate90,
            2 => Self::Rotate180,
            3 => Self::Rotate270,
            _ => Self::Identity,
        }
    }

    /// From the 2x2 part `[a b; c d]` of a preferred-transform affine matrix.
    pub fn from_affine(a: f64, b: f64, c: f64, d: f64) -> Self {
        let near = |value: f64, target: f64| (value - target).abs() < 1e-3;
        if near(a, 0.0) && near(d, 0.0) {
            if near(b, 1.0) && near(c, -1.0) {
                return Self::Rotate90;
            }
            if near(b, -1.0) && near(c, 1.0) {
                return Self::Rotate270;
            }
        }
        if near(a, -1.0) && near(d, -1.0) {
            return Self::Rotate180;
        }
        Self::Identity
    }

    pub fn is_quarter_turn(self) -> bool {
        matches!(self, Self::Rotate90 | Self::Rotate270)
    }

    /// Display size for a stored frame of `natural` size.
    pub fn render_size(self, natural: (u32, u32)) -> (u32, u32) {
        if self.is_quarter_turn() {
            (natural.1, natural.0)
        } else {
            natural
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    #[default]
    Rgba8,
    Bgra8,
}

/// Rotates and converts a stored frame into an RGBA8 frame in display orientation.
///
/// Returns the display `(width, height)` and pixels.
pub fn to_display_rgba(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    orientation: Orientation,
) -> CaptionResult<(u32, u32, Vec<u8>)> {
    let expected = width as usize * height as usize * 4;
    if width == 0 || height == 0 || pixels.len() != expected {
        return Err(CaptionError::frame_buffer(format!(
            "source frame is {} bytes but {}x{} RGBA needs {}",
            pixels.len(),
            width,
            height,
            expected
        )));
    }

    let (out_width, out_height) = orientation.render_size((width, height));
    let mut out = vec![0_u8; expected];
    let (w, h) = (width as usize, height as usize);
    let ow = out_width as usize;

    for y in 0..h {
        for x in 0..w {
            let (dx, dy) = match orientation {
                Orientation::Identity => (x, y),
                Orientation::Rotate90 => (h - 1 - y, x),
                Orientation::Rotate180 => (w - 1 - x, h - 1 - y),
                Orientation::Rotate270 => (y, w - 1 - x),
            };
            let src = (y * w + x) * 4;
            let dst = (dy * ow + dx) * 4;
            let px = &pixels[src..src + 4];
            let rgba = match format {
                PixelFormat::Rgba8 => [px[0], px[1], px[2], px[3]],
                PixelFormat::Bgra8 => [px[2], px[1], px[0], px[3]],
            };
            out[dst..dst + 4].copy_from_slice(&rgba);
        }
    }

    Ok((out_width, out_height, out))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2x1 frame: red, green.
    const WIDE: [u8; 8] = [255, 0, 0, 255, 0, 255, 0, 255];

    #[test]
    fn quarter_turns_swap_render_size() {
        assert_eq!(Orientation::Rotate90.render_size((1920, 1080)), (1080, 1920));
        assert_eq!(Orientation::Rotate180.render_size((1920, 1080)), (1920, 1080));
    }

    #[test]
    fn degrees_and_affine_agree() {
        assert_eq!(Orientation::from_clockwise_degrees(-90.0), Orientation::Rotate270);
        assert_eq!(Orientation::from_clockwise_degrees(450.0), Orientation::Rotate90);
        assert_eq!(Orientation::from_affine(0.0, 1.0, -1.0, 0.0), Orientation::Rotate90);
        assert_eq!(Orientation::from_affine(-1.0, 0.0, 0.0, -1.0), Orientation::Rotate180);
        assert_eq!(Orientation::from_affine(1.0, 0.0, 0.0, 1.0), Orientation::Identity);
    }

    #[test]
    fn rotate90_puts_left_pixel_on_top() {
        let (w, h, out) =
            to_display_rgba(&WIDE, 2, 1, PixelFormat::Rgba8, Orientation::Rotate90).expect("ok");
        assert_eq!((w, h), (1, 2));
        assert_eq!(&out[0..4], &[255, 0, 0, 255]);
        assert_eq!(&out[4..8], &[0, 255, 0, 255]);
    }

    #[test]
    fn rotate270_puts_right_pixel_on_top() {
        let (_, _, out) =
            to_display_rgba(&WIDE, 2, 1, PixelFormat::Rgba8, Orientation::Rotate270).expect("ok");
        assert_eq!(&out[0..4], &[0, 255, 0, 255]);
    }

    #[test]
    fn bgra_is_swizzled() {
        let (_, _, out) =
            to_display_rgba(&[1, 2, 3, 4], 1, 1, PixelFormat::Bgra8, Orientation::Identity)
                .expect("ok");
        assert_eq!(out, vec![3, 2, 1, 4]);
    }

    #[test]
    fn short_buffer_is_a_frame_buffer_error() {
        let result = to_display_rgba(&[0; 7], 2, 1, PixelFormat::Rgba8, Orientation::Identity);
        assert!(matches!(result, Err(CaptionError::FrameBuffer { .. })));
    }
}
