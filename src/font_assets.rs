use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use fontdue::{Font, FontSettings};
use sha2::{Digest, Sha256};

use crate::error::{CaptionError, CaptionResult};
use crate::glyph_atlas::{GlyphRasterizer, LineMetrics, RasterizedGlyph};
use crate::style::SubtitleStyle;

pub const FONT_SHA256_MISMATCH: &str = "FONT_SHA256_MISMATCH";
pub const FONT_DIRS_ENV: &str = "CAPTION_BURN_FONT_DIRS";

const SYSTEM_FONT_DIRS: [&str; 4] = [
    "/usr/share/fonts",
    "/usr/local/share/fonts",
    "/Library/Fonts",
    "/System/Library/Fonts",
];

const FONT_EXTENSIONS: [&str; 3] = ["ttf", "otf", "ttc"];

/// Directories searched for a font family, `CAPTION_BURN_FONT_DIRS` first.
pub fn font_search_dirs() -> Vec<PathBuf> {
    let mut dirs = env::var_os(FONT_DIRS_ENV)
        .map(|raw| env::split_paths(&raw).collect::<Vec<_>>())
        .unwrap_or_default();
    if let Some(home) = env::var_os("HOME") {
        dirs.push(Path::new(&home).join(".local/share/fonts"));
        dirs.push(Path::new(&home).join(".fonts"));
    }
    dirs.extend(SYSTEM_FONT_DIRS.iter().map(PathBuf::from));
    dirs
}

/// Finds `<family>.ttf|otf|ttc` (case-insensitive stem) under `dirs`, recursively.
pub fn find_font_file(family: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let wanted = family.trim().to_ascii_lowercase();
    dirs.iter()
        .filter(|dir| dir.is_dir())
        .find_map(|dir| find_in_dir(dir, &wanted, 0))
}

fn find_in_dir(dir: &Path, wanted: &str, depth: usize) -> Option<PathBuf> {
    if depth > 6 {
        return None;
    }
    let mut entries = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    entries.sort();

    let mut subdirs = Vec::new();
    for path in entries {
        if path.is_dir() {
            subdirs.push(path);
            continue;
        }
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if FONT_EXTENSIONS.contains(&ext.as_str()) && stem == wanted {
            return Some(path);
        }
    }
    subdirs
        .iter()
        .find_map(|subdir| find_in_dir(subdir, wanted, depth + 1))
}

pub fn resolve_font_path(style: &SubtitleStyle) -> Result<PathBuf> {
    if let Some(path) = &style.font_path {
        if !path.is_file() {
            bail!("style.font_path does not exist: {}", path.display());
        }
        return Ok(path.clone());
    }
    let dirs = font_search_dirs();
    find_font_file(&style.font_family, &dirs).ok_or_else(|| {
        anyhow!(
            "font family '{}' not found in {}; set style.font_path or {}",
            style.font_family,
            dirs.iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            FONT_DIRS_ENV
        )
    })
}

/// Reads the style's font, checking `font_sha256` when one is configured.
pub fn read_style_font_bytes(style: &SubtitleStyle) -> Result<(PathBuf, Vec<u8>)> {
    let path = resolve_font_path(style)?;
    let bytes =
        fs::read(&path).with_context(|| format!("failed to read font file '{}'", path.display()))?;
    if let Some(expected) = &style.font_sha256 {
        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(expected) {
            bail!(
                "{}: {} expected sha256={} actual sha256={}",
                FONT_SHA256_MISMATCH,
                path.display(),
                expected,
                actual
            );
        }
    }
    Ok((path, bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// [`GlyphRasterizer`] over a fontdue font at a fixed pixel size.
pub struct FontdueRasterizer {
    font: Font,
    px: f32,
}

impl FontdueRasterizer {
    pub fn from_bytes(bytes: Vec<u8>, px: f32) -> CaptionResult<Self> {
        let font = Font::from_bytes(
            bytes,
            FontSettings {
                scale: px,
                ..FontSettings::default()
            },
        )
        .map_err(|error| CaptionError::rasterization(format!("failed to parse font: {error}")))?;
        Ok(Self { font, px })
    }

    pub fn for_style(style: &SubtitleStyle) -> CaptionResult<Self> {
        let (path, bytes) = read_style_font_bytes(style)
            .map_err(|error| CaptionError::rasterization(format!("{error:#}")))?;
        tracing::debug!(font = %path.display(), size = style.font_size, "loaded caption font");
        Self::from_bytes(bytes, style.font_size)
    }
}

impl GlyphRasterizer for FontdueRasterizer {
    fn line_metrics(&self) -> CaptionResult<LineMetrics> {
        let metrics = self.font.horizontal_line_metrics(self.px).ok_or_else(|| {
            CaptionError::rasterization("font has no horizontal line metrics")
        })?;
        Ok(LineMetrics {
            ascent: metrics.ascent,
            descent: metrics.descent,
        })
    }

    fn rasterize(&self, ch: char) -> Option<RasterizedGlyph> {
        if ch != ' ' && self.font.lookup_glyph_index(ch) == 0 {
            return None;
        }
        let (metrics, coverage) = self.font.rasterize(ch, self.px);
        Some(RasterizedGlyph {
            advance_width: metrics.advance_width,
            xmin: metrics.xmin,
            ymin: metrics.ymin,
            width: metrics.width,
            height: metrics.height,
            coverage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_family_case_insensitively_in_nested_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let nested = temp.path().join("truetype/dejavu");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(nested.join("DejaVuSans-Bold.ttf"), b"not a real font").expect("write");
        fs::write(nested.join("DejaVuSans-Bold.txt"), b"decoy").expect("write");

        let found = find_font_file("dejavusans-bold", &[temp.path().to_path_buf()]);
        assert_eq!(found, Some(nested.join("DejaVuSans-Bold.ttf")));
        assert!(find_font_file("Missing", &[temp.path().to_path_buf()]).is_none());
    }

    #[test]
    fn rejects_font_with_wrong_hash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("font.ttf");
        fs::write(&path, b"font bytes").expect("write");

        let mut style = SubtitleStyle::default();
        style.font_path = Some(path);
        style.font_sha256 = Some("0".repeat(64));
        let error = read_style_font_bytes(&style).expect_err("hash mismatch");
        assert!(error.to_string().contains(FONT_SHA256_MISMATCH));

        style.font_sha256 = Some(sha256_hex(b"font bytes"));
        assert!(read_style_font_bytes(&style).is_ok());
    }

    #[test]
    fn garbage_font_bytes_are_a_rasterization_error() {
        let result = FontdueRasterizer::from_bytes(b"nope".to_vec(), 32.0);
        assert!(matches!(result, Err(CaptionError::Rasterization { .. })));
    }
}
