//! YAML job configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::compositor::{BackendKind, LayoutConfig};
use crate::encoding::FfmpegMode;
use crate::glyph_atlas::AtlasGrid;
use crate::mesh::{max_chunk_vertices, VERTICES_PER_GLYPH};
use crate::style::SubtitleStyle;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct JobConfig {
    pub style: SubtitleStyle,
    pub atlas: AtlasGrid,
    pub layout: LayoutConfig,
    pub render: RenderConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

impl JobConfig {
    pub fn validate(&self) -> Result<()> {
        self.style.validate()?;
        self.atlas.validate()?;
        self.layout.validate()?;
        self.render.validate()?;
        self.export.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RenderConfig {
    /// Composition frame rate; source frames are resampled to it.
    pub fps: u32,
    /// Inline vertex payload bound for a single draw call.
    pub max_chunk_bytes: usize,
    pub backend: BackendKind,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            max_chunk_bytes: 4096,
            backend: BackendKind::Gpu,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            bail!("render.fps must be > 0");
        }
        if max_chunk_vertices(self.max_chunk_bytes) < VERTICES_PER_GLYPH {
            bail!(
                "render.max_chunk_bytes {} cannot hold a single glyph",
                self.max_chunk_bytes
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Prores,
}

impl VideoCodec {
    pub fn to_ffmpeg_codec(self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::Hevc => "libx265",
            Self::Prores => "prores_ks",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExportConfig {
    pub codec: VideoCodec,
    pub crf: u8,
    pub keep_audio: bool,
    pub ffmpeg: FfmpegMode,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            crf: 18,
            keep_audio: true,
            ffmpeg: FfmpegMode::Auto,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.crf > 51 {
            bail!("export.crf must be within 0..=51, got {}", self.crf);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

pub fn load_job_config(path: &Path) -> Result<JobConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read job config {}", path.display()))?;
    let mut config: JobConfig = serde_yaml::from_str(&contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!(
            "failed to parse yaml in {} at {}: {}",
            path.display(),
            location,
            error
        )
    })?;

    resolve_relative_paths(&mut config, path);
    config
        .validate()
        .with_context(|| format!("invalid job config {}", path.display()))?;
    Ok(config)
}

/// `style.font_path` is relative to the config file's directory.
fn resolve_relative_paths(config: &mut JobConfig, config_path: &Path) {
    let config_dir = config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    if let Some(font_path) = config.style.font_path.as_mut() {
        if font_path.is_relative() {
            *font_path = config_dir.join(&*font_path);
        }
    }
}
