use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

/// Straight (non-premultiplied) RGBA color with channels in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rgba {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgba {
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn as_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn with_alpha_scaled(self, factor: f32) -> Self {
        Self {
            a: self.a * factor.clamp(0.0, 1.0),
            ..self
        }
    }

    pub fn parse_hex(raw: &str) -> Result<Self> {
        let hex = raw.trim().trim_start_matches('#');
        if !matches!(hex.len(), 6 | 8) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("color '{raw}' must be #RRGGBB or #RRGGBBAA");
        }
        let channel = |offset: usize| -> Result<f32> {
            let byte = u8::from_str_radix(&hex[offset..offset + 2], 16)?;
            Ok(f32::from(byte) / 255.0)
        };
        let a = if hex.len() == 8 { channel(6)? } else { 1.0 };
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?, a))
    }

    fn validate(&self, field: &str) -> Result<()> {
        for value in self.as_array() {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                bail!("{field} channels must be within [0, 1], got {:?}", self.as_array());
            }
        }
        Ok(())
    }
}

impl Default for Rgba {
    fn default() -> Self {
        Self::WHITE
    }
}

impl<'de> Deserialize<'de> for Rgba {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawColor {
            Hex(String),
            Channels([f32; 4]),
            Named { r: f32, g: f32, b: f32, a: f32 },
        }

        match RawColor::deserialize(deserializer)? {
            RawColor::Hex(raw) => Rgba::parse_hex(&raw).map_err(D::Error::custom),
            RawColor::Channels([r, g, b, a]) => Ok(Rgba::new(r, g, b, a)),
            RawColor::Named { r, g, b, a } => Ok(Rgba::new(r, g, b, a)),
        }
    }
}

/// Visual style bound to one render job.
///
/// `background_color` and `corner_radius` are part of the style format but
/// the compositor does not draw a caption background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SubtitleStyle {
    pub font_family: String,
    /// Explicit font file; when absent the family is looked up in the font directories.
    pub font_path: Option<PathBuf>,
    /// Optional lowercase hex sha256 the font file must match.
    pub font_sha256: Option<String>,
    pub font_size: f32,
    pub text_color: Rgba,
    pub background_color: Rgba,
    pub corner_radius: f32,
    /// Fade-in/fade-out length in seconds; 0 disables fading.
    pub transition_duration: f64,
}

impl Default for SubtitleStyle {
    fn default() -> Self {
        Self {
            font_family: "DejaVuSans-Bold".to_owned(),
            font_path: None,
            font_sha256: None,
            font_size: 48.0,
            text_color: Rgba::WHITE,
            background_color: Rgba::new(0.0, 0.0, 0.0, 0.6),
            corner_radius: 4.0,
            transition_duration: 0.25,
        }
    }
}

impl SubtitleStyle {
    pub fn validate(&self) -> Result<()> {
        if self.font_family.trim().is_empty() && self.font_path.is_none() {
            bail!("style needs a font_family or a font_path");
        }
        if !self.font_size.is_finite() || self.font_size <= 0.0 {
            bail!("style.font_size must be > 0, got {}", self.font_size);
        }
        if !self.corner_radius.is_finite() || self.corner_radius < 0.0 {
            bail!("style.corner_radius must be >= 0, got {}", self.corner_radius);
        }
        if !self.transition_duration.is_finite() || self.transition_duration < 0.0 {
            bail!(
                "style.transition_duration must be >= 0 seconds, got {}",
                self.transition_duration
            );
        }
        if let Some(hash) = &self.font_sha256 {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("style.font_sha256 must be 64 hex characters");
            }
        }
        self.text_color.validate("style.text_color")?;
        self.background_color.validate("style.background_color")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_channel_colors() {
        let style: SubtitleStyle = serde_yaml::from_str(
            "text_color: \"#FF000080\"\nbackground_color: [0.0, 0.5, 1.0, 1.0]\n",
        )
        .expect("style parses");
        assert_eq!(style.text_color.r, 1.0);
        assert!((style.text_color.a - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(style.background_color, Rgba::new(0.0, 0.5, 1.0, 1.0));
        assert_eq!(style.font_size, 48.0);
    }

    #[test]
    fn rejects_out_of_range_channels() {
        let mut style = SubtitleStyle::default();
        style.text_color = Rgba::new(1.5, 0.0, 0.0, 1.0);
        assert!(style.validate().is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(serde_yaml::from_str::<SubtitleStyle>("font_weight: bold\n").is_err());
    }
}
