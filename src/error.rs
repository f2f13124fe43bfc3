//! Error taxonomy for the captioning core.

use std::fmt;

/// Boxed collaborator error carried by [`CaptionError::Export`].
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every failure the core can surface. All of them abort the current job.
#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    /// Decoded audio is empty or malformed, so timing cannot be computed.
    #[error("invalid audio: {message}")]
    InvalidAudio { message: String },

    /// The glyph atlas could not be built (font or rasterizer problem).
    #[error("glyph atlas rasterization failed: {message}")]
    Rasterization { message: String },

    /// GPU pipeline or resource creation failed during job setup.
    #[error("renderer initialization failed: {message}")]
    RendererInit { message: String },

    /// A specific frame could not be produced.
    #[error("frame buffer error: {message}")]
    FrameBuffer { message: String },

    /// The encoder or container writer failed.
    #[error("export failed: {message}")]
    Export {
        message: String,
        #[source]
        source: BoxedError,
    },
}

pub type CaptionResult<T> = Result<T, CaptionError>;

impl CaptionError {
    pub fn invalid_audio(msg: impl Into<String>) -> Self {
        Self::InvalidAudio {
            message: msg.into(),
        }
    }

    pub fn rasterization(msg: impl Into<String>) -> Self {
        Self::Rasterization {
            message: msg.into(),
        }
    }

    pub fn renderer_init(msg: impl Into<String>) -> Self {
        Self::RendererInit {
            message: msg.into(),
        }
    }

    pub fn frame_buffer(msg: impl Into<String>) -> Self {
        Self::FrameBuffer {
            message: msg.into(),
        }
    }

    pub fn export(msg: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        Self::Export {
            message: msg.into(),
            source: source.into(),
        }
    }

    /// Stable machine-readable code, used in logs and the CLI error line.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAudio { .. } => "INVALID_AUDIO",
            Self::Rasterization { .. } => "RASTERIZATION",
            Self::RendererInit { .. } => "RENDERER_INIT",
            Self::FrameBuffer { .. } => "FRAME_BUFFER",
            Self::Export { .. } => "EXPORT",
        }
    }
}

/// Named stages of a captioning job, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineStage {
    Idle,
    Timing,
    Aligning,
    Rendering,
    Exporting,
    Done,
}

impl PipelineStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Timing => "timing",
            Self::Aligning => "aligning",
            Self::Rendering => "rendering",
            Self::Exporting => "exporting",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A failed job, tagged with the stage it failed in.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: CaptionError,
    },

    #[error("job cancelled before {stage} could complete")]
    Cancelled { stage: PipelineStage },
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Stage { stage, .. } | Self::Cancelled { stage } => *stage,
        }
    }

    pub fn caption_error(&self) -> Option<&CaptionError> {
        match self {
            Self::Stage { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_error_keeps_collaborator_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let error = CaptionError::export("encoder rejected frame", inner);
        let source = std::error::Error::source(&error).expect("source present");
        assert_eq!(source.to_string(), "pipe closed");
        assert_eq!(error.code(), "EXPORT");
    }

    #[test]
    fn stage_error_names_the_failed_stage() {
        let error = PipelineError::Stage {
            stage: PipelineStage::Timing,
            source: CaptionError::invalid_audio("zero samples"),
        };
        assert_eq!(error.stage(), PipelineStage::Timing);
        assert_eq!(
            error.to_string(),
            "timing stage failed: invalid audio: zero samples"
        );
    }
}
