use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use caption_burn::audio::{read_wav, FfmpegAudioSource};
use caption_burn::compositor::BackendKind;
use caption_burn::config::{load_job_config, JobConfig};
use caption_burn::decoding::{probe_video, FfmpegFrameSource};
use caption_burn::encoding::{EncodeTarget, FfmpegFrameSink};
use caption_burn::font_assets::resolve_font_path;
use caption_burn::glyph_atlas::GlyphAtlas;
use caption_burn::logging::init_logging;
use caption_burn::pipeline::{
    AudioSource, CancelToken, CaptionInput, CaptionJob, PassthroughAligner, Pipeline, Progress,
    WavAudioSource,
};
use caption_burn::segment::{read_segments, read_transcript, write_segments};
use caption_burn::time_mapper::map_segments;

#[derive(Debug, Parser)]
#[command(name = "caption-burn")]
#[command(about = "Burn time-aligned captions into video")]
#[command(version)]
struct Cli {
    /// YAML job config; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Composite captions onto every frame of a video.
    Burn {
        video: PathBuf,
        /// Recognizer output: JSON array of {start_ms, end_ms, text}.
        #[arg(long, conflicts_with = "segments", required_unless_present = "segments")]
        transcript: Option<PathBuf>,
        /// Segments already on the media timeline (interchange JSON).
        #[arg(long)]
        segments: Option<PathBuf>,
        /// Audio the transcript was recognized from; defaults to the video's audio.
        #[arg(long)]
        audio: Option<PathBuf>,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long)]
        fps: Option<u32>,
        #[arg(long, value_parser = parse_backend)]
        backend: Option<BackendKind>,
    },
    /// Map a transcript onto an audio clock and write interchange segments.
    Map {
        audio: PathBuf,
        #[arg(long)]
        transcript: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
    /// Write the glyph atlas texture as a PNG.
    Atlas {
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },
    /// Validate the job config and font.
    Check,
}

fn parse_backend(raw: &str) -> Result<BackendKind, String> {
    match raw {
        "gpu" => Ok(BackendKind::Gpu),
        "software" => Ok(BackendKind::Software),
        other => Err(format!("unknown backend '{other}', expected gpu or software")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => load_job_config(path)?,
        None => JobConfig::default(),
    };
    if let Commands::Burn { fps, backend, .. } = &cli.command {
        if let Some(fps) = fps {
            config.render.fps = *fps;
        }
        if let Some(backend) = backend {
            config.render.backend = *backend;
        }
        config.validate()?;
    }
    init_logging(&config.logging);
    if let Some(hash) = option_env!("CAPTION_BURN_GIT_HASH") {
        tracing::debug!(git = hash, "caption-burn build");
    }

    match cli.command {
        Commands::Burn {
            video,
            transcript,
            segments,
            audio,
            output,
            ..
        } => run_burn(
            &config,
            &video,
            transcript.as_deref(),
            segments.as_deref(),
            audio.as_deref(),
            &output,
        ),
        Commands::Map {
            audio,
            transcript,
            output,
        } => run_map(&config, &audio, &transcript, &output),
        Commands::Atlas { output } => run_atlas(&config, &output),
        Commands::Check => run_check(&config, cli.config.as_deref()),
    }
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}

fn audio_source(path: &Path, config: &JobConfig) -> Box<dyn AudioSource> {
    if is_wav(path) {
        Box::new(WavAudioSource(path.to_path_buf()))
    } else {
        Box::new(FfmpegAudioSource::new(path).with_mode(config.export.ffmpeg))
    }
}

fn run_burn(
    config: &JobConfig,
    video: &Path,
    transcript: Option<&Path>,
    segments: Option<&Path>,
    audio: Option<&Path>,
    output: &Path,
) -> Result<()> {
    let (captions, audio) = match (transcript, segments) {
        (Some(transcript), _) => {
            let spans = read_transcript(transcript)?;
            let source = audio_source(audio.unwrap_or(video), config);
            (CaptionInput::Recognized(spans), Some(source))
        }
        (None, Some(segments)) => (CaptionInput::Segments(read_segments(segments)?), None),
        (None, None) => bail!("either --transcript or --segments is required"),
    };

    let info = probe_video(video)?;
    let (width, height) = info.orientation.render_size((info.width, info.height));
    let fps = config.render.fps;
    let frames = FfmpegFrameSource::spawn(video, &info, fps, config.export.ffmpeg)?;
    let sink = FfmpegFrameSink::spawn(EncodeTarget {
        width,
        height,
        fps,
        output_path: output.to_path_buf(),
        audio_source: info.has_audio.then(|| video.to_path_buf()),
        export: config.export,
    })?;

    let job = CaptionJob {
        asset_key: video.to_string_lossy().into_owned(),
        captions,
        style: config.style.clone(),
        grid: config.atlas,
        atlas: None,
        layout: config.layout,
        render: config.render,
        audio,
        aligner: Box::new(PassthroughAligner),
        frames: Box::new(frames),
        sink: Box::new(sink),
    };

    let last_percent = Arc::new(AtomicU64::new(u64::MAX));
    let progress = Arc::new(move |progress: Progress| {
        let percent = (progress.fraction * 100.0).floor() as u64;
        if last_percent.swap(percent, Ordering::Relaxed) != percent && percent % 5 == 0 {
            eprintln!("{:>3}% {}", percent, progress.stage);
        }
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let pipeline = Pipeline::new();
    let written = runtime
        .block_on(pipeline.process(job, progress, CancelToken::new()))
        .map_err(|error| {
            let code = error.caption_error().map_or("CANCELLED", |inner| inner.code());
            anyhow!("{code}: {error}")
        })?;
    println!("Wrote {}", written.display());
    Ok(())
}

fn run_map(config: &JobConfig, audio: &Path, transcript: &Path, output: &Path) -> Result<()> {
    let spans = read_transcript(transcript)?;
    let decoded = if is_wav(audio) {
        read_wav(audio)?
    } else {
        FfmpegAudioSource::new(audio)
            .with_mode(config.export.ffmpeg)
            .decode()?
    };
    let segments = map_segments(&spans, decoded.sample_count(), decoded.sample_rate)?;
    write_segments(output, &segments)?;
    info!(
        segments = segments.len(),
        audio_seconds = decoded.duration_seconds(),
        output = %output.display(),
        "wrote segments"
    );
    println!("Wrote {} segments to {}", segments.len(), output.display());
    Ok(())
}

fn run_atlas(config: &JobConfig, output: &Path) -> Result<()> {
    let atlas = GlyphAtlas::for_style(&config.style, config.atlas)?;
    atlas
        .to_image()?
        .save(output)
        .with_context(|| format!("failed to write atlas image {}", output.display()))?;
    println!(
        "Wrote {} ({}x{}, cell {}x{})",
        output.display(),
        atlas.width(),
        atlas.height(),
        config.atlas.cell_width,
        config.atlas.cell_height
    );
    Ok(())
}

fn run_check(config: &JobConfig, config_path: Option<&Path>) -> Result<()> {
    config.validate()?;
    let font = resolve_font_path(&config.style)?;
    println!(
        "OK: {} (font {}, {} fps, backend {:?}, codec {:?})",
        config_path.map_or_else(|| "<defaults>".to_owned(), |p| p.display().to_string()),
        font.display(),
        config.render.fps,
        config.render.backend,
        config.export.codec
    );
    Ok(())
}
