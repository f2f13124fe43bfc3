//! Stage sequencing for one captioning job.
//!
//! A job runs `Timing -> Aligning -> Rendering -> Exporting -> Done`. Each
//! stage executes on the blocking pool so the async caller only suspends
//! while waiting. The frame loop inside `Rendering` is strictly ordered:
//! frame `i + 1` is decoded only after frame `i` was composited and handed to
//! the sink. Jobs for the same asset key are serialized; jobs for different
//! keys run independently, each with its own [`RenderJob`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::audio::{read_wav, DecodedAudio, FfmpegAudioSource};
use crate::compositor::{
    CompositedFrame, LayoutConfig, RenderJob, RenderJobSetup, SourceFrame,
};
use crate::config::RenderConfig;
use crate::error::{CaptionError, PipelineError, PipelineStage};
use crate::glyph_atlas::{AtlasGrid, GlyphAtlas};
use crate::orientation::Orientation;
use crate::segment::{CaptionSegment, RecognizedSpan};
use crate::style::SubtitleStyle;
use crate::time_mapper::map_segments;

pub trait AudioSource: Send {
    fn decode(&mut self) -> Result<DecodedAudio>;
}

/// Refines segment timing after mapping.
pub trait Aligner: Send {
    fn align(
        &mut self,
        segments: Vec<CaptionSegment>,
        audio: Option<&DecodedAudio>,
    ) -> Result<Vec<CaptionSegment>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSourceInfo {
    /// Stored (pre-rotation) frame size.
    pub natural_size: (u32, u32),
    pub orientation: Orientation,
    pub fps: u32,
    /// Used only for progress reporting.
    pub estimated_frames: Option<u64>,
}

/// Decoded frames in strictly increasing timestamp order.
pub trait FrameSource: Send {
    fn info(&self) -> FrameSourceInfo;
    fn next_frame(&mut self) -> Result<Option<SourceFrame>>;
}

/// Consumes composited frames in submission order.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &CompositedFrame) -> Result<()>;

    /// Finalizes the output and returns its location.
    fn finish(&mut self) -> Result<PathBuf>;

    /// Stops encoding and discards the partial output.
    fn abort(&mut self);
}

impl AudioSource for FfmpegAudioSource {
    fn decode(&mut self) -> Result<DecodedAudio> {
        FfmpegAudioSource::decode(self)
    }
}

/// 16-bit PCM WAV file on disk.
pub struct WavAudioSource(pub PathBuf);

impl AudioSource for WavAudioSource {
    fn decode(&mut self) -> Result<DecodedAudio> {
        read_wav(&self.0)
    }
}

impl AudioSource for DecodedAudio {
    fn decode(&mut self) -> Result<DecodedAudio> {
        Ok(self.clone())
    }
}

/// Leaves segments exactly as mapped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughAligner;

impl Aligner for PassthroughAligner {
    fn align(
        &mut self,
        segments: Vec<CaptionSegment>,
        _audio: Option<&DecodedAudio>,
    ) -> Result<Vec<CaptionSegment>> {
        Ok(segments)
    }
}

pub enum CaptionInput {
    /// Recognizer output, mapped onto the audio clock during `Timing`.
    Recognized(Vec<RecognizedSpan>),
    /// Segments already on the media timeline.
    Segments(Vec<CaptionSegment>),
}

pub struct CaptionJob {
    /// Identifies the asset; jobs sharing a key never overlap.
    pub asset_key: String,
    pub captions: CaptionInput,
    pub style: SubtitleStyle,
    pub grid: AtlasGrid,
    /// Prebuilt atlas; when absent one is rasterized from `style` with fontdue.
    pub atlas: Option<Arc<GlyphAtlas>>,
    pub layout: LayoutConfig,
    pub render: RenderConfig,
    pub audio: Option<Box<dyn AudioSource>>,
    pub aligner: Box<dyn Aligner>,
    pub frames: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub stage: PipelineStage,
    /// Overall job progress in `[0, 1]`.
    pub fraction: f64,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Overall progress range covered by `stage`.
pub fn stage_progress_span(stage: PipelineStage) -> (f64, f64) {
    match stage {
        PipelineStage::Idle => (0.0, 0.0),
        PipelineStage::Timing => (0.0, 0.2),
        PipelineStage::Aligning => (0.2, 0.35),
        PipelineStage::Rendering => (0.35, 0.85),
        PipelineStage::Exporting => (0.85, 1.0),
        PipelineStage::Done => (1.0, 1.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running(PipelineStage),
    Done,
    Failed(PipelineStage),
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, stage: PipelineStage) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled { stage })
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
struct ProgressReporter {
    callback: ProgressCallback,
    last: Arc<Mutex<f64>>,
}

impl ProgressReporter {
    fn new(callback: ProgressCallback) -> Self {
        Self {
            callback,
            last: Arc::new(Mutex::new(0.0)),
        }
    }

    fn report(&self, stage: PipelineStage, stage_fraction: f64) {
        let (low, high) = stage_progress_span(stage);
        let overall = low + (high - low) * stage_fraction.clamp(0.0, 1.0);
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if overall < *last {
                return;
            }
            *last = overall;
        }
        (self.callback)(Progress {
            stage,
            fraction: overall,
        });
    }
}

fn failed_at(stage: PipelineStage) -> impl Fn(CaptionError) -> PipelineError {
    move |source| PipelineError::Stage { stage, source }
}

fn worker_lost(stage: PipelineStage, error: tokio::task::JoinError) -> PipelineError {
    let source = match stage {
        PipelineStage::Exporting => CaptionError::export("export worker failed", error),
        PipelineStage::Timing | PipelineStage::Aligning => {
            CaptionError::invalid_audio(format!("{stage} worker failed: {error}"))
        }
        _ => CaptionError::frame_buffer(format!("{stage} worker failed: {error}")),
    };
    PipelineError::Stage { stage, source }
}

#[derive(Default)]
pub struct Pipeline {
    asset_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    states: Mutex<HashMap<String, JobState>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known state of the most recent job for `asset_key`.
    pub fn state(&self, asset_key: &str) -> Option<JobState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(asset_key)
            .copied()
    }

    fn set_state(&self, asset_key: &str, state: JobState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(asset_key.to_owned(), state);
    }

    fn asset_lock(&self, asset_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.asset_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(asset_key.to_owned()).or_default())
    }

    /// Forgets the lock for `asset_key` once no job holds or awaits it.
    fn release_asset_lock(&self, asset_key: &str) {
        let mut locks = self.asset_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(asset_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(asset_key);
        }
    }

    /// Runs `job` to completion and returns the output location.
    ///
    /// On failure the sink's partial output is discarded and the error names
    /// the stage that failed; no progress is reported after the failure.
    pub async fn process(
        &self,
        job: CaptionJob,
        progress: ProgressCallback,
        cancel: CancelToken,
    ) -> Result<PathBuf, PipelineError> {
        let asset_key = job.asset_key.clone();
        let guard = self.asset_lock(&asset_key).lock_owned().await;

        info!(asset = %asset_key, "caption job started");
        let reporter = ProgressReporter::new(progress);
        let result = self.run(job, &reporter, &cancel).await;
        match &result {
            Ok(path) => {
                self.set_state(&asset_key, JobState::Done);
                info!(asset = %asset_key, output = %path.display(), "caption job finished");
            }
            Err(error) => {
                self.set_state(&asset_key, JobState::Failed(error.stage()));
                warn!(asset = %asset_key, stage = %error.stage(), %error, "caption job failed");
            }
        }
        drop(guard);
        self.release_asset_lock(&asset_key);
        result
    }

    async fn run(
        &self,
        job: CaptionJob,
        reporter: &ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<PathBuf, PipelineError> {
        let CaptionJob {
            asset_key,
            captions,
            style,
            grid,
            atlas,
            layout,
            render,
            audio,
            mut aligner,
            frames,
            mut sink,
        } = job;

        if let Err(error) = cancel.check(PipelineStage::Timing) {
            sink.abort();
            return Err(error);
        }
        self.enter(&asset_key, reporter, PipelineStage::Timing);
        let timing = tokio::task::spawn_blocking(move || run_timing(captions, audio))
            .await
            .map_err(|error| worker_lost(PipelineStage::Timing, error))
            .and_then(|result| result.map_err(failed_at(PipelineStage::Timing)));
        let (segments, decoded) = match timing {
            Ok(output) => output,
            Err(error) => {
                sink.abort();
                return Err(error);
            }
        };
        reporter.report(PipelineStage::Timing, 1.0);

        if let Err(error) = cancel.check(PipelineStage::Aligning) {
            sink.abort();
            return Err(error);
        }
        self.enter(&asset_key, reporter, PipelineStage::Aligning);
        let aligned = tokio::task::spawn_blocking(move || {
            aligner
                .align(segments, decoded.as_ref())
                .map_err(|error| CaptionError::invalid_audio(format!("alignment failed: {error:#}")))
        })
        .await
        .map_err(|error| worker_lost(PipelineStage::Aligning, error))
        .and_then(|result| result.map_err(failed_at(PipelineStage::Aligning)));
        let segments = match aligned {
            Ok(segments) => segments,
            Err(error) => {
                sink.abort();
                return Err(error);
            }
        };
        reporter.report(PipelineStage::Aligning, 1.0);

        if let Err(error) = cancel.check(PipelineStage::Rendering) {
            sink.abort();
            return Err(error);
        }
        self.enter(&asset_key, reporter, PipelineStage::Rendering);
        let render_reporter = reporter.clone();
        let render_cancel = cancel.clone();
        let mut sink = tokio::task::spawn_blocking(move || {
            let inputs = RenderInputs {
                style,
                grid,
                atlas,
                layout,
                render,
                segments,
            };
            match render_frames(inputs, frames, sink.as_mut(), &render_reporter, &render_cancel) {
                Ok(()) => Ok(sink),
                Err(error) => {
                    sink.abort();
                    Err(error)
                }
            }
        })
        .await
        .map_err(|error| worker_lost(PipelineStage::Rendering, error))??;

        if let Err(error) = cancel.check(PipelineStage::Exporting) {
            sink.abort();
            return Err(error);
        }
        self.enter(&asset_key, reporter, PipelineStage::Exporting);
        let output = tokio::task::spawn_blocking(move || {
            sink.finish()
                .map_err(|error| CaptionError::export("failed to finalize output", error))
        })
        .await
        .map_err(|error| worker_lost(PipelineStage::Exporting, error))?
        .map_err(failed_at(PipelineStage::Exporting))?;
        reporter.report(PipelineStage::Exporting, 1.0);

        self.enter(&asset_key, reporter, PipelineStage::Done);
        Ok(output)
    }

    fn enter(&self, asset_key: &str, reporter: &ProgressReporter, stage: PipelineStage) {
        debug!(asset = %asset_key, %stage, "entering stage");
        let state = if stage == PipelineStage::Done {
            JobState::Done
        } else {
            JobState::Running(stage)
        };
        self.set_state(asset_key, state);
        reporter.report(stage, 0.0);
    }
}

fn run_timing(
    captions: CaptionInput,
    audio: Option<Box<dyn AudioSource>>,
) -> Result<(Vec<CaptionSegment>, Option<DecodedAudio>), CaptionError> {
    match captions {
        CaptionInput::Recognized(spans) => {
            let mut source = audio.ok_or_else(|| {
                CaptionError::invalid_audio("recognizer spans need an audio source for timing")
            })?;
            let decoded = source
                .decode()
                .map_err(|error| CaptionError::invalid_audio(format!("{error:#}")))?;
            let segments = map_segments(&spans, decoded.sample_count(), decoded.sample_rate)?;
            Ok((segments, Some(decoded)))
        }
        CaptionInput::Segments(segments) => Ok((segments, None)),
    }
}

struct RenderInputs {
    style: SubtitleStyle,
    grid: AtlasGrid,
    atlas: Option<Arc<GlyphAtlas>>,
    layout: LayoutConfig,
    render: RenderConfig,
    segments: Vec<CaptionSegment>,
}

fn render_frames(
    inputs: RenderInputs,
    mut frames: Box<dyn FrameSource>,
    sink: &mut dyn FrameSink,
    reporter: &ProgressReporter,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let stage = PipelineStage::Rendering;
    let fail = failed_at(stage);

    let atlas = match inputs.atlas {
        Some(atlas) => atlas,
        None => Arc::new(GlyphAtlas::for_style(&inputs.style, inputs.grid).map_err(&fail)?),
    };
    let info = frames.info();
    let setup = RenderJobSetup {
        atlas,
        style: inputs.style,
        segments: inputs.segments,
        layout: inputs.layout,
        max_chunk_bytes: inputs.render.max_chunk_bytes,
        orientation: info.orientation,
        natural_size: info.natural_size,
        fps: info.fps,
    };
    let mut job = RenderJob::with_backend_kind(inputs.render.backend, setup).map_err(&fail)?;
    let overlaps = job.track().overlaps();
    if !overlaps.is_empty() {
        warn!(
            pairs = overlaps.len(),
            "caption segments overlap; the earliest-starting segment is drawn"
        );
    }

    let fps = u64::from(info.fps.max(1));
    let mut composited = 0_u64;
    loop {
        cancel.check(stage)?;
        let Some(frame) = frames
            .next_frame()
            .map_err(|error| fail(CaptionError::frame_buffer(format!("{error:#}"))))?
        else {
            break;
        };
        let output = job.composite(&frame).map_err(&fail)?;
        sink.write_frame(&output)
            .map_err(|error| fail(CaptionError::export("encoder rejected frame", error)))?;
        composited += 1;

        if let Some(total) = info.estimated_frames.filter(|total| *total > 0) {
            reporter.report(stage, composited as f64 / total as f64);
        }
        if composited % fps == 0 {
            debug!(
                frames = composited,
                position_ms = frame.timestamp.rescale(1000).value(),
                backend = job.backend_label(),
                "rendering"
            );
        }
    }

    info!(frames = composited, backend = job.backend_label(), "rendered all frames");
    reporter.report(stage, 1.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_spans_tile_the_unit_interval() {
        let stages = [
            PipelineStage::Timing,
            PipelineStage::Aligning,
            PipelineStage::Rendering,
            PipelineStage::Exporting,
        ];
        let mut end = 0.0;
        for stage in stages {
            let (low, high) = stage_progress_span(stage);
            assert_eq!(low, end);
            assert!(high > low);
            end = high;
        }
        assert_eq!(end, 1.0);
    }

    #[test]
    fn reporter_never_goes_backwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reporter = ProgressReporter::new(Arc::new(move |progress: Progress| {
            sink.lock().expect("lock").push(progress.fraction);
        }));
        reporter.report(PipelineStage::Rendering, 0.5);
        reporter.report(PipelineStage::Rendering, 0.25);
        reporter.report(PipelineStage::Exporting, 0.0);
        let seen = seen.lock().expect("lock").clone();
        assert_eq!(seen.len(), 2);
        assert!((seen[0] - 0.6).abs() < 1e-9);
        assert!((seen[1] - 0.85).abs() < 1e-9);
    }

    #[test]
    fn idle_asset_locks_are_forgotten() {
        let pipeline = Pipeline::new();
        let tracked = |pipeline: &Pipeline| pipeline.asset_locks.lock().expect("locks").len();

        let held = pipeline.asset_lock("clip");
        pipeline.release_asset_lock("clip");
        assert_eq!(tracked(&pipeline), 1, "a held lock stays registered");

        drop(held);
        pipeline.release_asset_lock("clip");
        assert_eq!(tracked(&pipeline), 0);
        pipeline.release_asset_lock("never-seen");
    }

    #[test]
    fn recognized_spans_without_audio_fail_timing() {
        let result = run_timing(CaptionInput::Recognized(vec![]), None);
        assert!(matches!(result, Err(CaptionError::InvalidAudio { .. })));
    }
}
