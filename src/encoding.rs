use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compositor::CompositedFrame;
use crate::config::{ExportConfig, VideoCodec};
use crate::pipeline::FrameSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfmpegMode {
    #[default]
    Auto,
    System,
    Sidecar,
}

/// Resolves the ffmpeg executable for `mode`, downloading the sidecar if needed.
pub fn resolve_ffmpeg(mode: FfmpegMode) -> Result<PathBuf> {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => Ok(PathBuf::from("ffmpeg")),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                let path = ffmpeg_sidecar::paths::ffmpeg_path();
                if !path.exists() {
                    ffmpeg_sidecar::download::auto_download()
                        .context("failed to auto-download ffmpeg sidecar binary")?;
                }
                Ok(path)
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                Err(anyhow!(
                    "ffmpeg sidecar mode requested but caption-burn was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                ))
            }
        }
    }
}

/// Encoder settings for one output file.
#[derive(Debug, Clone)]
pub struct EncodeTarget {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub output_path: PathBuf,
    /// Source whose first audio stream is muxed into the output, if any.
    pub audio_source: Option<PathBuf>,
    pub export: ExportConfig,
}

/// Streams RGBA frames into an ffmpeg encoder running on a worker thread.
///
/// The destination is removed when encoding fails or is aborted.
pub struct FfmpegFrameSink {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<()>>>,
    output_path: PathBuf,
    frame_bytes: usize,
    frames_written: u64,
}

impl FfmpegFrameSink {
    pub fn spawn(target: EncodeTarget) -> Result<Self> {
        validate_output_path(&target.output_path)?;
        let ffmpeg = resolve_ffmpeg(target.export.ffmpeg)?;
        let frame_bytes = target.width as usize * target.height as usize * 4;
        let output_path = target.output_path.clone();
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);

        let worker = thread::Builder::new()
            .name("caption-ffmpeg-encoder".to_owned())
            .spawn(move || run_ffmpeg_process(&ffmpeg, receiver, &target))
            .context("failed to spawn ffmpeg writer thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            output_path,
            frame_bytes,
            frames_written: 0,
        })
    }

    fn join_worker(&mut self) -> Result<()> {
        drop(self.sender.take());
        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("ffmpeg worker thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("ffmpeg worker thread panicked")),
        }
    }

    fn discard_output(&self) {
        match fs::remove_file(&self.output_path) {
            Ok(()) => debug!(path = %self.output_path.display(), "removed partial output"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!(
                path = %self.output_path.display(),
                %error,
                "failed to remove partial output"
            ),
        }
    }
}

impl FrameSink for FfmpegFrameSink {
    fn write_frame(&mut self, frame: &CompositedFrame) -> Result<()> {
        if frame.pixels.len() != self.frame_bytes {
            bail!(
                "composited frame is {} bytes, encoder expects {}",
                frame.pixels.len(),
                self.frame_bytes
            );
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("encoder has already been finalized"))?;
        if sender.send(frame.pixels.clone()).is_err() {
            // The worker exited early; its error explains why.
            return Err(match self.join_worker() {
                Err(error) => error.context("ffmpeg stopped accepting frames"),
                Ok(()) => anyhow!("ffmpeg exited before all frames were written"),
            });
        }
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<PathBuf> {
        match self.join_worker() {
            Ok(()) => {
                info!(
                    path = %self.output_path.display(),
                    frames = self.frames_written,
                    "encoded output"
                );
                Ok(self.output_path.clone())
            }
            Err(error) => {
                self.discard_output();
                Err(error)
            }
        }
    }

    fn abort(&mut self) {
        if self.worker.is_some() {
            if let Err(error) = self.join_worker() {
                debug!(%error, "encoder stopped during abort");
            }
        }
        self.discard_output();
    }
}

impl Drop for FfmpegFrameSink {
    fn drop(&mut self) {
        // Dropped without `finish`: the output is incomplete.
        if self.worker.is_some() {
            self.abort();
        }
    }
}

fn validate_output_path(output_path: &Path) -> Result<()> {
    let path_str = output_path.to_string_lossy();
    if path_str.chars().any(|c| c.is_control()) {
        bail!("output path contains control characters");
    }
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.is_dir() {
            bail!("output directory does not exist: {}", parent.display());
        }
    }
    Ok(())
}

fn run_ffmpeg_process(
    ffmpeg_path: &Path,
    receiver: mpsc::Receiver<Vec<u8>>,
    target: &EncodeTarget,
) -> Result<()> {
    let args = ffmpeg_args(target);
    let mut command = Command::new(ffmpeg_path);
    command
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(|error| {
        if error.kind() == ErrorKind::NotFound {
            anyhow!(
                "ffmpeg executable not found (resolved_path={}). Install ffmpeg or use sidecar mode with `--features sidecar_ffmpeg`.",
                ffmpeg_path.display()
            )
        } else {
            anyhow!(
                "failed to spawn ffmpeg process (resolved_path={}, args='{}'): {error}",
                ffmpeg_path.display(),
                args.join(" ")
            )
        }
    })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    let mut write_result = Ok(());
    while let Ok(frame) = receiver.recv() {
        if let Err(error) = stdin.write_all(&frame) {
            write_result = Err(error).context("failed to write frame to ffmpeg stdin");
            break;
        }
    }
    if write_result.is_ok() {
        write_result = stdin.flush().context("failed to flush ffmpeg stdin");
    }
    drop(stdin);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    if !status.success() {
        return Err(anyhow!(
            "ffmpeg failed with status {status} (args='{}', stderr_tail='{}')",
            args.join(" "),
            stderr_tail
        ));
    }
    write_result
}

pub fn ffmpeg_args(target: &EncodeTarget) -> Vec<String> {
    let size = format!("{}x{}", target.width, target.height);
    let mut args = ffmpeg_rawvideo_input_args(&size, &target.fps.to_string());

    let audio = target
        .audio_source
        .as_ref()
        .filter(|_| target.export.keep_audio);
    if let Some(source) = audio {
        args.extend([
            "-i".to_owned(),
            source.to_string_lossy().into_owned(),
            "-map".to_owned(),
            "0:v:0".to_owned(),
            "-map".to_owned(),
            "1:a:0?".to_owned(),
            "-c:a".to_owned(),
            audio_codec(target.export.codec).to_owned(),
            "-shortest".to_owned(),
        ]);
    } else {
        args.push("-an".to_owned());
    }

    args.extend(ffmpeg_video_output_args(&target.export));
    args.extend(ffmpeg_container_output_args(&target.output_path));
    args.push(target.output_path.to_string_lossy().into_owned());
    args
}

pub fn ffmpeg_rawvideo_input_args(size: &str, fps: &str) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s:v".to_owned(),
        size.to_owned(),
        "-r".to_owned(),
        fps.to_owned(),
        "-i".to_owned(),
        "-".to_owned(),
    ]
}

pub fn ffmpeg_video_output_args(export: &ExportConfig) -> Vec<String> {
    match export.codec {
        VideoCodec::H264 | VideoCodec::Hevc => vec![
            "-c:v".to_owned(),
            export.codec.to_ffmpeg_codec().to_owned(),
            "-crf".to_owned(),
            export.crf.to_string(),
            "-preset".to_owned(),
            "medium".to_owned(),
            "-pix_fmt".to_owned(),
            "yuv420p".to_owned(),
        ],
        VideoCodec::Prores => vec![
            "-c:v".to_owned(),
            export.codec.to_ffmpeg_codec().to_owned(),
            "-profile:v".to_owned(),
            "3".to_owned(),
            "-pix_fmt".to_owned(),
            "yuv422p10le".to_owned(),
        ],
    }
}

pub fn ffmpeg_container_output_args(output_path: &Path) -> Vec<String> {
    let ext = output_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if matches!(ext.as_str(), "mov" | "mp4" | "m4v") {
        vec!["-movflags".to_owned(), "+faststart".to_owned()]
    } else {
        Vec::new()
    }
}

fn audio_codec(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::Prores => "pcm_s16le",
        VideoCodec::H264 | VideoCodec::Hevc => "aac",
    }
}

fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(last_n_chars(&text, 500))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(audio: Option<&str>, codec: VideoCodec, output: &str) -> EncodeTarget {
        EncodeTarget {
            width: 1080,
            height: 1920,
            fps: 30,
            output_path: PathBuf::from(output),
            audio_source: audio.map(PathBuf::from),
            export: ExportConfig {
                codec,
                ..ExportConfig::default()
            },
        }
    }

    #[test]
    fn h264_args_map_source_audio_optionally() {
        let args = ffmpeg_args(&target(Some("in.mov"), VideoCodec::H264, "out.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-s:v 1080x1920 -r 30 -i -"));
        assert!(joined.contains("-i in.mov -map 0:v:0 -map 1:a:0? -c:a aac"));
        assert!(joined.contains("-c:v libx264 -crf 18"));
        assert!(joined.contains("-movflags +faststart"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn no_audio_source_disables_audio() {
        let args = ffmpeg_args(&target(None, VideoCodec::Prores, "out.mkv"));
        assert!(args.contains(&"-an".to_owned()));
        assert!(args.contains(&"prores_ks".to_owned()));
        assert!(!args.contains(&"-movflags".to_owned()));
    }

    #[test]
    fn keep_audio_false_drops_the_audio_input() {
        let mut target = target(Some("in.mov"), VideoCodec::Hevc, "out.mp4");
        target.export.keep_audio = false;
        let args = ffmpeg_args(&target);
        assert!(!args.contains(&"in.mov".to_owned()));
        assert!(args.contains(&"libx265".to_owned()));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        assert_eq!(last_n_chars("  abcdef ", 4), "def");
    }

    #[test]
    fn rejects_missing_output_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(validate_output_path(&temp.path().join("nope/out.mp4")).is_err());
        assert!(validate_output_path(&temp.path().join("out.mp4")).is_ok());
    }
}
