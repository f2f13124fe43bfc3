use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::compositor::SourceFrame;
use crate::encoding::{resolve_ffmpeg, FfmpegMode};
use crate::media_time::MediaTime;
use crate::orientation::{Orientation, PixelFormat};
use crate::pipeline::{FrameSource, FrameSourceInfo};

/// What `ffprobe` reports about an asset's first video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub orientation: Orientation,
    pub duration_seconds: Option<f64>,
    pub has_audio: bool,
}

impl VideoInfo {
    pub fn estimated_frames(&self, fps: u32) -> Option<u64> {
        self.duration_seconds
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
            .map(|seconds| (seconds * f64::from(fps)).ceil() as u64)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    tags: Option<ProbeTags>,
    #[serde(default)]
    side_data_list: Vec<ProbeSideData>,
}

#[derive(Debug, Deserialize)]
struct ProbeTags {
    rotate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeSideData {
    rotation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

pub fn probe_video(input_path: &Path) -> Result<VideoInfo> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("stream=codec_type,width,height,duration:stream_tags=rotate:stream_side_data=rotation:format=duration")
        .arg("-of")
        .arg("json")
        .arg(input_path)
        .stdin(Stdio::null())
        .output()
        .context("failed to run ffprobe")?;
    if !output.status.success() {
        bail!(
            "ffprobe failed for {} with status {}: {}",
            input_path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let text = String::from_utf8(output.stdout).context("ffprobe output is not UTF-8")?;
    let info = parse_probe_json(&text)
        .with_context(|| format!("failed to read ffprobe output for {}", input_path.display()))?;
    info!(
        input = %input_path.display(),
        width = info.width,
        height = info.height,
        orientation = ?info.orientation,
        has_audio = info.has_audio,
        "probed video"
    );
    Ok(info)
}

pub fn parse_probe_json(text: &str) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_str(text).context("invalid ffprobe JSON")?;
    let video = probe
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| anyhow!("asset has no video stream"))?;
    let (width, height) = match (video.width, video.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => (width, height),
        _ => bail!("video stream has no frame size"),
    };

    // Display-matrix side data is counter-clockwise; the legacy tag is clockwise.
    let clockwise = video
        .side_data_list
        .iter()
        .find_map(|side| side.rotation)
        .map(|ccw| -ccw)
        .or_else(|| {
            video
                .tags
                .as_ref()
                .and_then(|tags| tags.rotate.as_deref())
                .and_then(|rotate| rotate.trim().parse::<f64>().ok())
        })
        .unwrap_or(0.0);

    let duration_seconds = video
        .duration
        .as_deref()
        .or_else(|| probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|raw| raw.trim().parse::<f64>().ok());

    Ok(VideoInfo {
        width,
        height,
        orientation: Orientation::from_clockwise_degrees(clockwise),
        duration_seconds,
        has_audio: probe
            .streams
            .iter()
            .any(|stream| stream.codec_type.as_deref() == Some("audio")),
    })
}

/// Decodes frames in stored orientation, resampled to a constant frame rate.
pub struct FfmpegFrameSource {
    receiver: mpsc::Receiver<Vec<u8>>,
    worker: Option<JoinHandle<Result<()>>>,
    child: Child,
    info: FrameSourceInfo,
    next_index: i64,
    finished: bool,
}

impl FfmpegFrameSource {
    pub fn spawn(input_path: &Path, video: &VideoInfo, fps: u32, mode: FfmpegMode) -> Result<Self> {
        if fps == 0 {
            bail!("frame rate must be > 0");
        }
        let ffmpeg = resolve_ffmpeg(mode)?;
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);
        let input_path: PathBuf = input_path.to_path_buf();

        let mut child = Command::new(&ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-noautorotate")
            .arg("-i")
            .arg(&input_path)
            .arg("-map")
            .arg("0:v:0")
            .arg("-vf")
            .arg(format!("fps={fps}"))
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("failed to spawn ffmpeg decoder")?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        let frame_size = video.width as usize * video.height as usize * 4;

        let worker = thread::Builder::new()
            .name("caption-ffmpeg-decoder".to_owned())
            .spawn(move || {
                loop {
                    let mut buffer = vec![0u8; frame_size];
                    match stdout.read_exact(&mut buffer) {
                        Ok(_) => {
                            if sender.send(buffer).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(anyhow!("failed to read from ffmpeg: {e}")),
                    }
                }
                Ok(())
            })
            .context("failed to spawn ffmpeg reader thread")?;

        debug!(input = %input_path.display(), fps, "started frame decoder");
        Ok(Self {
            receiver,
            worker: Some(worker),
            child,
            info: FrameSourceInfo {
                natural_size: (video.width, video.height),
                orientation: video.orientation,
                fps,
                estimated_frames: video.estimated_frames(fps),
            },
            next_index: 0,
            finished: false,
        })
    }

    fn join(&mut self) -> Result<()> {
        let read_result = match self.worker.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("ffmpeg reader thread panicked")),
            },
            None => Ok(()),
        };
        let status = self.child.wait().context("failed waiting for ffmpeg decoder")?;
        read_result?;
        if !status.success() {
            bail!("ffmpeg decoder exited with status {status}");
        }
        Ok(())
    }
}

impl FrameSource for FfmpegFrameSource {
    fn info(&self) -> FrameSourceInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        if self.finished {
            return Ok(None);
        }
        match self.receiver.recv() {
            Ok(pixels) => {
                let timestamp = MediaTime::new(self.next_index, self.info.fps);
                self.next_index += 1;
                Ok(Some(SourceFrame {
                    timestamp,
                    width: self.info.natural_size.0,
                    height: self.info.natural_size.1,
                    format: PixelFormat::Rgba8,
                    pixels,
                }))
            }
            Err(_) => {
                self.finished = true;
                self.join()?;
                Ok(None)
            }
        }
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_data_rotation_is_counter_clockwise() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "width": 1920, "height": 1080, "duration": "12.5",
                 "side_data_list": [{"rotation": -90}]},
                {"codec_type": "audio"}
            ],
            "format": {"duration": "12.6"}
        }"#;
        let info = parse_probe_json(json).expect("probe");
        assert_eq!(info.orientation, Orientation::Rotate90);
        assert_eq!(info.orientation.render_size((info.width, info.height)), (1080, 1920));
        assert_eq!(info.duration_seconds, Some(12.5));
        assert!(info.has_audio);
        assert_eq!(info.estimated_frames(30), Some(375));
    }

    #[test]
    fn legacy_rotate_tag_and_format_duration() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 640, "height": 480, "tags": {"rotate": "180"}}],
            "format": {"duration": "2.0"}
        }"#;
        let info = parse_probe_json(json).expect("probe");
        assert_eq!(info.orientation, Orientation::Rotate180);
        assert_eq!(info.duration_seconds, Some(2.0));
        assert!(!info.has_audio);
    }

    #[test]
    fn audio_only_asset_is_rejected() {
        let json = r#"{"streams": [{"codec_type": "audio"}]}"#;
        assert!(parse_probe_json(json).is_err());
    }
}
