//! Decoded mono PCM input for caption timing.

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::encoding::{resolve_ffmpeg, FfmpegMode};

/// Recognizer input rate.
pub const RECOGNIZER_SAMPLE_RATE: u32 = 16_000;

/// Mono signed 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn sample_count(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Reads 16-bit integer PCM WAV audio.
///
/// Multi-channel audio is downmixed by averaging each frame's channels.
pub fn decode_wav<R: Read>(reader: R) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(reader).context("not a readable WAV stream")?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        bail!(
            "unsupported WAV encoding ({:?}, {} bits); only 16-bit PCM is supported",
            spec.sample_format,
            spec.bits_per_sample
        );
    }
    if spec.channels == 0 {
        bail!("WAV file declares zero channels");
    }

    let interleaved = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("truncated WAV sample data")?;
    let channels = usize::from(spec.channels);
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&sample| i32::from(sample)).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

pub fn parse_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    decode_wav(Cursor::new(bytes))
}

pub fn read_wav(path: &Path) -> Result<DecodedAudio> {
    let file =
        File::open(path).with_context(|| format!("failed to open WAV file {}", path.display()))?;
    decode_wav(BufReader::new(file))
        .with_context(|| format!("failed to parse WAV file {}", path.display()))
}

/// Decodes the first audio stream of a media file to mono s16 at a fixed rate.
#[derive(Debug, Clone)]
pub struct FfmpegAudioSource {
    input_path: PathBuf,
    sample_rate: u32,
    mode: FfmpegMode,
}

impl FfmpegAudioSource {
    pub fn new(input_path: &Path) -> Self {
        Self {
            input_path: input_path.to_path_buf(),
            sample_rate: RECOGNIZER_SAMPLE_RATE,
            mode: FfmpegMode::Auto,
        }
    }

    pub fn with_mode(mut self, mode: FfmpegMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn decode(&self) -> Result<DecodedAudio> {
        let ffmpeg = resolve_ffmpeg(self.mode)?;
        let mut command = Command::new(&ffmpeg);
        command
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(&self.input_path)
            .arg("-vn")
            .arg("-map")
            .arg("0:a:0")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(self.sample_rate.to_string())
            .arg("-f")
            .arg("s16le")
            .arg("-");
        let samples = read_pcm(command, &self.input_path)
            .with_context(|| format!("{} audio decode failed", ffmpeg.display()))?;
        debug!(
            input = %self.input_path.display(),
            samples = samples.len(),
            rate = self.sample_rate,
            "decoded audio"
        );
        Ok(DecodedAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// Runs a decoder that writes s16le PCM to stdout.
///
/// stdout and stderr are drained together, so a decoder that logs heavily
/// cannot stall on a full stderr pipe.
fn read_pcm(mut command: Command, input_path: &Path) -> Result<Vec<i16>> {
    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to run the audio decoder")?;
    if !output.status.success() {
        bail!(
            "decoding {} failed with status {}: {}",
            input_path.display(),
            output.status,
            String::from_utf8_lossy(tail(&output.stderr)).trim()
        );
    }
    Ok(output
        .stdout
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Last few KiB of decoder diagnostics.
fn tail(stderr: &[u8]) -> &[u8] {
    const KEEP: usize = 4096;
    &stderr[stderr.len().saturating_sub(KEEP)..]
}

#[cfg(test)]
fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut out, spec).expect("wav writer");
        for &sample in samples {
            writer.write_sample(sample).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }
    out.into_inner()
}
