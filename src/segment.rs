//! Caption segments, the sorted track the compositor queries, and the JSON
//! interchange form.
//!
//! The interchange record stores `start`/`end` as floating seconds and reads
//! them back at [`MediaTime::INTERCHANGE_TIMESCALE`] (600 ticks/s). The round
//! trip is lossy: a decoded bound differs from the original by at most one
//! tick, about 1.67 ms.

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::media_time::MediaTime;

/// A caption text valid over `[start, end)` on the media timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "SegmentRecord", try_from = "SegmentRecord")]
pub struct CaptionSegment {
    id: Uuid,
    start: MediaTime,
    end: MediaTime,
    text: String,
}

impl CaptionSegment {
    /// Returns `None` unless `start < end`.
    pub fn new(start: MediaTime, end: MediaTime, text: impl Into<String>) -> Option<Self> {
        Self::with_id(Uuid::new_v4(), start, end, text)
    }

    pub fn with_id(
        id: Uuid,
        start: MediaTime,
        end: MediaTime,
        text: impl Into<String>,
    ) -> Option<Self> {
        if start >= end {
            return None;
        }
        Some(Self {
            id,
            start,
            end,
            text: text.into(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start(&self) -> MediaTime {
        self.start
    }

    pub fn end(&self) -> MediaTime {
        self.end
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn contains(&self, t: MediaTime) -> bool {
        self.start <= t && t < self.end
    }
}

/// Compact on-disk record: `{"id", "s", "e", "t"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentRecord {
    id: Uuid,
    s: f64,
    e: f64,
    t: String,
}

impl From<CaptionSegment> for SegmentRecord {
    fn from(segment: CaptionSegment) -> Self {
        Self {
            id: segment.id,
            s: segment.start.seconds(),
            e: segment.end.seconds(),
            t: segment.text,
        }
    }
}

impl TryFrom<SegmentRecord> for CaptionSegment {
    type Error = String;

    fn try_from(record: SegmentRecord) -> std::result::Result<Self, Self::Error> {
        let reject = || {
            format!(
                "segment {} has start {}s not before end {}s",
                record.id, record.s, record.e
            )
        };
        if record.s.partial_cmp(&record.e) != Some(Ordering::Less) {
            return Err(reject());
        }
        let (start, end) = interchange_bounds(record.s, record.e);
        CaptionSegment::with_id(record.id, start, end, record.t).ok_or_else(reject)
    }
}

/// Rounds `start < end` to interchange ticks.
///
/// An interval shorter than a tick that rounds to a single tick `k` is widened
/// to one tick, on whichever side keeps both bounds within a tick of the input.
fn interchange_bounds(start: f64, end: f64) -> (MediaTime, MediaTime) {
    let timescale = MediaTime::INTERCHANGE_TIMESCALE;
    let start_time = MediaTime::from_seconds(start, timescale);
    let end_time = MediaTime::from_seconds(end, timescale);
    if start_time < end_time {
        return (start_time, end_time);
    }
    let tick = start_time.value();
    if end * f64::from(timescale) >= tick as f64 {
        (start_time, MediaTime::new(tick.saturating_add(1), timescale))
    } else {
        (MediaTime::new(tick.saturating_sub(1), timescale), end_time)
    }
}

pub fn read_segments(path: &Path) -> Result<Vec<CaptionSegment>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read segments {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse segments {}", path.display()))
}

pub fn write_segments(path: &Path, segments: &[CaptionSegment]) -> Result<()> {
    let json = serde_json::to_string_pretty(segments).context("failed to serialize segments")?;
    fs::write(path, json).with_context(|| format!("failed to write segments {}", path.display()))
}

/// Segments sorted by start time, with an interval lookup.
///
/// Overlap is tolerated: when several segments contain `t`, the one with the
/// earliest start wins, and equal starts resolve to the original input order.
#[derive(Debug, Clone, Default)]
pub struct SegmentTrack {
    segments: Vec<CaptionSegment>,
    // max end over segments[..=i]; monotone, so it can be binary searched.
    prefix_max_end: Vec<MediaTime>,
}

impl SegmentTrack {
    pub fn new(mut segments: Vec<CaptionSegment>) -> Self {
        segments.sort_by_key(CaptionSegment::start);

        let mut prefix_max_end = Vec::with_capacity(segments.len());
        let mut running: Option<MediaTime> = None;
        for segment in &segments {
            let next = match running {
                Some(current) if current >= segment.end => current,
                _ => segment.end,
            };
            prefix_max_end.push(next);
            running = Some(next);
        }

        Self {
            segments,
            prefix_max_end,
        }
    }

    pub fn segments(&self) -> &[CaptionSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The segment whose `[start, end)` contains `t`, if any.
    pub fn active_at(&self, t: MediaTime) -> Option<&CaptionSegment> {
        // No segment before `lower` can still be running at t.
        let lower = self.prefix_max_end.partition_point(|end| *end <= t);
        // No segment from `upper` on has started yet.
        let upper = self.segments.partition_point(|segment| segment.start <= t);
        if lower >= upper {
            return None;
        }
        self.segments[lower..upper]
            .iter()
            .find(|segment| segment.contains(t))
    }

    /// Index pairs `(i, j)`, `i < j`, of sorted segments whose intervals overlap.
    pub fn overlaps(&self) -> Vec<(usize, usize)> {
        let mut pairs = Vec::new();
        for (i, left) in self.segments.iter().enumerate() {
            for (offset, right) in self.segments[i + 1..].iter().enumerate() {
                if right.start >= left.end {
                    break;
                }
                pairs.push((i, i + 1 + offset));
            }
        }
        pairs
    }
}

/// One recognizer output tuple: `(start_ms, end_ms, text)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizedSpan {
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

impl RecognizedSpan {
    pub fn new(start_ms: i64, end_ms: i64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }
}

/// Reads a transcript: a JSON array of `{start_ms, end_ms, text}` objects.
pub fn read_transcript(path: &Path) -> Result<Vec<RecognizedSpan>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read transcript {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse transcript {}", path.display()))
}
