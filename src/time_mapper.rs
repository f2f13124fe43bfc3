//! Maps recognizer millisecond offsets onto the media clock of the decoded audio.

use tracing::{debug, warn};

use crate::error::{CaptionError, CaptionResult};
use crate::media_time::MediaTime;
use crate::segment::{CaptionSegment, RecognizedSpan};

/// Mapped segments use the audio sample rate as their tick rate, so a mapped
/// bound is an audio frame index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTimeMapper {
    total_sample_count: u64,
    sample_rate_hz: u32,
}

impl SegmentTimeMapper {
    pub fn new(total_sample_count: u64, sample_rate_hz: u32) -> CaptionResult<Self> {
        if total_sample_count == 0 {
            return Err(CaptionError::invalid_audio(
                "decoded audio has zero samples; caption timing cannot be computed",
            ));
        }
        if sample_rate_hz == 0 {
            return Err(CaptionError::invalid_audio("decoded audio reports a 0 Hz sample rate"));
        }
        Ok(Self {
            total_sample_count,
            sample_rate_hz,
        })
    }

    /// Total audio length in milliseconds as an exact fraction `(numerator, denominator)`.
    pub fn total_duration_ms(&self) -> (u128, u128) {
        (
            u128::from(self.total_sample_count) * 1000,
            u128::from(self.sample_rate_hz),
        )
    }

    /// Audio frame index for a recognizer offset, clamped to `[0, total_sample_count]`.
    ///
    /// `frame = total * ms / total_duration_ms`, with the duration kept as a
    /// fraction so no rounding happens before the final truncation.
    pub fn frame_at(&self, offset_ms: i64) -> u64 {
        let (duration_num, duration_den) = self.total_duration_ms();
        let clamped_ms = match u128::try_from(offset_ms) {
            Ok(ms) => ms.min(duration_num / duration_den + 1),
            Err(_) => 0,
        };
        // total * ms * den / (total * 1000): the sample count cancels exactly.
        let frame = clamped_ms * duration_den / 1000;
        u64::try_from(frame)
            .unwrap_or(u64::MAX)
            .min(self.total_sample_count)
    }

    pub fn media_time_at(&self, offset_ms: i64) -> MediaTime {
        let frame = self.frame_at(offset_ms);
        MediaTime::new(i64::try_from(frame).unwrap_or(i64::MAX), self.sample_rate_hz)
    }

    /// Maps every span in order. Spans whose mapped interval is empty are
    /// dropped with a warning; nothing is merged or reordered.
    pub fn map(&self, spans: &[RecognizedSpan]) -> Vec<CaptionSegment> {
        let mut segments = Vec::with_capacity(spans.len());
        for (index, span) in spans.iter().enumerate() {
            let start = self.media_time_at(span.start_ms);
            let end = self.media_time_at(span.end_ms);
            match CaptionSegment::new(start, end, span.text.clone()) {
                Some(segment) => segments.push(segment),
                None => warn!(
                    index,
                    start_ms = span.start_ms,
                    end_ms = span.end_ms,
                    "dropping recognizer span with empty mapped interval"
                ),
            }
        }
        debug!(
            spans = spans.len(),
            segments = segments.len(),
            sample_rate = self.sample_rate_hz,
            "mapped recognizer spans onto audio clock"
        );
        segments
    }
}

/// Convenience wrapper over [`SegmentTimeMapper`].
pub fn map_segments(
    spans: &[RecognizedSpan],
    total_sample_count: u64,
    sample_rate_hz: u32,
) -> CaptionResult<Vec<CaptionSegment>> {
    Ok(SegmentTimeMapper::new(total_sample_count, sample_rate_hz)?.map(spans))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_offsets_outside_the_audio() {
        let mapper = SegmentTimeMapper::new(32_000, 16_000).expect("valid audio");
        assert_eq!(mapper.frame_at(-250), 0);
        assert_eq!(mapper.frame_at(2_000), 32_000);
        assert_eq!(mapper.frame_at(9_999_999), 32_000);
    }

    #[test]
    fn truncates_fractional_frames() {
        // 44.1 kHz: 1 ms is 44.1 frames.
        let mapper = SegmentTimeMapper::new(441_000, 44_100).expect("valid audio");
        assert_eq!(mapper.frame_at(1), 44);
        assert_eq!(mapper.frame_at(10), 441);
    }

    #[test]
    fn zero_rate_is_invalid_audio() {
        let error = SegmentTimeMapper::new(10, 0).expect_err("zero rate");
        assert!(matches!(error, CaptionError::InvalidAudio { .. }));
    }

    #[test]
    fn spans_collapsing_past_the_end_are_dropped() {
        let spans = [
            RecognizedSpan::new(0, 500, "kept"),
            RecognizedSpan::new(3_000, 4_000, "beyond"),
        ];
        let segments = map_segments(&spans, 16_000, 16_000).expect("valid audio");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text(), "kept");
    }
}
