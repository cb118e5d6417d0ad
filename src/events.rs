//! Event extraction
//!
//! Converts scored units into [`DetectionEvent`]s. A unit becomes an event
//! only if its score is strictly above the threshold. Every passing window
//! produces its own event: adjacent overlapping clips that cover the same
//! act are *not* merged here. Callers that want intervals can post-process
//! with [`merge_intervals`].

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::common::{FrameTimecode, Result, Rgb, ScanError};
use crate::dispatcher::ScoredUnit;
use crate::face::FaceEvidence;
use crate::violence::ClipEvidence;

/// Decision threshold; a score passes only if strictly greater
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold(f32);

impl Threshold {
    pub fn new(value: f32) -> Result<Self> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(ScanError::config_error(format!(
                "threshold must be within [0, 1], got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f32 {
        self.0
    }

    pub fn passes(&self, score: f32) -> bool {
        score > self.0
    }
}

/// Severity band of a violence detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn from_score(score: f32) -> Self {
        if score > 0.9 {
            Severity::High
        } else if score > 0.8 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence band of an identity match, from its similarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn from_similarity(similarity: f32) -> Self {
        if similarity > 0.8 {
            Confidence::High
        } else if similarity > 0.7 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "LOW",
            Confidence::Medium => "MEDIUM",
            Confidence::High => "HIGH",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Levels per channel used when bucketing colours
const COLOR_LEVELS: u32 = 8;

/// Dominant colour of an image
///
/// Pixels are quantised to 8 levels per channel; the most populated bucket
/// wins (ties go to the lowest bucket) and its mean colour is returned.
#[instrument(skip(image), fields(width = image.width(), height = image.height()))]
pub fn dominant_color(image: &RgbImage) -> Rgb {
    let buckets = (COLOR_LEVELS * COLOR_LEVELS * COLOR_LEVELS) as usize;
    let mut counts = vec![0u32; buckets];
    let mut sums = vec![[0u64; 3]; buckets];

    for pixel in image.pixels() {
        let [r, g, b] = pixel.0;
        let bucket = bucket_of(r) * COLOR_LEVELS * COLOR_LEVELS + bucket_of(g) * COLOR_LEVELS + bucket_of(b);
        let bucket = bucket as usize;
        counts[bucket] += 1;
        for (sum, value) in sums[bucket].iter_mut().zip(pixel.0) {
            *sum += value as u64;
        }
    }

    let Some((best, &count)) = counts
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, &u32)>, (i, c)| match best {
            Some((_, top)) if top >= c => best,
            _ => Some((i, c)),
        })
    else {
        return [0, 0, 0];
    };

    if count == 0 {
        return [0, 0, 0];
    }

    let mean = |c: usize| ((sums[best][c] as f64 / count as f64).round()) as u8;
    [mean(0), mean(1), mean(2)]
}

fn bucket_of(value: u8) -> u32 {
    value as u32 * COLOR_LEVELS / 256
}

/// Evidence attached to an event
#[derive(Debug, Clone)]
pub enum Evidence {
    Face(FaceEvidence),
    Clip(ClipEvidence),
}

impl Evidence {
    /// Image shown for the event: the face crop or the clip thumbnail
    pub fn image(&self) -> &RgbImage {
        match self {
            Evidence::Face(face) => &face.crop,
            Evidence::Clip(clip) => &clip.thumbnail,
        }
    }
}

/// Domain-specific event metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventMetadata {
    Identity { dominant_color: Rgb, reference_index: usize },
    Violence { severity: Severity },
}

/// A scored unit that crossed the threshold
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub video_id: String,
    pub frame_index: u64,
    pub time_seconds: f64,
    pub score: f32,
    pub evidence: Evidence,
    pub metadata: EventMetadata,
}

/// Payloads that can be turned into event evidence
pub trait EventPayload {
    fn into_evidence(self, score: f32) -> (Evidence, EventMetadata);
}

impl EventPayload for FaceEvidence {
    fn into_evidence(self, _score: f32) -> (Evidence, EventMetadata) {
        let metadata = EventMetadata::Identity {
            dominant_color: dominant_color(&self.crop),
            reference_index: self.reference_index,
        };
        (Evidence::Face(self), metadata)
    }
}

impl EventPayload for ClipEvidence {
    fn into_evidence(self, score: f32) -> (Evidence, EventMetadata) {
        let metadata = EventMetadata::Violence {
            severity: Severity::from_score(score),
        };
        (Evidence::Clip(self), metadata)
    }
}

/// Threshold-based extractor for one detection domain
#[derive(Debug, Clone, Copy)]
pub struct EventExtractor {
    threshold: Threshold,
}

impl EventExtractor {
    pub fn new(threshold: Threshold) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    /// Turn the scored units of one video into events
    ///
    /// Units may arrive in any order; events come out sorted by frame index.
    #[instrument(skip(self, units), fields(units = units.len()))]
    pub fn extract<P: EventPayload>(
        &self,
        video_id: &str,
        fps: f64,
        units: Vec<ScoredUnit<P>>,
    ) -> Vec<DetectionEvent> {
        let mut events: Vec<DetectionEvent> = units
            .into_iter()
            .filter(|unit| {
                let passes = self.threshold.passes(unit.score);
                trace!("Unit {} score {:.4} passes={}", unit.position, unit.score, passes);
                passes
            })
            .map(|unit| {
                let (evidence, metadata) = unit.payload.into_evidence(unit.score);
                DetectionEvent {
                    video_id: video_id.to_string(),
                    frame_index: unit.position,
                    time_seconds: FrameTimecode::new(unit.position, fps).seconds(),
                    score: unit.score,
                    evidence,
                    metadata,
                }
            })
            .collect();

        events.sort_by_key(|event| event.frame_index);

        debug!(
            "{}: {} events above threshold {}",
            video_id,
            events.len(),
            self.threshold.value()
        );
        events
    }
}

/// A run of events merged into one interval
#[derive(Debug, Clone, PartialEq)]
pub struct EventInterval {
    pub video_id: String,
    pub start_frame: u64,
    pub end_frame: u64,
    pub peak_score: f32,
    pub event_count: usize,
}

/// Merge events of the same video whose starts are at most `gap_frames` apart
///
/// Not applied by the pipeline; offered for callers that prefer intervals
/// over one event per window.
pub fn merge_intervals(events: &[DetectionEvent], gap_frames: u64) -> Vec<EventInterval> {
    let mut sorted: Vec<&DetectionEvent> = events.iter().collect();
    sorted.sort_by(|a, b| a.video_id.cmp(&b.video_id).then(a.frame_index.cmp(&b.frame_index)));

    let mut intervals: Vec<EventInterval> = Vec::new();
    for event in sorted {
        match intervals.last_mut() {
            Some(current)
                if current.video_id == event.video_id
                    && event.frame_index.saturating_sub(current.end_frame) <= gap_frames =>
            {
                current.end_frame = event.frame_index;
                current.peak_score = current.peak_score.max(event.score);
                current.event_count += 1;
            }
            _ => intervals.push(EventInterval {
                video_id: event.video_id.clone(),
                start_frame: event.frame_index,
                end_frame: event.frame_index,
                peak_score: event.score,
                event_count: 1,
            }),
        }
    }
    intervals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BoundingBox;

    fn clip_unit(position: u64, score: f32) -> ScoredUnit<ClipEvidence> {
        ScoredUnit {
            position,
            score,
            payload: ClipEvidence {
                thumbnail: RgbImage::new(2, 2),
                frame_count: 16,
            },
        }
    }

    fn face_unit(position: u64, score: f32) -> ScoredUnit<FaceEvidence> {
        ScoredUnit {
            position,
            score,
            payload: FaceEvidence {
                crop: RgbImage::from_pixel(4, 4, image::Rgb([30, 60, 90])),
                bbox: BoundingBox::new(0.0, 0.0, 4.0, 4.0),
                detection_probability: 0.99,
                reference_index: 2,
                timestamp: position as f64 / 30.0,
            },
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let threshold = Threshold::new(0.72).unwrap();
        assert!(!threshold.passes(0.72));
        assert!(threshold.passes(0.72 + 1e-6));
        assert!(!threshold.passes(0.5));
    }

    #[test]
    fn test_threshold_bounds() {
        assert!(Threshold::new(-0.1).is_err());
        assert!(Threshold::new(1.1).is_err());
        assert!(Threshold::new(f32::INFINITY).is_err());
    }

    #[test]
    fn test_equal_score_never_produces_event() {
        for t in [0.0f32, 0.3, 0.65, 0.68, 0.72, 1.0] {
            let extractor = EventExtractor::new(Threshold::new(t).unwrap());
            let events = extractor.extract("v.mp4", 25.0, vec![clip_unit(0, t)]);
            assert!(events.is_empty(), "score == threshold {} produced an event", t);
        }
    }

    #[test]
    fn test_face_scores_example() {
        let extractor = EventExtractor::new(Threshold::new(0.72).unwrap());
        let units = vec![face_unit(30, 0.9), face_unit(0, 0.5), face_unit(15, 0.75)];

        let events = extractor.extract("v.mp4", 30.0, units);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].frame_index, 15);
        assert_eq!(events[0].score, 0.75);
        assert_eq!(events[1].frame_index, 30);
        assert_eq!(events[1].time_seconds, 1.0);

        match &events[0].metadata {
            EventMetadata::Identity { dominant_color, reference_index } => {
                assert_eq!(*dominant_color, [30, 60, 90]);
                assert_eq!(*reference_index, 2);
            }
            other => panic!("Expected identity metadata, got: {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_windows_not_merged() {
        let extractor = EventExtractor::new(Threshold::new(0.68).unwrap());
        let units = vec![clip_unit(8, 0.85), clip_unit(0, 0.8), clip_unit(16, 0.95)];

        let events = extractor.extract("v.mp4", 8.0, units);
        let starts: Vec<u64> = events.iter().map(|e| e.frame_index).collect();
        assert_eq!(starts, vec![0, 8, 16]);
        assert_eq!(events[2].time_seconds, 2.0);
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(Severity::from_score(0.95), Severity::High);
        assert_eq!(Severity::from_score(0.9), Severity::Medium);
        assert_eq!(Severity::from_score(0.85), Severity::Medium);
        assert_eq!(Severity::from_score(0.8), Severity::Low);
        assert_eq!(Severity::from_score(0.7), Severity::Low);
        assert_eq!(Severity::High.to_string(), "HIGH");
    }

    #[test]
    fn test_confidence_bands() {
        assert_eq!(Confidence::from_similarity(0.95), Confidence::High);
        assert_eq!(Confidence::from_similarity(0.8), Confidence::Medium);
        assert_eq!(Confidence::from_similarity(0.75), Confidence::Medium);
        assert_eq!(Confidence::from_similarity(0.7), Confidence::Low);
        assert_eq!(serde_json::to_string(&Confidence::High).unwrap(), "\"HIGH\"");
    }

    #[test]
    fn test_violence_metadata() {
        let extractor = EventExtractor::new(Threshold::new(0.65).unwrap());
        let events = extractor.extract("v.mp4", 25.0, vec![clip_unit(0, 0.92)]);
        assert_eq!(events[0].metadata, EventMetadata::Violence { severity: Severity::High });
        assert_eq!(events[0].evidence.image().dimensions(), (2, 2));
    }

    #[test]
    fn test_dominant_color_majority_bucket() {
        // 12 reddish pixels vs 4 green pixels
        let image = RgbImage::from_fn(4, 4, |x, y| {
            if y == 3 {
                image::Rgb([0, 255, 0])
            } else if x % 2 == 0 {
                image::Rgb([250, 10, 10])
            } else {
                image::Rgb([240, 20, 0])
            }
        });
        assert_eq!(dominant_color(&image), [245, 15, 5]);
    }

    #[test]
    fn test_dominant_color_empty_image() {
        assert_eq!(dominant_color(&RgbImage::new(0, 0)), [0, 0, 0]);
    }

    #[test]
    fn test_merge_intervals() {
        let extractor = EventExtractor::new(Threshold::new(0.5).unwrap());
        let mut events = extractor.extract("a.mp4", 25.0, vec![clip_unit(0, 0.6), clip_unit(8, 0.9), clip_unit(40, 0.7)]);
        events.extend(extractor.extract("b.mp4", 25.0, vec![clip_unit(8, 0.8)]));

        let intervals = merge_intervals(&events, 8);
        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[0].start_frame, 0);
        assert_eq!(intervals[0].end_frame, 8);
        assert_eq!(intervals[0].event_count, 2);
        assert_eq!(intervals[0].peak_score, 0.9);
        assert_eq!(intervals[1].start_frame, 40);
        assert_eq!(intervals[2].video_id, "b.mp4");
    }
}
