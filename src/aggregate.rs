//! Run-level aggregation
//!
//! Collects the events of every video in a run. Nothing is dropped here:
//! ranking by score for presentation is the only transformation applied.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::events::DetectionEvent;

/// A video that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedVideo {
    pub video_id: String,
    pub reason: String,
}

/// A unit whose scoring failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub video_id: String,
    pub position: u64,
    pub reason: String,
}

/// Event collector for one detection domain across all videos
#[derive(Debug, Default)]
pub struct Aggregator {
    events: Vec<DetectionEvent>,
    skipped: Vec<SkippedVideo>,
    failures: Vec<UnitFailure>,
    videos_processed: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the events of one fully or partially processed video
    pub fn add_video(&mut self, video_id: &str, events: Vec<DetectionEvent>) {
        debug!("Aggregating {} events from {}", events.len(), video_id);
        self.videos_processed += 1;
        self.events.extend(events);
    }

    pub fn skip_video(&mut self, video_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Skipping video {}: {}", video_id, reason);
        self.skipped.push(SkippedVideo {
            video_id: video_id.to_string(),
            reason,
        });
    }

    pub fn record_failure(&mut self, video_id: &str, position: u64, reason: impl Into<String>) {
        self.failures.push(UnitFailure {
            video_id: video_id.to_string(),
            position,
            reason: reason.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn videos_processed(&self) -> usize {
        self.videos_processed
    }

    /// Distinct videos with at least one event, in name order
    pub fn videos_with_events(&self) -> BTreeSet<String> {
        self.events.iter().map(|event| event.video_id.clone()).collect()
    }

    /// Events ranked by descending score
    ///
    /// Equal scores keep a deterministic order: video id, then frame index.
    pub fn ranked(&self) -> Vec<DetectionEvent> {
        let mut events = self.events.clone();
        rank(&mut events);
        events
    }

    pub fn into_parts(self) -> (Vec<DetectionEvent>, Vec<SkippedVideo>, Vec<UnitFailure>) {
        let mut events = self.events;
        rank(&mut events);
        (events, self.skipped, self.failures)
    }
}

fn rank(events: &mut [DetectionEvent]) {
    events.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.video_id.cmp(&b.video_id))
            .then_with(|| a.frame_index.cmp(&b.frame_index))
    });
}

/// Everything a run produced
#[derive(Debug, Default)]
pub struct RunResult {
    /// Identity events ranked by descending similarity
    pub identity_events: Vec<DetectionEvent>,
    /// Violence events ranked by descending probability
    pub violence_events: Vec<DetectionEvent>,
    pub skipped: Vec<SkippedVideo>,
    pub failures: Vec<UnitFailure>,
    /// Videos handed from identity search to violence scoring
    pub forwarded_videos: Vec<String>,
    /// False if the run was cancelled; results are then partial
    pub complete: bool,
}

impl RunResult {
    /// Whether the results may be reported as final
    pub fn is_final(&self) -> bool {
        self.complete
    }

    pub fn total_events(&self) -> usize {
        self.identity_events.len() + self.violence_events.len()
    }
}
