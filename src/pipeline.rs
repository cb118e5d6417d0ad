//! Scan pipeline
//!
//! Wires the stages together for a run:
//! frame source -> windowing -> dispatcher -> event extraction -> aggregation.
//!
//! Identity search runs first when enabled. In full mode only the videos in
//! which the person was found are forwarded to violence scoring.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::aggregate::{Aggregator, RunResult};
use crate::capabilities::Capabilities;
use crate::common::{Result, ScanError};
use crate::config::{DecodePolicy, ScanConfig, ScanMode};
use crate::dispatcher::{CancelToken, Dispatcher, ScoredUnit};
use crate::events::{EventExtractor, EventPayload, Threshold};
use crate::face::{FaceScorer, ReferenceImage, ReferenceIdentity};
use crate::report::{ReportKind, ReportRequest, Reporter};
use crate::violence::ClipScorer;
use crate::windowing::{Window, WindowPolicy, Windower};

/// Validated configuration, capabilities and worker pool for scan runs
#[derive(Debug)]
pub struct Scanner {
    config: ScanConfig,
    capabilities: Capabilities,
    dispatcher: Dispatcher,
    face_threshold: Threshold,
    violence_threshold: Threshold,
}

impl Scanner {
    /// Validate the configuration and start the worker pool
    #[instrument(skip_all)]
    pub fn new(config: ScanConfig, capabilities: Capabilities) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(config.workers, config.max_in_flight)?;
        let face_threshold = Threshold::new(config.face.threshold)?;
        let violence_threshold = Threshold::new(config.violence.threshold)?;

        info!(
            "Scanner ready: mode={:?}, workers={}, identity_concurrent={}, clip_concurrent={}",
            config.mode,
            config.workers,
            capabilities.identity_concurrent(),
            capabilities.clip_concurrent()
        );

        Ok(Self {
            config,
            capabilities,
            dispatcher,
            face_threshold,
            violence_threshold,
        })
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Run every enabled stage over `videos`
    ///
    /// # Errors
    /// * `InvalidConfig` - No videos, or identity search without references
    /// * `NoReferenceFaces` - No reference image contains a face
    ///
    /// Per-video and per-unit failures are recorded in the result instead.
    #[instrument(skip_all, fields(videos = videos.len(), references = references.len()))]
    pub fn run(&self, videos: &[String], references: &[ReferenceImage], cancel: &CancelToken) -> Result<RunResult> {
        if videos.is_empty() {
            return Err(ScanError::config_error("no videos to scan"));
        }

        let started = Instant::now();
        let mode = self.config.mode;
        let mut result = RunResult {
            complete: true,
            ..RunResult::default()
        };

        // Reference faces are resolved before any video is opened
        let identity = if mode.runs_identity() {
            Some(Arc::new(ReferenceIdentity::from_images(
                references,
                self.capabilities.face_detector.as_ref(),
                self.capabilities.face_embedder.as_ref(),
            )?))
        } else {
            None
        };

        let mut violence_targets: Vec<String> = videos.to_vec();

        if let Some(identity) = identity {
            info!("[1] Missing person search over {} videos", videos.len());
            let (aggregator, complete) = self.scan_identity(identity, videos, cancel);
            result.complete &= complete;

            if mode == ScanMode::Full {
                violence_targets = aggregator.videos_with_events().into_iter().collect();
                result.forwarded_videos = violence_targets.clone();
                info!("{} videos with a match forwarded to violence scoring", violence_targets.len());
            }

            let (events, skipped, failures) = aggregator.into_parts();
            result.identity_events = events;
            result.skipped.extend(skipped);
            result.failures.extend(failures);
        }

        if mode.runs_violence() && result.complete {
            if violence_targets.is_empty() {
                info!("No videos to analyze for violence");
            } else {
                info!("[2] Violence detection over {} videos", violence_targets.len());
                let (aggregator, complete) = self.scan_violence(&violence_targets, cancel);
                result.complete &= complete;

                let (events, skipped, failures) = aggregator.into_parts();
                result.violence_events = events;
                result.skipped.extend(skipped);
                result.failures.extend(failures);
            }
        }

        if !result.complete {
            warn!("Run cancelled; results are partial");
        }

        info!(
            "Run finished in {:.2?}: {} identity events, {} violence events, {} skipped videos, {} failed units",
            started.elapsed(),
            result.identity_events.len(),
            result.violence_events.len(),
            result.skipped.len(),
            result.failures.len()
        );

        Ok(result)
    }

    fn scan_identity(
        &self,
        identity: Arc<ReferenceIdentity>,
        videos: &[String],
        cancel: &CancelToken,
    ) -> (Aggregator, bool) {
        let scorer = FaceScorer::new(
            self.capabilities.face_detector.clone(),
            self.capabilities.face_embedder.clone(),
            identity,
        );
        let extractor = EventExtractor::new(self.face_threshold);
        let serial = !self.capabilities.identity_concurrent();

        self.scan_videos(videos, self.config.face_policy(), extractor, serial, cancel, |window: &Window| {
            match window.first_frame() {
                Some(frame) => scorer.score_frame(frame),
                None => Ok(None),
            }
        })
    }

    fn scan_violence(&self, videos: &[String], cancel: &CancelToken) -> (Aggregator, bool) {
        let scorer = ClipScorer::new(
            self.capabilities.clip_classifier.clone(),
            self.config.violence.input_size,
        );
        let extractor = EventExtractor::new(self.violence_threshold);
        let serial = !self.capabilities.clip_concurrent();

        self.scan_videos(videos, self.config.clip_policy(), extractor, serial, cancel, |window: &Window| {
            scorer.score_window(window).map(Some)
        })
    }

    fn scan_videos<P, F>(
        &self,
        videos: &[String],
        policy: WindowPolicy,
        extractor: EventExtractor,
        serial: bool,
        cancel: &CancelToken,
        score: F,
    ) -> (Aggregator, bool)
    where
        P: EventPayload + Send,
        F: Fn(&Window) -> Result<Option<ScoredUnit<P>>> + Sync,
    {
        let mut aggregator = Aggregator::new();

        for video in videos {
            if cancel.is_cancelled() {
                warn!("Cancelled before {}", video);
                return (aggregator, false);
            }

            if !self.scan_video(video, policy, &extractor, serial, cancel, &score, &mut aggregator) {
                return (aggregator, false);
            }
        }

        (aggregator, true)
    }

    /// Process one video; returns false if the run was cancelled meanwhile
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, extractor, cancel, score, aggregator))]
    fn scan_video<P, F>(
        &self,
        video: &str,
        policy: WindowPolicy,
        extractor: &EventExtractor,
        serial: bool,
        cancel: &CancelToken,
        score: &F,
        aggregator: &mut Aggregator,
    ) -> bool
    where
        P: EventPayload + Send,
        F: Fn(&Window) -> Result<Option<ScoredUnit<P>>> + Sync,
    {
        let source = match self.capabilities.sources.open(video) {
            Ok(source) => source,
            Err(e) => {
                aggregator.skip_video(video, e.to_string());
                return true;
            }
        };
        let fps = source.fps();
        if !fps.is_finite() || fps <= 0.0 {
            aggregator.skip_video(video, format!("unusable frame rate {}", fps));
            return true;
        }

        let windows = match Windower::new(source, policy) {
            Ok(windows) => windows,
            Err(e) => {
                aggregator.skip_video(video, e.to_string());
                return true;
            }
        };

        // Units below the threshold are dropped on the worker so their
        // payloads never outlive the in-flight bound
        let threshold = extractor.threshold();
        let report = self.dispatcher.dispatch(
            windows,
            |window| window.start_index,
            |window: &Window| -> Result<Option<ScoredUnit<P>>> {
                Ok(score(window)?.filter(|unit| threshold.passes(unit.score)))
            },
            serial,
            cancel,
        );

        debug!(
            "{}: {} units submitted, {} outcomes",
            video,
            report.submitted,
            report.outcomes.len()
        );

        for (position, reason) in report.failures() {
            aggregator.record_failure(video, position, reason);
        }

        let complete = report.complete;
        if let Some(error) = &report.source_error {
            match self.config.decode_policy {
                DecodePolicy::Strict => {
                    aggregator.skip_video(video, error.to_string());
                    return complete;
                }
                DecodePolicy::TruncateOnError => {
                    warn!("{}: decode stopped early ({}), keeping {} scored units", video, error, report.submitted);
                }
            }
        }

        let events = extractor.extract(video, fps, report.into_scored());
        aggregator.add_video(video, events);
        complete
    }
}

/// Run a scan with a fresh [`Scanner`]
pub fn run(
    config: ScanConfig,
    capabilities: Capabilities,
    videos: &[String],
    references: &[ReferenceImage],
    cancel: &CancelToken,
) -> Result<RunResult> {
    Scanner::new(config, capabilities)?.run(videos, references, cancel)
}

/// Hand the ranked events of a finished run to a reporter
///
/// One report per domain with at least one event. Partial results of a
/// cancelled run are never reported as final.
#[instrument(skip_all)]
pub fn write_reports(result: &RunResult, reporter: &dyn Reporter, references: &[String]) -> Result<Vec<PathBuf>> {
    if !result.is_final() {
        return Err(ScanError::Cancelled);
    }

    let mut artifacts = Vec::new();
    for (kind, events) in [
        (ReportKind::MissingPerson, &result.identity_events),
        (ReportKind::Violence, &result.violence_events),
    ] {
        if events.is_empty() {
            continue;
        }
        artifacts.push(reporter.report(&ReportRequest {
            kind,
            events,
            references,
        })?);
    }

    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use image::RgbImage;

    use crate::capabilities::{ClipClassifier, Embedding, FaceCandidate, FaceDetector, FaceEmbedder};
    use crate::events::{EventMetadata, Evidence, Severity};
    use crate::video_stream::MemorySourceFactory;
    use crate::violence::{ClipEvidence, ClipTensor};

    static LIVE: AtomicUsize = AtomicUsize::new(0);
    static PEAK: AtomicUsize = AtomicUsize::new(0);

    /// Payload that tracks how many instances are alive at once
    struct Tracked;

    impl Tracked {
        fn new() -> Self {
            let live = LIVE.fetch_add(1, Ordering::SeqCst) + 1;
            PEAK.fetch_max(live, Ordering::SeqCst);
            Tracked
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            LIVE.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl EventPayload for Tracked {
        fn into_evidence(self, _score: f32) -> (Evidence, EventMetadata) {
            let evidence = Evidence::Clip(ClipEvidence {
                thumbnail: RgbImage::new(1, 1),
                frame_count: 1,
            });
            (evidence, EventMetadata::Violence { severity: Severity::Low })
        }
    }

    struct Unused;

    impl FaceDetector for Unused {
        fn detect_faces(&self, _image: &RgbImage) -> Result<Vec<FaceCandidate>> {
            Ok(Vec::new())
        }
    }

    impl FaceEmbedder for Unused {
        fn embed(&self, _face: &RgbImage) -> Result<Embedding> {
            Ok(Vec::new())
        }
    }

    impl ClipClassifier for Unused {
        fn classify_clip(&self, _clip: &ClipTensor) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn scanner(sources: MemorySourceFactory) -> Scanner {
        let config = ScanConfig {
            mode: ScanMode::Violence,
            workers: 2,
            max_in_flight: 2,
            ..ScanConfig::default()
        };
        let capabilities = Capabilities {
            sources: Arc::new(sources),
            face_detector: Arc::new(Unused),
            face_embedder: Arc::new(Unused),
            clip_classifier: Arc::new(Unused),
        };
        Scanner::new(config, capabilities).unwrap()
    }

    #[test]
    fn test_below_threshold_payloads_released_on_worker() {
        let frames = (0..500).map(|_| RgbImage::new(2, 2)).collect();
        let scanner = scanner(MemorySourceFactory::new().with_video("long.mp4", 25.0, frames));
        let extractor = EventExtractor::new(Threshold::new(0.5).unwrap());
        let mut aggregator = Aggregator::new();

        let score = |window: &Window| -> Result<Option<ScoredUnit<Tracked>>> {
            Ok(Some(ScoredUnit {
                position: window.start_index,
                score: 0.1,
                payload: Tracked::new(),
            }))
        };

        let complete = scanner.scan_video(
            "long.mp4",
            WindowPolicy::FixedStride { stride: 1 },
            &extractor,
            false,
            &CancelToken::new(),
            &score,
            &mut aggregator,
        );

        assert!(complete);
        assert!(aggregator.is_empty());
        assert_eq!(LIVE.load(Ordering::SeqCst), 0);
        assert!(PEAK.load(Ordering::SeqCst) <= 2, "peak {}", PEAK.load(Ordering::SeqCst));
    }
}
