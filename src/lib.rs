//! Windowed-inference scanning of video collections
//!
//! Videos are decoded into frames, grouped into windows, scored by pluggable
//! models on a bounded worker pool and turned into ranked detection events.
//! Two detection domains share the same pipeline:
//!
//! * missing-person search - one sampled frame every `frame_interval`
//!   frames, scored by face similarity against reference photos
//! * violence detection - overlapping fixed-length clips scored by a video
//!   classifier
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rust_videoscan::{run, CancelToken, Capabilities, ScanConfig, ScanMode};
//! # fn capabilities() -> Capabilities { unimplemented!() }
//!
//! let config = ScanConfig {
//!     mode: ScanMode::Violence,
//!     ..ScanConfig::default()
//! };
//! let videos = vec!["clip.mp4".to_string()];
//!
//! let result = run(config, capabilities(), &videos, &[], &CancelToken::new())?;
//! for event in &result.violence_events {
//!     println!("{} at {:.2}s: {:.3}", event.video_id, event.time_seconds, event.score);
//! }
//! # Ok::<(), rust_videoscan::ScanError>(())
//! ```
//!
//! Model and decoder implementations are supplied through [`Capabilities`].
//! With the `opencv` feature, [`scan_files`] wires up the OpenCV backend.

mod aggregate;
mod capabilities;
mod common;
mod config;
mod dispatcher;
mod events;
mod face;
mod pipeline;
mod report;
mod video_stream;
mod violence;
mod windowing;

#[cfg(feature = "opencv")]
mod backend;

// Re-export main types for public API
pub use aggregate::{Aggregator, RunResult, SkippedVideo, UnitFailure};
pub use capabilities::{
    cosine_similarity, Capabilities, ClipClassifier, Embedding, FaceCandidate, FaceDetector, FaceEmbedder,
};
pub use common::{BoundingBox, Frame, FrameTimecode, Result, Rgb, ScanError};
pub use config::{DecodePolicy, FaceConfig, ScanConfig, ScanMode, ViolenceConfig};
pub use dispatcher::{CancelToken, DispatchReport, Dispatcher, ScoredUnit, UnitOutcome};
pub use events::{
    dominant_color, merge_intervals, Confidence, DetectionEvent, EventExtractor, EventInterval, EventMetadata, EventPayload,
    Evidence, Severity, Threshold,
};
pub use face::{best_candidate, FaceEvidence, FaceScorer, ReferenceIdentity, ReferenceImage};
pub use pipeline::{run, write_reports, Scanner};
pub use report::{JsonReporter, ReportKind, ReportRequest, Reporter};
pub use video_stream::{FrameSource, FrameSourceFactory, MemoryFrameSource, MemorySourceFactory, VideoInfo};
pub use violence::{violent_probability, ClipEvidence, ClipScorer, ClipTensor};
pub use windowing::{expected_window_starts, Window, WindowPolicy, Windower};

#[cfg(feature = "opencv")]
pub use backend::{
    opencv_capabilities, DnnClipClassifier, ModelPaths, SFaceEmbedder, YuNetFaceDetector,
};
#[cfg(feature = "opencv")]
pub use video_stream::{get_video_info, OpenCvSourceFactory, VideoStream};

use tracing::info;

/// Window start positions a video of `total_frames` frames would produce
/// for each stage enabled by `config`
///
/// Returns `(identity_starts, clip_starts)`; a disabled stage yields an
/// empty list.
pub fn plan_windows(config: &ScanConfig, total_frames: u64) -> Result<(Vec<u64>, Vec<u64>)> {
    config.validate()?;

    let identity = if config.mode.runs_identity() {
        expected_window_starts(total_frames, config.face_policy())
    } else {
        Vec::new()
    };
    let clips = if config.mode.runs_violence() {
        expected_window_starts(total_frames, config.clip_policy())
    } else {
        Vec::new()
    };

    Ok((identity, clips))
}

/// Scan video files on disk with the OpenCV backend
///
/// Reference photos are decoded first; a missing photo aborts the run
/// before any model is loaded.
///
/// # Errors
/// * `InvalidConfig` - Invalid configuration, missing model or reference file
/// * `NoReferenceFaces` - No reference photo contains a face
/// * `OpenCv` - A model could not be loaded
#[cfg(feature = "opencv")]
#[tracing::instrument(skip(config, models, cancel))]
pub fn scan_files(
    config: ScanConfig,
    models: &ModelPaths<'_>,
    videos: &[String],
    references: &[std::path::PathBuf],
    cancel: &CancelToken,
) -> Result<RunResult> {
    let references = if config.mode.runs_identity() {
        references
            .iter()
            .map(|path| ReferenceImage::load(path))
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    let capabilities = opencv_capabilities(models, config.mode.runs_identity(), config.mode.runs_violence())?;
    run(config, capabilities, videos, &references, cancel)
}

/// Initialize tracing for the library
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this more
/// than once keeps the first subscriber.
///
/// # Arguments
/// * `level` - Tracing level filter (e.g., "debug", "info", "warn", "error")
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let installed = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok();

    if installed {
        info!("Video scan library initialized with tracing level: {}", level);
    }
}
