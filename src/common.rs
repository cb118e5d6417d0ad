//! Common types, utilities, and error handling for the video scan pipeline.
//!
//! This module provides the foundational types shared by every stage:
//! frame timecodes, decoded frames, bounding boxes, and the error taxonomy
//! used to decide whether a failure skips a unit, a video, or the whole run.

use image::RgbImage;
use tracing::{debug, instrument};

/// RGB colour triple
pub type Rgb = [u8; 3];

/// Represents a specific point in time within a video
///
/// Pairs a frame index with the stream framerate so positions reported by
/// the windowing engine can be converted to wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTimecode {
    frame_number: u64,
    fps: f64,
}

impl FrameTimecode {
    /// Create a new FrameTimecode
    ///
    /// # Arguments
    /// * `frame_number` - The frame number (0-indexed)
    /// * `fps` - Frames per second of the video
    ///
    /// # Panics
    /// Panics if fps is not positive (fail-fast approach)
    pub fn new(frame_number: u64, fps: f64) -> Self {
        assert!(fps > 0.0, "FPS must be positive, got: {}", fps);
        Self { frame_number, fps }
    }

    /// Get the frame number
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Get the framerate
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Convert to seconds since start of video (`index / fps`)
    pub fn seconds(&self) -> f64 {
        self.frame_number as f64 / self.fps
    }
}

/// A single decoded video frame
///
/// Produced by a frame source in strictly increasing `index` order and never
/// mutated afterwards. Pixels are stored as packed RGB.
#[derive(Clone)]
pub struct Frame {
    pub index: u64,
    pub timestamp: f64,
    pub pixels: RgbImage,
}

impl Frame {
    pub fn new(index: u64, timestamp: f64, pixels: RgbImage) -> Self {
        Self { index, timestamp, pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

// Pixel buffers are large; keep Debug output to the metadata
impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("timestamp", &self.timestamp)
            .field("width", &self.pixels.width())
            .field("height", &self.pixels.height())
            .finish()
    }
}

/// Axis-aligned box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Clamp the box to an image of the given size
    ///
    /// Returns integer `(x, y, w, h)` or `None` if nothing of the box lies
    /// inside the image.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as i64;
        let y0 = self.y.max(0.0).floor() as i64;
        let x1 = ((self.x + self.width).ceil() as i64).min(image_width as i64);
        let y1 = ((self.y + self.height).ceil() as i64).min(image_height as i64);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    /// Cut this box out of an image
    #[instrument(skip(image))]
    pub fn crop(&self, image: &RgbImage) -> Option<RgbImage> {
        let (x, y, w, h) = self.clamp_to(image.width(), image.height())?;
        debug!("Cropping {}x{} at ({}, {})", w, h, x, y);
        Some(image::imageops::crop_imm(image, x, y, w, h).to_image())
    }
}

/// All possible errors from the scan pipeline
///
/// Decode errors are fatal for one video, scoring errors for one unit.
/// Configuration errors and a reference set without any usable face abort
/// the whole run before any video is touched.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Video file not found: {path}")]
    VideoNotFound { path: String },

    #[error("Failed to open video file: {path}")]
    VideoOpenFailed { path: String },

    #[error("Decode failed for {path} at frame {frame}: {reason}")]
    DecodeFailed { path: String, frame: u64, reason: String },

    #[error("Scoring failed for unit at position {position}: {reason}")]
    ScoringFailed { position: u64, reason: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("No faces detected in any of the {images} reference images")]
    NoReferenceFaces { images: usize },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Report generation failed: {message}")]
    Report { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

impl ScanError {
    /// Create a configuration error with a descriptive message
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    /// Create a mid-stream decode error
    pub fn decode_error(path: impl Into<String>, frame: u64, reason: impl Into<String>) -> Self {
        Self::DecodeFailed {
            path: path.into(),
            frame,
            reason: reason.into(),
        }
    }

    /// Create a per-unit scoring error
    pub fn scoring_error(position: u64, reason: impl Into<String>) -> Self {
        Self::ScoringFailed {
            position,
            reason: reason.into(),
        }
    }

    /// Create a report error
    pub fn report_error(message: impl Into<String>) -> Self {
        Self::Report { message: message.into() }
    }

    /// Whether this error only invalidates the video being decoded
    pub fn is_decode_error(&self) -> bool {
        #[cfg(feature = "opencv")]
        if matches!(self, Self::OpenCv(_)) {
            return true;
        }
        matches!(
            self,
            Self::VideoNotFound { .. } | Self::VideoOpenFailed { .. } | Self::DecodeFailed { .. }
        )
    }

    /// Whether this error must abort the run before any video is processed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::NoReferenceFaces { .. }
        )
    }
}

/// Convenient Result type for scan operations
pub type Result<T> = std::result::Result<T, ScanError>;
