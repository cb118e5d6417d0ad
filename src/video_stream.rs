//! Frame sources
//!
//! A frame source turns a video container into an ordered sequence of
//! [`Frame`]s. Decoding is strictly sequential: one reader per video, frames
//! come out with consecutive indices starting at 0. Read failures are
//! reported as errors and never turned into a silent end of stream.
//!
//! With the `opencv` feature enabled, [`VideoStream`] wraps OpenCV's
//! `VideoCapture`. [`MemoryFrameSource`] serves already-decoded frames.

use std::collections::VecDeque;
use std::sync::Arc;

use image::RgbImage;
use tracing::{debug, instrument};

use crate::common::{Frame, Result, ScanError};

/// Sequential producer of decoded frames
pub trait FrameSource: Send {
    /// Video framerate, used to convert frame indices to seconds
    fn fps(&self) -> f64;

    /// Frame count reported by the container, if known
    fn frame_count_hint(&self) -> Option<u64>;

    /// Identifier of the underlying video
    fn path(&self) -> &str;

    /// Read the next frame
    ///
    /// Returns `Ok(None)` at end of stream and `Err` if a read fails.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn fps(&self) -> f64 {
        (**self).fps()
    }

    fn frame_count_hint(&self) -> Option<u64> {
        (**self).frame_count_hint()
    }

    fn path(&self) -> &str {
        (**self).path()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }
}

/// Opens frame sources for video paths
///
/// Shared read-only across a run.
pub trait FrameSourceFactory: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn FrameSource>>;
}

/// Frame source backed by frames already held in memory
#[derive(Debug)]
pub struct MemoryFrameSource {
    path: String,
    fps: f64,
    total: u64,
    frames: VecDeque<RgbImage>,
    next_index: u64,
    fail_at: Option<u64>,
}

impl MemoryFrameSource {
    /// Create a source that yields `frames` in order
    ///
    /// # Panics
    /// Panics if fps is not positive (fail-fast approach)
    pub fn new(path: impl Into<String>, fps: f64, frames: Vec<RgbImage>) -> Self {
        assert!(fps > 0.0, "FPS must be positive, got: {}", fps);
        Self {
            path: path.into(),
            fps,
            total: frames.len() as u64,
            frames: frames.into(),
            next_index: 0,
            fail_at: None,
        }
    }

    /// Make the read of frame `index` fail with a decode error
    pub fn with_failure_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }
}

impl FrameSource for MemoryFrameSource {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_count_hint(&self) -> Option<u64> {
        Some(self.total)
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.fail_at == Some(self.next_index) {
            return Err(ScanError::decode_error(
                self.path.clone(),
                self.next_index,
                "injected read failure",
            ));
        }

        let Some(pixels) = self.frames.pop_front() else {
            return Ok(None);
        };

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame::new(index, index as f64 / self.fps, pixels)))
    }
}

/// Factory serving a fixed set of in-memory videos
///
/// Each `open` hands out a fresh source over a clone of the stored frames.
#[derive(Debug, Default, Clone)]
pub struct MemorySourceFactory {
    videos: Vec<(String, f64, Arc<Vec<RgbImage>>, Option<u64>)>,
}

impl MemorySourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, path: impl Into<String>, fps: f64, frames: Vec<RgbImage>) -> Self {
        self.videos.push((path.into(), fps, Arc::new(frames), None));
        self
    }

    /// Register a video whose read of frame `fail_at` fails
    pub fn with_broken_video(
        mut self,
        path: impl Into<String>,
        fps: f64,
        frames: Vec<RgbImage>,
        fail_at: u64,
    ) -> Self {
        self.videos.push((path.into(), fps, Arc::new(frames), Some(fail_at)));
        self
    }
}

impl FrameSourceFactory for MemorySourceFactory {
    #[instrument(skip(self))]
    fn open(&self, path: &str) -> Result<Box<dyn FrameSource>> {
        let (_, fps, frames, fail_at) = self
            .videos
            .iter()
            .find(|(p, ..)| p == path)
            .ok_or_else(|| ScanError::VideoNotFound { path: path.to_string() })?;

        debug!("Opening in-memory video {} ({} frames)", path, frames.len());

        let mut source = MemoryFrameSource::new(path, *fps, frames.as_ref().clone());
        if let Some(index) = fail_at {
            source = source.with_failure_at(*index);
        }
        Ok(Box::new(source))
    }
}

/// Video metadata information
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct VideoInfo {
    pub path: String,
    pub fps: f64,
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
}

impl VideoInfo {
    /// Get a human-readable description of the video
    pub fn description(&self) -> String {
        format!(
            "{}x{} at {:.2}fps, {} frames ({:.1}s duration)",
            self.width, self.height, self.fps, self.frame_count, self.duration_seconds
        )
    }

    /// Check if this appears to be a valid video configuration
    pub fn is_valid(&self) -> bool {
        self.fps > 0.0
            && self.frame_count > 0
            && self.width > 0
            && self.height > 0
            && self.duration_seconds > 0.0
    }
}

#[cfg(feature = "opencv")]
pub use self::opencv_stream::{get_video_info, OpenCvSourceFactory, VideoStream};

#[cfg(feature = "opencv")]
mod opencv_stream {
    use std::path::Path;

    use image::RgbImage;
    use opencv::{core::Mat, imgproc, prelude::*, videoio};
    use tracing::{debug, info, instrument, warn};

    use super::{FrameSource, FrameSourceFactory, VideoInfo};
    use crate::common::{Frame, Result, ScanError};

    /// Wrapper around OpenCV VideoCapture for sequential frame reading
    ///
    /// The capture handle is released when the stream is dropped, whether the
    /// caller read to the end, hit an error, or stopped early.
    pub struct VideoStream {
        cap: videoio::VideoCapture,
        fps: f64,
        frame_count: u64,
        current_frame: u64,
        width: u32,
        height: u32,
        path: String,
    }

    impl VideoStream {
        /// Open a video file for reading
        ///
        /// # Errors
        /// * `VideoNotFound` - If the file doesn't exist
        /// * `VideoOpenFailed` - If OpenCV can't open the file or reports
        ///   unusable properties
        #[instrument]
        pub fn open(path: &str) -> Result<Self> {
            info!("Opening video stream: {}", path);

            if !Path::new(path).exists() {
                return Err(ScanError::VideoNotFound { path: path.to_string() });
            }

            let open_failed = || ScanError::VideoOpenFailed { path: path.to_string() };

            let cap = videoio::VideoCapture::from_file(path, videoio::CAP_ANY).map_err(|e| {
                warn!("Failed to create VideoCapture: {}", e);
                open_failed()
            })?;

            if !cap.is_opened().map_err(|_| open_failed())? {
                return Err(open_failed());
            }

            let fps = cap.get(videoio::CAP_PROP_FPS)?;
            let frame_count = cap.get(videoio::CAP_PROP_FRAME_COUNT)?.max(0.0) as u64;
            let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)?.max(0.0) as u32;
            let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)?.max(0.0) as u32;

            if !fps.is_finite() || fps <= 0.0 || width == 0 || height == 0 {
                warn!("Unusable video properties: fps={}, size={}x{}", fps, width, height);
                return Err(open_failed());
            }

            info!(
                "Video opened - FPS: {}, Frames: {}, Size: {}x{}",
                fps, frame_count, width, height
            );

            Ok(Self {
                cap,
                fps,
                frame_count,
                current_frame: 0,
                width,
                height,
                path: path.to_string(),
            })
        }

        pub fn width(&self) -> u32 {
            self.width
        }

        pub fn height(&self) -> u32 {
            self.height
        }

        pub fn duration_seconds(&self) -> f64 {
            self.frame_count as f64 / self.fps
        }

        fn to_rgb_image(&self, bgr: &Mat) -> Result<RgbImage> {
            let mut rgb = Mat::default();
            imgproc::cvt_color_def(bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;

            let width = rgb.cols() as u32;
            let height = rgb.rows() as u32;
            let bytes = rgb.data_bytes()?.to_vec();

            RgbImage::from_raw(width, height, bytes).ok_or_else(|| {
                ScanError::decode_error(
                    self.path.clone(),
                    self.current_frame,
                    "frame buffer size does not match its dimensions",
                )
            })
        }
    }

    impl FrameSource for VideoStream {
        fn fps(&self) -> f64 {
            self.fps
        }

        fn frame_count_hint(&self) -> Option<u64> {
            (self.frame_count > 0).then_some(self.frame_count)
        }

        fn path(&self) -> &str {
            &self.path
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            let mut frame = Mat::default();

            let success = self.cap.read(&mut frame).map_err(|e| {
                ScanError::decode_error(
                    self.path.clone(),
                    self.current_frame,
                    format!("OpenCV read failed: {}", e),
                )
            })?;

            if !success || frame.empty() {
                debug!("Reached end of video at frame {}", self.current_frame);
                return Ok(None);
            }

            let pixels = self.to_rgb_image(&frame)?;
            let index = self.current_frame;
            self.current_frame += 1;

            Ok(Some(Frame::new(index, index as f64 / self.fps, pixels)))
        }
    }

    impl Drop for VideoStream {
        fn drop(&mut self) {
            debug!("Releasing capture for {}", self.path);
            if let Err(e) = self.cap.release() {
                warn!("Failed to release VideoCapture for {}: {}", self.path, e);
            }
        }
    }

    // Avoid showing internal OpenCV state
    impl std::fmt::Debug for VideoStream {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("VideoStream")
                .field("path", &self.path)
                .field("fps", &self.fps)
                .field("frame_count", &self.frame_count)
                .field("current_frame", &self.current_frame)
                .field("width", &self.width)
                .field("height", &self.height)
                .finish()
        }
    }

    // VideoCapture is only touched by the thread that owns the stream
    unsafe impl Send for VideoStream {}

    /// Opens [`VideoStream`]s from file paths
    #[derive(Debug, Default, Clone, Copy)]
    pub struct OpenCvSourceFactory;

    impl FrameSourceFactory for OpenCvSourceFactory {
        fn open(&self, path: &str) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(VideoStream::open(path)?))
        }
    }

    /// Get video information without decoding any frames
    #[instrument]
    pub fn get_video_info(path: &str) -> Result<VideoInfo> {
        let stream = VideoStream::open(path)?;

        Ok(VideoInfo {
            path: path.to_string(),
            fps: stream.fps,
            frame_count: stream.frame_count,
            width: stream.width,
            height: stream.height,
            duration_seconds: stream.duration_seconds(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frames(n: usize) -> Vec<RgbImage> {
        (0..n).map(|_| RgbImage::new(4, 4)).collect()
    }

    #[test]
    fn test_memory_source_yields_ordered_frames() {
        let mut source = MemoryFrameSource::new("mem.mp4", 25.0, blank_frames(3));
        assert_eq!(source.frame_count_hint(), Some(3));

        let mut indices = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            indices.push(frame.index);
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_memory_source_timestamps() {
        let mut source = MemoryFrameSource::new("mem.mp4", 10.0, blank_frames(2));
        source.next_frame().unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.timestamp, 0.1);
    }

    #[test]
    fn test_memory_source_injected_failure() {
        let mut source = MemoryFrameSource::new("mem.mp4", 25.0, blank_frames(5)).with_failure_at(2);
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());

        match source.next_frame().unwrap_err() {
            ScanError::DecodeFailed { frame, .. } => assert_eq!(frame, 2),
            other => panic!("Expected DecodeFailed, got: {:?}", other),
        }
    }

    #[test]
    fn test_factory_unknown_video() {
        let factory = MemorySourceFactory::new().with_video("a.mp4", 25.0, blank_frames(1));
        assert!(factory.open("a.mp4").is_ok());

        match factory.open("missing.mp4") {
            Err(ScanError::VideoNotFound { path }) => assert_eq!(path, "missing.mp4"),
            other => panic!("Expected VideoNotFound, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_video_info_validation() {
        let valid_info = VideoInfo {
            path: "test.mp4".to_string(),
            fps: 30.0,
            frame_count: 100,
            width: 640,
            height: 480,
            duration_seconds: 3.33,
        };
        assert!(valid_info.is_valid());
        assert!(valid_info.description().contains("640x480"));

        let invalid_fps = VideoInfo { fps: 0.0, ..valid_info.clone() };
        assert!(!invalid_fps.is_valid());

        let invalid_frames = VideoInfo { frame_count: 0, ..valid_info };
        assert!(!invalid_frames.is_valid());
    }

    #[cfg(feature = "opencv")]
    #[test]
    fn test_video_stream_nonexistent_file() {
        match VideoStream::open("nonexistent_video.mp4") {
            Err(ScanError::VideoNotFound { path }) => assert_eq!(path, "nonexistent_video.mp4"),
            other => panic!("Expected VideoNotFound, got: {:?}", other.map(|_| ())),
        }
    }
}
