//! Windowing engine
//!
//! Slices the frame sequence of one video into the units the dispatcher
//! scores. Two policies are supported:
//!
//! * **Fixed stride** - every `stride`-th frame becomes a length-1 window
//!   (identity search).
//! * **Overlapping clips** - frames are buffered until `clip_length` is
//!   reached; the window is emitted and the last `overlap` frames seed the
//!   next buffer (temporal classification).
//!
//! Windows are built synchronously on the decode path. A trailing buffer
//! shorter than `clip_length` is discarded, never padded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::common::{Frame, FrameTimecode, Result, ScanError};
use crate::video_stream::FrameSource;

/// Temporal sampling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum WindowPolicy {
    FixedStride { stride: u64 },
    OverlappingClips { clip_length: usize, overlap: usize },
}

impl WindowPolicy {
    /// Validate policy constants
    ///
    /// `overlap >= clip_length` would never advance the buffer and is
    /// rejected as a configuration error.
    pub fn validate(&self) -> Result<()> {
        match *self {
            WindowPolicy::FixedStride { stride } => {
                if stride == 0 {
                    return Err(ScanError::config_error("frame stride must be at least 1"));
                }
            }
            WindowPolicy::OverlappingClips { clip_length, overlap } => {
                if clip_length == 0 {
                    return Err(ScanError::config_error("clip length must be at least 1"));
                }
                if overlap >= clip_length {
                    return Err(ScanError::config_error(format!(
                        "overlap ({}) must be smaller than clip length ({})",
                        overlap, clip_length
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of frames in every window this policy emits
    pub fn window_length(&self) -> usize {
        match *self {
            WindowPolicy::FixedStride { .. } => 1,
            WindowPolicy::OverlappingClips { clip_length, .. } => clip_length,
        }
    }

    /// Distance in frames between consecutive window starts
    pub fn step(&self) -> u64 {
        match *self {
            WindowPolicy::FixedStride { stride } => stride,
            WindowPolicy::OverlappingClips { clip_length, overlap } => (clip_length - overlap) as u64,
        }
    }
}

/// A fixed-length run of consecutive frames scored as one unit
///
/// Frames are reference-counted so overlapping windows share pixel buffers.
#[derive(Debug, Clone)]
pub struct Window {
    pub start_index: u64,
    pub frames: Vec<Arc<Frame>>,
}

impl Window {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn first_frame(&self) -> Option<&Frame> {
        self.frames.first().map(|frame| frame.as_ref())
    }

    pub fn start_timecode(&self, fps: f64) -> FrameTimecode {
        FrameTimecode::new(self.start_index, fps)
    }
}

/// Iterator adapter turning a frame source into windows
///
/// Yields `Err` once if the source fails; the caller decides whether that
/// ends the video early or invalidates it.
pub struct Windower<S: FrameSource> {
    source: S,
    policy: WindowPolicy,
    buffer: Vec<Arc<Frame>>,
    finished: bool,
    frames_read: u64,
    windows_emitted: u64,
}

impl<S: FrameSource> Windower<S> {
    /// Wrap a source with the given policy
    #[instrument(skip(source))]
    pub fn new(source: S, policy: WindowPolicy) -> Result<Self> {
        policy.validate()?;
        debug!("Windowing {} with {:?}", source.path(), policy);

        Ok(Self {
            source,
            buffer: Vec::with_capacity(policy.window_length()),
            policy,
            finished: false,
            frames_read: 0,
            windows_emitted: 0,
        })
    }

    pub fn fps(&self) -> f64 {
        self.source.fps()
    }

    pub fn path(&self) -> &str {
        self.source.path()
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn windows_emitted(&self) -> u64 {
        self.windows_emitted
    }

    fn next_stride(&mut self, stride: u64) -> Result<Option<Window>> {
        while let Some(frame) = self.source.next_frame()? {
            self.frames_read += 1;
            if frame.index % stride == 0 {
                return Ok(Some(Window {
                    start_index: frame.index,
                    frames: vec![Arc::new(frame)],
                }));
            }
        }
        Ok(None)
    }

    fn next_clip(&mut self, clip_length: usize, overlap: usize) -> Result<Option<Window>> {
        while let Some(frame) = self.source.next_frame()? {
            self.frames_read += 1;
            self.buffer.push(Arc::new(frame));

            if self.buffer.len() == clip_length {
                let frames = if overlap > 0 {
                    let seed = self.buffer[clip_length - overlap..].to_vec();
                    std::mem::replace(&mut self.buffer, seed)
                } else {
                    std::mem::take(&mut self.buffer)
                };

                let start_index = frames[0].index;
                trace!("Clip ready: frames {}..={}", start_index, start_index + clip_length as u64 - 1);
                return Ok(Some(Window { start_index, frames }));
            }
        }

        if !self.buffer.is_empty() {
            debug!(
                "Discarding {} trailing frames shorter than clip length {}",
                self.buffer.len(),
                clip_length
            );
            self.buffer.clear();
        }
        Ok(None)
    }
}

impl<S: FrameSource> Iterator for Windower<S> {
    type Item = Result<Window>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let next = match self.policy {
            WindowPolicy::FixedStride { stride } => self.next_stride(stride),
            WindowPolicy::OverlappingClips { clip_length, overlap } => {
                self.next_clip(clip_length, overlap)
            }
        };

        match next {
            Ok(Some(window)) => {
                self.windows_emitted += 1;
                Some(Ok(window))
            }
            Ok(None) => {
                self.finished = true;
                debug!(
                    "Windowing complete: {} windows from {} frames",
                    self.windows_emitted, self.frames_read
                );
                None
            }
            Err(e) => {
                self.finished = true;
                self.buffer.clear();
                Some(Err(e))
            }
        }
    }
}

/// Start indices a stream of `total_frames` frames produces under `policy`
pub fn expected_window_starts(total_frames: u64, policy: WindowPolicy) -> Vec<u64> {
    let length = policy.window_length() as u64;
    let step = policy.step();

    if step == 0 || length == 0 || total_frames < length {
        return Vec::new();
    }

    (0..)
        .map(|k| k * step)
        .take_while(|start| start + length <= total_frames)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_stream::MemoryFrameSource;
    use image::RgbImage;

    fn source(n: usize) -> MemoryFrameSource {
        MemoryFrameSource::new("test.mp4", 25.0, (0..n).map(|_| RgbImage::new(2, 2)).collect())
    }

    fn clips(n: usize, clip_length: usize, overlap: usize) -> Vec<Window> {
        Windower::new(source(n), WindowPolicy::OverlappingClips { clip_length, overlap })
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    fn indices(window: &Window) -> Vec<u64> {
        window.frames.iter().map(|f| f.index).collect()
    }

    #[test]
    fn test_overlapping_clips_example() {
        let windows = clips(9, 4, 2);

        let starts: Vec<u64> = windows.iter().map(|w| w.start_index).collect();
        assert_eq!(starts, vec![0, 2, 4]);
        assert_eq!(indices(&windows[0]), vec![0, 1, 2, 3]);
        assert_eq!(indices(&windows[1]), vec![2, 3, 4, 5]);
        assert_eq!(indices(&windows[2]), vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_window_count_formula() {
        for (clip_length, overlap) in [(4usize, 2usize), (16, 8), (5, 0), (3, 2), (1, 0)] {
            let step = clip_length - overlap;
            for k in 1..5usize {
                for r in 0..step {
                    let n = k * clip_length - (k - 1) * overlap + r;
                    let windows = clips(n, clip_length, overlap);
                    assert_eq!(
                        windows.len(),
                        k,
                        "clip_length={} overlap={} n={}",
                        clip_length,
                        overlap,
                        n
                    );
                    assert!(windows.iter().all(|w| w.len() == clip_length));
                }
            }
        }
    }

    #[test]
    fn test_consecutive_windows_share_exactly_overlap_frames() {
        let windows = clips(40, 16, 8);
        for pair in windows.windows(2) {
            let shared = indices(&pair[0])
                .into_iter()
                .filter(|i| indices(&pair[1]).contains(i))
                .count();
            assert_eq!(shared, 8);
        }
    }

    #[test]
    fn test_zero_overlap_clears_buffer() {
        let windows = clips(10, 4, 0);
        let starts: Vec<u64> = windows.iter().map(|w| w.start_index).collect();
        assert_eq!(starts, vec![0, 4]);
    }

    #[test]
    fn test_short_stream_emits_nothing() {
        assert!(clips(3, 4, 2).is_empty());
        assert!(clips(0, 4, 2).is_empty());
    }

    #[test]
    fn test_fixed_stride_sampling() {
        let windows: Vec<Window> = Windower::new(source(46), WindowPolicy::FixedStride { stride: 15 })
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        let starts: Vec<u64> = windows.iter().map(|w| w.start_index).collect();
        assert_eq!(starts, vec![0, 15, 30, 45]);
        assert!(windows.iter().all(|w| w.len() == 1));
    }

    #[test]
    fn test_invalid_policies() {
        assert!(Windower::new(source(1), WindowPolicy::FixedStride { stride: 0 }).is_err());
        assert!(Windower::new(source(1), WindowPolicy::OverlappingClips { clip_length: 4, overlap: 4 }).is_err());
        assert!(Windower::new(source(1), WindowPolicy::OverlappingClips { clip_length: 4, overlap: 5 }).is_err());
        assert!(Windower::new(source(1), WindowPolicy::OverlappingClips { clip_length: 0, overlap: 0 }).is_err());
    }

    #[test]
    fn test_decode_error_is_surfaced_once() {
        let broken = source(10).with_failure_at(5);
        let mut windower =
            Windower::new(broken, WindowPolicy::OverlappingClips { clip_length: 4, overlap: 2 }).unwrap();

        assert_eq!(windower.next().unwrap().unwrap().start_index, 0);
        assert!(windower.next().unwrap().is_err());
        assert!(windower.next().is_none());
    }

    #[test]
    fn test_expected_window_starts_matches_windower() {
        let policy = WindowPolicy::OverlappingClips { clip_length: 4, overlap: 2 };
        assert_eq!(expected_window_starts(9, policy), vec![0, 2, 4]);

        let policy = WindowPolicy::FixedStride { stride: 15 };
        assert_eq!(expected_window_starts(46, policy), vec![0, 15, 30, 45]);
        assert!(expected_window_starts(0, policy).is_empty());
    }

    #[test]
    fn test_start_timecode() {
        let window = clips(9, 4, 2).remove(2);
        assert_eq!(window.start_timecode(2.0).seconds(), 2.0);
    }
}
