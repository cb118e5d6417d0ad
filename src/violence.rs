//! Clip scoring for violence detection
//!
//! Converts a window of frames into a normalised `[1, 3, T, S, S]` tensor,
//! runs the clip classifier and keeps the probability of the violent class.

use std::sync::Arc;

use image::{imageops::FilterType, RgbImage};
use ndarray::Array5;
use tracing::{instrument, trace};

use crate::capabilities::ClipClassifier;
use crate::common::{Frame, Result, ScanError};
use crate::dispatcher::ScoredUnit;
use crate::windowing::Window;

/// Per-channel normalisation constants (ImageNet statistics)
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Index of the violent class in the classifier output
const VIOLENT_CLASS: usize = 1;

/// Clip tensor in `[batch, channel, time, height, width]` layout
#[derive(Debug, Clone)]
pub struct ClipTensor {
    data: Array5<f32>,
}

impl ClipTensor {
    /// Resize and normalise every frame of a clip
    #[instrument(skip(frames), fields(frames = frames.len()))]
    pub fn from_frames(frames: &[Arc<Frame>], size: u32) -> Result<Self> {
        if frames.is_empty() {
            return Err(ScanError::scoring_error(0, "cannot build a tensor from an empty clip"));
        }
        if size == 0 {
            return Err(ScanError::config_error("clip input size must be positive"));
        }

        let side = size as usize;
        let mut data = Array5::<f32>::zeros((1, 3, frames.len(), side, side));

        for (t, frame) in frames.iter().enumerate() {
            let resized = image::imageops::resize(&frame.pixels, size, size, FilterType::Triangle);
            for (x, y, pixel) in resized.enumerate_pixels() {
                for c in 0..3 {
                    let value = pixel.0[c] as f32 / 255.0;
                    data[[0, c, t, y as usize, x as usize]] = (value - MEAN[c]) / STD[c];
                }
            }
        }

        Ok(Self { data })
    }

    /// Tensor shape as `[batch, channel, time, height, width]`
    pub fn shape(&self) -> [usize; 5] {
        let dim = self.data.dim();
        [dim.0, dim.1, dim.2, dim.3, dim.4]
    }

    pub fn frame_count(&self) -> usize {
        self.data.dim().2
    }

    pub fn data(&self) -> &Array5<f32> {
        &self.data
    }

    /// Contiguous row-major view of the tensor
    pub fn as_slice(&self) -> Option<&[f32]> {
        self.data.as_slice()
    }
}

/// Evidence kept for a scored clip
#[derive(Debug, Clone)]
pub struct ClipEvidence {
    /// First frame of the clip
    pub thumbnail: RgbImage,
    pub frame_count: usize,
}

/// Turn a classifier output into P(violent)
///
/// Accepts exactly two classes. Outputs that are not probabilities (values
/// outside `[0, 1]`) are treated as logits and passed through softmax;
/// probabilities that do not sum to 1 are renormalised.
pub fn violent_probability(position: u64, output: &[f32]) -> Result<f32> {
    if output.len() != 2 {
        return Err(ScanError::scoring_error(
            position,
            format!("expected 2 class scores, got {}", output.len()),
        ));
    }
    if output.iter().any(|v| !v.is_finite()) {
        return Err(ScanError::scoring_error(position, "classifier returned non-finite scores"));
    }

    let probabilities: Vec<f32> = if output.iter().any(|v| !(0.0..=1.0).contains(v)) {
        softmax(output)
    } else {
        let sum: f32 = output.iter().sum();
        if sum <= f32::EPSILON {
            return Err(ScanError::scoring_error(position, "classifier returned an all-zero distribution"));
        }
        output.iter().map(|v| v / sum).collect()
    };

    Ok(probabilities[VIOLENT_CLASS])
}

pub(crate) fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// Scores windows with a clip classifier
#[derive(Clone)]
pub struct ClipScorer {
    classifier: Arc<dyn ClipClassifier>,
    input_size: u32,
}

impl ClipScorer {
    pub fn new(classifier: Arc<dyn ClipClassifier>, input_size: u32) -> Self {
        Self { classifier, input_size }
    }

    /// Score one clip; the position is the clip's start index
    #[instrument(skip(self, window), fields(start = window.start_index))]
    pub fn score_window(&self, window: &Window) -> Result<ScoredUnit<ClipEvidence>> {
        let position = window.start_index;
        let thumbnail = window
            .first_frame()
            .map(|frame| frame.pixels.clone())
            .ok_or_else(|| ScanError::scoring_error(position, "empty clip"))?;

        let tensor = ClipTensor::from_frames(&window.frames, self.input_size)
            .map_err(|e| ScanError::scoring_error(position, e.to_string()))?;

        let output = self.classifier.classify_clip(&tensor)?;
        let score = violent_probability(position, &output)?;

        trace!("Clip at {} violence probability {:.4}", position, score);

        Ok(ScoredUnit {
            position,
            score,
            payload: ClipEvidence {
                thumbnail,
                frame_count: window.len(),
            },
        })
    }
}

impl std::fmt::Debug for ClipScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipScorer")
            .field("input_size", &self.input_size)
            .finish()
    }
}
