//! Model capability interfaces
//!
//! The pipeline treats the face detector, the face embedder and the clip
//! classifier as black boxes. Implementations are shared read-only by every
//! worker of a run, so they must be `Send + Sync`. A backend that cannot be
//! invoked concurrently reports it through `supports_concurrency` and the
//! dispatcher serializes scoring to a single worker.

use std::sync::Arc;

use image::RgbImage;

use crate::common::{BoundingBox, Result};
use crate::video_stream::FrameSourceFactory;
use crate::violence::ClipTensor;

/// Fixed-dimension face embedding
pub type Embedding = Vec<f32>;

/// A face region found by a detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceCandidate {
    pub bbox: BoundingBox,
    pub probability: f32,
}

pub trait FaceDetector: Send + Sync {
    /// Find zero or more faces in an image
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<FaceCandidate>>;

    fn supports_concurrency(&self) -> bool {
        true
    }
}

pub trait FaceEmbedder: Send + Sync {
    /// Embed a face crop into an L2-comparable vector
    fn embed(&self, face: &RgbImage) -> Result<Embedding>;

    fn supports_concurrency(&self) -> bool {
        true
    }
}

pub trait ClipClassifier: Send + Sync {
    /// Probability distribution over `[non-violent, violent]`
    fn classify_clip(&self, clip: &ClipTensor) -> Result<Vec<f32>>;

    fn supports_concurrency(&self) -> bool {
        true
    }
}

/// Cosine similarity mapped into `[0, 1]`
///
/// Mismatched dimensions and zero vectors score 0. Negative cosine values
/// clamp to 0, matching a "no resemblance" reading of the score.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
        (dot + x * y, na + x * x, nb + y * y)
    });

    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Immutable bundle of the collaborators a run needs
///
/// Created once at run start and shared by reference with every stage.
#[derive(Clone)]
pub struct Capabilities {
    pub sources: Arc<dyn FrameSourceFactory>,
    pub face_detector: Arc<dyn FaceDetector>,
    pub face_embedder: Arc<dyn FaceEmbedder>,
    pub clip_classifier: Arc<dyn ClipClassifier>,
}

impl Capabilities {
    /// Whether identity scoring may run on more than one worker
    pub fn identity_concurrent(&self) -> bool {
        self.face_detector.supports_concurrency() && self.face_embedder.supports_concurrency()
    }

    /// Whether clip scoring may run on more than one worker
    pub fn clip_concurrent(&self) -> bool {
        self.clip_classifier.supports_concurrency()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("identity_concurrent", &self.identity_concurrent())
            .field("clip_concurrent", &self.clip_concurrent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_vectors() {
        let v = [0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_and_opposite() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_scale_invariant() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 4.0, 6.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
