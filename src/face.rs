//! Identity scoring for missing-person search
//!
//! A [`ReferenceIdentity`] is built once per run from the reference photos.
//! Each sampled frame is then scored by its best face: the face with the
//! highest detection probability is embedded and compared against every
//! reference vector, and the maximum similarity becomes the frame's score.

use std::path::Path;
use std::sync::Arc;

use image::RgbImage;
use tracing::{debug, info, instrument, trace, warn};

use crate::capabilities::{cosine_similarity, Embedding, FaceCandidate, FaceDetector, FaceEmbedder};
use crate::common::{BoundingBox, Frame, Result, ScanError};
use crate::dispatcher::ScoredUnit;

/// A reference photo to build the identity from
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub name: String,
    pub image: RgbImage,
}

impl ReferenceImage {
    pub fn new(name: impl Into<String>, image: RgbImage) -> Self {
        Self { name: name.into(), image }
    }

    /// Decode a reference photo from disk
    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ScanError::config_error(format!(
                "reference image not found: {}",
                path.display()
            )));
        }
        let image = image::open(path)?.to_rgb8();
        debug!("Loaded reference {} ({}x{})", path.display(), image.width(), image.height());
        Ok(Self::new(path.display().to_string(), image))
    }
}

/// Embedding vectors of the person being searched for
///
/// Immutable once built and shared by every worker of the run.
#[derive(Debug, Clone)]
pub struct ReferenceIdentity {
    embeddings: Vec<Embedding>,
    /// Reference image name per embedding
    sources: Vec<String>,
    images_considered: usize,
}

impl ReferenceIdentity {
    /// Build the identity from reference photos
    ///
    /// Photos without a detectable face are skipped. If none of them yields
    /// a face the run cannot proceed.
    ///
    /// # Errors
    /// * `InvalidConfig` - If no reference images were supplied
    /// * `NoReferenceFaces` - If no reference image contains a face
    #[instrument(skip_all, fields(images = images.len()))]
    pub fn from_images(
        images: &[ReferenceImage],
        detector: &dyn FaceDetector,
        embedder: &dyn FaceEmbedder,
    ) -> Result<Self> {
        if images.is_empty() {
            return Err(ScanError::config_error("at least one reference image is required"));
        }

        let mut embeddings = Vec::new();
        let mut sources = Vec::new();

        for reference in images {
            let candidates = detector.detect_faces(&reference.image)?;
            let Some(best) = best_candidate(&candidates) else {
                warn!("No face detected in reference image {}", reference.name);
                continue;
            };

            let Some(crop) = best.bbox.crop(&reference.image) else {
                warn!("Face box lies outside reference image {}", reference.name);
                continue;
            };

            debug!(
                "Reference {}: using face with probability {:.3} of {} candidates",
                reference.name,
                best.probability,
                candidates.len()
            );

            embeddings.push(embedder.embed(&crop)?);
            sources.push(reference.name.clone());
        }

        if embeddings.is_empty() {
            return Err(ScanError::NoReferenceFaces { images: images.len() });
        }

        info!("Reference identity built from {}/{} images", embeddings.len(), images.len());

        Ok(Self {
            embeddings,
            sources,
            images_considered: images.len(),
        })
    }

    /// Build directly from precomputed embeddings
    pub fn from_embeddings(embeddings: Vec<Embedding>) -> Result<Self> {
        if embeddings.is_empty() {
            return Err(ScanError::config_error("reference identity needs at least one embedding"));
        }
        let sources = (0..embeddings.len()).map(|i| format!("embedding-{}", i)).collect();
        Ok(Self {
            images_considered: embeddings.len(),
            embeddings,
            sources,
        })
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn images_considered(&self) -> usize {
        self.images_considered
    }

    pub fn source_name(&self, index: usize) -> Option<&str> {
        self.sources.get(index).map(String::as_str)
    }

    /// Best similarity against any reference vector and its index
    pub fn best_match(&self, embedding: &[f32]) -> (usize, f32) {
        self.embeddings
            .iter()
            .enumerate()
            .map(|(i, reference)| (i, cosine_similarity(embedding, reference)))
            .fold((0, f32::MIN), |best, current| if current.1 > best.1 { current } else { best })
    }
}

/// Pick the face with the highest detection probability; ties keep the first
pub fn best_candidate(candidates: &[FaceCandidate]) -> Option<&FaceCandidate> {
    candidates.iter().fold(None, |best: Option<&FaceCandidate>, candidate| match best {
        Some(current) if current.probability >= candidate.probability => Some(current),
        _ => Some(candidate),
    })
}

/// Evidence kept for a scored frame
#[derive(Debug, Clone)]
pub struct FaceEvidence {
    pub crop: RgbImage,
    pub bbox: BoundingBox,
    pub detection_probability: f32,
    /// Reference vector that matched best
    pub reference_index: usize,
    pub timestamp: f64,
}

/// Scores sampled frames against a reference identity
#[derive(Clone)]
pub struct FaceScorer {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    identity: Arc<ReferenceIdentity>,
}

impl FaceScorer {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        identity: Arc<ReferenceIdentity>,
    ) -> Self {
        Self {
            detector,
            embedder,
            identity,
        }
    }

    pub fn identity(&self) -> &ReferenceIdentity {
        &self.identity
    }

    /// Score one frame; `None` if it contains no usable face
    #[instrument(skip(self, frame), fields(index = frame.index))]
    pub fn score_frame(&self, frame: &Frame) -> Result<Option<ScoredUnit<FaceEvidence>>> {
        let candidates = self
            .detector
            .detect_faces(&frame.pixels)
            .map_err(|e| ScanError::scoring_error(frame.index, e.to_string()))?;

        let Some(best) = best_candidate(&candidates) else {
            trace!("No face in frame {}", frame.index);
            return Ok(None);
        };

        let Some(crop) = best.bbox.crop(&frame.pixels) else {
            debug!("Face box outside frame {}, skipping", frame.index);
            return Ok(None);
        };

        let embedding = self
            .embedder
            .embed(&crop)
            .map_err(|e| ScanError::scoring_error(frame.index, e.to_string()))?;

        let (reference_index, similarity) = self.identity.best_match(&embedding);
        trace!(
            "Frame {}: {} faces, best similarity {:.4} (reference {})",
            frame.index,
            candidates.len(),
            similarity,
            reference_index
        );

        Ok(Some(ScoredUnit {
            position: frame.index,
            score: similarity,
            payload: FaceEvidence {
                crop,
                bbox: best.bbox,
                detection_probability: best.probability,
                reference_index,
                timestamp: frame.timestamp,
            },
        }))
    }
}

impl std::fmt::Debug for FaceScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceScorer")
            .field("references", &self.identity.len())
            .finish()
    }
}
