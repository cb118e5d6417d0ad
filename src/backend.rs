//! OpenCV model backend
//!
//! * [`YuNetFaceDetector`] - `FaceDetectorYN` with the YuNet ONNX model
//! * [`SFaceEmbedder`] - `FaceRecognizerSF` with the SFace ONNX model
//! * [`DnnClipClassifier`] - any ONNX clip classifier taking a
//!   `[1, 3, T, S, S]` blob and producing two logits
//!
//! OpenCV model handles are not safe to call from several threads at once.
//! Each one sits behind a `Mutex` and reports `supports_concurrency() ==
//! false`, so the dispatcher scores one unit at a time with them.

use std::path::Path;
use std::sync::{Arc, Mutex};

use image::RgbImage;
use opencv::core::{Mat, Scalar, Size, CV_32F, CV_8UC3};
use opencv::dnn::{self, DNN_BACKEND_DEFAULT, DNN_TARGET_CPU};
use opencv::imgproc;
use opencv::objdetect::{FaceDetectorYN, FaceRecognizerSF};
use opencv::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Capabilities, ClipClassifier, Embedding, FaceCandidate, FaceDetector, FaceEmbedder};
use crate::common::{BoundingBox, Result, ScanError};
use crate::video_stream::OpenCvSourceFactory;
use crate::violence::{softmax, ClipTensor};

/// Candidates below this score are dropped inside the detector
const YUNET_SCORE_THRESHOLD: f32 = 0.6;
const YUNET_NMS_THRESHOLD: f32 = 0.3;
const YUNET_TOP_K: i32 = 5000;

/// SFace expects aligned 112x112 face crops
const SFACE_INPUT_SIZE: i32 = 112;

fn lock_error(what: &str) -> ScanError {
    ScanError::scoring_error(0, format!("{} lock poisoned", what))
}

fn require_model(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ScanError::config_error(format!("model file not found: {}", path.display())));
    }
    Ok(path.to_string_lossy().into_owned())
}

/// Copy an RGB image into a BGR `Mat`
fn rgb_to_bgr_mat(image: &RgbImage) -> Result<Mat> {
    let mut rgb = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        CV_8UC3,
        Scalar::all(0.0),
    )?;
    rgb.data_bytes_mut()?.copy_from_slice(image.as_raw());

    let mut bgr = Mat::default();
    imgproc::cvt_color_def(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR)?;
    Ok(bgr)
}

/// YuNet face detector
pub struct YuNetFaceDetector {
    detector: Mutex<opencv::core::Ptr<FaceDetectorYN>>,
}

impl YuNetFaceDetector {
    /// Load the YuNet model
    ///
    /// # Errors
    /// * `InvalidConfig` - If the model file doesn't exist
    /// * `OpenCv` - If OpenCV cannot build the detector
    #[instrument]
    pub fn new(model_path: &Path) -> Result<Self> {
        let model = require_model(model_path)?;
        // Input size is reset per image before each detection
        let detector = FaceDetectorYN::create(
            &model,
            "",
            Size::new(320, 320),
            YUNET_SCORE_THRESHOLD,
            YUNET_NMS_THRESHOLD,
            YUNET_TOP_K,
            DNN_BACKEND_DEFAULT,
            DNN_TARGET_CPU,
        )?;

        info!("YuNet face detector loaded from {}", model_path.display());
        Ok(Self {
            detector: Mutex::new(detector),
        })
    }
}

impl FaceDetector for YuNetFaceDetector {
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<FaceCandidate>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let frame = rgb_to_bgr_mat(image)?;
        let mut faces = Mat::default();
        {
            let mut detector = self.detector.lock().map_err(|_| lock_error("YuNet"))?;
            detector.set_input_size(Size::new(frame.cols(), frame.rows()))?;
            detector.detect(&frame, &mut faces)?;
        }

        // Each row: x, y, w, h, 5 landmark pairs, score
        let mut candidates = Vec::with_capacity(faces.rows().max(0) as usize);
        for i in 0..faces.rows() {
            let x = *faces.at_2d::<f32>(i, 0)?;
            let y = *faces.at_2d::<f32>(i, 1)?;
            let w = *faces.at_2d::<f32>(i, 2)?;
            let h = *faces.at_2d::<f32>(i, 3)?;
            let score = *faces.at_2d::<f32>(i, 14)?;

            if w <= 0.0 || h <= 0.0 {
                debug!("Dropping degenerate face box {}x{}", w, h);
                continue;
            }

            candidates.push(FaceCandidate {
                bbox: BoundingBox::new(x, y, w, h),
                probability: score,
            });
        }

        Ok(candidates)
    }

    fn supports_concurrency(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for YuNetFaceDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YuNetFaceDetector").finish_non_exhaustive()
    }
}

/// SFace face embedder
pub struct SFaceEmbedder {
    recognizer: Mutex<opencv::core::Ptr<FaceRecognizerSF>>,
}

impl SFaceEmbedder {
    #[instrument]
    pub fn new(model_path: &Path) -> Result<Self> {
        let model = require_model(model_path)?;
        let recognizer = FaceRecognizerSF::create(&model, "", DNN_BACKEND_DEFAULT, DNN_TARGET_CPU)?;

        info!("SFace embedder loaded from {}", model_path.display());
        Ok(Self {
            recognizer: Mutex::new(recognizer),
        })
    }
}

impl FaceEmbedder for SFaceEmbedder {
    fn embed(&self, face: &RgbImage) -> Result<Embedding> {
        let crop = rgb_to_bgr_mat(face)?;
        let mut aligned = Mat::default();
        imgproc::resize(
            &crop,
            &mut aligned,
            Size::new(SFACE_INPUT_SIZE, SFACE_INPUT_SIZE),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut feature = Mat::default();
        {
            let mut recognizer = self.recognizer.lock().map_err(|_| lock_error("SFace"))?;
            recognizer.feature(&aligned, &mut feature)?;
        }

        Ok(feature.data_typed::<f32>()?.to_vec())
    }

    fn supports_concurrency(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for SFaceEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SFaceEmbedder").finish_non_exhaustive()
    }
}

/// ONNX video classifier run through `opencv::dnn`
pub struct DnnClipClassifier {
    net: Mutex<dnn::Net>,
}

impl DnnClipClassifier {
    #[instrument]
    pub fn new(model_path: &Path) -> Result<Self> {
        let model = require_model(model_path)?;
        let mut net = dnn::read_net_from_onnx(&model)?;
        net.set_preferable_backend(DNN_BACKEND_DEFAULT)?;
        net.set_preferable_target(DNN_TARGET_CPU)?;

        info!("Clip classifier loaded from {}", model_path.display());
        Ok(Self { net: Mutex::new(net) })
    }
}

impl ClipClassifier for DnnClipClassifier {
    fn classify_clip(&self, clip: &ClipTensor) -> Result<Vec<f32>> {
        let shape: Vec<i32> = clip.shape().iter().map(|&d| d as i32).collect();
        let data = clip
            .as_slice()
            .ok_or_else(|| ScanError::scoring_error(0, "clip tensor is not contiguous"))?;

        let mut blob = Mat::new_nd_with_default(&shape, CV_32F, Scalar::all(0.0))?;
        blob.data_typed_mut::<f32>()?.copy_from_slice(data);

        let output = {
            let mut net = self.net.lock().map_err(|_| lock_error("dnn"))?;
            net.set_input_def(&blob)?;
            net.forward_single_def()?
        };

        let logits = output.data_typed::<f32>()?.to_vec();
        if logits.len() != 2 {
            warn!("Clip classifier produced {} outputs", logits.len());
        }
        Ok(softmax(&logits))
    }

    fn supports_concurrency(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for DnnClipClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnnClipClassifier").finish_non_exhaustive()
    }
}

/// Model files for the OpenCV backend
#[derive(Debug, Clone)]
pub struct ModelPaths<'a> {
    pub face_detector: &'a Path,
    pub face_embedder: &'a Path,
    pub clip_classifier: &'a Path,
}

/// Build capabilities backed by OpenCV
///
/// Only the models needed by the enabled stages are loaded; the others are
/// replaced by stand-ins that report a scoring failure if ever called.
pub fn opencv_capabilities(models: &ModelPaths<'_>, identity: bool, violence: bool) -> Result<Capabilities> {
    let face_detector: Arc<dyn FaceDetector> = if identity {
        Arc::new(YuNetFaceDetector::new(models.face_detector)?)
    } else {
        Arc::new(Unloaded("face detector"))
    };
    let face_embedder: Arc<dyn FaceEmbedder> = if identity {
        Arc::new(SFaceEmbedder::new(models.face_embedder)?)
    } else {
        Arc::new(Unloaded("face embedder"))
    };
    let clip_classifier: Arc<dyn ClipClassifier> = if violence {
        Arc::new(DnnClipClassifier::new(models.clip_classifier)?)
    } else {
        Arc::new(Unloaded("clip classifier"))
    };

    Ok(Capabilities {
        sources: Arc::new(OpenCvSourceFactory),
        face_detector,
        face_embedder,
        clip_classifier,
    })
}

/// Placeholder for a model the current mode never uses
struct Unloaded(&'static str);

impl Unloaded {
    fn error(&self) -> ScanError {
        ScanError::scoring_error(0, format!("{} was not loaded", self.0))
    }
}

impl FaceDetector for Unloaded {
    fn detect_faces(&self, _image: &RgbImage) -> Result<Vec<FaceCandidate>> {
        Err(self.error())
    }
}

impl FaceEmbedder for Unloaded {
    fn embed(&self, _face: &RgbImage) -> Result<Embedding> {
        Err(self.error())
    }
}

impl ClipClassifier for Unloaded {
    fn classify_clip(&self, _clip: &ClipTensor) -> Result<Vec<f32>> {
        Err(self.error())
    }
}
