//! Run configuration
//!
//! All thresholds and sampling constants live here rather than in the
//! pipeline stages. A configuration is validated once, before any reference
//! image or video is touched.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::common::{Result, ScanError};
use crate::windowing::WindowPolicy;

/// Which detection stages a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Identity search only
    MissingPerson,
    /// Clip classification only
    Violence,
    /// Identity search, then clip classification on videos with a hit
    #[default]
    Full,
}

impl ScanMode {
    pub fn runs_identity(&self) -> bool {
        matches!(self, ScanMode::MissingPerson | ScanMode::Full)
    }

    pub fn runs_violence(&self) -> bool {
        matches!(self, ScanMode::Violence | ScanMode::Full)
    }
}

/// What to do when a video fails to decode part-way through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Skip the whole video
    Strict,
    /// Keep the windows decoded before the failure and end the video early
    #[default]
    TruncateOnError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    /// Similarity a frame must exceed to become an event
    pub threshold: f32,
    /// Sample every Nth frame
    pub frame_interval: u64,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.72,
            frame_interval: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolenceConfig {
    /// Probability a clip must exceed to become an event
    pub threshold: f32,
    pub clip_length: usize,
    pub overlap: usize,
    /// Square side each frame is resized to before classification
    pub input_size: u32,
}

impl Default for ViolenceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.68,
            clip_length: 16,
            overlap: 8,
            input_size: 112,
        }
    }
}

/// Complete configuration for one scan run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub mode: ScanMode,
    pub face: FaceConfig,
    pub violence: ViolenceConfig,
    /// Worker threads used for scoring
    pub workers: usize,
    /// Units submitted but not yet finished; bounds frames held in memory
    pub max_in_flight: usize,
    pub decode_policy: DecodePolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            mode: ScanMode::default(),
            face: FaceConfig::default(),
            violence: ViolenceConfig::default(),
            workers,
            max_in_flight: workers * 2,
            decode_policy: DecodePolicy::default(),
        }
    }
}

impl ScanConfig {
    /// Load a configuration from a JSON file
    ///
    /// Missing fields fall back to their defaults. The result is validated.
    #[instrument]
    pub fn from_json_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());

        let file = std::fs::File::open(path)?;
        let config: ScanConfig = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;

        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Check every constraint the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        validate_threshold("face.threshold", self.face.threshold)?;
        validate_threshold("violence.threshold", self.violence.threshold)?;

        self.face_policy().validate()?;
        self.clip_policy().validate()?;

        if self.violence.input_size == 0 {
            return Err(ScanError::config_error("violence.input_size must be positive"));
        }
        if self.workers == 0 {
            return Err(ScanError::config_error("workers must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(ScanError::config_error("max_in_flight must be at least 1"));
        }

        Ok(())
    }

    /// Windowing policy for identity search
    pub fn face_policy(&self) -> WindowPolicy {
        WindowPolicy::FixedStride {
            stride: self.face.frame_interval,
        }
    }

    /// Windowing policy for clip classification
    pub fn clip_policy(&self) -> WindowPolicy {
        WindowPolicy::OverlappingClips {
            clip_length: self.violence.clip_length,
            overlap: self.violence.overlap,
        }
    }
}

fn validate_threshold(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ScanError::config_error(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}
