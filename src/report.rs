//! Reporting boundary
//!
//! The pipeline hands ranked events to a [`Reporter`]. Rendering is up to
//! the implementation; [`JsonReporter`] writes a JSON summary and, if asked,
//! the evidence images next to it.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument};

use crate::common::{Result, Rgb, ScanError};
use crate::events::{Confidence, DetectionEvent, EventMetadata, Severity};

/// Which detection domain a report covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    MissingPerson,
    Violence,
}

impl ReportKind {
    pub fn file_stem(&self) -> &'static str {
        match self {
            ReportKind::MissingPerson => "missing_person",
            ReportKind::Violence => "violence",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ReportKind::MissingPerson => "Missing Person Detection Report",
            ReportKind::Violence => "Violence Detection Report",
        }
    }
}

/// Input handed to a reporter
#[derive(Debug, Clone, Copy)]
pub struct ReportRequest<'a> {
    pub kind: ReportKind,
    /// Events in presentation order
    pub events: &'a [DetectionEvent],
    /// Reference image names used for identity search
    pub references: &'a [String],
}

/// Renders a report and returns a handle to the produced artifact
pub trait Reporter {
    fn report(&self, request: &ReportRequest<'_>) -> Result<PathBuf>;
}

#[derive(Debug, Serialize)]
struct ReportEntry<'a> {
    rank: usize,
    video: &'a str,
    frame_index: u64,
    time_seconds: f64,
    score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<Confidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dominant_color: Option<Rgb>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    evidence_file: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReportDocument<'a> {
    title: &'static str,
    kind: ReportKind,
    /// Local time the report was written, `%Y-%m-%d %H:%M:%S`
    generated_at: String,
    total_detections: usize,
    references: &'a [String],
    detections: Vec<ReportEntry<'a>>,
}

/// Writes `<kind>_detections.json` into an output directory
#[derive(Debug, Clone)]
pub struct JsonReporter {
    output_dir: PathBuf,
    save_evidence: bool,
}

impl JsonReporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            save_evidence: false,
        }
    }

    /// Also write each event's crop or thumbnail as a PNG
    pub fn with_evidence(mut self, save_evidence: bool) -> Self {
        self.save_evidence = save_evidence;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write_evidence(&self, kind: ReportKind, rank: usize, event: &DetectionEvent) -> Result<String> {
        let name = format!("{}_{:04}.png", kind.file_stem(), rank);
        event.evidence.image().save(self.output_dir.join(&name))?;
        Ok(name)
    }
}

impl Reporter for JsonReporter {
    #[instrument(skip(self, request), fields(kind = ?request.kind, events = request.events.len()))]
    fn report(&self, request: &ReportRequest<'_>) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).map_err(|e| {
            ScanError::report_error(format!("cannot create {}: {}", self.output_dir.display(), e))
        })?;

        let mut detections = Vec::with_capacity(request.events.len());
        for (i, event) in request.events.iter().enumerate() {
            let rank = i + 1;
            let (severity, confidence, dominant_color, reference_index) = match &event.metadata {
                EventMetadata::Violence { severity } => (Some(*severity), None, None, None),
                EventMetadata::Identity { dominant_color, reference_index } => (
                    None,
                    Some(Confidence::from_similarity(event.score)),
                    Some(*dominant_color),
                    Some(*reference_index),
                ),
            };

            let evidence_file = if self.save_evidence {
                Some(self.write_evidence(request.kind, rank, event)?)
            } else {
                None
            };

            detections.push(ReportEntry {
                rank,
                video: &event.video_id,
                frame_index: event.frame_index,
                time_seconds: event.time_seconds,
                score: event.score,
                severity,
                confidence,
                dominant_color,
                reference_index,
                evidence_file,
            });
        }

        let document = ReportDocument {
            title: request.kind.title(),
            kind: request.kind,
            generated_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            total_detections: request.events.len(),
            references: request.references,
            detections,
        };

        let path = self
            .output_dir
            .join(format!("{}_detections.json", request.kind.file_stem()));
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, &document)?;

        info!("Wrote {} detections to {}", request.events.len(), path.display());
        Ok(path)
    }
}
