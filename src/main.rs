//! Command-line interface for the video scan library
//!
//! * `scan` - search videos for a person and/or violent clips
//! * `info` - print video properties
//! * `plan` - print the window start positions for a frame count
//!
//! Decoding and model inference need the `opencv` feature; `plan` works
//! without it.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn};

use rust_videoscan::{
    init_tracing, plan_windows, Confidence, DecodePolicy, DetectionEvent, EventMetadata, RunResult, ScanConfig, ScanMode,
};

/// Locate a person and flag violent clips in video collections
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Simple)]
    format: OutputFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan videos for the enabled detection stages
    Scan(ScanArgs),
    /// Show video properties without scanning
    Info {
        /// Video file to inspect
        video: String,
    },
    /// Show which windows a video of N frames would produce
    Plan {
        /// Total number of frames
        #[arg(long, value_name = "COUNT")]
        frames: u64,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// One line per detection
    Simple,
    /// Grouped report with timings
    Detailed,
    /// JSON for integration
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliMode {
    MissingPerson,
    Violence,
    Full,
}

impl From<CliMode> for ScanMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::MissingPerson => ScanMode::MissingPerson,
            CliMode::Violence => ScanMode::Violence,
            CliMode::Full => ScanMode::Full,
        }
    }
}

/// Configuration file and per-field overrides
#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// JSON configuration file; flags below override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Detection stages to run
    #[arg(long, value_enum)]
    mode: Option<CliMode>,

    /// Face similarity threshold (0.0 - 1.0)
    #[arg(long, value_name = "THRESHOLD")]
    face_threshold: Option<f32>,

    /// Violence probability threshold (0.0 - 1.0)
    #[arg(long, value_name = "THRESHOLD")]
    violence_threshold: Option<f32>,

    /// Sample one frame every N frames for face search
    #[arg(long, value_name = "FRAMES")]
    frame_interval: Option<u64>,

    /// Frames per classified clip
    #[arg(long, value_name = "FRAMES")]
    clip_length: Option<usize>,

    /// Frames shared by consecutive clips
    #[arg(long, value_name = "FRAMES")]
    overlap: Option<usize>,

    /// Worker threads for model inference
    #[arg(long)]
    workers: Option<usize>,

    /// Skip a video entirely when decoding fails mid-stream
    #[arg(long)]
    strict_decode: bool,
}

impl ConfigArgs {
    fn build(&self) -> Result<ScanConfig> {
        let mut config = match &self.config {
            Some(path) => ScanConfig::from_json_file(path)
                .with_context(|| format!("failed to load configuration from {}", path.display()))?,
            None => ScanConfig::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(threshold) = self.face_threshold {
            config.face.threshold = threshold;
        }
        if let Some(threshold) = self.violence_threshold {
            config.violence.threshold = threshold;
        }
        if let Some(interval) = self.frame_interval {
            config.face.frame_interval = interval;
        }
        if let Some(length) = self.clip_length {
            config.violence.clip_length = length;
        }
        if let Some(overlap) = self.overlap {
            config.violence.overlap = overlap;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
            config.max_in_flight = workers * 2;
        }
        if self.strict_decode {
            config.decode_policy = DecodePolicy::Strict;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Video files to scan
    #[arg(required = true, value_name = "VIDEO")]
    videos: Vec<String>,

    /// Reference photo of the missing person (repeatable)
    #[arg(long = "reference", value_name = "IMAGE")]
    references: Vec<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,

    /// YuNet face detection model
    #[arg(long, value_name = "FILE", default_value = "models/face_detection_yunet_2023mar.onnx")]
    face_detector_model: PathBuf,

    /// SFace face recognition model
    #[arg(long, value_name = "FILE", default_value = "models/face_recognition_sface_2021dec.onnx")]
    face_embedder_model: PathBuf,

    /// Video classification model with two outputs
    #[arg(long, value_name = "FILE", default_value = "models/violence_classifier.onnx")]
    clip_model: PathBuf,

    /// Directory for JSON reports
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Also write face crops and clip thumbnails next to the reports
    #[arg(long, requires = "output")]
    save_evidence: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    init_tracing(log_level);

    info!("Video scan CLI v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", cli);

    match &cli.command {
        Command::Scan(args) => scan(args, cli.format),
        Command::Info { video } => show_video_info(video, cli.format),
        Command::Plan { frames, config } => show_plan(*frames, config, cli.format),
    }
}

#[cfg(feature = "opencv")]
fn scan(args: &ScanArgs, format: OutputFormat) -> Result<()> {
    use rust_videoscan::{scan_files, write_reports, CancelToken, JsonReporter, ModelPaths};

    let config = args.config.build()?;
    if config.mode.runs_identity() && args.references.is_empty() {
        anyhow::bail!("--reference is required for mode {:?}", config.mode);
    }

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupt received, cancelling scan...");
        handler.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let models = ModelPaths {
        face_detector: &args.face_detector_model,
        face_embedder: &args.face_embedder_model,
        clip_classifier: &args.clip_model,
    };

    let start_time = std::time::Instant::now();
    let result = scan_files(config, &models, &args.videos, &args.references, &cancel)?;
    let scan_time = start_time.elapsed();

    output_results(&result, format, scan_time)?;

    if !result.is_final() {
        anyhow::bail!("scan was cancelled; results above are partial and no report was written");
    }

    if let Some(dir) = &args.output {
        let reporter = JsonReporter::new(dir).with_evidence(args.save_evidence);
        let names: Vec<String> = args.references.iter().map(|p| p.display().to_string()).collect();
        for path in write_reports(&result, &reporter, &names)? {
            info!("Report written to {}", path.display());
        }
    }

    Ok(())
}

#[cfg(not(feature = "opencv"))]
fn scan(_args: &ScanArgs, _format: OutputFormat) -> Result<()> {
    anyhow::bail!("video decoding is unavailable: rebuild with `--features opencv`")
}

#[cfg(feature = "opencv")]
fn show_video_info(video: &str, format: OutputFormat) -> Result<()> {
    let info = rust_videoscan::get_video_info(video)
        .with_context(|| format!("failed to read video info for {}", video))?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Video Information:");
    println!("  Path: {}", info.path);
    println!("  Dimensions: {}x{}", info.width, info.height);
    println!("  Frame Rate: {:.2} fps", info.fps);
    println!("  Frame Count: {}", info.frame_count);
    println!("  Duration: {:.2} seconds", info.duration_seconds);
    println!("  Description: {}", info.description());

    if !info.is_valid() {
        warn!("Video properties look incomplete; frame count may be unreliable");
    }
    Ok(())
}

#[cfg(not(feature = "opencv"))]
fn show_video_info(_video: &str, _format: OutputFormat) -> Result<()> {
    anyhow::bail!("video decoding is unavailable: rebuild with `--features opencv`")
}

fn show_plan(frames: u64, config: &ConfigArgs, format: OutputFormat) -> Result<()> {
    let config = config.build()?;
    let (identity, clips) = plan_windows(&config, frames)?;
    if identity.is_empty() && clips.is_empty() {
        warn!("No complete window fits in {} frames", frames);
    }

    match format {
        OutputFormat::Simple => {
            println!("Sampled frames: {:?}", identity);
            println!("Clip starts: {:?}", clips);
        }
        OutputFormat::Detailed => {
            println!("Window plan for {} frames:", frames);
            if config.mode.runs_identity() {
                println!("  Face search every {} frames: {} samples", config.face.frame_interval, identity.len());
                println!("    {:?}", identity);
            }
            if config.mode.runs_violence() {
                println!(
                    "  Clips of {} frames overlapping by {}: {} clips",
                    config.violence.clip_length,
                    config.violence.overlap,
                    clips.len()
                );
                for (i, start) in clips.iter().enumerate() {
                    println!("    Clip {}: frames {}-{}", i + 1, start, start + config.violence.clip_length as u64 - 1);
                }
            }
        }
        OutputFormat::Json => {
            let json_output = serde_json::json!({
                "frames": frames,
                "mode": config.mode,
                "sampled_frames": identity,
                "clip_starts": clips,
                "clip_length": config.violence.clip_length,
            });
            println!("{}", serde_json::to_string_pretty(&json_output)?);
        }
    }
    Ok(())
}

#[cfg_attr(not(feature = "opencv"), allow(dead_code))]
fn event_detail(event: &DetectionEvent) -> String {
    match &event.metadata {
        EventMetadata::Violence { severity } => format!("severity {}", severity),
        EventMetadata::Identity { dominant_color, .. } => format!(
            "confidence {}, dominant color #{:02x}{:02x}{:02x}",
            Confidence::from_similarity(event.score),
            dominant_color[0],
            dominant_color[1],
            dominant_color[2]
        ),
    }
}

#[cfg_attr(not(feature = "opencv"), allow(dead_code))]
fn event_json(event: &DetectionEvent) -> serde_json::Value {
    serde_json::json!({
        "video": event.video_id,
        "frame_index": event.frame_index,
        "time_seconds": event.time_seconds,
        "score": event.score,
        "metadata": event.metadata,
    })
}

#[cfg_attr(not(feature = "opencv"), allow(dead_code))]
fn output_results(result: &RunResult, format: OutputFormat, scan_time: std::time::Duration) -> Result<()> {
    let sections = [
        ("Missing person matches", &result.identity_events),
        ("Violence detections", &result.violence_events),
    ];

    match format {
        OutputFormat::Simple => {
            for (_, events) in sections {
                for event in events {
                    println!(
                        "{}\t{}\t{:.2}s\t{:.4}",
                        event.video_id, event.frame_index, event.time_seconds, event.score
                    );
                }
            }
        }
        OutputFormat::Detailed => {
            println!("Scan Results{}:", if result.complete { "" } else { " (partial)" });
            println!("  Scan time: {:.2}s", scan_time.as_secs_f64());
            for (title, events) in sections {
                println!("  {}: {}", title, events.len());
                for (rank, event) in events.iter().enumerate() {
                    println!(
                        "    {}. {} at {:.2}s (frame {}): {:.4}, {}",
                        rank + 1,
                        event.video_id,
                        event.time_seconds,
                        event.frame_index,
                        event.score,
                        event_detail(event)
                    );
                }
            }
            if !result.forwarded_videos.is_empty() {
                println!("  Forwarded to violence scoring: {:?}", result.forwarded_videos);
            }
            for skipped in &result.skipped {
                println!("  Skipped {}: {}", skipped.video_id, skipped.reason);
            }
            for failure in &result.failures {
                println!("  Failed unit {} @ {}: {}", failure.video_id, failure.position, failure.reason);
            }
        }
        OutputFormat::Json => {
            let json_output = serde_json::json!({
                "complete": result.complete,
                "scan_time_ms": scan_time.as_millis() as u64,
                "identity_events": result.identity_events.iter().map(event_json).collect::<Vec<_>>(),
                "violence_events": result.violence_events.iter().map(event_json).collect::<Vec<_>>(),
                "forwarded_videos": result.forwarded_videos,
                "skipped": result.skipped,
                "failures": result.failures,
            });
            println!("{}", serde_json::to_string_pretty(&json_output)?);
        }
    }

    info!(
        "Scan completed in {:.2}s, {} events",
        scan_time.as_secs_f64(),
        result.total_events()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scan_args_parsing() {
        let cli = Cli::try_parse_from([
            "rust-videoscan",
            "scan",
            "a.mp4",
            "b.mp4",
            "--reference",
            "face.jpg",
            "--mode",
            "missing-person",
            "--face-threshold",
            "0.8",
            "--format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.format, OutputFormat::Json);
        let Command::Scan(args) = cli.command else {
            panic!("Expected scan command");
        };
        assert_eq!(args.videos, vec!["a.mp4", "b.mp4"]);
        assert_eq!(args.references, vec![PathBuf::from("face.jpg")]);

        let config = args.config.build().unwrap();
        assert_eq!(config.mode, ScanMode::MissingPerson);
        assert_eq!(config.face.threshold, 0.8);
    }

    #[test]
    fn test_scan_requires_videos() {
        assert!(Cli::try_parse_from(["rust-videoscan", "scan"]).is_err());
    }

    #[test]
    fn test_save_evidence_requires_output() {
        assert!(Cli::try_parse_from(["rust-videoscan", "scan", "a.mp4", "--save-evidence"]).is_err());
    }

    #[test]
    fn test_overrides_are_validated() {
        let args = ConfigArgs {
            clip_length: Some(8),
            overlap: Some(8),
            ..ConfigArgs::default()
        };
        assert!(args.build().is_err());
    }

    #[test]
    fn test_workers_override_sets_in_flight_bound() {
        let args = ConfigArgs {
            workers: Some(3),
            strict_decode: true,
            ..ConfigArgs::default()
        };
        let config = args.build().unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_in_flight, 6);
        assert_eq!(config.decode_policy, DecodePolicy::Strict);
    }

    #[test]
    fn test_plan_command_parsing() {
        let cli = Cli::try_parse_from(["rust-videoscan", "plan", "--frames", "40", "--clip-length", "16"]).unwrap();
        assert!(matches!(cli.command, Command::Plan { frames: 40, .. }));
    }
}
