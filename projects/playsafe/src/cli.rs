use crate::config::PipelineConfig;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the upload page and the run API
    Serve(ServeArgs),
    /// Analyse one video from the command line
    Analyze(AnalyzeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 12206)]
    pub port: u16,

    /// Root directory for run directories
    #[arg(long, env = "PLAYSAFE_OUTPUT_ROOT", default_value = "runs")]
    pub output_root: String,

    /// Largest accepted upload, in megabytes
    #[arg(long, default_value_t = 512)]
    pub max_upload_mb: usize,

    #[command(flatten)]
    pub models: ModelArgs,
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    /// Input video (.mp4, .mkv, .avi)
    #[arg(long)]
    pub input: PathBuf,

    /// Annotated H.264 output
    #[arg(long)]
    pub output: PathBuf,

    /// Per-player statistics as JSON
    #[arg(long)]
    pub stats_out: Option<PathBuf>,

    /// Text file with one player name per line
    #[arg(long)]
    pub roster: Option<PathBuf>,

    #[command(flatten)]
    pub models: ModelArgs,
}

/// Model and runtime flags shared by both subcommands
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// YOLOv8 detection model
    #[arg(long, env = "PLAYSAFE_DETECTOR_MODEL", default_value = "models/yolov8n.onnx")]
    pub detector_model: String,

    /// YOLOv8 pose model
    #[arg(long, env = "PLAYSAFE_POSE_MODEL", default_value = "models/yolov8n-pose.onnx")]
    pub pose_model: String,

    /// Video decoding backend
    #[arg(long, default_value = "opencv", value_parser = ["opencv", "ffmpeg"])]
    pub backend: String,

    /// ffmpeg binary used for the output encode
    #[arg(long, env = "PLAYSAFE_FFMPEG")]
    pub ffmpeg_bin: Option<String>,

    /// JSON file overriding the analysis thresholds
    #[arg(long, env = "PLAYSAFE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl ModelArgs {
    /// Pipeline config from the optional file, with command-line overrides applied.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load_or_default(self.config.as_deref())?;
        if let Some(bin) = &self.ffmpeg_bin {
            config.encoder.ffmpeg_bin = bin.clone();
        }
        Ok(config)
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
