mod cli;
mod config;
mod error;
mod pipeline;
mod run_artifacts;
mod run_context;
mod video;
mod web;

use anyhow::{Context, Result};
use cli::{AnalyzeArgs, Cli, Command};
use indicatif::{ProgressBar, ProgressStyle};
use pipeline::orchestrator::{analyze_video, AnalysisRequest};
use pipeline::types::{ProcessingState, Roster};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse_args();

    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Analyze(args) => analyze(args).await?,
    }

    Ok(())
}

/// Analyse one video synchronously, with a terminal progress bar.
async fn analyze(args: AnalyzeArgs) -> Result<()> {
    let config = args.models.pipeline_config()?;
    let roster = match &args.roster {
        Some(path) => Roster::parse(
            &std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read roster {:?}", path))?,
        ),
        None => Roster::default(),
    };
    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let request = AnalysisRequest {
        input: args.input.clone(),
        output_video: args.output.clone(),
        artifacts_dir: None,
        stats_out: args.stats_out.clone(),
        roster,
        detector_model: args.models.detector_model.clone(),
        pose_model: args.models.pose_model.clone(),
        backend: args.models.backend.clone(),
        config,
    };

    let state = Arc::new(ProcessingState::new("cli".to_string(), 0));
    let worker_state = state.clone();
    let mut handle =
        tokio::task::spawn_blocking(move || analyze_video(&request, &worker_state));

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")?
            .progress_chars("#>-"),
    );

    let result = loop {
        tokio::select! {
            res = &mut handle => break res?,
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                pb.set_length(state.total_frames.load(Ordering::Relaxed) as u64);
                pb.set_position(state.frames_done.load(Ordering::Relaxed) as u64);
            }
        }
    };

    match result {
        Ok((summary, stats)) => {
            pb.set_length(summary.frames_read as u64);
            pb.set_position(summary.frames_read as u64);
            pb.finish_with_message("Done");
            tracing::info!(
                "Wrote {} frames to {:?}",
                summary.frames_written,
                args.output
            );
            for (id, player) in &stats {
                if player.alert {
                    tracing::warn!(
                        "Substitute #{} {} now: risk {:.1}%",
                        id,
                        player.name,
                        player.last_risk_pct.unwrap_or(0.0)
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            tracing::error!("{}", error::user_message(&e));
            Err(e)
        }
    }
}
