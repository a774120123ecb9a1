use crate::run_artifacts::{ANNOTATED_VIDEO_FILE, METADATA_FILE};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "mkv", "avi"];

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunMetadata {
    pub run_id: String,
    pub original_name: String,
    pub created_at: DateTime<Utc>,
    /// File name of the stored upload inside the run directory
    pub input_file: String,
    pub roster: Vec<String>,
    #[serde(skip)]
    pub output_dir: PathBuf,
}

impl RunMetadata {
    pub fn input_path(&self) -> PathBuf {
        self.output_dir.join(&self.input_file)
    }

    pub fn annotated_path(&self) -> PathBuf {
        self.output_dir.join(ANNOTATED_VIDEO_FILE)
    }
}

/// Run ids come from URLs; anything that could leave the output root is refused.
pub fn is_valid_run_id(run_id: &str) -> bool {
    !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Lower-cased extension if it is one of the accepted video containers.
pub fn video_extension(name: &str) -> Option<String> {
    let ext = Path::new(name)
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())?;
    VIDEO_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn sanitize_stem(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    let clean: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    if clean.is_empty() {
        "video".to_string()
    } else {
        clean
    }
}

/// Create a fresh run directory and its metadata.json. Run ids are the
/// sanitised upload stem plus a millisecond timestamp, so re-uploading the
/// same file never collides.
pub fn create_run(output_root: &Path, video_name: &str, roster: Vec<String>) -> Result<RunMetadata> {
    let ext = video_extension(video_name)
        .ok_or_else(|| anyhow::anyhow!("Unsupported video type: {}", video_name))?;

    let created_at = Utc::now();
    let run_id = format!(
        "{}-{}",
        sanitize_stem(video_name),
        created_at.format("%Y%m%d%H%M%S%3f")
    );

    let output_dir = output_root.join(&run_id);
    if output_dir.exists() {
        return Err(anyhow::anyhow!("Output directory already exists for: {}", run_id));
    }
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create run directory {:?}", output_dir))?;

    let metadata = RunMetadata {
        run_id,
        original_name: video_name.to_string(),
        created_at,
        input_file: format!("input.{}", ext),
        roster,
        output_dir: output_dir.clone(),
    };

    save_metadata(&metadata)?;
    Ok(metadata)
}

pub fn save_metadata(metadata: &RunMetadata) -> Result<()> {
    let content = serde_json::to_string_pretty(metadata)?;
    fs::write(metadata.output_dir.join(METADATA_FILE), content)
        .with_context(|| format!("Failed to write metadata for {}", metadata.run_id))?;
    Ok(())
}

pub fn load_run(output_root: &Path, run_id: &str) -> Result<RunMetadata> {
    let path = output_root.join(run_id);
    let content = fs::read_to_string(path.join(METADATA_FILE))
        .with_context(|| format!("Unknown run {}", run_id))?;
    let mut metadata: RunMetadata = serde_json::from_str(&content)?;
    metadata.output_dir = path;
    Ok(metadata)
}

/// All runs under the output root, newest first.
pub fn list_runs(output_root: &Path) -> Result<Vec<RunMetadata>> {
    let mut runs = Vec::new();

    if !output_root.exists() {
        return Ok(runs);
    }

    for entry in fs::read_dir(output_root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let metadata_path = path.join(METADATA_FILE);
        if !metadata_path.exists() {
            continue;
        }
        let content = fs::read_to_string(&metadata_path)?;
        match serde_json::from_str::<RunMetadata>(&content) {
            Ok(mut metadata) => {
                metadata.output_dir = path.clone();
                runs.push(metadata);
            }
            Err(e) => tracing::warn!("Skipping {:?}: {}", metadata_path, e),
        }
    }

    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(runs)
}
