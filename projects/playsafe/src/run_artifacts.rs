// Run artifact struct definitions
//
// Everything a run persists into its output directory, besides the videos.

use serde::{Deserialize, Serialize};

pub const METADATA_FILE: &str = "metadata.json";
pub const ANNOTATED_VIDEO_FILE: &str = "annotated.mp4";
pub const STATS_FILE: &str = "stats.json";
pub const DETECTIONS_FILE: &str = "detections.json";
pub const RISK_CSV_FILE: &str = "risk.csv";

/// Gauge colour for a risk value
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    Green,
    Amber,
    Red,
    /// The player was seen but never scored
    Unscored,
}

impl RiskBand {
    pub fn for_pct(pct: Option<f32>, warn_threshold: f32, flag_threshold: f32) -> Self {
        match pct {
            None => RiskBand::Unscored,
            Some(p) if p >= flag_threshold => RiskBand::Red,
            Some(p) if p >= warn_threshold => RiskBand::Amber,
            Some(_) => RiskBand::Green,
        }
    }
}

/// One entry of stats.json, keyed by player id
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlayerStats {
    pub name: String,
    pub frames_seen: usize,
    pub frames_scored: usize,
    pub last_risk_pct: Option<f32>,
    pub peak_risk_pct: Option<f32>,
    pub mean_risk_pct: Option<f32>,
    pub flagged_frames: usize,
    pub band: RiskBand,
    /// Last risk at or above the substitution alert threshold
    pub alert: bool,
}

/// One row of risk.csv: a player in a frame
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RiskRow {
    pub frame: usize,
    pub timestamp_secs: f64,
    pub player_id: u32,
    pub name: String,
    pub status: String,
    pub risk_pct: Option<f32>,
    pub flagged: bool,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}
