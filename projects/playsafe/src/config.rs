// Pipeline configuration
//
// Every threshold the analysis uses lives here. The defaults reproduce the
// values the application shipped with; none of them are validated against
// biomechanical data, so they are meant to be tuned through a JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub pose: PoseConfig,
    pub risk: RiskConfig,
    pub tracking: TrackingConfig,
    pub overlay: OverlayConfig,
    pub encoder: EncoderConfig,
}

impl PipelineConfig {
    /// Load a config file, falling back to defaults for missing keys.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DetectorConfig {
    pub min_confidence: f32,
    /// Label of the class treated as a player
    pub class_name: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.25,
            class_name: "person".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PoseConfig {
    /// Mean confidence of hips, knees and ankles required to score a pose
    pub min_keypoint_confidence: f32,
    /// Fraction of the box size added on each side of the crop
    pub crop_padding: f32,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            min_keypoint_confidence: 0.5,
            crop_padding: 0.1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RiskWeights {
    pub leg_extension: f32,
    pub knee_flexion: f32,
    pub knee_valgus: f32,
    pub joint_velocity: f32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            leg_extension: 0.35,
            knee_flexion: 0.25,
            knee_valgus: 0.25,
            joint_velocity: 0.15,
        }
    }
}

impl RiskWeights {
    pub fn total(&self) -> f32 {
        self.leg_extension + self.knee_flexion + self.knee_valgus + self.joint_velocity
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    /// Divisor for the summed knee-to-ankle distances, in pixels
    pub leg_extension_scale_px: f32,
    pub safe_knee_flexion_deg: f32,
    pub max_knee_flexion_deg: f32,
    /// Medial knee offset relative to leg length at which valgus saturates
    pub max_valgus_ratio: f32,
    /// Ankle speed, in body heights per second, counted as a spike
    pub velocity_spike_body_heights_per_sec: f32,
    /// Number of spikes in the history window that saturates the metric
    pub velocity_spike_saturation: usize,
    /// 0 disables the logistic emphasis curve
    pub logistic_steepness: f32,
    pub flag_threshold_pct: f32,
    pub warn_threshold_pct: f32,
    pub alert_threshold_pct: f32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            leg_extension_scale_px: 300.0,
            safe_knee_flexion_deg: 30.0,
            max_knee_flexion_deg: 90.0,
            max_valgus_ratio: 0.25,
            velocity_spike_body_heights_per_sec: 4.0,
            velocity_spike_saturation: 3,
            logistic_steepness: 0.0,
            flag_threshold_pct: 70.0,
            warn_threshold_pct: 50.0,
            alert_threshold_pct: 63.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TrackingConfig {
    pub iou_threshold: f32,
    pub max_missed_frames: usize,
    pub history_frames: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            max_missed_frames: 5,
            history_frames: 15,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OverlayConfig {
    pub draw_skeleton: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            draw_skeleton: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EncoderConfig {
    /// Path or name of the ffmpeg binary
    pub ffmpeg_bin: String,
    pub crf: u8,
    pub preset: String,
    /// Copy the source's audio track (if any) into the output as AAC
    pub carry_audio: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            crf: 23,
            preset: "veryfast".to_string(),
            carry_audio: true,
        }
    }
}
