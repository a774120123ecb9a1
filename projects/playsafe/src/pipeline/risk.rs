// Injury-risk heuristic
//
// Pure arithmetic over lower-body joints. Each metric is normalised to
// [0, 1], combined with the configured weights and scaled to a percentage.
// The thresholds are hand-picked, see RiskConfig.

use crate::config::RiskConfig;
use crate::pipeline::geometry::{angle_deg, distance, horizontal_offset_from_line};
use crate::pipeline::tracking::{PoseHistory, PoseSample};
use crate::pipeline::types::{Joint, KeypointSet, RiskScore};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RiskMetrics {
    pub leg_extension: f32,
    pub knee_flexion: f32,
    pub knee_valgus: f32,
    pub joint_velocity: f32,
}

pub struct RiskHeuristic {
    config: RiskConfig,
    min_keypoint_confidence: f32,
}

impl RiskHeuristic {
    pub fn new(config: RiskConfig, min_keypoint_confidence: f32) -> Self {
        Self {
            config,
            min_keypoint_confidence,
        }
    }

    /// Score the current pose. Returns None for a pose whose lower-body
    /// confidence is below threshold: such a pose is skipped, not scored 0.
    pub fn assess(&self, current: &PoseSample, history: &PoseHistory, fps: f64) -> Option<RiskScore> {
        if current.keypoints.mean_confidence(&Joint::LOWER_BODY) < self.min_keypoint_confidence {
            return None;
        }

        let m = self.metrics(current, history, fps);
        let w = &self.config.weights;
        let total = w.total();
        let score = if total > 0.0 {
            (w.leg_extension * m.leg_extension
                + w.knee_flexion * m.knee_flexion
                + w.knee_valgus * m.knee_valgus
                + w.joint_velocity * m.joint_velocity)
                / total
        } else {
            0.0
        };

        let k = self.config.logistic_steepness;
        let pct = if k > 0.0 {
            100.0 / (1.0 + (-k * (score - 0.5)).exp())
        } else {
            score * 100.0
        };

        Some(RiskScore::new(pct, self.config.flag_threshold_pct))
    }

    pub fn metrics(&self, current: &PoseSample, history: &PoseHistory, fps: f64) -> RiskMetrics {
        let kp = &current.keypoints;
        RiskMetrics {
            leg_extension: self.leg_extension(kp),
            knee_flexion: self.knee_flexion(kp),
            knee_valgus: self.knee_valgus(kp),
            joint_velocity: self.joint_velocity(current, history, fps),
        }
    }

    /// Summed knee-to-ankle distance over a fixed pixel scale.
    fn leg_extension(&self, kp: &KeypointSet) -> f32 {
        let scale = self.config.leg_extension_scale_px;
        if scale <= 0.0 {
            return 0.0;
        }
        let left = distance(kp.get(Joint::LeftKnee).point(), kp.get(Joint::LeftAnkle).point());
        let right = distance(
            kp.get(Joint::RightKnee).point(),
            kp.get(Joint::RightAnkle).point(),
        );
        ((left + right) / scale).min(1.0)
    }

    /// Deepest knee bend of the two legs, between the safe and max flexion.
    fn knee_flexion(&self, kp: &KeypointSet) -> f32 {
        let safe = self.config.safe_knee_flexion_deg;
        let max = self.config.max_knee_flexion_deg;

        legs()
            .iter()
            .filter_map(|(hip, knee, ankle)| {
                angle_deg(
                    kp.get(*hip).point(),
                    kp.get(*knee).point(),
                    kp.get(*ankle).point(),
                )
            })
            .map(|angle| {
                let flexion = 180.0 - angle;
                if max <= safe {
                    return if flexion > safe { 1.0 } else { 0.0 };
                }
                ((flexion - safe) / (max - safe)).clamp(0.0, 1.0)
            })
            .fold(0.0, f32::max)
    }

    /// Knee drifting towards the body midline, off the hip-to-ankle line.
    fn knee_valgus(&self, kp: &KeypointSet) -> f32 {
        if self.config.max_valgus_ratio <= 0.0 {
            return 0.0;
        }
        let midline_x = (kp.get(Joint::LeftHip).x + kp.get(Joint::RightHip).x) / 2.0;

        legs()
            .iter()
            .filter_map(|(hip, knee, ankle)| {
                let hip = kp.get(*hip).point();
                let knee = kp.get(*knee).point();
                let ankle = kp.get(*ankle).point();

                let towards_midline = midline_x - hip.x;
                if towards_midline.abs() <= f32::EPSILON {
                    return None;
                }
                let offset = horizontal_offset_from_line(knee, hip, ankle)?;
                let medial = offset * towards_midline.signum();

                let leg_length = distance(hip, knee) + distance(knee, ankle);
                if leg_length <= f32::EPSILON {
                    return None;
                }
                Some((medial / leg_length / self.config.max_valgus_ratio).clamp(0.0, 1.0))
            })
            .fold(0.0, f32::max)
    }

    /// Ankle-speed spikes across the history window and the current pose.
    fn joint_velocity(&self, current: &PoseSample, history: &PoseHistory, fps: f64) -> f32 {
        if fps <= 0.0 || self.config.velocity_spike_saturation == 0 {
            return 0.0;
        }
        let threshold = self.config.velocity_spike_body_heights_per_sec;

        let samples: Vec<&PoseSample> = history
            .iter()
            .filter(|s| s.frame_index < current.frame_index)
            .chain(std::iter::once(current))
            .collect();

        let spikes = samples
            .windows(2)
            .filter(|pair| {
                let (a, b) = (pair[0], pair[1]);
                let dt = (b.frame_index - a.frame_index) as f64 / fps;
                let body = (a.body_height + b.body_height) / 2.0;
                if dt <= 0.0 || body <= 0.0 {
                    return false;
                }
                [Joint::LeftAnkle, Joint::RightAnkle].iter().any(|joint| {
                    let disp = distance(a.keypoints.get(*joint).point(), b.keypoints.get(*joint).point());
                    (disp / body) as f64 / dt > threshold as f64
                })
            })
            .count();

        (spikes as f32 / self.config.velocity_spike_saturation as f32).min(1.0)
    }
}

fn legs() -> [(Joint, Joint, Joint); 2] {
    [
        (Joint::LeftHip, Joint::LeftKnee, Joint::LeftAnkle),
        (Joint::RightHip, Joint::RightKnee, Joint::RightAnkle),
    ]
}
