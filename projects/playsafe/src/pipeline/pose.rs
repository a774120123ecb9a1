use crate::config::PoseConfig;
use crate::error::RunFailure;
use crate::pipeline::crop::PlayerCrop;
use crate::pipeline::detection::mat_to_dynamic_image;
use crate::pipeline::types::{Joint, Keypoint, KeypointSet, PoseOutcome};
use anyhow::Result;
use opencv::core::Mat;
use std::path::Path;
use usls::models::YOLO;
use usls::{Config, Image};

/// Anything that can place the joint vocabulary on a single-player crop.
/// Coordinates are local to the crop; `None` means no person was found.
pub trait PoseEstimator {
    fn estimate(&mut self, crop: &Mat) -> Result<Option<KeypointSet>>;
}

/// YOLOv8-pose running through usls on the player crop.
pub struct YoloPoseEstimator {
    model: YOLO,
}

impl YoloPoseEstimator {
    pub fn new(model_path: &str) -> Result<Self> {
        if !Path::new(model_path).exists() {
            return Err(
                RunFailure::ModelLoad(format!("pose model not found: {}", model_path)).into(),
            );
        }

        let config = Config::yolo_pose().with_model_file(model_path);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config
            .commit()
            .map_err(|e| RunFailure::ModelLoad(format!("pose {}: {}", model_path, e)))?;
        let model = YOLO::new(config)
            .map_err(|e| RunFailure::ModelLoad(format!("pose {}: {}", model_path, e)))?;

        tracing::info!("Loaded pose model {}", model_path);
        Ok(Self { model })
    }
}

impl PoseEstimator for YoloPoseEstimator {
    fn estimate(&mut self, crop: &Mat) -> Result<Option<KeypointSet>> {
        let image = Image::from(mat_to_dynamic_image(crop)?);
        let ys = self.model.forward(&[image])?;
        let Some(y) = ys.into_iter().next() else {
            return Ok(None);
        };

        // The crop should hold one player; a neighbour may leak in at the
        // edges, so keep the most confident person.
        let best = y
            .hbbs
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.confidence()
                    .unwrap_or(0.0)
                    .total_cmp(&b.confidence().unwrap_or(0.0))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        let Some(kpts) = y.keypointss.get(best) else {
            return Ok(None);
        };

        let points: Vec<Keypoint> = kpts
            .iter()
            .map(|kp| Keypoint {
                x: kp.x(),
                y: kp.y(),
                confidence: kp.confidence().unwrap_or(0.0),
            })
            .collect();

        Ok(KeypointSet::from_slice(&points))
    }
}

/// Run the estimator on a crop and gate the result.
///
/// An estimator error is returned as is; the caller knows the frame and
/// decides to skip the player. Keypoints come back in frame coordinates.
pub fn assess_pose(
    estimator: &mut dyn PoseEstimator,
    crop: &PlayerCrop,
    config: &PoseConfig,
) -> Result<PoseOutcome> {
    let Some(set) = estimator.estimate(&crop.image)? else {
        return Ok(PoseOutcome::NoPose);
    };

    if set.mean_confidence(&Joint::LOWER_BODY) < config.min_keypoint_confidence {
        return Ok(PoseOutcome::LowConfidence);
    }

    Ok(PoseOutcome::Pose(
        set.translated(crop.x_offset as f32, crop.y_offset as f32),
    ))
}
