use crate::config::DetectorConfig;
use crate::error::RunFailure;
use crate::pipeline::types::{BBox, Detection};
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use std::path::Path;
use usls::models::YOLO;
use usls::{Config, Image};

/// Anything that can find boxes in a BGR frame. The model behind it can be swapped.
pub trait PlayerDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>>;
}

/// YOLOv8 detector running through usls.
pub struct YoloDetector {
    model: YOLO,
}

impl YoloDetector {
    /// Load the model. Any failure here is fatal for the run.
    pub fn new(model_path: &str) -> Result<Self> {
        if !Path::new(model_path).exists() {
            return Err(
                RunFailure::ModelLoad(format!("detector model not found: {}", model_path)).into(),
            );
        }

        let config = Config::yolo_detect()
            .with_model_file(model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config
            .commit()
            .map_err(|e| RunFailure::ModelLoad(format!("detector {}: {}", model_path, e)))?;
        let model = YOLO::new(config)
            .map_err(|e| RunFailure::ModelLoad(format!("detector {}: {}", model_path, e)))?;

        tracing::info!("Loaded detector model {}", model_path);
        Ok(Self { model })
    }
}

impl PlayerDetector for YoloDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<Detection>> {
        let image = Image::from(mat_to_dynamic_image(frame)?);
        let ys = self.model.forward(&[image])?;

        let detections = ys
            .into_iter()
            .next()
            .map(|y| {
                y.hbbs
                    .into_iter()
                    .map(|hbb| Detection {
                        bbox: BBox {
                            x: hbb.xmin(),
                            y: hbb.ymin(),
                            w: hbb.width(),
                            h: hbb.height(),
                        },
                        confidence: hbb.confidence().unwrap_or(0.0),
                        class_id: hbb.id().unwrap_or(0),
                        class_name: hbb.name().map(|s| s.to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(detections)
    }
}

/// Keep the player detections: right label, confident enough, and with a
/// non-degenerate box once clamped to the frame.
pub fn filter_players(
    detections: Vec<Detection>,
    config: &DetectorConfig,
    frame_width: f32,
    frame_height: f32,
) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= config.min_confidence)
        .filter(|d| d.class_name.as_deref().unwrap_or("") == config.class_name)
        .filter_map(|d| {
            let bbox = d.bbox.clamp_to(frame_width, frame_height)?;
            Some(Detection { bbox, ..d })
        })
        .collect()
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
pub fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    let width = size.width as u32;
    let height = size.height as u32;

    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();

    let img_buffer = ImageBuffer::<Rgb<u8>, _>::from_vec(width, height, buffer)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    fn det(name: &str, conf: f32, bbox: BBox) -> Detection {
        Detection {
            bbox,
            confidence: conf,
            class_id: 0,
            class_name: Some(name.to_string()),
        }
    }

    #[test]
    fn test_filter_players() {
        let config = DetectorConfig::default();
        let detections = vec![
            det("person", 0.9, BBox::from_xyxy(10.0, 10.0, 50.0, 120.0)),
            det("person", 0.1, BBox::from_xyxy(10.0, 10.0, 50.0, 120.0)),
            det("sports ball", 0.9, BBox::from_xyxy(60.0, 60.0, 70.0, 70.0)),
            det("person", 0.8, BBox::from_xyxy(630.0, 10.0, 700.0, 100.0)),
            det("person", 0.8, BBox::from_xyxy(700.0, 10.0, 720.0, 100.0)),
        ];

        let players = filter_players(detections, &config, 640.0, 480.0);
        assert_eq!(players.len(), 2);
        assert_eq!(players[1].bbox, BBox::from_xyxy(630.0, 10.0, 640.0, 100.0));
    }

    #[test]
    fn test_mat_to_dynamic_image_swaps_channels() {
        // Pure blue in BGR
        let mat =
            Mat::new_rows_cols_with_default(4, 6, CV_8UC3, Scalar::new(255.0, 0.0, 0.0, 0.0))
                .unwrap();
        let img = mat_to_dynamic_image(&mat).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (6, 4));
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 255]);
    }

    #[test]
    fn test_missing_model_is_model_load_failure() {
        let err = match YoloDetector::new("/nonexistent/yolov8n.onnx") {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert!(matches!(
            err.downcast_ref::<RunFailure>(),
            Some(RunFailure::ModelLoad(_))
        ));
    }
}
