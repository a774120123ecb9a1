use crate::pipeline::types::BBox;
use anyhow::Result;
use opencv::core;
use opencv::prelude::*;

/// A player region cut out of a frame, with its offset in frame pixels
pub struct PlayerCrop {
    pub image: core::Mat,
    pub x_offset: i32,
    pub y_offset: i32,
}

/// Grow a box by `padding` of its own size on every side.
pub fn pad_bbox(bbox: &BBox, padding: f32) -> BBox {
    let pad_w = bbox.w * padding;
    let pad_h = bbox.h * padding;
    BBox {
        x: bbox.x - pad_w,
        y: bbox.y - pad_h,
        w: bbox.w + 2.0 * pad_w,
        h: bbox.h + 2.0 * pad_h,
    }
}

/// Crops a Mat using a pixel bounding box, clamped to the image.
pub fn crop_pixels(img: &core::Mat, bbox: &BBox) -> Result<PlayerCrop> {
    let size = img.size()?;

    let x = bbox.x.round() as i32;
    let y = bbox.y.round() as i32;
    let w = bbox.w.round() as i32;
    let h = bbox.h.round() as i32;

    let x_clamped = x.clamp(0, size.width);
    let y_clamped = y.clamp(0, size.height);
    let w_clamped = (w - (x_clamped - x)).clamp(0, size.width - x_clamped);
    let h_clamped = (h - (y_clamped - y)).clamp(0, size.height - y_clamped);

    if w_clamped <= 0 || h_clamped <= 0 {
        anyhow::bail!(
            "Invalid crop dimensions: {}x{} (bbox: {:?})",
            w_clamped,
            h_clamped,
            bbox
        );
    }

    let roi = core::Rect::new(x_clamped, y_clamped, w_clamped, h_clamped);
    let cropped = core::Mat::roi(img, roi)?;

    let mut out = core::Mat::default();
    cropped.copy_to(&mut out)?;

    Ok(PlayerCrop {
        image: out,
        x_offset: x_clamped,
        y_offset: y_clamped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    #[test]
    fn test_crop_clamps_to_image() {
        let img = Mat::new_rows_cols_with_default(100, 200, CV_8UC3, Scalar::all(0.0)).unwrap();
        let crop = crop_pixels(&img, &BBox::from_xyxy(-20.0, 50.0, 40.0, 130.0)).unwrap();
        assert_eq!(crop.x_offset, 0);
        assert_eq!(crop.y_offset, 50);
        assert_eq!(crop.image.cols(), 40);
        assert_eq!(crop.image.rows(), 50);
    }

    #[test]
    fn test_crop_outside_image_fails() {
        let img = Mat::new_rows_cols_with_default(100, 100, CV_8UC3, Scalar::all(0.0)).unwrap();
        assert!(crop_pixels(&img, &BBox::from_xyxy(150.0, 150.0, 180.0, 180.0)).is_err());
    }

    #[test]
    fn test_pad_bbox() {
        let padded = pad_bbox(&BBox::from_xyxy(10.0, 10.0, 20.0, 30.0), 0.1);
        assert!((padded.x - 9.0).abs() < 1e-5);
        assert!((padded.y - 8.0).abs() < 1e-5);
        assert!((padded.w - 12.0).abs() < 1e-5);
        assert!((padded.h - 24.0).abs() < 1e-5);
    }
}
