use crate::config::OverlayConfig;
use crate::pipeline::types::{Joint, KeypointSet, PlayerResult, PlayerStatus, Roster};
use anyhow::Result;
use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc;

const RED: (f64, f64, f64) = (0.0, 0.0, 255.0);
const GREEN: (f64, f64, f64) = (0.0, 200.0, 0.0);
const GREY: (f64, f64, f64) = (160.0, 160.0, 160.0);
const WHITE: (f64, f64, f64) = (255.0, 255.0, 255.0);

/// Torso and leg bones, COCO indices
const BONES: [(Joint, Joint); 8] = [
    (Joint::LeftAnkle, Joint::LeftKnee),
    (Joint::LeftKnee, Joint::LeftHip),
    (Joint::RightAnkle, Joint::RightKnee),
    (Joint::RightKnee, Joint::RightHip),
    (Joint::LeftHip, Joint::RightHip),
    (Joint::LeftShoulder, Joint::LeftHip),
    (Joint::RightShoulder, Joint::RightHip),
    (Joint::LeftShoulder, Joint::RightShoulder),
];

fn bgr(c: (f64, f64, f64)) -> Scalar {
    Scalar::new(c.0, c.1, c.2, 0.0)
}

pub struct OverlayRenderer {
    config: OverlayConfig,
    min_keypoint_confidence: f32,
    roster: Roster,
}

impl OverlayRenderer {
    pub fn new(config: OverlayConfig, min_keypoint_confidence: f32, roster: Roster) -> Self {
        Self {
            config,
            min_keypoint_confidence,
            roster,
        }
    }

    /// Burn the per-player annotations into `frame`. A frame without players
    /// is not touched at all.
    pub fn draw(&self, frame: &mut Mat, players: &[PlayerResult]) -> Result<()> {
        for player in players {
            let b = player.detection.bbox;
            let x1 = b.x.round() as i32;
            let y1 = b.y.round() as i32;
            let rect = Rect::new(x1, y1, (b.w.round() as i32).max(1), (b.h.round() as i32).max(1));

            match (player.status, player.risk) {
                (PlayerStatus::Scored, Some(risk)) => {
                    let color = bgr(if risk.flagged { RED } else { GREEN });
                    imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

                    if self.config.draw_skeleton {
                        if let Some(kp) = &player.keypoints {
                            self.draw_skeleton(frame, kp, color)?;
                        }
                    }

                    let label = format!("Risk: {}%", risk.pct as i32);
                    put_text(frame, &label, Point::new(x1, y1 - 25), 0.6, color)?;
                    let verdict = if risk.flagged { "INJURED" } else { "OK" };
                    put_text(frame, verdict, Point::new(x1, y1 - 5), 0.7, color)?;
                }
                _ => {
                    imgproc::rectangle(frame, rect, bgr(GREY), 1, imgproc::LINE_8, 0)?;
                }
            }

            let tag = format!("#{} {}", player.track_id, self.roster.name_for(player.track_id));
            put_text(frame, &tag, Point::new(x1, rect.y + rect.height + 15), 0.45, bgr(WHITE))?;
        }
        Ok(())
    }

    fn draw_skeleton(&self, frame: &mut Mat, kp: &KeypointSet, color: Scalar) -> Result<()> {
        let visible = |j: Joint| kp.get(j).confidence >= self.min_keypoint_confidence;
        let to_point = |j: Joint| {
            let k = kp.get(j);
            Point::new(k.x.round() as i32, k.y.round() as i32)
        };

        for (a, b) in BONES {
            if visible(a) && visible(b) {
                imgproc::line(frame, to_point(a), to_point(b), color, 2, imgproc::LINE_AA, 0)?;
            }
        }
        for joint in Joint::LOWER_BODY {
            if visible(joint) {
                imgproc::circle(frame, to_point(joint), 3, bgr(WHITE), -1, imgproc::LINE_8, 0)?;
            }
        }
        Ok(())
    }
}

fn put_text(frame: &mut Mat, text: &str, org: Point, scale: f64, color: Scalar) -> Result<()> {
    imgproc::put_text(
        frame,
        text,
        org,
        imgproc::FONT_HERSHEY_SIMPLEX,
        scale,
        color,
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// Byte-level comparison of two frames of the same shape
#[cfg(test)]
pub(crate) fn frames_identical(a: &Mat, b: &Mat) -> Result<bool> {
    use opencv::core;
    use opencv::prelude::*;
    if a.size()? != b.size()? || a.typ() != b.typ() {
        return Ok(false);
    }
    let diff = core::norm2(a, b, core::NORM_INF, &core::no_array())?;
    Ok(diff == 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{BBox, Detection, Keypoint, RiskScore, JOINT_COUNT};
    use opencv::core::{Vec3b, CV_8UC3};
    use opencv::prelude::*;

    fn black_frame() -> Mat {
        Mat::new_rows_cols_with_default(200, 200, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    fn player(status: PlayerStatus, risk: Option<RiskScore>) -> PlayerResult {
        PlayerResult {
            track_id: 1,
            detection: Detection {
                bbox: BBox::from_xyxy(20.0, 40.0, 80.0, 140.0),
                confidence: 0.9,
                class_id: 0,
                class_name: Some("person".to_string()),
            },
            status,
            keypoints: Some(KeypointSet::new([Keypoint::default(); JOINT_COUNT])),
            risk,
        }
    }

    fn renderer() -> OverlayRenderer {
        OverlayRenderer::new(OverlayConfig::default(), 0.5, Roster::parse("Ahmed"))
    }

    #[test]
    fn test_no_players_leaves_frame_untouched() {
        let original = black_frame();
        let mut frame = original.try_clone().unwrap();
        renderer().draw(&mut frame, &[]).unwrap();
        assert!(frames_identical(&original, &frame).unwrap());
    }

    #[test]
    fn test_box_color_follows_flag() {
        let mut frame = black_frame();
        let flagged = player(PlayerStatus::Scored, Some(RiskScore::new(85.0, 70.0)));
        renderer().draw(&mut frame, &[flagged]).unwrap();
        let px = *frame.at_2d::<Vec3b>(90, 20).unwrap();
        assert_eq!(px, Vec3b::from([0, 0, 255]));

        let mut frame = black_frame();
        let ok = player(PlayerStatus::Scored, Some(RiskScore::new(20.0, 70.0)));
        renderer().draw(&mut frame, &[ok]).unwrap();
        let px = *frame.at_2d::<Vec3b>(90, 20).unwrap();
        assert_eq!(px, Vec3b::from([0, 200, 0]));
    }

    #[test]
    fn test_unscored_player_gets_grey_box() {
        let mut frame = black_frame();
        renderer()
            .draw(&mut frame, &[player(PlayerStatus::LowConfidence, None)])
            .unwrap();
        let px = *frame.at_2d::<Vec3b>(90, 20).unwrap();
        assert_eq!(px, Vec3b::from([160, 160, 160]));
        assert!(!frames_identical(&black_frame(), &frame).unwrap());
    }
}
