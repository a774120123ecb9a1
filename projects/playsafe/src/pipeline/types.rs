use opencv::core::Mat;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;

pub const STAGES: [&str; 5] = ["decode", "detect", "pose", "overlay", "encode"];

#[derive(Debug, Serialize, Clone)]
pub struct StageProgress {
    pub current: usize,
    pub total: usize,
    pub ms_per_frame: f64,
}

/// Processing state shared between the pipeline thread and the web handlers
#[derive(Debug)]
pub struct ProcessingState {
    pub run_id: String,
    pub total_frames: AtomicUsize,
    pub frames_done: AtomicUsize,
    pub is_active: AtomicBool,
    pub is_complete: AtomicBool,
    /// Set by the UI; the pipeline checks it between frames
    pub stop_requested: AtomicBool,
    pub error: RwLock<Option<String>>,
    /// Progress per stage (e.g., "decode", "detect", "pose", "overlay", "encode")
    pub stages: RwLock<BTreeMap<String, StageProgress>>,
    pub start_time: Instant,
}

impl ProcessingState {
    pub fn new(run_id: String, total_frames: usize) -> Self {
        let stages = STAGES
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    StageProgress {
                        current: 0,
                        total: total_frames,
                        ms_per_frame: 0.0,
                    },
                )
            })
            .collect();

        Self {
            run_id,
            total_frames: AtomicUsize::new(total_frames),
            frames_done: AtomicUsize::new(0),
            is_active: AtomicBool::new(true),
            is_complete: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            error: RwLock::new(None),
            stages: RwLock::new(stages),
            start_time: Instant::now(),
        }
    }

    /// The frame count from container metadata is only a hint; the reader
    /// corrects it once the source is open.
    pub fn set_total_frames(&self, total: usize) {
        self.total_frames.store(total, Ordering::Relaxed);
        if let Ok(mut stages) = self.stages.write() {
            for progress in stages.values_mut() {
                progress.total = total;
            }
        }
    }

    pub fn update_stage(&self, stage: &str, current: usize, ms_per_frame: f64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.current = current;
                // Simple exponential moving average for smoothing durations
                if progress.ms_per_frame == 0.0 {
                    progress.ms_per_frame = ms_per_frame;
                } else {
                    progress.ms_per_frame = progress.ms_per_frame * 0.9 + ms_per_frame * 0.1;
                }
            }
        }
    }

    pub fn mark_complete(&self) {
        self.is_complete.store(true, Ordering::Relaxed);
        self.is_active.store(false, Ordering::Relaxed);
    }

    pub fn mark_failed(&self, message: String) {
        if let Ok(mut error) = self.error.write() {
            *error = Some(message);
        }
        self.is_active.store(false, Ordering::Relaxed);
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Relaxed);
    }

    pub fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    /// True once the run has recorded its outcome, not merely been asked to stop.
    pub fn is_finished(&self) -> bool {
        !self.is_active.load(Ordering::Relaxed)
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let frames_done = self.frames_done.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let effective_fps = if elapsed > 0.0 {
            frames_done as f64 / elapsed
        } else {
            0.0
        };

        let stages_json: BTreeMap<String, serde_json::Value> = self
            .stages
            .read()
            .map(|stages| {
                stages
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.clone(),
                            serde_json::json!({
                                "current": v.current,
                                "total": v.total,
                                "ms_per_frame": v.ms_per_frame,
                            }),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let error = self.error.read().map(|e| e.clone()).unwrap_or(None);

        serde_json::json!({
            "run_id": self.run_id,
            "total_frames": self.total_frames.load(Ordering::Relaxed),
            "frames_done": frames_done,
            "is_active": self.is_active.load(Ordering::Relaxed),
            "is_complete": self.is_complete.load(Ordering::Relaxed),
            "stop_requested": self.stop_requested.load(Ordering::Relaxed),
            "error": error,
            "stages": stages_json,
            "effective_fps": effective_fps,
        })
    }
}

/// A 2D point in frame pixel coordinates
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Pixel bounding box (top-left corner plus size)
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            w: (x2 - x1).max(0.0),
            h: (y2 - y1).max(0.0),
        }
    }

    pub fn x2(&self) -> f32 {
        self.x + self.w
    }

    pub fn y2(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// Clamp into a width x height image. Returns None when nothing is left.
    pub fn clamp_to(&self, width: f32, height: f32) -> Option<BBox> {
        let x1 = self.x.clamp(0.0, width);
        let y1 = self.y.clamp(0.0, height);
        let x2 = self.x2().clamp(0.0, width);
        let y2 = self.y2().clamp(0.0, height);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }
        Some(BBox::from_xyxy(x1, y1, x2, y2))
    }
}

/// A decoded frame and its position in the stream
pub struct Frame {
    pub index: usize,
    pub timestamp_secs: f64,
    pub image: Mat,
}

/// A player found by the detector
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// The 17 COCO keypoints emitted by the pose model, in model output order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Joint {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

pub const JOINT_COUNT: usize = 17;

impl Joint {
    pub const ALL: [Joint; JOINT_COUNT] = [
        Joint::Nose,
        Joint::LeftEye,
        Joint::RightEye,
        Joint::LeftEar,
        Joint::RightEar,
        Joint::LeftShoulder,
        Joint::RightShoulder,
        Joint::LeftElbow,
        Joint::RightElbow,
        Joint::LeftWrist,
        Joint::RightWrist,
        Joint::LeftHip,
        Joint::RightHip,
        Joint::LeftKnee,
        Joint::RightKnee,
        Joint::LeftAnkle,
        Joint::RightAnkle,
    ];

    /// Joints the risk heuristic reads
    pub const LOWER_BODY: [Joint; 6] = [
        Joint::LeftHip,
        Joint::RightHip,
        Joint::LeftKnee,
        Joint::RightKnee,
        Joint::LeftAnkle,
        Joint::RightAnkle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Joint::Nose => "nose",
            Joint::LeftEye => "left_eye",
            Joint::RightEye => "right_eye",
            Joint::LeftEar => "left_ear",
            Joint::RightEar => "right_ear",
            Joint::LeftShoulder => "left_shoulder",
            Joint::RightShoulder => "right_shoulder",
            Joint::LeftElbow => "left_elbow",
            Joint::RightElbow => "right_elbow",
            Joint::LeftWrist => "left_wrist",
            Joint::RightWrist => "right_wrist",
            Joint::LeftHip => "left_hip",
            Joint::RightHip => "right_hip",
            Joint::LeftKnee => "left_knee",
            Joint::RightKnee => "right_knee",
            Joint::LeftAnkle => "left_ankle",
            Joint::RightAnkle => "right_ankle",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn point(&self) -> Point {
        Point {
            x: self.x,
            y: self.y,
        }
    }
}

/// One keypoint per joint of the fixed vocabulary
#[derive(Debug, Clone, PartialEq)]
pub struct KeypointSet {
    points: [Keypoint; JOINT_COUNT],
}

impl KeypointSet {
    pub fn new(points: [Keypoint; JOINT_COUNT]) -> Self {
        Self { points }
    }

    /// Build from model output. Anything but exactly one point per joint is rejected.
    pub fn from_slice(points: &[Keypoint]) -> Option<Self> {
        let points: [Keypoint; JOINT_COUNT] = points.try_into().ok()?;
        Some(Self { points })
    }

    pub fn get(&self, joint: Joint) -> &Keypoint {
        &self.points[joint.index()]
    }

    pub fn points(&self) -> &[Keypoint; JOINT_COUNT] {
        &self.points
    }

    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        let mut points = self.points;
        for p in points.iter_mut() {
            p.x += dx;
            p.y += dy;
        }
        Self { points }
    }

    pub fn mean_confidence(&self, joints: &[Joint]) -> f32 {
        if joints.is_empty() {
            return 0.0;
        }
        let sum: f32 = joints.iter().map(|j| self.get(*j).confidence).sum();
        sum / joints.len() as f32
    }
}

impl Serialize for KeypointSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(JOINT_COUNT))?;
        for joint in Joint::ALL {
            map.serialize_entry(joint.name(), self.get(joint))?;
        }
        map.end()
    }
}

/// What the pose adapter produced for one player crop
#[derive(Debug, Clone)]
pub enum PoseOutcome {
    Pose(KeypointSet),
    LowConfidence,
    NoPose,
}

/// Risk percentage in [0, 100] and the derived flag
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskScore {
    pub pct: f32,
    pub flagged: bool,
}

impl RiskScore {
    pub fn new(pct: f32, flag_threshold_pct: f32) -> Self {
        let pct = if pct.is_nan() { 0.0 } else { pct.clamp(0.0, 100.0) };
        Self {
            pct,
            flagged: pct >= flag_threshold_pct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Scored,
    LowConfidence,
    NoPose,
}

/// Per-player result for one frame
#[derive(Debug, Clone, Serialize)]
pub struct PlayerResult {
    pub track_id: u32,
    pub detection: Detection,
    pub status: PlayerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<KeypointSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskScore>,
}

/// Everything recorded about one processed frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub index: usize,
    pub timestamp_secs: f64,
    pub players: Vec<PlayerResult>,
}

/// Player names, one per line, mapped onto 1-based track ids
#[derive(Debug, Clone, Default)]
pub struct Roster {
    names: Vec<String>,
}

impl Roster {
    pub fn parse(text: &str) -> Self {
        let names = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_for(&self, id: u32) -> String {
        (id as usize)
            .checked_sub(1)
            .and_then(|i| self.names.get(i))
            .cloned()
            .unwrap_or_else(|| format!("P{}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roster_names() {
        let roster = Roster::parse("Ahmed\n\n  Fahad \nSaad\n");
        assert_eq!(roster.names().len(), 3);
        assert_eq!(roster.name_for(1), "Ahmed");
        assert_eq!(roster.name_for(2), "Fahad");
        assert_eq!(roster.name_for(4), "P4");
        assert_eq!(roster.name_for(0), "P0");
    }

    #[test]
    fn test_risk_score_is_clamped() {
        assert_eq!(RiskScore::new(150.0, 70.0).pct, 100.0);
        assert_eq!(RiskScore::new(-5.0, 70.0).pct, 0.0);
        assert_eq!(RiskScore::new(f32::NAN, 70.0).pct, 0.0);
        assert!(RiskScore::new(70.0, 70.0).flagged);
        assert!(!RiskScore::new(69.9, 70.0).flagged);
    }

    #[test]
    fn test_keypoint_set_requires_full_vocabulary() {
        let short = vec![Keypoint::default(); 16];
        assert!(KeypointSet::from_slice(&short).is_none());
        let full = vec![Keypoint::default(); JOINT_COUNT];
        assert!(KeypointSet::from_slice(&full).is_some());
    }

    #[test]
    fn test_joint_order_matches_coco() {
        assert_eq!(Joint::LeftKnee.index(), 13);
        assert_eq!(Joint::RightAnkle.index(), 16);
        for (i, joint) in Joint::ALL.iter().enumerate() {
            assert_eq!(joint.index(), i);
        }
    }

    #[test]
    fn test_bbox_clamp() {
        let b = BBox::from_xyxy(-10.0, 5.0, 50.0, 200.0);
        let c = b.clamp_to(100.0, 100.0).unwrap();
        assert_eq!(c, BBox::from_xyxy(0.0, 5.0, 50.0, 100.0));
        assert!(BBox::from_xyxy(120.0, 0.0, 150.0, 10.0)
            .clamp_to(100.0, 100.0)
            .is_none());
    }

    #[test]
    fn test_progress_json_reports_error() {
        let state = ProcessingState::new("run".to_string(), 10);
        state.update_stage("detect", 3, 12.0);
        state.mark_failed("encoding failed: missing".to_string());
        let json = state.to_progress_json();
        assert_eq!(json["error"], "encoding failed: missing");
        assert_eq!(json["is_active"], false);
        assert_eq!(json["stages"]["detect"]["current"], 3);
    }
}
