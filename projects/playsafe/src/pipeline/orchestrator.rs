// Pipeline orchestrator: runs one video end to end
//
// Strictly sequential per frame: decode, detect, pose + risk per player,
// overlay, encode. Progress goes into a shared ProcessingState that the web
// handlers read, and web runs are kept in a process-wide registry.

pub use crate::pipeline::types::ProcessingState;
use crate::config::PipelineConfig;
use crate::error::{user_message, RunFailure};
use crate::pipeline::crop::{crop_pixels, pad_bbox};
use crate::pipeline::detection::{filter_players, PlayerDetector, YoloDetector};
use crate::pipeline::finalize::{summarize_players, write_run_artifacts, write_stats};
use crate::pipeline::overlay::OverlayRenderer;
use crate::pipeline::pose::{assess_pose, PoseEstimator, YoloPoseEstimator};
use crate::pipeline::risk::RiskHeuristic;
use crate::pipeline::tracking::{PlayerTracker, PoseHistory, PoseSample};
use crate::pipeline::types::{FrameRecord, PlayerResult, PlayerStatus, PoseOutcome, Roster};
use crate::run_artifacts::PlayerStats;
use crate::video::encoder::FfmpegEncoder;
use crate::video::{open_source, FrameSink, FrameSource};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// How long a finished run stays registered, so late progress and status
/// reads still see its outcome. After that the run is read back from disk.
const REGISTRY_GRACE: Duration = Duration::from_secs(300);

// Global registry of web runs
lazy_static::lazy_static! {
    static ref PROCESSING_REGISTRY: RwLock<HashMap<String, Arc<ProcessingState>>> =
        RwLock::new(HashMap::new());
}

pub fn get_processing_state(run_id: &str) -> Option<Arc<ProcessingState>> {
    PROCESSING_REGISTRY
        .read()
        .ok()
        .and_then(|registry| registry.get(run_id).cloned())
}

fn register_run(run_id: &str, state: Arc<ProcessingState>) {
    tracing::info!("Registering run {}", run_id);
    if let Ok(mut registry) = PROCESSING_REGISTRY.write() {
        registry.insert(run_id.to_string(), state);
    }
}

/// Drop a finished run from the registry. A newer run registered under the
/// same id is left alone.
fn release_run(run_id: &str, state: &Arc<ProcessingState>) -> bool {
    if !state.is_finished() {
        return false;
    }
    let Ok(mut registry) = PROCESSING_REGISTRY.write() else {
        return false;
    };
    match registry.get(run_id) {
        Some(current) if Arc::ptr_eq(current, state) => {
            registry.remove(run_id);
            tracing::debug!("Released run {}", run_id);
            true
        }
        _ => false,
    }
}

/// Ask a run to stop after its current frame. The run stays active until
/// the pipeline has recorded the stop as its outcome.
pub fn stop_processing(run_id: &str) -> bool {
    match get_processing_state(run_id) {
        Some(state) if !state.is_finished() => {
            state.request_stop();
            true
        }
        _ => false,
    }
}

/// Everything needed to analyse one video
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub input: PathBuf,
    pub output_video: PathBuf,
    /// Run directory receiving stats.json, detections.json and risk.csv
    pub artifacts_dir: Option<PathBuf>,
    /// Extra copy of stats.json at an arbitrary path
    pub stats_out: Option<PathBuf>,
    pub roster: Roster,
    pub detector_model: String,
    pub pose_model: String,
    pub backend: String,
    pub config: PipelineConfig,
}

pub struct RunSummary {
    pub frames_read: usize,
    pub frames_written: usize,
    pub fps: f64,
    pub resolution: (u32, u32),
    pub records: Vec<FrameRecord>,
}

/// Run the per-frame pipeline until the source is exhausted.
///
/// Detector and pose failures on a frame are logged and absorbed. Reader
/// and sink failures abort the run, as does a stop request.
pub fn run_pipeline(
    source: &mut dyn FrameSource,
    detector: &mut dyn PlayerDetector,
    pose: &mut dyn PoseEstimator,
    config: &PipelineConfig,
    overlay: &OverlayRenderer,
    sink: &mut dyn FrameSink,
    state: &ProcessingState,
) -> Result<RunSummary> {
    let fps = source.fps();
    let (width, height) = source.resolution();
    let heuristic = RiskHeuristic::new(config.risk.clone(), config.pose.min_keypoint_confidence);
    let mut tracker = PlayerTracker::new(config.tracking.clone());
    let no_history = PoseHistory::new(0);
    let mut records = Vec::new();

    loop {
        if state.should_stop() {
            tracing::info!("Run {} stopped after {} frames", state.run_id, records.len());
            return Err(RunFailure::Stopped.into());
        }

        let t = Instant::now();
        let Some(mut frame) = source.next_frame()? else {
            break;
        };
        state.update_stage("decode", frame.index + 1, ms_since(t));

        let t = Instant::now();
        let detections = match detector.detect(&frame.image) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Detection failed on frame {}: {}", frame.index, e);
                Vec::new()
            }
        };
        let players = filter_players(detections, &config.detector, width as f32, height as f32);
        let boxes: Vec<_> = players.iter().map(|d| d.bbox).collect();
        let ids = tracker.associate(frame.index, &boxes);
        state.update_stage("detect", frame.index + 1, ms_since(t));

        let t = Instant::now();
        let mut results = Vec::with_capacity(players.len());
        for (detection, id) in players.into_iter().zip(ids) {
            let padded = pad_bbox(&detection.bbox, config.pose.crop_padding);
            let outcome = match crop_pixels(&frame.image, &padded) {
                Ok(crop) => match assess_pose(pose, &crop, &config.pose) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(
                            "Pose estimation failed on frame {} for player {}: {}",
                            frame.index,
                            id,
                            e
                        );
                        PoseOutcome::NoPose
                    }
                },
                Err(e) => {
                    tracing::warn!("Crop failed on frame {} for player {}: {}", frame.index, id, e);
                    PoseOutcome::NoPose
                }
            };

            let result = match outcome {
                PoseOutcome::Pose(keypoints) => {
                    let sample = PoseSample {
                        frame_index: frame.index,
                        keypoints,
                        body_height: detection.bbox.h,
                    };
                    let history = tracker.history(id).unwrap_or(&no_history);
                    let risk = heuristic.assess(&sample, history, fps);
                    let keypoints = sample.keypoints.clone();
                    if risk.is_some() {
                        tracker.record_pose(id, sample);
                    }
                    PlayerResult {
                        track_id: id,
                        detection,
                        status: if risk.is_some() {
                            PlayerStatus::Scored
                        } else {
                            PlayerStatus::LowConfidence
                        },
                        keypoints: Some(keypoints),
                        risk,
                    }
                }
                PoseOutcome::LowConfidence => PlayerResult {
                    track_id: id,
                    detection,
                    status: PlayerStatus::LowConfidence,
                    keypoints: None,
                    risk: None,
                },
                PoseOutcome::NoPose => PlayerResult {
                    track_id: id,
                    detection,
                    status: PlayerStatus::NoPose,
                    keypoints: None,
                    risk: None,
                },
            };
            results.push(result);
        }
        state.update_stage("pose", frame.index + 1, ms_since(t));

        let t = Instant::now();
        if !results.is_empty() {
            overlay.draw(&mut frame.image, &results)?;
        }
        state.update_stage("overlay", frame.index + 1, ms_since(t));

        let t = Instant::now();
        sink.write_frame(&frame.image)?;
        state.update_stage("encode", frame.index + 1, ms_since(t));

        records.push(FrameRecord {
            index: frame.index,
            timestamp_secs: frame.timestamp_secs,
            players: results,
        });
        state.frames_done.store(records.len(), Ordering::Relaxed);
        if records.len() > state.total_frames.load(Ordering::Relaxed) {
            state.set_total_frames(records.len());
        }
    }

    if records.is_empty() {
        return Err(RunFailure::UnreadableInput("no frames read".to_string()).into());
    }

    let frames_written = sink.finish()?;
    state.set_total_frames(records.len());

    Ok(RunSummary {
        frames_read: records.len(),
        frames_written,
        fps,
        resolution: (width, height),
        records,
    })
}

fn ms_since(t: Instant) -> f64 {
    t.elapsed().as_secs_f64() * 1000.0
}

/// Open the input, load both models, encode, and write the artifacts.
pub fn analyze_video(
    request: &AnalysisRequest,
    state: &ProcessingState,
) -> Result<(RunSummary, BTreeMap<u32, PlayerStats>)> {
    let mut source = open_source(&request.backend, &request.input)?;
    state.set_total_frames(source.frame_count_hint());

    let mut detector = YoloDetector::new(&request.detector_model)?;
    let mut pose = YoloPoseEstimator::new(&request.pose_model)?;

    let config = &request.config;
    let (width, height) = source.resolution();
    let mut encoder = FfmpegEncoder::start(
        &config.encoder,
        &request.output_video,
        width,
        height,
        source.fps(),
        Some(&request.input),
    )?;

    let overlay = OverlayRenderer::new(
        config.overlay.clone(),
        config.pose.min_keypoint_confidence,
        request.roster.clone(),
    );

    let summary = run_pipeline(
        source.as_mut(),
        &mut detector,
        &mut pose,
        config,
        &overlay,
        &mut encoder,
        state,
    )?;

    let stats = summarize_players(&summary.records, &request.roster, &config.risk);
    if let Some(dir) = &request.artifacts_dir {
        write_run_artifacts(dir, &summary.records, &stats, &request.roster)?;
    }
    if let Some(path) = &request.stats_out {
        write_stats(path, &stats)?;
    }

    tracing::info!(
        "Analysed {} frames ({}x{} @ {:.2} fps), {} players",
        summary.frames_read,
        summary.resolution.0,
        summary.resolution.1,
        summary.fps,
        stats.len()
    );
    Ok((summary, stats))
}

/// Blocking body of a web run: analyse and record the outcome on the state.
pub fn execute_run(request: AnalysisRequest, state: Arc<ProcessingState>) {
    let result = analyze_video(&request, &state);
    record_outcome(&state, result);
}

fn record_outcome<T>(state: &ProcessingState, result: Result<T>) {
    match result {
        Ok(_) => {
            tracing::info!("Run {} complete", state.run_id);
            state.mark_complete();
        }
        Err(e) => {
            tracing::error!("Run {} failed: {:#}", state.run_id, e);
            state.mark_failed(user_message(&e));
        }
    }
}

/// Register a run and start it on the blocking thread pool.
pub fn start_processing(run_id: &str, request: AnalysisRequest) -> Result<Arc<ProcessingState>> {
    if let Some(state) = get_processing_state(run_id) {
        if state.is_active.load(Ordering::Relaxed) {
            anyhow::bail!("Run {} is already being processed", run_id);
        }
    }

    let state = Arc::new(ProcessingState::new(run_id.to_string(), 0));
    register_run(run_id, state.clone());

    let worker_state = state.clone();
    let worker = tokio::task::spawn_blocking(move || execute_run(request, worker_state));

    let run_id = run_id.to_string();
    let finished_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.await {
            tracing::error!("Run {} worker panicked: {}", run_id, e);
            finished_state.mark_failed(format!("processing failed: {}", e));
        }
        tokio::time::sleep(REGISTRY_GRACE).await;
        release_run(&run_id, &finished_state);
    });

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::overlay::frames_identical;
    use crate::pipeline::risk::tests::standing_pose;
    use crate::pipeline::types::{BBox, Detection, Frame, KeypointSet};
    use opencv::core::{Mat, Scalar, CV_8UC3};
    use opencv::prelude::*;

    struct SyntheticSource {
        frames: usize,
        next: usize,
    }

    impl FrameSource for SyntheticSource {
        fn fps(&self) -> f64 {
            30.0
        }
        fn resolution(&self) -> (u32, u32) {
            (320, 240)
        }
        fn frame_count_hint(&self) -> usize {
            self.frames
        }
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.next >= self.frames {
                return Ok(None);
            }
            let index = self.next;
            self.next += 1;
            Ok(Some(Frame {
                index,
                timestamp_secs: index as f64 / 30.0,
                image: Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0))?,
            }))
        }
    }

    /// Same box every frame, or nothing
    struct FixedDetector(Option<BBox>);

    impl PlayerDetector for FixedDetector {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<Detection>> {
            Ok(self
                .0
                .iter()
                .map(|bbox| Detection {
                    bbox: *bbox,
                    confidence: 0.9,
                    class_id: 0,
                    class_name: Some("person".to_string()),
                })
                .collect())
        }
    }

    struct FailingDetector;

    impl PlayerDetector for FailingDetector {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<Detection>> {
            anyhow::bail!("inference exploded")
        }
    }

    /// Standing pose with the given confidence, in crop coordinates
    struct StandingPose(f32);

    impl PoseEstimator for StandingPose {
        fn estimate(&mut self, _crop: &Mat) -> Result<Option<KeypointSet>> {
            Ok(Some(standing_pose(-60.0, 0.0, self.0)))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        frames: Vec<Mat>,
        finished: bool,
    }

    impl FrameSink for CollectingSink {
        fn write_frame(&mut self, frame: &Mat) -> Result<()> {
            self.frames.push(frame.try_clone()?);
            Ok(())
        }
        fn finish(&mut self) -> Result<usize> {
            self.finished = true;
            Ok(self.frames.len())
        }
    }

    fn overlay() -> OverlayRenderer {
        let config = PipelineConfig::default();
        OverlayRenderer::new(config.overlay, config.pose.min_keypoint_confidence, Roster::default())
    }

    fn run(
        frames: usize,
        detector: &mut dyn PlayerDetector,
        pose_confidence: f32,
        sink: &mut CollectingSink,
    ) -> Result<RunSummary> {
        let mut source = SyntheticSource { frames, next: 0 };
        let state = ProcessingState::new("test".to_string(), frames);
        run_pipeline(
            &mut source,
            detector,
            &mut StandingPose(pose_confidence),
            &PipelineConfig::default(),
            &overlay(),
            sink,
            &state,
        )
    }

    #[test]
    fn test_standing_player_is_tracked_and_not_flagged() {
        let mut detector = FixedDetector(Some(BBox::from_xyxy(100.0, 20.0, 140.0, 220.0)));
        let mut sink = CollectingSink::default();
        let summary = run(30, &mut detector, 0.9, &mut sink).unwrap();

        assert_eq!(summary.frames_read, 30);
        assert_eq!(summary.frames_written, 30);
        assert!(sink.finished);
        for record in &summary.records {
            assert_eq!(record.players.len(), 1);
            let player = &record.players[0];
            assert_eq!(player.track_id, 1);
            assert_eq!(player.status, PlayerStatus::Scored);
            let risk = player.risk.unwrap();
            assert!(risk.pct < 70.0);
            assert!(!risk.flagged);
        }
    }

    #[test]
    fn test_black_video_passes_through_untouched() {
        let mut sink = CollectingSink::default();
        let summary = run(12, &mut FixedDetector(None), 0.9, &mut sink).unwrap();

        assert_eq!(summary.frames_written, 12);
        assert_eq!(sink.frames.len(), 12);
        let black = Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0)).unwrap();
        for frame in &sink.frames {
            assert!(frames_identical(&black, frame).unwrap());
        }
        assert!(summary.records.iter().all(|r| r.players.is_empty()));
    }

    #[test]
    fn test_low_confidence_pose_gets_no_score() {
        let mut detector = FixedDetector(Some(BBox::from_xyxy(100.0, 20.0, 140.0, 220.0)));
        let mut sink = CollectingSink::default();
        let summary = run(5, &mut detector, 0.2, &mut sink).unwrap();

        for record in &summary.records {
            assert_eq!(record.players[0].status, PlayerStatus::LowConfidence);
            assert!(record.players[0].risk.is_none());
        }
        // Box is still drawn, in grey
        assert!(!frames_identical(
            &Mat::new_rows_cols_with_default(240, 320, CV_8UC3, Scalar::all(0.0)).unwrap(),
            &sink.frames[0]
        )
        .unwrap());
    }

    #[test]
    fn test_detector_errors_are_absorbed() {
        let mut sink = CollectingSink::default();
        let summary = run(4, &mut FailingDetector, 0.9, &mut sink).unwrap();
        assert_eq!(summary.frames_written, 4);
        assert!(summary.records.iter().all(|r| r.players.is_empty()));
    }

    struct FailingPose;

    impl PoseEstimator for FailingPose {
        fn estimate(&mut self, _crop: &Mat) -> Result<Option<KeypointSet>> {
            anyhow::bail!("pose inference exploded")
        }
    }

    #[test]
    fn test_pose_errors_skip_the_player() {
        let mut source = SyntheticSource { frames: 3, next: 0 };
        let state = ProcessingState::new("pose-errors".to_string(), 3);
        let mut sink = CollectingSink::default();
        let summary = run_pipeline(
            &mut source,
            &mut FixedDetector(Some(BBox::from_xyxy(100.0, 20.0, 140.0, 220.0))),
            &mut FailingPose,
            &PipelineConfig::default(),
            &overlay(),
            &mut sink,
            &state,
        )
        .unwrap();

        assert_eq!(summary.frames_written, 3);
        for record in &summary.records {
            assert_eq!(record.players[0].status, PlayerStatus::NoPose);
            assert!(record.players[0].risk.is_none());
        }
    }

    #[test]
    fn test_empty_source_is_unreadable() {
        let mut sink = CollectingSink::default();
        let err = match run(0, &mut FixedDetector(None), 0.9, &mut sink) {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert_eq!(user_message(&err), "could not read input video: no frames read");
        assert!(!sink.finished);
    }

    #[test]
    fn test_stopped_run_reports_error() {
        let mut source = SyntheticSource { frames: 10, next: 0 };
        let state = ProcessingState::new("stopped".to_string(), 10);
        state.request_stop();
        // Still active until the pipeline records the stop
        assert!(!state.is_finished());

        let mut sink = CollectingSink::default();
        let result = run_pipeline(
            &mut source,
            &mut FixedDetector(None),
            &mut StandingPose(0.9),
            &PipelineConfig::default(),
            &overlay(),
            &mut sink,
            &state,
        );
        match &result {
            Ok(_) => panic!("expected failure"),
            Err(e) => assert!(matches!(
                e.downcast_ref::<RunFailure>(),
                Some(RunFailure::Stopped)
            )),
        }

        record_outcome(&state, result);
        assert!(state.is_finished());
        let progress = state.to_progress_json();
        assert_eq!(progress["error"], "processing stopped");
        assert_eq!(progress["is_complete"], false);
        assert_eq!(progress["stop_requested"], true);
    }

    #[test]
    fn test_registry_stop() {
        let state = Arc::new(ProcessingState::new("registry-test".to_string(), 1));
        register_run("registry-test", state.clone());
        assert!(get_processing_state("registry-test").is_some());
        assert!(stop_processing("registry-test"));
        assert!(state.should_stop());
        assert!(!state.is_finished());
        assert!(!stop_processing("no-such-run"));

        state.mark_failed("processing stopped".to_string());
        assert!(!stop_processing("registry-test"));
    }

    #[test]
    fn test_release_finished_runs() {
        let state = Arc::new(ProcessingState::new("release-test".to_string(), 1));
        register_run("release-test", state.clone());
        assert!(!release_run("release-test", &state));
        assert!(get_processing_state("release-test").is_some());

        state.mark_complete();
        let rerun = Arc::new(ProcessingState::new("release-test".to_string(), 1));
        register_run("release-test", rerun.clone());
        assert!(!release_run("release-test", &state));
        assert!(get_processing_state("release-test").is_some());

        rerun.mark_complete();
        assert!(release_run("release-test", &rerun));
        assert!(get_processing_state("release-test").is_none());
    }

    #[test]
    fn test_failed_run_records_user_message() {
        let dir = tempfile::tempdir().unwrap();
        let request = AnalysisRequest {
            input: dir.path().join("missing.mp4"),
            output_video: dir.path().join("annotated.mp4"),
            artifacts_dir: Some(dir.path().to_path_buf()),
            stats_out: None,
            roster: Roster::default(),
            detector_model: "models/yolov8n.onnx".to_string(),
            pose_model: "models/yolov8n-pose.onnx".to_string(),
            backend: "opencv".to_string(),
            config: PipelineConfig::default(),
        };
        let state = Arc::new(ProcessingState::new("failing".to_string(), 0));
        execute_run(request, state.clone());

        assert!(state.is_finished());
        assert!(!state.is_complete.load(Ordering::Relaxed));
        let error = state.error.read().unwrap().clone().unwrap();
        assert!(error.starts_with("could not read input video"));
        assert!(!dir.path().join("annotated.mp4").exists());
    }
}
