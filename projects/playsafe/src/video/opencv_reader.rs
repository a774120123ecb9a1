use super::{sanitize_fps, FrameSource};
use crate::error::RunFailure;
use crate::pipeline::types::Frame;
use anyhow::{Context, Result};
use opencv::{
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH,
    },
};

pub struct OpencvReader {
    capture: VideoCapture,
    fps: f64,
    width: u32,
    height: u32,
    total_frames: usize,
    next_index: usize,
}

// SAFETY: the capture is owned by this reader and only driven from the one
// thread running the pipeline.
unsafe impl Send for OpencvReader {}

impl OpencvReader {
    pub fn new(path: &str) -> Result<Self> {
        let capture = VideoCapture::from_file(path, CAP_ANY)
            .map_err(|e| RunFailure::UnreadableInput(format!("{}: {}", path, e)))?;
        if !capture.is_opened()? {
            return Err(RunFailure::UnreadableInput(format!("cannot decode {}", path)).into());
        }

        let fps = sanitize_fps(capture.get(CAP_PROP_FPS)?);
        let width = capture.get(CAP_PROP_FRAME_WIDTH)? as u32;
        let height = capture.get(CAP_PROP_FRAME_HEIGHT)? as u32;
        let raw_count = capture.get(CAP_PROP_FRAME_COUNT)?;
        let total_frames = if raw_count.is_finite() && raw_count > 0.0 {
            raw_count as usize
        } else {
            0
        };

        tracing::info!(
            "OpencvReader: opened {}, {}x{}, fps={:.2}, stream_frames={}",
            path,
            width,
            height,
            fps,
            total_frames
        );

        Ok(Self {
            capture,
            fps,
            width,
            height,
            total_frames,
            next_index: 0,
        })
    }
}

impl FrameSource for OpencvReader {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn frame_count_hint(&self) -> usize {
        self.total_frames
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut image = Mat::default();
        let ok = self
            .capture
            .read(&mut image)
            .with_context(|| format!("Failed to decode frame {}", self.next_index))?;
        if !ok || image.empty() {
            return Ok(None);
        }

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame {
            index,
            timestamp_secs: index as f64 / self.fps,
            image,
        }))
    }
}
