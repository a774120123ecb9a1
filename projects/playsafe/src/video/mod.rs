pub mod encoder;
pub mod ffmpeg_reader;
pub mod opencv_reader;

use crate::error::RunFailure;
use crate::pipeline::types::Frame;
use anyhow::Result;
use opencv::core::Mat;
use std::path::Path;

/// Default used when the container carries no usable frame rate
pub const FALLBACK_FPS: f64 = 30.0;

/// Ordered stream of decoded BGR frames.
///
/// `Ok(None)` is the end of the stream, an `Err` a stream that broke while
/// decoding.
pub trait FrameSource: Send {
    fn fps(&self) -> f64;
    fn resolution(&self) -> (u32, u32);
    /// Frame count from container metadata; may be 0 or wrong.
    fn frame_count_hint(&self) -> usize;
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Consumer of annotated frames, in order.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &Mat) -> Result<()>;
    /// Flush and close the output. Returns the number of frames written.
    fn finish(&mut self) -> Result<usize>;
}

pub fn open_source(backend: &str, path: &Path) -> Result<Box<dyn FrameSource>> {
    if !path.is_file() {
        return Err(RunFailure::UnreadableInput(format!("{} does not exist", path.display())).into());
    }
    let path_str = path.to_string_lossy();

    let source: Box<dyn FrameSource> = match backend {
        "opencv" => Box::new(opencv_reader::OpencvReader::new(&path_str)?),
        "ffmpeg" => Box::new(ffmpeg_reader::FfmpegReader::new(&path_str)?),
        _ => return Err(anyhow::anyhow!("Unsupported video backend: {}", backend)),
    };
    Ok(source)
}

pub(crate) fn sanitize_fps(fps: f64) -> f64 {
    if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        tracing::warn!("No usable FPS in container metadata, falling back to {}", FALLBACK_FPS);
        FALLBACK_FPS
    }
}
