use super::{sanitize_fps, FrameSource};
use crate::error::RunFailure;
use crate::pipeline::types::Frame;
use anyhow::{anyhow, Context, Result};
use opencv::{core, prelude::*};
use std::path::Path;

use ffmpeg_next::ffi;

/// Video reader backed by libav through ffmpeg-next, CPU decoding only.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    width: u32,
    height: u32,
    fps: f64,
    total_frames: usize,
    frames_decoded: usize,
    packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

// SAFETY: FfmpegReader is only ever used from the single pipeline thread.
// The raw pointers inside ffmpeg-next types are not shared across threads.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &str) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        let source = Path::new(path);
        let unreadable = |what: &str| RunFailure::UnreadableInput(format!("{}: {}", path, what));

        let input_ctx =
            ffmpeg_next::format::input(&source).map_err(|e| unreadable(&e.to_string()))?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| unreadable("no video stream"))?;
        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let fps = if rational_fps.denominator() > 0 {
            sanitize_fps(rational_fps.numerator() as f64 / rational_fps.denominator() as f64)
        } else {
            sanitize_fps(0.0)
        };

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64;
        let total_frames = if stream_frames == 0 && duration_secs > 0.0 {
            (duration_secs * fps).round() as usize
        } else {
            stream_frames
        };

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .map_err(|e| unreadable(&e.to_string()))?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| unreadable(&e.to_string()))?;

        let width = decoder.width();
        let height = decoder.height();

        tracing::info!(
            "FfmpegReader: opened {}, {}x{}, duration={:.2}s, fps={:.2}, estimated_total={}",
            path,
            width,
            height,
            duration_secs,
            fps,
            total_frames
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            width,
            height,
            fps,
            total_frames,
            frames_decoded: 0,
            packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pull the next decoded frame. Returns false at the end of the stream.
    fn decode_loop(&mut self, target: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            // Feed packets until a video packet is found or the input ends
            let mut found_packet = false;
            while self.packet.read(&mut self.input_ctx).is_ok() {
                if self.packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn to_bgr(
        &mut self,
        frame: &ffmpeg_next::util::frame::Video,
    ) -> Result<ffmpeg_next::util::frame::Video> {
        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                frame.format(),
                self.width,
                self.height,
                ffmpeg_next::format::Pixel::BGR24,
                self.width,
                self.height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }

        let mut bgr = ffmpeg_next::util::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(frame, &mut bgr).context("Scaler failed")?;
        }
        Ok(bgr)
    }
}

/// Deep copy of a BGR24 ffmpeg frame into an owned Mat, honouring the row stride.
fn bgr_frame_to_mat(frame: &ffmpeg_next::util::frame::Video) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;

    let mut mat = core::Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC3,
        core::Scalar::all(0.0),
    )?;

    for y in 0..height as usize {
        let src_offset = y * stride;
        let src_row = &data[src_offset..src_offset + row_bytes];
        let dst_ptr = mat.ptr_mut(y as i32)?;
        // SAFETY: each Mat row holds exactly `row_bytes` bytes
        unsafe {
            std::ptr::copy_nonoverlapping(src_row.as_ptr(), dst_ptr, row_bytes);
        }
    }

    Ok(mat)
}

impl FrameSource for FfmpegReader {
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
        let mut raw = ffmpeg_next::util::frame::Video::empty();
        if !self.decode_loop(&mut raw)? {
            return Ok(None);
        }
        let bgr = self.to_bgr(&raw)?;
        let image = bgr_frame_to_mat(&bgr)?;

        let index = self.frames_decoded;
        self.frames_decoded += 1;
        Ok(Some(Frame {
            index,
            timestamp_secs: index as f64 / self.fps,
            image,
        }))
    }
}
