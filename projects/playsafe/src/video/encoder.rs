// H.264 output through the ffmpeg binary
//
// Raw BGR frames are piped into ffmpeg's stdin. ffmpeg writes next to the
// final path with a `.partial` suffix; the file is renamed into place only
// once ffmpeg exits cleanly, so a failed run never leaves a playable file.
// stderr is drained on its own thread: a full pipe would stall ffmpeg and,
// with it, every write to stdin.

use super::FrameSink;
use crate::config::EncoderConfig;
use crate::error::RunFailure;
use anyhow::Result;
use opencv::core::{Mat, CV_8UC3};
use opencv::prelude::*;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

pub struct FfmpegEncoder {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    /// Yields the last non-empty stderr line once ffmpeg closes the pipe
    stderr: Option<JoinHandle<Option<String>>>,
    output: PathBuf,
    partial: PathBuf,
    width: u32,
    height: u32,
    frames_written: usize,
    finished: bool,
}

fn drain_stderr(stderr: ChildStderr) -> std::io::Result<JoinHandle<Option<String>>> {
    std::thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || {
            let mut last = None;
            for line in BufReader::new(stderr).split(b'\n') {
                let Ok(line) = line else {
                    break;
                };
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if !line.is_empty() {
                    tracing::debug!("ffmpeg: {}", line);
                    last = Some(line.to_string());
                }
            }
            last
        })
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

/// Argument list for one encode. `audio_source` adds the source's first
/// audio track, if it has one.
pub fn build_args(
    config: &EncoderConfig,
    width: u32,
    height: u32,
    fps: f64,
    audio_source: Option<&Path>,
    target: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-y",
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "bgr24",
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}x{}", width, height));
    args.push("-r".to_string());
    args.push(format!("{}", fps));
    args.push("-i".to_string());
    args.push("-".to_string());

    if let Some(src) = audio_source.filter(|_| config.carry_audio) {
        args.push("-i".to_string());
        args.push(src.to_string_lossy().into_owned());
        for a in ["-map", "0:v:0", "-map", "1:a:0?", "-c:a", "aac"] {
            args.push(a.to_string());
        }
    }

    for a in ["-c:v", "libx264", "-preset"] {
        args.push(a.to_string());
    }
    args.push(config.preset.clone());
    args.push("-crf".to_string());
    args.push(config.crf.to_string());
    for a in ["-pix_fmt", "yuv420p", "-movflags", "+faststart", "-f", "mp4"] {
        args.push(a.to_string());
    }
    args.push(target.to_string_lossy().into_owned());
    args
}

impl FfmpegEncoder {
    pub fn start(
        config: &EncoderConfig,
        output: &Path,
        width: u32,
        height: u32,
        fps: f64,
        audio_source: Option<&Path>,
    ) -> Result<Self> {
        let partial = partial_path(output);
        let args = build_args(config, width, height, fps, audio_source, &partial);

        let mut child = Command::new(&config.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RunFailure::Encoding(format!("cannot start {}: {}", config.ffmpeg_bin, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunFailure::Encoding("ffmpeg stdin unavailable".to_string()))?;
        let stderr = match child.stderr.take().map(drain_stderr) {
            Some(Ok(handle)) => handle,
            Some(Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunFailure::Encoding(format!("cannot read ffmpeg output: {}", e)).into());
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunFailure::Encoding("ffmpeg stderr unavailable".to_string()).into());
            }
        };

        tracing::info!(
            "Encoder started: {}x{} @ {:.2} fps -> {}",
            width,
            height,
            fps,
            output.display()
        );

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            stderr: Some(stderr),
            output: output.to_path_buf(),
            partial,
            width,
            height,
            frames_written: 0,
            finished: false,
        })
    }

    /// Last stderr line, once ffmpeg has exited.
    fn last_stderr_line(&mut self) -> Option<String> {
        self.stderr.take().and_then(|handle| handle.join().ok().flatten())
    }

    /// Kill ffmpeg, drop whatever it wrote and build the error to return.
    fn abort(&mut self, reason: String) -> anyhow::Error {
        self.stdin = None;
        let mut detail = reason;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            if let Some(line) = self.last_stderr_line() {
                detail = format!("{} ({})", detail, line);
            }
        }
        let _ = std::fs::remove_file(&self.partial);
        self.finished = true;
        tracing::error!("Encoder failed: {}", detail);
        RunFailure::Encoding(detail).into()
    }
}

impl FrameSink for FfmpegEncoder {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        if frame.cols() as u32 != self.width
            || frame.rows() as u32 != self.height
            || frame.typ() != CV_8UC3
        {
            return Err(self.abort(format!(
                "frame {} is {}x{}, expected {}x{} BGR",
                self.frames_written,
                frame.cols(),
                frame.rows(),
                self.width,
                self.height
            )));
        }

        let owned;
        let frame = if frame.is_continuous() {
            frame
        } else {
            owned = frame.try_clone()?;
            &owned
        };
        let bytes = frame.data_bytes()?;

        let result = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(bytes),
            None => {
                return Err(RunFailure::Encoding("encoder already closed".to_string()).into())
            }
        };
        if let Err(e) = result {
            return Err(self.abort(format!("writing frame {}: {}", self.frames_written, e)));
        }

        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<usize> {
        if self.finished {
            return Err(RunFailure::Encoding("encoder already closed".to_string()).into());
        }

        // Closing stdin is ffmpeg's end-of-input
        self.stdin = None;
        let Some(mut child) = self.child.take() else {
            return Err(RunFailure::Encoding("encoder not running".to_string()).into());
        };

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => return Err(self.abort(format!("waiting for ffmpeg: {}", e))),
        };
        let last = self.last_stderr_line();
        if !status.success() {
            let last = last.unwrap_or_else(|| "no output".to_string());
            return Err(self.abort(format!("ffmpeg exited with {}: {}", status, last)));
        }

        if let Err(e) = std::fs::rename(&self.partial, &self.output) {
            return Err(self.abort(format!("moving output into place: {}", e)));
        }
        self.finished = true;

        tracing::info!(
            "Encoder finished: {} frames -> {}",
            self.frames_written,
            self.output.display()
        );
        Ok(self.frames_written)
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = std::fs::remove_file(&self.partial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::user_message;
    use opencv::core::Scalar;

    fn frame(w: i32, h: i32) -> Mat {
        Mat::new_rows_cols_with_default(h, w, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    fn config_with_bin(bin: &str) -> EncoderConfig {
        EncoderConfig {
            ffmpeg_bin: bin.to_string(),
            ..EncoderConfig::default()
        }
    }

    #[test]
    fn test_args_match_browser_profile() {
        let args = build_args(
            &EncoderConfig::default(),
            640,
            360,
            25.0,
            None,
            Path::new("/tmp/out.mp4.partial"),
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("-y -loglevel error -f rawvideo -pix_fmt bgr24 -s 640x360 -r 25 -i -"));
        assert!(joined.contains("-c:v libx264 -preset veryfast -crf 23 -pix_fmt yuv420p -movflags +faststart"));
        assert!(!joined.contains("aac"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4.partial"));

        let with_audio = build_args(
            &EncoderConfig::default(),
            640,
            360,
            25.0,
            Some(Path::new("/tmp/in.mp4")),
            Path::new("/tmp/out.mp4.partial"),
        )
        .join(" ");
        assert!(with_audio.contains("-i /tmp/in.mp4 -map 0:v:0 -map 1:a:0? -c:a aac"));
    }

    #[test]
    fn test_missing_binary_is_encoding_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("annotated.mp4");
        let err = match FfmpegEncoder::start(
            &config_with_bin("/nonexistent/ffmpeg"),
            &output,
            64,
            48,
            30.0,
            None,
        ) {
            Ok(_) => panic!("expected failure"),
            Err(e) => e,
        };
        assert!(user_message(&err).starts_with("encoding failed"));
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_encoder_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(dir.path(), "echo 'Unknown encoder libx264' >&2\nexit 1");
        let output = dir.path().join("annotated.mp4");

        let mut enc =
            FfmpegEncoder::start(&config_with_bin(&bin), &output, 64, 48, 30.0, None).unwrap();
        let result = enc.write_frame(&frame(64, 48)).and_then(|_| enc.finish());
        let err = result.unwrap_err();
        let message = user_message(&err);
        assert!(message.starts_with("encoding failed"));
        assert!(message.contains("Unknown encoder libx264"));
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_chatty_encoder_does_not_stall_writes() {
        let dir = tempfile::tempdir().unwrap();
        // ~200 KiB of stderr before reading any input, well past a pipe buffer
        let bin = fake_ffmpeg(
            dir.path(),
            "yes 'Error while decoding audio packet' | head -c 200000 >&2\nfor last; do :; done\ncat > \"$last\"",
        );
        let output = dir.path().join("annotated.mp4");

        let mut enc =
            FfmpegEncoder::start(&config_with_bin(&bin), &output, 320, 240, 30.0, None).unwrap();
        for _ in 0..3 {
            enc.write_frame(&frame(320, 240)).unwrap();
        }
        assert_eq!(enc.finish().unwrap(), 3);
        assert_eq!(
            std::fs::metadata(&output).unwrap().len(),
            3 * 320 * 240 * 3
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_encode_moves_partial_into_place() {
        let dir = tempfile::tempdir().unwrap();
        // Copy stdin into the last argument, like a very lazy ffmpeg
        let bin = fake_ffmpeg(dir.path(), "for last; do :; done\ncat > \"$last\"");
        let output = dir.path().join("annotated.mp4");

        let mut enc =
            FfmpegEncoder::start(&config_with_bin(&bin), &output, 8, 4, 30.0, None).unwrap();
        for _ in 0..5 {
            enc.write_frame(&frame(8, 4)).unwrap();
        }
        assert_eq!(enc.finish().unwrap(), 5);

        assert!(!partial_path(&output).exists());
        let written = std::fs::metadata(&output).unwrap().len();
        assert_eq!(written, 5 * 8 * 4 * 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_wrong_frame_size_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(dir.path(), "for last; do :; done\ncat > \"$last\"");
        let output = dir.path().join("annotated.mp4");

        let mut enc =
            FfmpegEncoder::start(&config_with_bin(&bin), &output, 8, 4, 30.0, None).unwrap();
        let err = enc.write_frame(&frame(16, 4)).unwrap_err();
        assert!(user_message(&err).starts_with("encoding failed"));
        drop(enc);
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dropped_encoder_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(dir.path(), "for last; do :; done\ncat > \"$last\"");
        let output = dir.path().join("annotated.mp4");
        {
            let mut enc =
                FfmpegEncoder::start(&config_with_bin(&bin), &output, 8, 4, 30.0, None).unwrap();
            enc.write_frame(&frame(8, 4)).unwrap();
        }
        assert!(!output.exists());
        assert!(!partial_path(&output).exists());
    }
}
