use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use crate::models::config::{EncoderCandidate, StreamProfile};
use crate::models::error::CaptureError;
use crate::models::frame::ColorFrame;

/// Raw-frame sink piping decoded BGR24 frames into an encoder subprocess.
///
/// The subprocess writes directly to the given output path (always a
/// temporary file; the caller publishes it by rename after validation).
/// Standard error is captured only for diagnostics on failure, and the
/// input pipe is always closed before waiting on the process.
pub struct FrameSink {
    child: Child,
    stdin: Option<ChildStdin>,
    encoder: String,
    frames_written: u64,
}

impl FrameSink {
    pub fn spawn(
        ffmpeg: &Path,
        candidate: &EncoderCandidate,
        profile: StreamProfile,
        output: &Path,
    ) -> Result<Self, CaptureError> {
        let mut command = Command::new(ffmpeg);
        command
            .arg("-y")
            .args(["-f", "rawvideo", "-vcodec", "rawvideo"])
            .args(["-s", &format!("{}x{}", profile.width, profile.height)])
            .args(["-pix_fmt", "bgr24"])
            .args(["-r", &profile.fps.to_string()])
            .args(["-i", "pipe:0"])
            .args(&candidate.args)
            .args(["-movflags", "+faststart", "-f", "mp4"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            CaptureError::EncodingFailed(format!(
                "failed to spawn encoder {}: {}",
                candidate.name, e
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::EncodingFailed("encoder stdin unavailable".into()))?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            encoder: candidate.name.clone(),
            frames_written: 0,
        })
    }

    /// Pipe one decoded frame to the encoder's standard input.
    pub fn write_frame(&mut self, frame: &ColorFrame) -> Result<(), CaptureError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(CaptureError::EncodingFailed("encoder input closed".into()));
        };
        stdin.write_all(&frame.data).map_err(|e| {
            CaptureError::EncodingFailed(format!("failed to pipe frame to {}: {}", self.encoder, e))
        })?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Close the input pipe and wait for the encoder. On a non-zero exit
    /// the tail of its standard error is returned as the failure message.
    pub fn finish(mut self) -> Result<(), CaptureError> {
        drop(self.stdin.take());
        let encoder = self.encoder;
        let output = self.child.wait_with_output().map_err(|e| {
            CaptureError::EncodingFailed(format!("failed to wait for {}: {}", encoder, e))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(6).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(CaptureError::EncodingFailed(format!(
                "{} exited with {}: {}",
                encoder,
                output.status,
                tail.join(" | ")
            )));
        }
        Ok(())
    }

    /// Tear down a cancelled encode: kill the subprocess and reap it.
    pub fn abort(mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Frame counter for finished playback files.
///
/// Injectable so deployments (and tests) can swap the probing strategy;
/// the default shells out to `ffprobe`.
pub trait OutputProbe: Send + Sync {
    fn count_frames(&self, path: &Path) -> Result<u64, CaptureError>;
}

/// Counts packets of the first video stream via `ffprobe`.
pub struct FfprobeProbe {
    ffprobe: PathBuf,
}

impl FfprobeProbe {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }
}

impl OutputProbe for FfprobeProbe {
    fn count_frames(&self, path: &Path) -> Result<u64, CaptureError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-count_packets",
                "-show_entries",
                "stream=nb_read_packets",
                "-of",
                "csv=p=0",
            ])
            .arg(path)
            .output()
            .map_err(|e| CaptureError::EncodingFailed(format!("failed to run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(CaptureError::EncodingFailed(format!(
                "ffprobe failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.trim().parse::<u64>().map_err(|_| {
            CaptureError::EncodingFailed(format!("unexpected ffprobe output: {}", stdout.trim()))
        })
    }
}
