use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::models::config::StreamProfile;
use crate::models::error::CaptureError;
use crate::models::frame::FrameSet;

/// A camera enumerated by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub model: String,
    /// USB link descriptor as reported by the device (e.g. "3.2").
    pub usb_descriptor: String,
}

/// Where a pipeline's frames come from.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSource {
    /// A connected device, addressed by serial number when known.
    Live { serial: Option<String> },

    /// Replay of a previously recorded raw file.
    Playback {
        path: PathBuf,
        /// Pace frames at the recorded rate; `false` replays as fast as
        /// the file can be read (frame counting, conversion).
        real_time: bool,
        /// Restart from the beginning at end of file (live preview from
        /// a recorded file).
        looped: bool,
    },
}

/// A fully specified pipeline request: source, profile constraint, and
/// optional on-device recording target.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub source: StreamSource,

    /// Requested resolution and frame rate. `None` lets the backend use
    /// the stream's native profile (playback replay must not constrain
    /// the recorded format).
    pub profile: Option<StreamProfile>,

    /// Enable on-device recording to this path as part of the session.
    pub record_to: Option<PathBuf>,
}

/// Outcome of one bounded-timeout pipeline poll.
#[derive(Debug)]
pub enum PollResult {
    Frame(FrameSet),
    TimedOut,
    /// Playback reached end of file. Live pipelines never report this.
    EndOfStream,
}

/// Narrow capability surface over the vendor camera SDK.
///
/// Implemented by device backends (live SDK binding, synthetic simulator);
/// the orchestration layer never touches SDK types or exception shapes
/// directly.
pub trait DeviceBackend: Send + Sync + 'static {
    type Pipeline: DevicePipeline;

    /// Enumerate connected devices. Called only on explicit detection
    /// refresh, never implicitly.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    /// Validate that `request` can be satisfied by the device *without*
    /// starting it. Used by the slow half of the two-phase recording
    /// start.
    fn resolve(&self, request: &StreamRequest) -> Result<(), CaptureError>;

    /// Start a capture session for `request`.
    fn open(&self, request: &StreamRequest) -> Result<Self::Pipeline, CaptureError>;
}

/// A started capture session.
pub trait DevicePipeline: Send + 'static {
    /// Wait up to `timeout` for the next synchronized frameset.
    fn poll_frames(&mut self, timeout: Duration) -> Result<PollResult, CaptureError>;

    /// The profile actually negotiated by the device.
    fn profile(&self) -> StreamProfile;

    /// Request a deeper on-device frame queue, clamped to the
    /// device-reported maximum. Returns the applied depth.
    fn set_queue_depth(&mut self, frames: u32) -> Result<u32, CaptureError>;

    /// Pause the on-device recorder while the stream keeps running.
    fn pause_recorder(&mut self) -> Result<(), CaptureError>;

    /// Resume a paused on-device recorder.
    fn resume_recorder(&mut self) -> Result<(), CaptureError>;

    /// Stop the session and release the device. Also finalizes any
    /// on-device recording.
    fn stop(&mut self);
}
