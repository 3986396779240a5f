use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A candidate stream configuration: resolution plus target frame rate.
///
/// Color is always BGR8 (3 bytes/pixel), depth Z16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl StreamProfile {
    pub const fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps }
    }

    /// Byte size of one BGR8 color frame at this profile.
    pub fn color_frame_bytes(&self) -> usize {
        (self.width * self.height * 3) as usize
    }
}

impl fmt::Display for StreamProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} @ {} fps", self.width, self.height, self.fps)
    }
}

/// Per-camera capture configuration.
///
/// The candidate profile lists are ordered by preference; available USB
/// bandwidth varies with the number of concurrently active cameras, so the
/// negotiation loop tries the higher frame rate first and falls back.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Profile candidates when two or more cameras share the bus.
    pub multi_cam_profiles: Vec<StreamProfile>,

    /// Profile candidates when a single camera has the full bandwidth.
    pub single_cam_profiles: Vec<StreamProfile>,

    /// Bounded timeout for one capture-thread poll.
    pub poll_timeout: Duration,

    /// A cached frame older than this is reported as a read failure,
    /// making a stalled capture thread observable to consumers.
    pub stale_after: Duration,

    /// How long `stop()` waits for the capture thread before proceeding.
    pub join_timeout: Duration,

    /// Target on-device frame-queue depth while recording, clamped to the
    /// device-reported maximum. Absorbs disk-I/O latency spikes.
    pub queue_depth: u32,

    /// Log every Nth consecutive poll timeout instead of each occurrence.
    pub timeout_log_period: u32,

    /// Startup delay for the second camera of a multi-camera rig.
    pub stagger_delay: Duration,

    /// Settle time after stopping all cameras before re-detection.
    pub usb_settle: Duration,
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.multi_cam_profiles.is_empty() || self.single_cam_profiles.is_empty() {
            return Err("at least one candidate stream profile is required".into());
        }
        if self.poll_timeout.is_zero() {
            return Err("poll timeout must be non-zero".into());
        }
        if self.queue_depth == 0 {
            return Err("queue depth must be positive".into());
        }
        if self.timeout_log_period == 0 {
            return Err("timeout log period must be positive".into());
        }
        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            multi_cam_profiles: vec![
                StreamProfile::new(848, 480, 60),
                StreamProfile::new(848, 480, 30),
            ],
            single_cam_profiles: vec![
                StreamProfile::new(848, 480, 60),
                StreamProfile::new(848, 480, 30),
            ],
            poll_timeout: Duration::from_millis(100),
            stale_after: Duration::from_secs(2),
            join_timeout: Duration::from_secs(2),
            queue_depth: 64,
            timeout_log_period: 30,
            stagger_delay: Duration::from_millis(500),
            usb_settle: Duration::from_secs(3),
        }
    }
}

/// Inter-camera start-offset classification thresholds, in milliseconds.
///
/// The defaults are operational policy, not clinical invariants; deployments
/// may tighten or relax them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncThresholds {
    pub in_sync_ms: f64,
    pub degraded_ms: f64,
}

impl Default for SyncThresholds {
    fn default() -> Self {
        Self {
            in_sync_ms: 100.0,
            degraded_ms: 500.0,
        }
    }
}

impl SyncThresholds {
    pub fn classify(&self, offset_ms: f64) -> SyncQuality {
        if offset_ms <= self.in_sync_ms {
            SyncQuality::InSync
        } else if offset_ms <= self.degraded_ms {
            SyncQuality::Degraded
        } else {
            SyncQuality::OutOfSync
        }
    }
}

/// How well the two cameras' recording starts lined up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncQuality {
    InSync,
    Degraded,
    OutOfSync,
}

/// Recording orchestrator configuration.
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Directory receiving raw recordings and metadata sidecars.
    pub recordings_dir: PathBuf,

    /// Delay between a start request and arming the devices, so camera
    /// auto-exposure can settle before frames are committed to disk.
    pub warmup: Duration,

    /// Bounded wait at the synchronized-commit barrier. A camera whose
    /// commit thread misses the rendezvous is dropped from the session.
    pub barrier_wait: Duration,

    /// Number of logical cameras in the rig.
    pub logical_cameras: usize,

    pub sync: SyncThresholds,
}

impl RecordingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.logical_cameras == 0 {
            return Err("at least one logical camera is required".into());
        }
        if self.barrier_wait.is_zero() {
            return Err("barrier wait must be non-zero".into());
        }
        if self.sync.in_sync_ms > self.sync.degraded_ms {
            return Err("in-sync threshold must not exceed degraded threshold".into());
        }
        Ok(())
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("recordings"),
            warmup: Duration::from_secs(3),
            barrier_wait: Duration::from_secs(5),
            logical_cameras: 2,
            sync: SyncThresholds::default(),
        }
    }
}

/// One encoder the conversion pipeline may try, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCandidate {
    pub name: String,
    /// Output-side encoder arguments, inserted between the raw-input
    /// declaration and the output path.
    pub args: Vec<String>,
}

impl EncoderCandidate {
    pub fn new(name: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Default priority list: NVENC hardware encoder first, libx264
    /// software fallback.
    pub fn hardware_first() -> Vec<Self> {
        vec![
            Self::new(
                "h264_nvenc",
                &["-c:v", "h264_nvenc", "-preset", "p4", "-cq", "23", "-pix_fmt", "yuv420p"],
            ),
            Self::new(
                "libx264",
                &["-c:v", "libx264", "-preset", "fast", "-crf", "23", "-pix_fmt", "yuv420p"],
            ),
        ]
    }
}

/// Conversion pipeline configuration.
#[derive(Debug, Clone)]
pub struct ConversionConfig {
    /// Directory holding raw recordings; playback files land beside them.
    pub recordings_dir: PathBuf,

    /// Encoder binary invoked as a subprocess.
    pub ffmpeg: PathBuf,

    /// Probe binary used to count frames in finished playback files.
    pub ffprobe: PathBuf,

    /// Encoders to try in order; conversion stops at the first one that
    /// produces a valid output.
    pub encoders: Vec<EncoderCandidate>,

    /// Minimum surviving fraction of the raw recording's frames for an
    /// output to be accepted. Policy constant, not a clinical invariant.
    pub min_frame_ratio: f64,

    /// Poll timeout while replaying a raw recording.
    pub replay_poll: Duration,

    /// Minimum interval between slot progress updates.
    pub progress_interval: Duration,
}

impl ConversionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.encoders.is_empty() {
            return Err("at least one encoder candidate is required".into());
        }
        if !(self.min_frame_ratio > 0.0 && self.min_frame_ratio <= 1.0) {
            return Err(format!("invalid frame ratio: {}", self.min_frame_ratio));
        }
        if self.replay_poll.is_zero() {
            return Err("replay poll timeout must be non-zero".into());
        }
        Ok(())
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("recordings"),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            encoders: EncoderCandidate::hardware_first(),
            min_frame_ratio: 0.95,
            replay_poll: Duration::from_secs(2),
            progress_interval: Duration::from_millis(500),
        }
    }
}
