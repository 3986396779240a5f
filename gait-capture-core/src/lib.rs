//! # gait-capture-core
//!
//! Device-agnostic core for a two-camera clinical gait capture rig.
//!
//! Drives depth+RGB cameras through a narrow backend trait, keeps a live
//! frame cache per camera, records synchronized raw files via a two-phase
//! barrier-coordinated start, and converts raw recordings to playback
//! video after the fact.
//!
//! ## Architecture
//!
//! ```text
//! gait-capture-core (this crate)
//! ├── traits/       ← DeviceBackend, DevicePipeline (vendor SDK seam)
//! ├── models/       ← CaptureError, state machines, configs, frame types
//! ├── camera/       ← CameraSource (capture thread), CameraRegistry
//! ├── session/      ← RecordingOrchestrator, CommitBarrier
//! ├── conversion/   ← ConversionPipeline, FrameSink, job table
//! └── storage/      ← metadata sidecar read/merge/write
//! ```
//!
//! Backends (a live vendor SDK binding, the synthetic `gait-capture-sim`)
//! implement the `traits` and plug into the registry; the orchestration
//! layer above never branches on SDK-specific types.

pub mod camera;
pub mod conversion;
pub mod models;
pub mod session;
pub mod storage;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export key types at crate root for convenience.
pub use camera::registry::{CameraRegistry, DetectionCache};
pub use camera::source::{CameraInfo, CameraSource, FrameSnapshot, PreparedRecording, RecordingClock};
pub use conversion::encoder::{FfprobeProbe, FrameSink, OutputProbe};
pub use conversion::job::{ConversionJob, JobTable, SlotState};
pub use conversion::pipeline::ConversionPipeline;
pub use models::config::{
    CaptureConfig, ConversionConfig, EncoderCandidate, RecordingConfig, StreamProfile, SyncQuality,
    SyncThresholds,
};
pub use models::error::CaptureError;
pub use models::frame::{ColorFrame, DepthFrame, FrameSet, HwTimestamp, TimestampDomain};
pub use models::state::{CameraState, JobStatus, SessionStatus, SlotStatus};
pub use session::barrier::{BarrierWait, CommitBarrier};
pub use session::orchestrator::{RecordingOrchestrator, SessionSnapshot, StopOutcome};
pub use storage::metadata::{read_sidecar, sidecar_path, update_sidecar, RecordingSidecar};
pub use traits::device::{
    DeviceBackend, DeviceDescriptor, DevicePipeline, PollResult, StreamRequest, StreamSource,
};
