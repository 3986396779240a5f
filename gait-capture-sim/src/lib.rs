//! # gait-capture-sim
//!
//! Synthetic depth-camera backend for `gait-capture-core`.
//!
//! Implements the core's `DeviceBackend`/`DevicePipeline` traits with
//! paced frame generation, a simulated raw-container recorder honoring
//! pause/resume, playback replay (free-run or real-time, optionally
//! looped), and resolve-failure injection. Serves as the development and
//! test stand-in for the vendor camera SDK; the workspace's end-to-end
//! tests of the recording and conversion pipelines live here.

pub mod backend;
pub mod container;

pub use backend::{
    two_camera_rig, write_synthetic_recording, SimBackend, SimDevice, SimPipeline,
};
pub use container::{ContainerReader, ContainerWriter};
