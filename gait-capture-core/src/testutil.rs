//! Minimal in-memory device backend for unit tests.
//!
//! Generates tiny framesets immediately on every poll and writes a stub
//! raw file when recording is requested, so lifecycle and bookkeeping
//! paths can be exercised without a device or the simulator crate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::config::{CaptureConfig, StreamProfile};
use crate::models::error::CaptureError;
use crate::models::frame::{ColorFrame, DepthFrame, FrameSet, HwTimestamp, TimestampDomain};
use crate::traits::device::{
    DeviceBackend, DeviceDescriptor, DevicePipeline, PollResult, StreamRequest, StreamSource,
};

/// Capture configuration tuned for fast tests: tiny frames, short
/// timeouts, no startup stagger.
pub fn test_capture_config() -> CaptureConfig {
    let profiles = vec![StreamProfile::new(8, 6, 60), StreamProfile::new(8, 6, 30)];
    CaptureConfig {
        multi_cam_profiles: profiles.clone(),
        single_cam_profiles: profiles,
        poll_timeout: Duration::from_millis(20),
        stale_after: Duration::from_millis(500),
        join_timeout: Duration::from_millis(500),
        queue_depth: 8,
        timeout_log_period: 30,
        stagger_delay: Duration::ZERO,
        usb_settle: Duration::from_millis(10),
    }
}

pub struct MockBackend {
    devices: Vec<DeviceDescriptor>,
    rejected_fps: Mutex<HashSet<u32>>,
    opens: AtomicUsize,
}

impl MockBackend {
    pub fn with_devices(count: usize) -> Self {
        let devices = (0..count)
            .map(|i| DeviceDescriptor {
                serial: format!("MOCK-{:04}", i + 1),
                model: "Mock Depth Camera".into(),
                usb_descriptor: "3.2".into(),
            })
            .collect();
        Self {
            devices,
            rejected_fps: Mutex::new(HashSet::new()),
            opens: AtomicUsize::new(0),
        }
    }

    /// How many pipelines were ever opened.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Reject every candidate profile so negotiation always fails.
    pub fn reject_all_profiles(&self) {
        let mut rejected = self.rejected_fps.lock();
        rejected.insert(30);
        rejected.insert(60);
    }

    fn check(&self, request: &StreamRequest) -> Result<(), CaptureError> {
        match &request.source {
            StreamSource::Live { serial } => {
                if let Some(serial) = serial {
                    if !self.devices.iter().any(|d| &d.serial == serial) {
                        return Err(CaptureError::DeviceNotAvailable);
                    }
                } else if self.devices.is_empty() {
                    return Err(CaptureError::DeviceNotAvailable);
                }
                if let Some(profile) = &request.profile {
                    if self.rejected_fps.lock().contains(&profile.fps) {
                        return Err(CaptureError::ConfigurationFailed(format!(
                            "profile {} rejected",
                            profile
                        )));
                    }
                }
                Ok(())
            }
            StreamSource::Playback { path, .. } => {
                if path.exists() {
                    Ok(())
                } else {
                    Err(CaptureError::ConfigurationFailed(format!(
                        "playback file missing: {}",
                        path.display()
                    )))
                }
            }
        }
    }
}

impl DeviceBackend for MockBackend {
    type Pipeline = MockPipeline;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        Ok(self.devices.clone())
    }

    fn resolve(&self, request: &StreamRequest) -> Result<(), CaptureError> {
        self.check(request)
    }

    fn open(&self, request: &StreamRequest) -> Result<Self::Pipeline, CaptureError> {
        self.check(request)?;
        if let Some(path) = &request.record_to {
            std::fs::write(path, b"mock raw recording")
                .map_err(|e| CaptureError::StorageError(e.to_string()))?;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(MockPipeline {
            profile: request.profile.unwrap_or(StreamProfile::new(8, 6, 30)),
            frame_index: 0,
        })
    }
}

pub struct MockPipeline {
    profile: StreamProfile,
    frame_index: u64,
}

impl DevicePipeline for MockPipeline {
    fn poll_frames(&mut self, _timeout: Duration) -> Result<PollResult, CaptureError> {
        thread::sleep(Duration::from_millis(1));
        let millis = self.frame_index as f64 * 1000.0 / self.profile.fps as f64;
        self.frame_index += 1;
        let pixels = (self.profile.width * self.profile.height) as usize;
        Ok(PollResult::Frame(FrameSet {
            color: ColorFrame {
                width: self.profile.width,
                height: self.profile.height,
                data: vec![(self.frame_index & 0xff) as u8; pixels * 3],
            },
            depth: Some(DepthFrame {
                width: self.profile.width,
                height: self.profile.height,
                data: vec![1000; pixels],
            }),
            timestamp: HwTimestamp {
                millis,
                domain: TimestampDomain::HardwareClock,
            },
        }))
    }

    fn profile(&self) -> StreamProfile {
        self.profile
    }

    fn set_queue_depth(&mut self, frames: u32) -> Result<u32, CaptureError> {
        Ok(frames.min(16))
    }

    fn pause_recorder(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn resume_recorder(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn stop(&mut self) {}
}
