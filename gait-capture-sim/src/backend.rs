//! Synthetic depth-camera backend.
//!
//! Generates framesets paced at the negotiated frame rate, honors the
//! recording/pause/resume contract by writing the simulated raw
//! container, and replays recorded containers for playback. Supports
//! per-profile resolve-failure injection so negotiation fallback paths
//! can be exercised.

use std::collections::HashSet;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gait_capture_core::{
    CaptureError, ColorFrame, DepthFrame, DeviceBackend, DeviceDescriptor, DevicePipeline,
    FrameSet, HwTimestamp, PollResult, StreamProfile, StreamRequest, StreamSource,
    TimestampDomain,
};

use crate::container::{ContainerReader, ContainerWriter};

/// One simulated camera.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub serial: String,
    pub model: String,
    pub usb_descriptor: String,
    pub supported: Vec<StreamProfile>,
    pub max_queue_depth: u32,
    /// Per-device hardware-clock epoch offset in milliseconds, so
    /// cross-camera alignment logic sees distinct clocks.
    pub clock_offset_ms: f64,
}

impl SimDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            model: "SimDepth D4".into(),
            usb_descriptor: "3.2".into(),
            supported: vec![
                StreamProfile::new(848, 480, 60),
                StreamProfile::new(848, 480, 30),
            ],
            max_queue_depth: 32,
            clock_offset_ms: 0.0,
        }
    }

    pub fn with_profiles(mut self, profiles: Vec<StreamProfile>) -> Self {
        self.supported = profiles;
        self
    }

    pub fn with_clock_offset_ms(mut self, offset: f64) -> Self {
        self.clock_offset_ms = offset;
        self
    }
}

/// Backend over a fixed set of simulated devices.
pub struct SimBackend {
    devices: Vec<SimDevice>,
    rejected: Mutex<HashSet<(String, u32)>>,
}

impl SimBackend {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        Self {
            devices,
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// Make `resolve`/`open` fail for one (device, frame rate) pair,
    /// forcing the negotiation loop onto its fallback candidates.
    pub fn reject_profile(&self, serial: &str, fps: u32) {
        self.rejected.lock().insert((serial.to_string(), fps));
    }

    fn device_for(&self, serial: &Option<String>) -> Result<&SimDevice, CaptureError> {
        match serial {
            Some(serial) => self
                .devices
                .iter()
                .find(|d| &d.serial == serial)
                .ok_or(CaptureError::DeviceNotAvailable),
            None => self.devices.first().ok_or(CaptureError::DeviceNotAvailable),
        }
    }

    fn check_live(&self, request: &StreamRequest) -> Result<&SimDevice, CaptureError> {
        let StreamSource::Live { serial } = &request.source else {
            return Err(CaptureError::Unknown("not a live request".into()));
        };
        let device = self.device_for(serial)?;
        if let Some(profile) = &request.profile {
            if !device.supported.contains(profile) {
                return Err(CaptureError::ConfigurationFailed(format!(
                    "{}: unsupported profile {}",
                    device.serial, profile
                )));
            }
            if self
                .rejected
                .lock()
                .contains(&(device.serial.clone(), profile.fps))
            {
                return Err(CaptureError::ConfigurationFailed(format!(
                    "{}: profile {} cannot resolve",
                    device.serial, profile
                )));
            }
        }
        Ok(device)
    }
}

impl DeviceBackend for SimBackend {
    type Pipeline = SimPipeline;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        Ok(self
            .devices
            .iter()
            .map(|device| DeviceDescriptor {
                serial: device.serial.clone(),
                model: device.model.clone(),
                usb_descriptor: device.usb_descriptor.clone(),
            })
            .collect())
    }

    fn resolve(&self, request: &StreamRequest) -> Result<(), CaptureError> {
        match &request.source {
            StreamSource::Live { .. } => {
                self.check_live(request)?;
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

    fn open(&self, request: &StreamRequest) -> Result<Self::Pipeline, CaptureError> {
        match &request.source {
            StreamSource::Live { .. } => {
                let device = self.check_live(request)?;
                let profile = request
                    .profile
                    .or_else(|| device.supported.first().copied())
                    .ok_or_else(|| {
                        CaptureError::ConfigurationFailed(format!(
                            "{}: no stream profiles",
                            device.serial
                        ))
                    })?;

                let writer = match &request.record_to {
                    Some(path) => Some(ContainerWriter::create(path, profile).map_err(|e| {
                        CaptureError::StorageError(format!(
                            "cannot create raw recording {}: {}",
                            path.display(),
                            e
                        ))
                    })?),
                    None => None,
                };

                log::debug!("sim {}: live pipeline at {}", device.serial, profile);
                Ok(SimPipeline::live(
                    profile,
                    device.clock_offset_ms,
                    device.max_queue_depth,
                    writer,
                ))
            }
            StreamSource::Playback {
                path,
                real_time,
                looped,
            } => {
                let reader = ContainerReader::open(path).map_err(|e| {
                    CaptureError::StorageError(format!(
                        "cannot open raw recording {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                log::debug!("sim: playback pipeline for {}", path.display());
                Ok(SimPipeline::playback(reader, *real_time, *looped))
            }
        }
    }
}

enum Mode {
    Live {
        profile: StreamProfile,
        clock_offset_ms: f64,
        max_queue_depth: u32,
        started: Instant,
        next_due: Instant,
        frame_index: u64,
        writer: Option<ContainerWriter>,
        recorder_paused: bool,
    },
    Playback {
        reader: ContainerReader,
        real_time: bool,
        looped: bool,
    },
}

/// A started simulated capture session.
pub struct SimPipeline {
    mode: Mode,
}

impl SimPipeline {
    fn live(
        profile: StreamProfile,
        clock_offset_ms: f64,
        max_queue_depth: u32,
        writer: Option<ContainerWriter>,
    ) -> Self {
        let now = Instant::now();
        Self {
            mode: Mode::Live {
                profile,
                clock_offset_ms,
                max_queue_depth,
                started: now,
                next_due: now + frame_period(profile.fps),
                frame_index: 0,
                writer,
                recorder_paused: false,
            },
        }
    }

    fn playback(reader: ContainerReader, real_time: bool, looped: bool) -> Self {
        Self {
            mode: Mode::Playback {
                reader,
                real_time,
                looped,
            },
        }
    }

    fn finish_recording(&mut self) {
        if let Mode::Live { writer, .. } = &mut self.mode {
            if let Some(writer) = writer.take() {
                match writer.finish() {
                    Ok(frames) => log::debug!("sim: raw recording closed with {} frames", frames),
                    Err(e) => log::warn!("sim: failed to close raw recording: {}", e),
                }
            }
        }
    }
}

impl DevicePipeline for SimPipeline {
    fn poll_frames(&mut self, timeout: Duration) -> Result<PollResult, CaptureError> {
        match &mut self.mode {
            Mode::Live {
                profile,
                clock_offset_ms,
                started,
                next_due,
                frame_index,
                writer,
                recorder_paused,
                ..
            } => {
                let now = Instant::now();
                if *next_due > now + timeout {
                    thread::sleep(timeout);
                    return Ok(PollResult::TimedOut);
                }
                if *next_due > now {
                    thread::sleep(*next_due - now);
                }

                let frames = synth_frameset(
                    *profile,
                    *frame_index,
                    started.elapsed().as_secs_f64() * 1000.0 + *clock_offset_ms,
                );
                if let Some(writer) = writer.as_mut() {
                    if !*recorder_paused {
                        writer.append(&frames).map_err(|e| {
                            CaptureError::StorageError(format!("raw recording write failed: {}", e))
                        })?;
                    }
                }

                *frame_index += 1;
                *next_due += frame_period(profile.fps);
                Ok(PollResult::Frame(frames))
            }
            Mode::Playback {
                reader,
                real_time,
                looped,
            } => {
                if *real_time {
                    thread::sleep(frame_period(reader.profile().fps).min(timeout));
                }
                match reader.next_frame() {
                    Ok(Some(frames)) => Ok(PollResult::Frame(frames)),
                    Ok(None) if *looped => {
                        reader
                            .rewind()
                            .map_err(|e| CaptureError::StorageError(e.to_string()))?;
                        match reader.next_frame() {
                            Ok(Some(frames)) => Ok(PollResult::Frame(frames)),
                            Ok(None) => Ok(PollResult::EndOfStream),
                            Err(e) => Err(CaptureError::StorageError(e.to_string())),
                        }
                    }
                    Ok(None) => Ok(PollResult::EndOfStream),
                    Err(e) => Err(CaptureError::StorageError(e.to_string())),
                }
            }
        }
    }

    fn profile(&self) -> StreamProfile {
        match &self.mode {
            Mode::Live { profile, .. } => *profile,
            Mode::Playback { reader, .. } => reader.profile(),
        }
    }

    fn set_queue_depth(&mut self, frames: u32) -> Result<u32, CaptureError> {
        match &self.mode {
            Mode::Live { max_queue_depth, .. } => Ok(frames.min(*max_queue_depth)),
            Mode::Playback { .. } => Ok(frames),
        }
    }

    fn pause_recorder(&mut self) -> Result<(), CaptureError> {
        match &mut self.mode {
            Mode::Live {
                writer: Some(_),
                recorder_paused,
                ..
            } => {
                *recorder_paused = true;
                Ok(())
            }
            _ => Err(CaptureError::ConfigurationFailed(
                "no active recorder to pause".into(),
            )),
        }
    }

    fn resume_recorder(&mut self) -> Result<(), CaptureError> {
        match &mut self.mode {
            Mode::Live {
                writer: Some(_),
                recorder_paused,
                ..
            } => {
                *recorder_paused = false;
                Ok(())
            }
            _ => Err(CaptureError::ConfigurationFailed(
                "no active recorder to resume".into(),
            )),
        }
    }

    fn stop(&mut self) {
        self.finish_recording();
    }
}

impl Drop for SimPipeline {
    fn drop(&mut self) {
        self.finish_recording();
    }
}

fn frame_period(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}

fn synth_frameset(profile: StreamProfile, frame_index: u64, millis: f64) -> FrameSet {
    let pixels = (profile.width * profile.height) as usize;
    FrameSet {
        color: ColorFrame {
            width: profile.width,
            height: profile.height,
            data: vec![(frame_index % 251) as u8; pixels * 3],
        },
        depth: Some(DepthFrame {
            width: profile.width,
            height: profile.height,
            data: vec![1000 + (frame_index % 97) as u16; pixels],
        }),
        timestamp: HwTimestamp {
            millis,
            domain: TimestampDomain::HardwareClock,
        },
    }
}

/// Convenience: a two-camera rig with distinct serials and slightly
/// offset hardware clocks, supporting the given profiles.
pub fn two_camera_rig(profiles: Vec<StreamProfile>) -> SimBackend {
    SimBackend::new(vec![
        SimDevice::new("SIM-0001").with_profiles(profiles.clone()),
        SimDevice::new("SIM-0002")
            .with_profiles(profiles)
            .with_clock_offset_ms(7.5),
    ])
}

/// Write a deterministic synthetic recording, for consumers that need a
/// raw container on disk without running a live pipeline.
pub fn write_synthetic_recording(
    path: &Path,
    profile: StreamProfile,
    frames: u64,
) -> Result<(), CaptureError> {
    let mut writer = ContainerWriter::create(path, profile)
        .map_err(|e| CaptureError::StorageError(e.to_string()))?;
    for index in 0..frames {
        let millis = index as f64 * 1000.0 / profile.fps.max(1) as f64;
        writer
            .append(&synth_frameset(profile, index, millis))
            .map_err(|e| CaptureError::StorageError(e.to_string()))?;
    }
    writer
        .finish()
        .map_err(|e| CaptureError::StorageError(e.to_string()))?;
    Ok(())
}
