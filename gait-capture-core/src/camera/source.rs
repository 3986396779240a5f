use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::camera::registry::DetectionCache;
use crate::models::config::{CaptureConfig, StreamProfile};
use crate::models::frame::{ColorFrame, DepthFrame, FrameSet, TimestampDomain};
use crate::models::state::CameraState;
use crate::traits::device::{DeviceBackend, DevicePipeline, PollResult, StreamRequest, StreamSource};

/// Most recent decoded payload, written only by the capture thread.
#[derive(Default)]
struct FrameCache {
    color: Option<ColorFrame>,
    depth: Option<DepthFrame>,
    captured_at: Option<Instant>,
}

/// Hardware-clock bookkeeping for the current (or most recent) recording,
/// used for post-hoc cross-camera alignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordingClock {
    pub first_hw_timestamp_ms: Option<f64>,
    pub last_hw_timestamp_ms: Option<f64>,
    pub domain: Option<TimestampDomain>,
    pub frame_count: u64,
}

struct ClockState {
    clock: RecordingClock,
    recording: bool,
}

/// Read-only snapshot of the latest cached frame pair.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub color: ColorFrame,
    pub depth: Option<DepthFrame>,
    pub captured_at: Instant,
}

/// State shared between the source handle and its capture thread.
struct CaptureShared<P: DevicePipeline> {
    stop: AtomicBool,
    pipeline: Mutex<Option<P>>,
    cache: Mutex<FrameCache>,
    clock: Mutex<ClockState>,
}

struct SourceState {
    state: CameraState,
    serial: Option<String>,
    profile: Option<StreamProfile>,
    recording_path: Option<PathBuf>,
    playback: Option<PathBuf>,
    capture_thread: Option<thread::JoinHandle<()>>,
}

/// Camera info snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub physical_id: usize,
    pub serial: Option<String>,
    pub state: CameraState,
    pub profile: Option<StreamProfile>,
}

/// A recording configuration validated by the device but not yet started.
///
/// Produced by the slow phase of the two-phase recording start
/// (`prepare_recording`) and consumed by the fast phase
/// (`commit_recording`).
#[derive(Debug, Clone)]
pub struct PreparedRecording {
    request: StreamRequest,
    path: PathBuf,
}

impl PreparedRecording {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One physical camera: owns the device pipeline, its single capture
/// thread, and the latest-frame cache.
///
/// The capture thread decouples hardware capture from all consumers:
/// readers take snapshot copies of the cache and never block on the
/// device. At most one capture thread exists per source at any time.
pub struct CameraSource<B: DeviceBackend> {
    physical_id: usize,
    backend: Arc<B>,
    detection: Arc<DetectionCache>,
    config: CaptureConfig,
    state: Mutex<SourceState>,
    shared: Arc<CaptureShared<B::Pipeline>>,
}

impl<B: DeviceBackend> CameraSource<B> {
    pub fn new(
        physical_id: usize,
        backend: Arc<B>,
        detection: Arc<DetectionCache>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            physical_id,
            backend,
            detection,
            config,
            state: Mutex::new(SourceState {
                state: CameraState::Stopped,
                serial: None,
                profile: None,
                recording_path: None,
                playback: None,
                capture_thread: None,
            }),
            shared: Arc::new(CaptureShared {
                stop: AtomicBool::new(false),
                pipeline: Mutex::new(None),
                cache: Mutex::new(FrameCache::default()),
                clock: Mutex::new(ClockState {
                    clock: RecordingClock::default(),
                    recording: false,
                }),
            }),
        }
    }

    pub fn physical_id(&self) -> usize {
        self.physical_id
    }

    pub fn state(&self) -> CameraState {
        self.state.lock().state
    }

    pub fn serial(&self) -> Option<String> {
        self.state.lock().serial.clone()
    }

    pub fn info(&self) -> CameraInfo {
        let s = self.state.lock();
        CameraInfo {
            physical_id: self.physical_id,
            serial: s.serial.clone(),
            state: s.state,
            profile: s.profile,
        }
    }

    /// Hardware-timestamp bookkeeping of the current or most recent
    /// recording. Values persist after `stop_recording` until the next
    /// commit resets them.
    pub fn recording_clock(&self) -> RecordingClock {
        self.shared.clock.lock().clock
    }

    /// Start streaming. Idempotent: returns `true` immediately when the
    /// camera is already live.
    ///
    /// When `playback` is given, frames come from a recorded raw file
    /// instead of a live device. Live starts fail fast when the camera is
    /// absent from the detection cache; detection refresh is never
    /// triggered from here so that concurrent starts cannot stampede USB
    /// enumeration.
    ///
    /// Returns once the device reports started, not once frames flow.
    pub fn start(&self, playback: Option<&Path>) -> bool {
        {
            let mut s = self.state.lock();
            if s.state.is_live() {
                return true;
            }
            if s.state == CameraState::Starting {
                return false;
            }
            s.state = CameraState::Starting;
            s.playback = playback.map(Path::to_path_buf);
        }

        if playback.is_none() {
            match self.detection.descriptor(self.physical_id) {
                Some(descriptor) => {
                    self.state.lock().serial = Some(descriptor.serial);
                }
                None => {
                    log::info!(
                        "camera {}: not in detection cache, skipping start",
                        self.physical_id
                    );
                    self.state.lock().state = CameraState::Stopped;
                    return false;
                }
            }
        }

        self.shared.stop.store(false, Ordering::SeqCst);
        let profile = self.open_stream(playback, None, false);

        match profile {
            Some(profile) if !self.shared.stop.load(Ordering::SeqCst) => {
                {
                    let mut s = self.state.lock();
                    s.state = CameraState::Streaming;
                    s.profile = Some(profile);
                }
                self.spawn_capture_thread();
                true
            }
            Some(_) => {
                // A stop raced the startup; release the device again.
                if let Some(mut pipeline) = self.shared.pipeline.lock().take() {
                    pipeline.stop();
                }
                self.state.lock().state = CameraState::Stopped;
                false
            }
            None => {
                self.state.lock().state = CameraState::Stopped;
                false
            }
        }
    }

    /// Stop streaming and release the device. Safe to call on an
    /// already-stopped source. Clears recording flags unconditionally.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);

        let handle = self.state.lock().capture_thread.take();
        if let Some(handle) = handle {
            if !join_with_timeout(handle, self.config.join_timeout) {
                log::warn!(
                    "camera {}: capture thread did not stop within {:?}, abandoning",
                    self.physical_id,
                    self.config.join_timeout
                );
            }
        }

        if let Some(mut pipeline) = self.shared.pipeline.lock().take() {
            pipeline.stop();
        }

        self.shared.clock.lock().recording = false;
        // A stopped source offers no frames, not yesterday's cache.
        *self.shared.cache.lock() = FrameCache::default();

        let mut s = self.state.lock();
        s.state = CameraState::Stopped;
        s.recording_path = None;
        s.profile = None;
    }

    /// Slow half of the synchronized recording start (~1-3 s): stop the
    /// current streaming session and validate a recording-enabled
    /// configuration with the device, without starting it.
    ///
    /// Splitting prepare from commit lets multiple cameras absorb the
    /// teardown/negotiation cost in parallel and then commit together
    /// behind a barrier.
    pub fn prepare_recording(&self, path: &Path) -> Option<PreparedRecording> {
        {
            let s = self.state.lock();
            if s.playback.is_some() {
                log::warn!(
                    "camera {}: raw recording is only supported for live devices",
                    self.physical_id
                );
                return None;
            }
            if s.state.is_recording() {
                log::warn!(
                    "camera {}: already recording to {:?}",
                    self.physical_id,
                    s.recording_path
                );
                return None;
            }
        }

        log::info!(
            "camera {}: preparing recording, stopping streaming pipeline",
            self.physical_id
        );
        self.stop();

        let serial = self.state.lock().serial.clone();
        for profile in self.profile_candidates() {
            let request = StreamRequest {
                source: StreamSource::Live {
                    serial: serial.clone(),
                },
                profile: Some(profile),
                record_to: Some(path.to_path_buf()),
            };
            match self.backend.resolve(&request) {
                Ok(()) => {
                    log::info!(
                        "camera {}: prepared {} -> {}",
                        self.physical_id,
                        profile,
                        path.display()
                    );
                    return Some(PreparedRecording {
                        request,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) => {
                    log::warn!(
                        "camera {}: profile {} cannot resolve for recording: {}",
                        self.physical_id,
                        profile,
                        e
                    );
                }
            }
        }

        log::error!(
            "camera {}: no stream profile resolves for recording",
            self.physical_id
        );
        None
    }

    /// Fast half of the synchronized recording start (~100-300 ms):
    /// start the prepared session, deepen the on-device frame queue, and
    /// relaunch the capture thread with fresh hardware-timestamp counters.
    pub fn commit_recording(&self, prepared: PreparedRecording) -> bool {
        match self.backend.open(&prepared.request) {
            Ok(mut pipeline) => {
                self.raise_queue_depth(&mut pipeline);
                let negotiated = pipeline.profile();

                {
                    let mut clock = self.shared.clock.lock();
                    clock.clock = RecordingClock::default();
                    clock.recording = true;
                }
                *self.shared.pipeline.lock() = Some(pipeline);
                self.shared.stop.store(false, Ordering::SeqCst);

                {
                    let mut s = self.state.lock();
                    s.state = CameraState::Recording;
                    s.profile = Some(negotiated);
                    s.recording_path = Some(prepared.path.clone());
                }
                self.spawn_capture_thread();

                log::info!(
                    "camera {}: recording committed at {} -> {}",
                    self.physical_id,
                    negotiated,
                    prepared.path.display()
                );
                true
            }
            Err(e) => {
                log::error!("camera {}: commit failed: {}", self.physical_id, e);
                self.state.lock().state = CameraState::Stopped;
                false
            }
        }
    }

    /// Pause the on-device recorder. The capture session keeps running,
    /// so live preview is unaffected. Returns `false` when not recording.
    pub fn pause_recording(&self) -> bool {
        {
            let s = self.state.lock();
            if s.state != CameraState::Recording {
                return false;
            }
        }
        let paused = {
            let mut guard = self.shared.pipeline.lock();
            match guard.as_mut() {
                Some(pipeline) => match pipeline.pause_recorder() {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("camera {}: pause failed: {}", self.physical_id, e);
                        false
                    }
                },
                None => false,
            }
        };
        if paused {
            self.state.lock().state = CameraState::Paused;
            log::info!("camera {}: raw recording paused", self.physical_id);
        }
        paused
    }

    /// Resume a paused on-device recorder. Returns `false` when not
    /// paused.
    pub fn resume_recording(&self) -> bool {
        {
            let s = self.state.lock();
            if s.state != CameraState::Paused {
                return false;
            }
        }
        let resumed = {
            let mut guard = self.shared.pipeline.lock();
            match guard.as_mut() {
                Some(pipeline) => match pipeline.resume_recorder() {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("camera {}: resume failed: {}", self.physical_id, e);
                        false
                    }
                },
                None => false,
            }
        };
        if resumed {
            self.state.lock().state = CameraState::Recording;
            log::info!("camera {}: raw recording resumed", self.physical_id);
        }
        resumed
    }

    /// Stop the on-device recorder and restart a plain streaming session
    /// so live preview keeps working. Returns the recorded file path, or
    /// `None` when no recording was active.
    ///
    /// Hardware-timestamp bookkeeping survives the stop and stays
    /// readable via `recording_clock` until the next commit.
    pub fn stop_recording(&self) -> Option<PathBuf> {
        let path = {
            let s = self.state.lock();
            if !s.state.is_recording() {
                return None;
            }
            s.recording_path.clone()
        };

        log::info!(
            "camera {}: stopping recording, restarting streaming",
            self.physical_id
        );
        self.stop();

        self.shared.stop.store(false, Ordering::SeqCst);
        self.state.lock().state = CameraState::Starting;
        match self.open_stream(None, None, true) {
            Some(profile) => {
                {
                    let mut s = self.state.lock();
                    s.state = CameraState::Streaming;
                    s.profile = Some(profile);
                }
                self.spawn_capture_thread();
            }
            None => {
                self.state.lock().state = CameraState::Stopped;
            }
        }

        path
    }

    /// Snapshot of the most recent cached frame. Returns `None` when no
    /// frame has arrived yet or the cache is stale, so a stalled capture
    /// thread is observable without consumers blocking on the device.
    pub fn read(&self) -> Option<FrameSnapshot> {
        let cache = self.shared.cache.lock();
        let (Some(color), Some(captured_at)) = (cache.color.as_ref(), cache.captured_at) else {
            return None;
        };
        if captured_at.elapsed() > self.config.stale_after {
            return None;
        }
        Some(FrameSnapshot {
            color: color.clone(),
            depth: cache.depth.clone(),
            captured_at,
        })
    }

    // --- Internal helpers ---

    fn profile_candidates(&self) -> Vec<StreamProfile> {
        if self.detection.len() >= 2 {
            self.config.multi_cam_profiles.clone()
        } else {
            self.config.single_cam_profiles.clone()
        }
    }

    /// Iterate the candidate profiles until the device accepts one.
    /// Stores the started pipeline in the shared slot and returns the
    /// negotiated profile, or `None` when every candidate fails (camera
    /// offline until an explicit restart).
    fn open_stream(
        &self,
        playback: Option<&Path>,
        record_to: Option<PathBuf>,
        quick_restart: bool,
    ) -> Option<StreamProfile> {
        // Stagger secondary cameras so simultaneous pipeline starts do
        // not contend on the USB bus. Skipped on quick restarts where the
        // sensor is already warmed up.
        if playback.is_none() && !quick_restart && self.physical_id > 0 && self.detection.len() >= 2
        {
            thread::sleep(self.config.stagger_delay);
        }

        let serial = self.state.lock().serial.clone();
        let candidates: Vec<Option<StreamProfile>> = match playback {
            Some(_) => vec![None],
            None => self.profile_candidates().into_iter().map(Some).collect(),
        };

        for profile in candidates {
            if self.shared.stop.load(Ordering::SeqCst) {
                log::info!("camera {}: startup aborted by stop signal", self.physical_id);
                return None;
            }

            let request = StreamRequest {
                source: match playback {
                    Some(path) => StreamSource::Playback {
                        path: path.to_path_buf(),
                        real_time: true,
                        looped: true,
                    },
                    None => StreamSource::Live {
                        serial: serial.clone(),
                    },
                },
                profile,
                record_to: record_to.clone(),
            };

            match self.backend.open(&request) {
                Ok(mut pipeline) => {
                    self.raise_queue_depth(&mut pipeline);
                    let negotiated = pipeline.profile();
                    *self.shared.pipeline.lock() = Some(pipeline);
                    log::info!("camera {}: started at {}", self.physical_id, negotiated);
                    return Some(negotiated);
                }
                Err(e) => match profile {
                    Some(profile) => {
                        log::warn!(
                            "camera {}: profile {} failed: {}",
                            self.physical_id,
                            profile,
                            e
                        );
                    }
                    None => {
                        log::warn!("camera {}: playback start failed: {}", self.physical_id, e);
                    }
                },
            }
        }

        log::error!(
            "camera {}: all stream profiles failed, camera offline",
            self.physical_id
        );
        None
    }

    fn raise_queue_depth(&self, pipeline: &mut B::Pipeline) {
        match pipeline.set_queue_depth(self.config.queue_depth) {
            Ok(applied) => {
                log::debug!("camera {}: frame queue depth {}", self.physical_id, applied);
            }
            Err(e) => {
                log::warn!(
                    "camera {}: could not raise frame queue depth: {}",
                    self.physical_id,
                    e
                );
            }
        }
    }

    fn spawn_capture_thread(&self) {
        let shared = Arc::clone(&self.shared);
        let physical_id = self.physical_id;
        let poll_timeout = self.config.poll_timeout;
        let log_period = self.config.timeout_log_period;

        let handle = thread::Builder::new()
            .name(format!("capture-{physical_id}"))
            .spawn(move || capture_loop(physical_id, &shared, poll_timeout, log_period))
            .expect("failed to spawn capture thread");

        self.state.lock().capture_thread = Some(handle);
    }
}

/// The single capture loop per camera: bounded-timeout polls, owned
/// decode into the frame cache, hardware-timestamp tracking while
/// recording. Transient timeouts are counted and logged periodically;
/// the loop exits only on the stop flag or pipeline teardown.
fn capture_loop<P: DevicePipeline>(
    physical_id: usize,
    shared: &CaptureShared<P>,
    poll_timeout: Duration,
    log_period: u32,
) {
    log::debug!("camera {}: capture loop started", physical_id);
    let mut stall_ticks: u32 = 0;

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        let mut guard = shared.pipeline.lock();
        let Some(pipeline) = guard.as_mut() else {
            break;
        };

        match pipeline.poll_frames(poll_timeout) {
            Ok(PollResult::Frame(frames)) => {
                drop(guard);
                stall_ticks = 0;

                let FrameSet {
                    color,
                    depth,
                    timestamp,
                } = frames;

                {
                    let mut clock = shared.clock.lock();
                    if clock.recording {
                        if clock.clock.first_hw_timestamp_ms.is_none() {
                            clock.clock.first_hw_timestamp_ms = Some(timestamp.millis);
                            clock.clock.domain = Some(timestamp.domain);
                        }
                        clock.clock.last_hw_timestamp_ms = Some(timestamp.millis);
                        clock.clock.frame_count += 1;
                    }
                }

                let mut cache = shared.cache.lock();
                cache.color = Some(color);
                cache.depth = depth;
                cache.captured_at = Some(Instant::now());
            }
            Ok(PollResult::TimedOut) => {
                drop(guard);
                stall_ticks += 1;
                if stall_ticks % log_period == 0 {
                    log::warn!(
                        "camera {}: {} consecutive poll timeouts",
                        physical_id,
                        stall_ticks
                    );
                }
            }
            Ok(PollResult::EndOfStream) => {
                drop(guard);
                log::info!("camera {}: stream ended", physical_id);
                break;
            }
            Err(e) => {
                drop(guard);
                stall_ticks += 1;
                if stall_ticks % log_period == 0 {
                    log::warn!("camera {}: capture error: {}", physical_id, e);
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    log::debug!("camera {}: capture loop stopped", physical_id);
}

/// Best-effort join: waits up to `timeout`, then abandons the thread so a
/// wedged device poll can never block shutdown indefinitely.
fn join_with_timeout(handle: thread::JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle.join().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_capture_config, MockBackend};

    fn source_with_devices(devices: usize) -> (Arc<MockBackend>, CameraSource<MockBackend>) {
        let backend = Arc::new(MockBackend::with_devices(devices));
        let detection = Arc::new(DetectionCache::new());
        detection.replace(backend.enumerate().unwrap());
        let source = CameraSource::new(
            0,
            Arc::clone(&backend),
            detection,
            test_capture_config(),
        );
        (backend, source)
    }

    #[test]
    fn start_fails_fast_when_not_detected() {
        let backend = Arc::new(MockBackend::with_devices(1));
        let detection = Arc::new(DetectionCache::new());
        // Detection cache left empty on purpose.
        let source = CameraSource::new(0, backend, detection, test_capture_config());

        assert!(!source.start(None));
        assert_eq!(source.state(), CameraState::Stopped);
    }

    #[test]
    fn start_is_idempotent_and_spawns_one_capture_thread() {
        let (backend, source) = source_with_devices(1);

        assert!(source.start(None));
        assert!(source.start(None));
        assert!(source.start(None));

        assert_eq!(source.state(), CameraState::Streaming);
        assert_eq!(backend.open_count(), 1);

        source.stop();
        assert_eq!(source.state(), CameraState::Stopped);
    }

    #[test]
    fn stop_on_stopped_source_is_noop() {
        let (_, source) = source_with_devices(1);
        source.stop();
        source.stop();
        assert_eq!(source.state(), CameraState::Stopped);
    }

    #[test]
    fn read_returns_fresh_frames() {
        let (_, source) = source_with_devices(1);
        assert!(source.start(None));

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut snapshot = None;
        while Instant::now() < deadline {
            snapshot = source.read();
            if snapshot.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let snapshot = snapshot.expect("no frame arrived");
        assert!(!snapshot.color.data.is_empty());
        source.stop();
    }

    #[test]
    fn failed_prepare_leaves_source_stopped() {
        let (backend, source) = source_with_devices(1);
        assert!(source.start(None));

        // Reject every candidate profile so preparation cannot resolve.
        backend.reject_all_profiles();
        let prepared = source.prepare_recording(Path::new("/tmp/never-written.bag"));
        assert!(prepared.is_none());
        assert_eq!(source.state(), CameraState::Stopped);
        assert!(source.read().is_none());
    }

    #[test]
    fn recording_clock_survives_stop_recording() {
        let (_, source) = source_with_devices(1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_camera1.bag");

        assert!(source.start(None));
        let prepared = source.prepare_recording(&path).expect("prepare failed");
        assert!(source.commit_recording(prepared));
        assert_eq!(source.state(), CameraState::Recording);

        // Let a few frames arrive.
        let deadline = Instant::now() + Duration::from_secs(2);
        while source.recording_clock().frame_count < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let recorded = source.stop_recording().expect("no recording path");
        assert_eq!(recorded, path);

        let clock = source.recording_clock();
        assert!(clock.frame_count >= 3);
        assert!(clock.first_hw_timestamp_ms.is_some());
        assert!(clock.last_hw_timestamp_ms.unwrap() >= clock.first_hw_timestamp_ms.unwrap());

        // Streaming resumed for live preview.
        assert_eq!(source.state(), CameraState::Streaming);
        source.stop();
    }

    #[test]
    fn pause_requires_active_recording() {
        let (_, source) = source_with_devices(1);
        assert!(source.start(None));
        assert!(!source.pause_recording());
        assert!(!source.resume_recording());
        source.stop();
    }
}
