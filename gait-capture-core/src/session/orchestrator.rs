use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;

use crate::camera::registry::CameraRegistry;
use crate::models::config::RecordingConfig;
use crate::models::error::CaptureError;
use crate::models::state::SessionStatus;
use crate::session::barrier::{BarrierWait, CommitBarrier};
use crate::storage::metadata;
use crate::traits::device::DeviceBackend;

/// Per-camera bookkeeping of the live session. A camera appears here only
/// after it successfully committed; failed cameras are simply absent.
#[derive(Debug, Clone)]
struct CameraSlot {
    raw_path: PathBuf,
    actual_fps: u32,
    started_at: DateTime<Local>,
    committed_mono: Instant,
}

/// The one live recording session, guarded by a single lock. Slow device
/// operations (prepare/commit/stop) run outside the lock; only
/// bookkeeping mutation is locked, so preview reads are never blocked by
/// hardware latency.
struct SessionState {
    status: SessionStatus,
    session_timestamp: Option<String>,
    patient_id: String,
    warmup_started: Option<Instant>,
    started_mono: Option<Instant>,
    cameras: BTreeMap<usize, CameraSlot>,
    inter_camera_offset_ms: Option<f64>,
    /// Bumped on every start and reset so stale warm-up and commit
    /// threads from a previous session can never arm or mutate this one.
    epoch: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            session_timestamp: None,
            patient_id: String::new(),
            warmup_started: None,
            started_mono: None,
            cameras: BTreeMap::new(),
            inter_camera_offset_ms: None,
            epoch: 0,
        }
    }

    fn reset(&mut self) {
        self.status = SessionStatus::Idle;
        self.session_timestamp = None;
        self.patient_id.clear();
        self.warmup_started = None;
        self.started_mono = None;
        self.cameras.clear();
        self.inter_camera_offset_ms = None;
        self.epoch += 1;
    }
}

/// Serializable session status for external polling.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub patient_id: String,
    pub session_timestamp: Option<String>,
    pub duration_secs: Option<f64>,
    pub warmup_remaining_secs: Option<f64>,
    /// Logical camera label ("camera1", "camera2") to raw file name.
    pub raw_files: BTreeMap<String, String>,
    pub inter_camera_offset_ms: Option<f64>,
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// No session was active; nothing changed.
    AlreadyIdle,
    /// Stop arrived during warm-up, before any device state changed.
    CancelledDuringWarmup,
    /// The session was stopped and its artifacts finalized.
    Stopped {
        raw_files: Vec<PathBuf>,
        sidecars: Vec<PathBuf>,
    },
}

/// Coordinates warm-up, two-phase synchronized start, pause/resume, and
/// stop across all active cameras for one recording session, and persists
/// the per-session metadata sidecars.
pub struct RecordingOrchestrator<B: DeviceBackend> {
    registry: Arc<CameraRegistry<B>>,
    config: RecordingConfig,
    session: Arc<Mutex<SessionState>>,
}

impl<B: DeviceBackend> RecordingOrchestrator<B> {
    pub fn new(
        registry: Arc<CameraRegistry<B>>,
        config: RecordingConfig,
    ) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;
        std::fs::create_dir_all(&config.recordings_dir)
            .map_err(|e| CaptureError::StorageError(e.to_string()))?;
        Ok(Self {
            registry,
            config,
            session: Arc::new(Mutex::new(SessionState::new())),
        })
    }

    /// Begin a recording session. Returns immediately with the session in
    /// `WarmingUp`; a background timer arms the devices once camera
    /// auto-exposure has had time to settle.
    ///
    /// Rejected with a conflict error when a session is already active.
    pub fn start(&self, patient_id: &str) -> Result<(), CaptureError> {
        let epoch = {
            let mut session = self.session.lock();
            if session.status.is_active() {
                return Err(CaptureError::SessionConflict(format!(
                    "a recording is already in progress ({:?})",
                    session.status
                )));
            }
            session.reset();
            session.status = SessionStatus::WarmingUp;
            session.patient_id = patient_id.to_string();
            session.session_timestamp =
                Some(Local::now().format("%Y-%m-%d_%H-%M-%S").to_string());
            session.warmup_started = Some(Instant::now());
            session.epoch
        };

        log::info!(
            "recording session warming up for {:?} (patient {})",
            self.config.warmup,
            patient_id
        );

        let registry = Arc::clone(&self.registry);
        let session = Arc::clone(&self.session);
        let config = self.config.clone();
        thread::Builder::new()
            .name("recording-warmup".into())
            .spawn(move || {
                thread::sleep(config.warmup);
                Self::arm_session(&registry, &session, &config, epoch);
            })
            .expect("failed to spawn warm-up thread");

        Ok(())
    }

    /// Warm-up completion: prepare every streaming camera in parallel,
    /// then commit the survivors together behind a barrier.
    fn arm_session(
        registry: &Arc<CameraRegistry<B>>,
        session: &Arc<Mutex<SessionState>>,
        config: &RecordingConfig,
        epoch: u64,
    ) {
        let timestamp = {
            let state = session.lock();
            if state.epoch != epoch || state.status != SessionStatus::WarmingUp {
                log::info!("warm-up cancelled before cameras were prepared");
                return;
            }
            state.session_timestamp.clone().unwrap_or_default()
        };

        // Phase 1: the slow part (teardown + config negotiation, ~1-3 s
        // per camera) runs concurrently. Cameras that are offline or fail
        // to prepare are dropped; a single-camera session is valid.
        let mut prepare_handles = Vec::new();
        for logical_id in 0..config.logical_cameras {
            let physical_id = registry.physical_for(logical_id);
            let source = registry.get_or_create(physical_id);
            if !source.state().is_live() {
                log::info!(
                    "logical camera {} (physical {}) offline, skipping",
                    logical_id,
                    physical_id
                );
                continue;
            }
            let path = config
                .recordings_dir
                .join(format!("{}_camera{}.bag", timestamp, logical_id + 1));
            prepare_handles.push(
                thread::Builder::new()
                    .name(format!("prepare-cam{logical_id}"))
                    .spawn(move || {
                        let prepared = source.prepare_recording(&path);
                        (logical_id, source, prepared)
                    })
                    .expect("failed to spawn prepare thread"),
            );
        }

        let mut ready = Vec::new();
        for handle in prepare_handles {
            if let Ok((logical_id, source, Some(prepared))) = handle.join() {
                ready.push((logical_id, source, prepared));
            }
        }

        if ready.is_empty() {
            log::error!("no camera prepared successfully, aborting session");
            let mut state = session.lock();
            if state.epoch == epoch {
                state.reset();
            }
            return;
        }

        // Phase 2: the fast part. Every commit thread rendezvous at the
        // barrier after its own preparation is complete, so the device
        // starts land within a tight window.
        let barrier = Arc::new(CommitBarrier::new(ready.len()));
        let mut commit_handles = Vec::new();
        for (logical_id, source, prepared) in ready {
            let barrier = Arc::clone(&barrier);
            let barrier_wait = config.barrier_wait;
            commit_handles.push(
                thread::Builder::new()
                    .name(format!("commit-cam{logical_id}"))
                    .spawn(move || {
                        if barrier.wait(barrier_wait) == BarrierWait::Broken {
                            log::error!(
                                "logical camera {}: commit barrier broken, dropping from session",
                                logical_id
                            );
                            return None;
                        }
                        let path = prepared.path().to_path_buf();
                        if !source.commit_recording(prepared) {
                            return None;
                        }
                        let committed_mono = Instant::now();
                        // The fps actually negotiated by the device may
                        // differ from the prepared candidate.
                        let fps = source.info().profile.map(|p| p.fps).unwrap_or(0);
                        Some((
                            logical_id,
                            source,
                            CameraSlot {
                                raw_path: path,
                                actual_fps: fps,
                                started_at: Local::now(),
                                committed_mono,
                            },
                        ))
                    })
                    .expect("failed to spawn commit thread"),
            );
        }

        let mut committed = Vec::new();
        for handle in commit_handles {
            if let Ok(Some(entry)) = handle.join() {
                committed.push(entry);
            }
        }

        let offset_ms = commit_spread_ms(&committed);

        let mut state = session.lock();
        if state.epoch != epoch || state.status != SessionStatus::WarmingUp {
            drop(state);
            log::info!(
                "session cancelled while committing, stopping {} camera(s)",
                committed.len()
            );
            for (_, source, _) in committed {
                source.stop_recording();
            }
            return;
        }

        if committed.is_empty() {
            log::error!("no camera committed, session aborted");
            state.reset();
            return;
        }

        for (logical_id, _, slot) in committed {
            state.cameras.insert(logical_id, slot);
        }
        state.inter_camera_offset_ms = offset_ms;
        state.status = SessionStatus::Recording;
        state.started_mono = Some(Instant::now());

        log::info!(
            "recording started with {} camera(s), inter-camera offset {}",
            state.cameras.len(),
            offset_ms
                .map(|o| format!("{:.1} ms", o))
                .unwrap_or_else(|| "n/a".into())
        );
    }

    /// Pause the on-device recorder of every session camera. Streaming
    /// keeps running so the operator still sees a live preview.
    pub fn pause(&self) -> Result<(), CaptureError> {
        let cameras = {
            let mut session = self.session.lock();
            if session.status != SessionStatus::Recording {
                return Err(CaptureError::SessionConflict(
                    "no active recording to pause".into(),
                ));
            }
            session.status = SessionStatus::Paused;
            session.cameras.keys().copied().collect::<Vec<_>>()
        };

        for logical_id in cameras {
            let source = self
                .registry
                .get_or_create(self.registry.physical_for(logical_id));
            if !source.pause_recording() {
                log::warn!("logical camera {}: pause failed", logical_id);
            }
        }
        log::info!("recording paused");
        Ok(())
    }

    /// Resume a paused session.
    pub fn resume(&self) -> Result<(), CaptureError> {
        let cameras = {
            let mut session = self.session.lock();
            if session.status != SessionStatus::Paused {
                return Err(CaptureError::SessionConflict(
                    "no paused recording to resume".into(),
                ));
            }
            session.status = SessionStatus::Recording;
            session.cameras.keys().copied().collect::<Vec<_>>()
        };

        for logical_id in cameras {
            let source = self
                .registry
                .get_or_create(self.registry.physical_for(logical_id));
            if !source.resume_recording() {
                log::warn!("logical camera {}: resume failed", logical_id);
            }
        }
        log::info!("recording resumed");
        Ok(())
    }

    /// Stop the session. Valid from any state: already idle and warm-up
    /// cancellation are reported as such without device side effects.
    ///
    /// From `Recording`/`Paused`, every camera is stopped in parallel to
    /// minimize inter-camera stop skew; each camera's hardware-timestamp
    /// bookkeeping is read strictly after its own device-level stop.
    /// Output files are renamed to carry the operator note and one
    /// metadata sidecar is written per camera. The session always ends
    /// `Idle`, even on partial failure.
    pub fn stop(&self, note: &str) -> StopOutcome {
        let (patient_id, cameras, offset_ms) = {
            let mut session = self.session.lock();
            match session.status {
                SessionStatus::Idle => return StopOutcome::AlreadyIdle,
                SessionStatus::WarmingUp => {
                    session.reset();
                    log::info!("warm-up cancelled by stop request");
                    return StopOutcome::CancelledDuringWarmup;
                }
                SessionStatus::Recording | SessionStatus::Paused => {}
            }
            let snapshot = (
                session.patient_id.clone(),
                std::mem::take(&mut session.cameras),
                session.inter_camera_offset_ms,
            );
            session.reset();
            snapshot
        };

        let stopped_at = Local::now();

        let mut stop_handles = Vec::new();
        for (logical_id, slot) in cameras {
            let registry = Arc::clone(&self.registry);
            stop_handles.push(
                thread::Builder::new()
                    .name(format!("stop-cam{logical_id}"))
                    .spawn(move || {
                        let source =
                            registry.get_or_create(registry.physical_for(logical_id));
                        let path = source.stop_recording();
                        let clock = source.recording_clock();
                        (logical_id, slot, path, clock)
                    })
                    .expect("failed to spawn camera stop thread"),
            );
        }

        let note_suffix = sanitize_note(note);
        let mut raw_files = Vec::new();
        let mut sidecars = Vec::new();

        for handle in stop_handles {
            let Ok((logical_id, slot, path, clock)) = handle.join() else {
                continue;
            };
            let Some(path) = path else {
                log::warn!("logical camera {}: no raw file produced", logical_id);
                continue;
            };
            let non_empty = std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
            if !non_empty {
                log::warn!(
                    "logical camera {}: raw file missing or empty: {}",
                    logical_id,
                    path.display()
                );
                continue;
            }

            let final_path = apply_note(&path, &note_suffix);
            let sidecar_path = metadata::sidecar_path(&final_path);
            let view = camera_view(logical_id);
            let file_name = final_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            let quality = offset_ms.map(|o| self.config.sync.classify(o));

            let written = metadata::update_sidecar(&sidecar_path, |meta| {
                meta.patient_id.get_or_insert_with(|| patient_id.clone());
                if !note.trim().is_empty() {
                    meta.note.get_or_insert_with(|| note.trim().to_string());
                }
                meta.camera_view.get_or_insert_with(|| view.to_string());
                meta.fps = Some(slot.actual_fps as f64);
                meta.recording_started_at = Some(slot.started_at.to_rfc3339());
                meta.recording_stopped_at = Some(stopped_at.to_rfc3339());
                meta.inter_camera_offset_ms = offset_ms;
                meta.sync_quality = quality;
                meta.first_hw_timestamp_ms = clock.first_hw_timestamp_ms;
                meta.last_hw_timestamp_ms = clock.last_hw_timestamp_ms;
                meta.hw_timestamp_domain = clock.domain;
                meta.frame_count = Some(clock.frame_count);
                meta.raw_file = file_name.clone();
            });
            match written {
                Ok(()) => sidecars.push(sidecar_path),
                Err(e) => {
                    log::error!("logical camera {}: sidecar write failed: {}", logical_id, e);
                }
            }
            raw_files.push(final_path);
        }

        log::info!("recording stopped, {} raw file(s)", raw_files.len());
        StopOutcome::Stopped {
            raw_files,
            sidecars,
        }
    }

    /// Current session status for external polling.
    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.lock();

        let warmup_remaining_secs = match (session.status, session.warmup_started) {
            (SessionStatus::WarmingUp, Some(started)) => Some(
                self.config
                    .warmup
                    .saturating_sub(started.elapsed())
                    .as_secs_f64(),
            ),
            _ => None,
        };
        let duration_secs = match session.status {
            SessionStatus::Recording | SessionStatus::Paused => {
                session.started_mono.map(|t| t.elapsed().as_secs_f64())
            }
            _ => None,
        };
        let raw_files = session
            .cameras
            .iter()
            .filter_map(|(logical_id, slot)| {
                slot.raw_path
                    .file_name()
                    .map(|n| (format!("camera{}", logical_id + 1), n.to_string_lossy().into_owned()))
            })
            .collect();

        SessionSnapshot {
            status: session.status,
            patient_id: session.patient_id.clone(),
            session_timestamp: session.session_timestamp.clone(),
            duration_secs,
            warmup_remaining_secs,
            raw_files,
            inter_camera_offset_ms: session.inter_camera_offset_ms,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.session.lock().status
    }
}

/// Spread between the earliest and latest commit completion, in
/// milliseconds. Meaningful only once at least two cameras committed.
fn commit_spread_ms<S>(committed: &[(usize, S, CameraSlot)]) -> Option<f64> {
    if committed.len() < 2 {
        return None;
    }
    let times: Vec<Instant> = committed
        .iter()
        .map(|(_, _, slot)| slot.committed_mono)
        .collect();
    match (times.iter().min(), times.iter().max()) {
        (Some(&earliest), Some(&latest)) => {
            Some(latest.duration_since(earliest).as_secs_f64() * 1000.0)
        }
        _ => None,
    }
}

fn camera_view(logical_id: usize) -> &'static str {
    match logical_id {
        0 => "Front",
        1 => "Side",
        _ => "Aux",
    }
}

/// Reduce an operator note to a file-name-safe suffix.
fn sanitize_note(note: &str) -> String {
    note.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(40)
        .collect()
}

/// Rename a raw file to carry the operator note. Falls back to the
/// original path when the rename fails.
fn apply_note(path: &Path, note_suffix: &str) -> PathBuf {
    if note_suffix.is_empty() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("recording");
    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("bag");
    let renamed = path.with_file_name(format!("{stem}_{note_suffix}.{extension}"));
    match std::fs::rename(path, &renamed) {
        Ok(()) => renamed,
        Err(e) => {
            log::warn!(
                "could not rename {} to include note: {}",
                path.display(),
                e
            );
            path.to_path_buf()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_sanitization() {
        assert_eq!(sanitize_note("baseline walk"), "baseline-walk");
        assert_eq!(sanitize_note("  trial #2 (fast)  "), "trial-2-fast");
        assert_eq!(sanitize_note(""), "");
        assert_eq!(sanitize_note("///"), "");
    }

    #[test]
    fn note_longer_than_limit_is_truncated() {
        let long = "x".repeat(120);
        assert_eq!(sanitize_note(&long).len(), 40);
    }

    #[test]
    fn camera_views_follow_logical_ids() {
        assert_eq!(camera_view(0), "Front");
        assert_eq!(camera_view(1), "Side");
    }

    #[test]
    fn commit_spread_needs_two_cameras() {
        let now = Instant::now();
        let slot = |at: Instant| CameraSlot {
            raw_path: PathBuf::from("a.bag"),
            actual_fps: 30,
            started_at: Local::now(),
            committed_mono: at,
        };
        let one = vec![(0usize, (), slot(now))];
        assert_eq!(commit_spread_ms(&one), None);

        let later = now + std::time::Duration::from_millis(40);
        let two = vec![(0usize, (), slot(now)), (1usize, (), slot(later))];
        let spread = commit_spread_ms(&two).unwrap();
        approx::assert_abs_diff_eq!(spread, 40.0, epsilon = 1.0);
    }
}
