//! End-to-end recording sessions against the synthetic backend: startup,
//! two-phase synchronized start, orphan handling, pause/resume,
//! cancellation, and sidecar contents.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gait_capture_core::{
    read_sidecar, CameraRegistry, CameraState, CaptureConfig, RecordingConfig,
    RecordingOrchestrator, SessionStatus, StopOutcome, StreamProfile, SyncThresholds,
};
use gait_capture_sim::{two_camera_rig, SimBackend, SimDevice};

const PROFILE_60: StreamProfile = StreamProfile::new(16, 12, 60);
const PROFILE_30: StreamProfile = StreamProfile::new(16, 12, 30);

fn capture_config() -> CaptureConfig {
    CaptureConfig {
        multi_cam_profiles: vec![PROFILE_60, PROFILE_30],
        single_cam_profiles: vec![PROFILE_60, PROFILE_30],
        poll_timeout: Duration::from_millis(50),
        stale_after: Duration::from_secs(2),
        join_timeout: Duration::from_secs(1),
        queue_depth: 16,
        timeout_log_period: 30,
        stagger_delay: Duration::ZERO,
        usb_settle: Duration::from_millis(10),
    }
}

fn recording_config(dir: &Path, warmup: Duration) -> RecordingConfig {
    RecordingConfig {
        recordings_dir: dir.to_path_buf(),
        warmup,
        barrier_wait: Duration::from_secs(2),
        logical_cameras: 2,
        sync: SyncThresholds::default(),
    }
}

struct Rig {
    backend: Arc<SimBackend>,
    registry: Arc<CameraRegistry<SimBackend>>,
    orchestrator: RecordingOrchestrator<SimBackend>,
}

fn rig(dir: &Path, cameras: usize, warmup: Duration) -> Rig {
    let backend = Arc::new(match cameras {
        2 => two_camera_rig(vec![PROFILE_60, PROFILE_30]),
        n => SimBackend::new(
            (0..n)
                .map(|i| {
                    SimDevice::new(&format!("SIM-{:04}", i + 1))
                        .with_profiles(vec![PROFILE_60, PROFILE_30])
                })
                .collect(),
        ),
    });
    let registry =
        Arc::new(CameraRegistry::new(Arc::clone(&backend), capture_config()).unwrap());
    let orchestrator =
        RecordingOrchestrator::new(Arc::clone(&registry), recording_config(dir, warmup)).unwrap();
    Rig {
        backend,
        registry,
        orchestrator,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn start_streaming(rig: &Rig, cameras: usize) {
    rig.registry.startup_all();
    assert!(
        wait_until(Duration::from_secs(3), || {
            (0..cameras).all(|id| rig.registry.get_or_create(id).state().is_live())
        }),
        "cameras did not start streaming"
    );
}

#[test]
fn two_camera_synchronized_session() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), 2, Duration::from_millis(100));
    start_streaming(&rig, 2);

    rig.orchestrator.start("P-001").unwrap();
    // A second start while warming up is a conflict.
    assert!(rig.orchestrator.start("P-002").is_err());

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.orchestrator.status() == SessionStatus::Recording
        }),
        "session never reached recording"
    );

    let snapshot = rig.orchestrator.snapshot();
    assert_eq!(snapshot.raw_files.len(), 2);
    assert!(snapshot.raw_files.contains_key("camera1"));
    assert!(snapshot.raw_files.contains_key("camera2"));
    let offset = snapshot.inter_camera_offset_ms.expect("offset not measured");
    assert!(offset >= 0.0);
    assert!(offset < 1000.0, "commit spread unexpectedly large: {offset}");

    // Preview stays readable while recording.
    assert!(rig.registry.get_or_create(0).read().is_some());

    thread::sleep(Duration::from_millis(300));

    let outcome = rig.orchestrator.stop("baseline walk");
    let StopOutcome::Stopped {
        raw_files,
        sidecars,
    } = outcome.clone()
    else {
        panic!("unexpected stop outcome: {outcome:?}");
    };
    assert_eq!(raw_files.len(), 2);
    assert_eq!(sidecars.len(), 2);
    assert_eq!(rig.orchestrator.status(), SessionStatus::Idle);

    let mut views = Vec::new();
    for (raw, sidecar) in raw_files.iter().zip(&sidecars) {
        let name = raw.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("baseline-walk"), "note missing from {name}");
        assert!(std::fs::metadata(raw).unwrap().len() > 0);

        let meta = read_sidecar(sidecar);
        assert_eq!(meta.patient_id.as_deref(), Some("P-001"));
        assert_eq!(meta.note.as_deref(), Some("baseline walk"));
        assert_eq!(meta.fps, Some(60.0));
        assert!(meta.frame_count.unwrap() > 0);
        assert!(meta.first_hw_timestamp_ms.is_some());
        assert!(meta.last_hw_timestamp_ms.unwrap() >= meta.first_hw_timestamp_ms.unwrap());
        assert!(meta.inter_camera_offset_ms.is_some());
        assert!(meta.sync_quality.is_some());
        assert_eq!(meta.raw_file.as_deref(), Some(name.as_str()));
        views.push(meta.camera_view.unwrap());
    }
    views.sort();
    assert_eq!(views, vec!["Front".to_string(), "Side".to_string()]);

    // Streaming resumed for live preview after the recording stopped.
    assert!(wait_until(Duration::from_secs(2), || {
        (0..2).all(|id| rig.registry.get_or_create(id).state() == CameraState::Streaming)
    }));
}

#[test]
fn orphan_session_with_single_camera() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), 1, Duration::from_millis(50));
    start_streaming(&rig, 1);

    rig.orchestrator.start("P-002").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        rig.orchestrator.status() == SessionStatus::Recording
    }));

    let snapshot = rig.orchestrator.snapshot();
    assert_eq!(snapshot.raw_files.len(), 1);
    assert!(snapshot.inter_camera_offset_ms.is_none());

    thread::sleep(Duration::from_millis(150));

    let StopOutcome::Stopped {
        raw_files,
        sidecars,
    } = rig.orchestrator.stop("")
    else {
        panic!("expected a stopped session");
    };
    assert_eq!(raw_files.len(), 1);

    let meta = read_sidecar(&sidecars[0]);
    assert!(meta.inter_camera_offset_ms.is_none());
    assert!(meta.sync_quality.is_none());
    assert_eq!(meta.camera_view.as_deref(), Some("Front"));
}

#[test]
fn camera_that_fails_prepare_is_dropped_from_session() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), 2, Duration::from_millis(50));
    start_streaming(&rig, 2);

    // The second camera streams fine but can no longer resolve any
    // recording configuration.
    rig.backend.reject_profile("SIM-0002", 60);
    rig.backend.reject_profile("SIM-0002", 30);

    rig.orchestrator.start("P-003").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        rig.orchestrator.status() == SessionStatus::Recording
    }));

    let snapshot = rig.orchestrator.snapshot();
    assert_eq!(snapshot.raw_files.len(), 1);
    assert!(snapshot.raw_files.contains_key("camera1"));
    assert!(snapshot.inter_camera_offset_ms.is_none());

    let StopOutcome::Stopped { raw_files, .. } = rig.orchestrator.stop("") else {
        panic!("expected a stopped session");
    };
    assert_eq!(raw_files.len(), 1);
}

#[test]
fn negotiation_falls_back_to_lower_frame_rate() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), 2, Duration::from_millis(50));

    // 60 fps is rejected for the second camera before anything starts,
    // so both streaming and recording negotiate down to 30 fps there.
    rig.backend.reject_profile("SIM-0002", 60);
    start_streaming(&rig, 2);

    rig.orchestrator.start("P-004").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        rig.orchestrator.status() == SessionStatus::Recording
    }));
    thread::sleep(Duration::from_millis(200));

    let StopOutcome::Stopped { sidecars, .. } = rig.orchestrator.stop("") else {
        panic!("expected a stopped session");
    };
    assert_eq!(sidecars.len(), 2);

    let mut fps_by_view = std::collections::BTreeMap::new();
    for sidecar in &sidecars {
        let meta = read_sidecar(sidecar);
        fps_by_view.insert(meta.camera_view.unwrap(), meta.fps.unwrap());
    }
    assert_eq!(fps_by_view.get("Front"), Some(&60.0));
    assert_eq!(fps_by_view.get("Side"), Some(&30.0));
}

#[test]
fn stop_during_warmup_cancels_without_device_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), 2, Duration::from_millis(500));
    start_streaming(&rig, 2);

    rig.orchestrator.start("P-005").unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        rig.orchestrator.stop("ignored"),
        StopOutcome::CancelledDuringWarmup
    );

    // Even after the warm-up timer would have fired, nothing records.
    thread::sleep(Duration::from_millis(700));
    assert_eq!(rig.orchestrator.status(), SessionStatus::Idle);

    let raw_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "bag"))
        .collect();
    assert!(raw_files.is_empty(), "warm-up cancellation left raw files");

    // Cameras are still streaming, untouched.
    assert_eq!(
        rig.registry.get_or_create(0).state(),
        CameraState::Streaming
    );
}

#[test]
fn stop_when_idle_reports_already_idle() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), 2, Duration::from_millis(50));
    assert_eq!(rig.orchestrator.stop(""), StopOutcome::AlreadyIdle);
    assert_eq!(rig.orchestrator.stop(""), StopOutcome::AlreadyIdle);
}

#[test]
fn pause_and_resume_keep_preview_alive() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), 2, Duration::from_millis(50));
    start_streaming(&rig, 2);

    rig.orchestrator.start("P-006").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        rig.orchestrator.status() == SessionStatus::Recording
    }));

    // Pause is only valid from recording, resume only from paused.
    assert!(rig.orchestrator.resume().is_err());
    rig.orchestrator.pause().unwrap();
    assert_eq!(rig.orchestrator.status(), SessionStatus::Paused);
    assert!(rig.orchestrator.pause().is_err());

    assert_eq!(rig.registry.get_or_create(0).state(), CameraState::Paused);
    // The capture session keeps running while paused.
    assert!(wait_until(Duration::from_secs(1), || {
        rig.registry.get_or_create(0).read().is_some()
    }));

    rig.orchestrator.resume().unwrap();
    assert_eq!(rig.orchestrator.status(), SessionStatus::Recording);
    thread::sleep(Duration::from_millis(100));

    let StopOutcome::Stopped { sidecars, .. } = rig.orchestrator.stop("paused trial") else {
        panic!("expected a stopped session");
    };
    let meta = read_sidecar(&sidecars[0]);
    assert!(meta.frame_count.unwrap() > 0);
}
