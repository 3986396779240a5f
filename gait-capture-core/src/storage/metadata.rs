use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models::config::SyncQuality;
use crate::models::error::CaptureError;
use crate::models::frame::TimestampDomain;

/// Metadata sidecar stored next to each raw recording.
///
/// One JSON file per camera per batch, progressively enriched: the
/// recording orchestrator writes the capture fields, the conversion
/// pipeline later fills the playback fields, and downstream analytics add
/// their own. Every stage merges through [`update_sidecar`] and only sets
/// fields it owns (or absent ones), so no stage clobbers another stage's
/// data. Fields this crate does not know about are preserved verbatim via
/// the flattened `extra` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSidecar {
    pub patient_id: Option<String>,
    pub note: Option<String>,
    /// "Front" or "Side" view label derived from the logical camera id.
    pub camera_view: Option<String>,
    pub fps: Option<f64>,
    pub recording_started_at: Option<String>,
    pub recording_stopped_at: Option<String>,
    pub inter_camera_offset_ms: Option<f64>,
    pub sync_quality: Option<SyncQuality>,
    pub first_hw_timestamp_ms: Option<f64>,
    pub last_hw_timestamp_ms: Option<f64>,
    pub hw_timestamp_domain: Option<TimestampDomain>,
    pub frame_count: Option<u64>,
    pub raw_file: Option<String>,

    // Filled by the conversion pipeline.
    pub playback_file: Option<String>,
    pub playback_frames: Option<u64>,
    pub encoder: Option<String>,
    pub converted_at: Option<String>,
    pub conversion_secs: Option<f64>,

    /// Fields owned by downstream stages (tagging, analytics) pass
    /// through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Sidecar path for a raw recording: `<stem>_metadata.json` beside it.
pub fn sidecar_path(raw_path: &Path) -> PathBuf {
    let stem = raw_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("recording");
    raw_path.with_file_name(format!("{stem}_metadata.json"))
}

/// Load a sidecar, tolerating a missing or corrupt file (a corrupt
/// sidecar is logged and treated as empty rather than blocking the
/// recording workflow).
pub fn read_sidecar(path: &Path) -> RecordingSidecar {
    let Ok(json) = fs::read_to_string(path) else {
        return RecordingSidecar::default();
    };
    match serde_json::from_str(&json) {
        Ok(sidecar) => sidecar,
        Err(e) => {
            log::warn!("corrupt metadata sidecar {}: {}", path.display(), e);
            RecordingSidecar::default()
        }
    }
}

/// Read-modify-write a sidecar. `apply` mutates the loaded (or empty)
/// sidecar; stages use `Option::get_or_insert_with` for fields they do
/// not own.
pub fn update_sidecar(
    path: &Path,
    apply: impl FnOnce(&mut RecordingSidecar),
) -> Result<(), CaptureError> {
    let mut sidecar = read_sidecar(path);
    apply(&mut sidecar);
    let json = serde_json::to_string_pretty(&sidecar)
        .map_err(|e| CaptureError::StorageError(format!("failed to serialize sidecar: {}", e)))?;
    fs::write(path, json)
        .map_err(|e| CaptureError::StorageError(format!("failed to write sidecar: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_path_is_derived_from_stem() {
        let path = sidecar_path(Path::new("/data/2026-02-17_12-30-45_camera1.bag"));
        assert_eq!(
            path,
            PathBuf::from("/data/2026-02-17_12-30-45_camera1_metadata.json")
        );
    }

    #[test]
    fn missing_sidecar_reads_empty() {
        let sidecar = read_sidecar(Path::new("/nonexistent/metadata.json"));
        assert_eq!(sidecar, RecordingSidecar::default());
    }

    #[test]
    fn update_preserves_fields_of_other_stages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_camera1_metadata.json");

        update_sidecar(&path, |meta| {
            meta.patient_id = Some("P-007".into());
            meta.fps = Some(60.0);
            meta.frame_count = Some(1234);
        })
        .unwrap();

        // A later stage fills its own fields without touching the rest.
        update_sidecar(&path, |meta| {
            meta.patient_id.get_or_insert_with(|| "clobbered".into());
            meta.playback_file = Some("clip_camera1.mp4".into());
            meta.playback_frames = Some(1200);
        })
        .unwrap();

        let sidecar = read_sidecar(&path);
        assert_eq!(sidecar.patient_id.as_deref(), Some("P-007"));
        assert_eq!(sidecar.fps, Some(60.0));
        assert_eq!(sidecar.frame_count, Some(1234));
        assert_eq!(sidecar.playback_file.as_deref(), Some("clip_camera1.mp4"));
    }

    #[test]
    fn unknown_fields_survive_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip_camera2_metadata.json");

        // A downstream stage wrote fields this crate does not model.
        std::fs::write(
            &path,
            r#"{"patient_id": "P-001", "gait_speed_mps": 1.12, "tags": ["turn", "stop"]}"#,
        )
        .unwrap();

        update_sidecar(&path, |meta| {
            meta.fps = Some(30.0);
        })
        .unwrap();

        let sidecar = read_sidecar(&path);
        assert_eq!(sidecar.patient_id.as_deref(), Some("P-001"));
        assert_eq!(sidecar.fps, Some(30.0));
        assert_eq!(
            sidecar.extra.get("gait_speed_mps"),
            Some(&serde_json::json!(1.12))
        );
        assert_eq!(
            sidecar.extra.get("tags"),
            Some(&serde_json::json!(["turn", "stop"]))
        );
    }

    #[test]
    fn corrupt_sidecar_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken_metadata.json");
        std::fs::write(&path, "{not json").unwrap();

        let sidecar = read_sidecar(&path);
        assert_eq!(sidecar, RecordingSidecar::default());
    }
}
