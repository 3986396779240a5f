use std::collections::HashMap;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::state::{JobStatus, SlotStatus};

/// Per-camera slot of a conversion job.
#[derive(Debug, Clone, Serialize)]
pub struct SlotState {
    pub enabled: bool,
    pub status: SlotStatus,
    pub progress_percent: u8,
    pub frames_written: u64,
    pub total_frames: u64,
    pub encoder: Option<String>,
    pub error: Option<String>,
    pub output_file: Option<String>,
    pub output_size_mb: Option<f64>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            enabled: true,
            status: SlotStatus::Pending,
            progress_percent: 0,
            frames_written: 0,
            total_frames: 0,
            encoder: None,
            error: None,
            output_file: None,
            output_size_mb: None,
        }
    }
}

/// One conversion job: a batch of up to two per-camera conversions that
/// run in parallel. Jobs are retained for status polling and never
/// auto-deleted.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionJob {
    pub job_id: String,
    pub batch_id: String,
    pub status: JobStatus,
    pub force: bool,
    pub created_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub camera1: Option<SlotState>,
    pub camera2: Option<SlotState>,
    pub cancelled: bool,
}

impl ConversionJob {
    pub fn slot(&self, camera: u8) -> Option<&SlotState> {
        match camera {
            1 => self.camera1.as_ref(),
            2 => self.camera2.as_ref(),
            _ => None,
        }
    }

    fn slot_mut(&mut self, camera: u8) -> Option<&mut SlotState> {
        match camera {
            1 => self.camera1.as_mut(),
            2 => self.camera2.as_mut(),
            _ => None,
        }
    }
}

/// Process-wide conversion job table.
pub struct JobTable {
    jobs: Mutex<HashMap<String, ConversionJob>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new job. Returns its id.
    pub fn create(&self, batch_id: &str, has_cam1: bool, has_cam2: bool, force: bool) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        let job = ConversionJob {
            job_id: job_id.clone(),
            batch_id: batch_id.to_string(),
            status: JobStatus::Pending,
            force,
            created_at: Local::now(),
            completed_at: None,
            camera1: has_cam1.then(SlotState::new),
            camera2: has_cam2.then(SlotState::new),
            cancelled: false,
        };
        self.jobs.lock().insert(job_id.clone(), job);
        job_id
    }

    pub fn get(&self, job_id: &str) -> Option<ConversionJob> {
        self.jobs.lock().get(job_id).cloned()
    }

    /// All jobs, newest first.
    pub fn all(&self) -> Vec<ConversionJob> {
        let mut jobs: Vec<_> = self.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Signal cancellation. Returns `false` when the job does not exist.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return false;
        };
        job.cancelled = true;
        if matches!(job.status, JobStatus::Pending | JobStatus::Converting) {
            job.status = JobStatus::Cancelled;
        }
        true
    }

    /// Polled at frame granularity during replay/encode, so cancellation
    /// latency is at most one frame's processing time.
    pub fn is_cancelled(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .get(job_id)
            .map(|job| job.cancelled)
            .unwrap_or(true)
    }

    /// Whether a conversion is already running for this batch. Callers
    /// check this before creating a second job for the same batch.
    pub fn is_batch_converting(&self, batch_id: &str) -> Option<String> {
        self.jobs
            .lock()
            .values()
            .find(|job| job.batch_id == batch_id && job.status == JobStatus::Converting)
            .map(|job| job.job_id.clone())
    }

    /// Transition a pending job to `Converting`, returning a snapshot for
    /// the supervisor thread.
    pub(crate) fn begin(&self, job_id: &str) -> Option<ConversionJob> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(job_id)?;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Converting;
        }
        Some(job.clone())
    }

    pub(crate) fn update_slot(&self, job_id: &str, camera: u8, apply: impl FnOnce(&mut SlotState)) {
        let mut jobs = self.jobs.lock();
        if let Some(slot) = jobs.get_mut(job_id).and_then(|job| job.slot_mut(camera)) {
            apply(slot);
        }
    }

    /// Compute the final job status once every slot thread has joined:
    /// `Cancelled` wins, then `Failed` if any slot failed, else `Done`.
    pub(crate) fn finalize(&self, job_id: &str) {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };
        if job.cancelled {
            job.status = JobStatus::Cancelled;
        } else {
            let any_failed = [&job.camera1, &job.camera2]
                .into_iter()
                .flatten()
                .any(|slot| slot.status == SlotStatus::Failed);
            job.status = if any_failed {
                JobStatus::Failed
            } else {
                JobStatus::Done
            };
        }
        job.completed_at = Some(Local::now());
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_lookup() {
        let table = JobTable::new();
        let id = table.create("2026-02-17_12-30-45", true, false, false);

        let job = table.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.camera1.is_some());
        assert!(job.camera2.is_none());
        assert!(table.get("no-such-job").is_none());
    }

    #[test]
    fn cancel_marks_job_and_flag() {
        let table = JobTable::new();
        let id = table.create("batch", true, true, false);

        assert!(table.cancel(&id));
        assert!(table.is_cancelled(&id));
        assert_eq!(table.get(&id).unwrap().status, JobStatus::Cancelled);
        assert!(!table.cancel("no-such-job"));
    }

    #[test]
    fn unknown_job_reads_as_cancelled() {
        let table = JobTable::new();
        assert!(table.is_cancelled("gone"));
    }

    #[test]
    fn finalize_failed_when_any_slot_failed() {
        let table = JobTable::new();
        let id = table.create("batch", true, true, false);
        table.begin(&id);

        table.update_slot(&id, 1, |slot| slot.status = SlotStatus::Done);
        table.update_slot(&id, 2, |slot| slot.status = SlotStatus::Failed);
        table.finalize(&id);

        let job = table.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn finalize_done_when_slots_done_or_skipped() {
        let table = JobTable::new();
        let id = table.create("batch", true, true, false);
        table.begin(&id);

        table.update_slot(&id, 1, |slot| slot.status = SlotStatus::Done);
        table.update_slot(&id, 2, |slot| slot.status = SlotStatus::Skipped);
        table.finalize(&id);

        assert_eq!(table.get(&id).unwrap().status, JobStatus::Done);
    }

    #[test]
    fn batch_converting_guard() {
        let table = JobTable::new();
        let id = table.create("batch-a", true, false, false);
        assert!(table.is_batch_converting("batch-a").is_none());

        table.begin(&id);
        assert_eq!(table.is_batch_converting("batch-a"), Some(id));
        assert!(table.is_batch_converting("batch-b").is_none());
    }
}
