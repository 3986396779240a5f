use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Local;

use crate::conversion::encoder::{FfprobeProbe, FrameSink, OutputProbe};
use crate::conversion::job::JobTable;
use crate::models::config::{ConversionConfig, EncoderCandidate};
use crate::models::error::CaptureError;
use crate::models::state::SlotStatus;
use crate::storage::metadata;
use crate::traits::device::{DeviceBackend, DevicePipeline, PollResult, StreamRequest, StreamSource};

/// Background job system converting raw recordings to playback files.
///
/// Each job runs one thread per enabled camera slot; slots replay the raw
/// recording through the backend's playback pipeline and pipe decoded
/// frames to an encoder subprocess, falling through the encoder priority
/// list until one produces a valid output. A failed or cancelled slot
/// never leaves a partial file on disk; outputs are published by atomic
/// rename only after frame-count validation.
pub struct ConversionPipeline<B: DeviceBackend> {
    backend: Arc<B>,
    config: ConversionConfig,
    jobs: Arc<JobTable>,
    probe: Arc<dyn OutputProbe>,
}

impl<B: DeviceBackend> ConversionPipeline<B> {
    pub fn new(backend: Arc<B>, config: ConversionConfig) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;
        let probe: Arc<dyn OutputProbe> = Arc::new(FfprobeProbe::new(config.ffprobe.clone()));
        Ok(Self {
            backend,
            config,
            jobs: Arc::new(JobTable::new()),
            probe,
        })
    }

    /// Swap the output frame counter (deployments without ffprobe,
    /// tests).
    pub fn with_probe(mut self, probe: Arc<dyn OutputProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// The job table, for status polling and cancellation.
    pub fn jobs(&self) -> Arc<JobTable> {
        Arc::clone(&self.jobs)
    }

    pub fn create_job(
        &self,
        batch_id: &str,
        has_cam1: bool,
        has_cam2: bool,
        force: bool,
    ) -> String {
        self.jobs.create(batch_id, has_cam1, has_cam2, force)
    }

    /// Launch the job's per-camera conversion threads. Both cameras of a
    /// batch run in parallel; the returned handle joins once the job
    /// reached its final status.
    pub fn start(&self, job_id: &str) -> Result<thread::JoinHandle<()>, CaptureError> {
        let job = self.jobs.begin(job_id).ok_or(CaptureError::JobNotFound)?;
        log::info!(
            "conversion job {}: starting batch {}",
            short_id(&job.job_id),
            job.batch_id
        );

        let backend = Arc::clone(&self.backend);
        let config = self.config.clone();
        let jobs = Arc::clone(&self.jobs);
        let probe = Arc::clone(&self.probe);

        let handle = thread::Builder::new()
            .name(format!("convert-{}", short_id(&job.job_id)))
            .spawn(move || {
                let mut slot_handles = Vec::new();
                for camera in [1u8, 2u8] {
                    if job.slot(camera).is_none() {
                        continue;
                    }
                    let backend = Arc::clone(&backend);
                    let config = config.clone();
                    let jobs = Arc::clone(&jobs);
                    let probe = Arc::clone(&probe);
                    let job_id = job.job_id.clone();
                    let batch_id = job.batch_id.clone();
                    let force = job.force;
                    slot_handles.push(
                        thread::Builder::new()
                            .name(format!("convert-cam{camera}"))
                            .spawn(move || {
                                SlotTask {
                                    backend: &*backend,
                                    config: &config,
                                    jobs: &jobs,
                                    probe: &*probe,
                                    job_id: &job_id,
                                    camera,
                                    batch_id: &batch_id,
                                    force,
                                }
                                .run();
                            })
                            .expect("failed to spawn conversion thread"),
                    );
                }
                for handle in slot_handles {
                    let _ = handle.join();
                }
                jobs.finalize(&job.job_id);
                let status = jobs.get(&job.job_id).map(|j| j.status);
                log::info!(
                    "conversion job {}: finished ({:?})",
                    short_id(&job.job_id),
                    status
                );
            })
            .expect("failed to spawn conversion supervisor thread");

        Ok(handle)
    }
}

/// One camera slot's conversion, run on its own thread.
struct SlotTask<'a, B: DeviceBackend> {
    backend: &'a B,
    config: &'a ConversionConfig,
    jobs: &'a JobTable,
    probe: &'a dyn OutputProbe,
    job_id: &'a str,
    camera: u8,
    batch_id: &'a str,
    force: bool,
}

enum ReplayOutcome {
    Completed(u64),
    Cancelled,
}

impl<B: DeviceBackend> SlotTask<'_, B> {
    fn run(&self) {
        let camera_key = format!("camera{}", self.camera);

        // Stop renames raw files to carry the operator note, so resolve
        // by batch prefix rather than exact name. Playback file and
        // sidecar share the raw recording's stem.
        let Some(raw_path) =
            locate_raw(&self.config.recordings_dir, self.batch_id, self.camera)
        else {
            self.fail(format!(
                "raw recording not found: {}_{}.bag",
                self.batch_id, camera_key
            ));
            return;
        };
        let out_path = raw_path.with_extension("mp4");
        let temp_path = raw_path.with_extension("mp4.converting");
        let sidecar_path = metadata::sidecar_path(&raw_path);

        if out_path.exists() && !self.force {
            log::info!("{}: playback file already exists, skipping", camera_key);
            let existing_frames = self.probe.count_frames(&out_path).unwrap_or(0);
            let out_name = file_name(&out_path);
            self.update(|slot| {
                slot.status = SlotStatus::Skipped;
                slot.progress_percent = 100;
                slot.frames_written = existing_frames;
                slot.output_file = Some(out_name.clone());
            });
            let merged = metadata::update_sidecar(&sidecar_path, |meta| {
                meta.playback_file.get_or_insert_with(|| out_name.clone());
                if existing_frames > 0 {
                    meta.playback_frames.get_or_insert(existing_frames);
                }
            });
            if let Err(e) = merged {
                log::warn!("{}: sidecar update failed: {}", camera_key, e);
            }
            return;
        }

        self.update(|slot| {
            slot.status = SlotStatus::Converting;
            slot.progress_percent = 0;
        });

        // Fast non-real-time pass, used only for progress-percentage
        // math, never for validation.
        log::info!("{}: counting raw frames", camera_key);
        let total_frames = count_raw_frames(self.backend, self.config, &raw_path);
        log::info!("{}: {} frames in raw recording", camera_key, total_frames);
        self.update(|slot| slot.total_frames = total_frames);

        if self.cancelled() {
            self.update(|slot| slot.status = SlotStatus::Cancelled);
            return;
        }

        let conversion_started = Instant::now();

        for candidate in &self.config.encoders {
            if self.cancelled() {
                cleanup_temp(&temp_path);
                self.update(|slot| slot.status = SlotStatus::Cancelled);
                return;
            }

            cleanup_temp(&temp_path);
            log::info!("{}: trying encoder {}", camera_key, candidate.name);
            self.update(|slot| {
                slot.encoder = Some(candidate.name.clone());
                slot.frames_written = 0;
            });

            let frames_written = match self.replay_to_sink(&raw_path, candidate, &temp_path, total_frames)
            {
                Ok(ReplayOutcome::Cancelled) => {
                    cleanup_temp(&temp_path);
                    self.update(|slot| slot.status = SlotStatus::Cancelled);
                    return;
                }
                Err(e) => {
                    log::warn!("{}: encoder {} failed: {}", camera_key, candidate.name, e);
                    cleanup_temp(&temp_path);
                    continue;
                }
                Ok(ReplayOutcome::Completed(frames)) => frames,
            };

            let output_bytes = fs::metadata(&temp_path).map(|m| m.len()).unwrap_or(0);
            if output_bytes == 0 {
                log::warn!("{}: output missing or empty ({})", camera_key, candidate.name);
                cleanup_temp(&temp_path);
                continue;
            }

            let output_frames = self.probe.count_frames(&temp_path).unwrap_or(0);
            let required = (total_frames as f64 * self.config.min_frame_ratio) as u64;
            if total_frames > 0 && output_frames < required {
                log::warn!(
                    "{}: frame validation failed ({}/{} via {})",
                    camera_key,
                    output_frames,
                    total_frames,
                    candidate.name
                );
                cleanup_temp(&temp_path);
                continue;
            }

            // Publish: atomic rename over any previous output.
            if out_path.exists() {
                let _ = fs::remove_file(&out_path);
            }
            if let Err(e) = fs::rename(&temp_path, &out_path) {
                cleanup_temp(&temp_path);
                self.fail(format!("failed to publish output: {}", e));
                return;
            }

            let size_mb = fs::metadata(&out_path)
                .map(|m| m.len() as f64 / (1024.0 * 1024.0))
                .unwrap_or(0.0);
            let size_mb = (size_mb * 10.0).round() / 10.0;
            let out_name = file_name(&out_path);

            self.update(|slot| {
                slot.status = SlotStatus::Done;
                slot.progress_percent = 100;
                slot.frames_written = frames_written;
                slot.output_file = Some(out_name.clone());
                slot.output_size_mb = Some(size_mb);
            });

            let encoder_name = candidate.name.clone();
            let raw_name = file_name(&raw_path);
            let elapsed_secs = conversion_started.elapsed().as_secs_f64();
            let merged = metadata::update_sidecar(&sidecar_path, |meta| {
                meta.playback_file = Some(out_name.clone());
                meta.playback_frames = Some(output_frames);
                meta.encoder = Some(encoder_name);
                meta.converted_at = Some(Local::now().to_rfc3339());
                meta.conversion_secs = Some((elapsed_secs * 10.0).round() / 10.0);
                meta.raw_file.get_or_insert(raw_name);
            });
            if let Err(e) = merged {
                log::warn!("{}: sidecar update failed: {}", camera_key, e);
            }

            log::info!(
                "{}: done, {} frames -> {} ({:.1} MB, {})",
                camera_key,
                frames_written,
                out_name,
                size_mb,
                candidate.name
            );
            return;
        }

        cleanup_temp(&temp_path);
        self.fail("all encoders failed".into());
    }

    /// Replay the raw recording, piping every decoded color frame to the
    /// encoder subprocess. The cancellation flag is polled between
    /// frames.
    fn replay_to_sink(
        &self,
        raw_path: &Path,
        candidate: &EncoderCandidate,
        temp_path: &Path,
        total_frames: u64,
    ) -> Result<ReplayOutcome, CaptureError> {
        let request = playback_request(raw_path);
        let mut pipeline = self.backend.open(&request)?;
        let profile = pipeline.profile();
        log::info!(
            "camera{}: raw stream {} via {}",
            self.camera,
            profile,
            candidate.name
        );

        let mut sink = FrameSink::spawn(&self.config.ffmpeg, candidate, profile, temp_path)?;
        let mut last_report = Instant::now();

        loop {
            if self.cancelled() {
                pipeline.stop();
                sink.abort();
                return Ok(ReplayOutcome::Cancelled);
            }

            match pipeline.poll_frames(self.config.replay_poll) {
                Ok(PollResult::Frame(frames)) => {
                    if let Err(write_err) = sink.write_frame(&frames.color) {
                        pipeline.stop();
                        // The encoder likely died; its stderr is the
                        // useful diagnostic.
                        return Err(match sink.finish() {
                            Err(finish_err) => finish_err,
                            Ok(()) => write_err,
                        });
                    }
                    if last_report.elapsed() >= self.config.progress_interval {
                        let written = sink.frames_written();
                        let percent = if total_frames > 0 {
                            (written.saturating_mul(100) / total_frames).min(99) as u8
                        } else {
                            0
                        };
                        self.update(|slot| {
                            slot.frames_written = written;
                            slot.progress_percent = percent;
                        });
                        last_report = Instant::now();
                    }
                }
                Ok(PollResult::TimedOut) | Ok(PollResult::EndOfStream) => break,
                Err(e) => {
                    pipeline.stop();
                    sink.abort();
                    return Err(e);
                }
            }
        }

        pipeline.stop();
        let written = sink.frames_written();
        sink.finish()?;
        Ok(ReplayOutcome::Completed(written))
    }

    fn cancelled(&self) -> bool {
        self.jobs.is_cancelled(self.job_id)
    }

    fn update(&self, apply: impl FnOnce(&mut crate::conversion::job::SlotState)) {
        self.jobs.update_slot(self.job_id, self.camera, apply);
    }

    fn fail(&self, message: String) {
        log::error!("camera{}: {}", self.camera, message);
        self.update(move |slot| {
            slot.status = SlotStatus::Failed;
            slot.error = Some(message);
        });
    }
}

/// Count color frames by replaying the raw recording at non-real-time
/// speed. Returns 0 when the file cannot be opened.
fn count_raw_frames<B: DeviceBackend>(
    backend: &B,
    config: &ConversionConfig,
    raw_path: &Path,
) -> u64 {
    let request = playback_request(raw_path);
    let mut pipeline = match backend.open(&request) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            log::warn!("frame count failed for {}: {}", raw_path.display(), e);
            return 0;
        }
    };

    let mut count = 0u64;
    loop {
        match pipeline.poll_frames(config.replay_poll) {
            Ok(PollResult::Frame(_)) => count += 1,
            Ok(PollResult::TimedOut) | Ok(PollResult::EndOfStream) => break,
            Err(e) => {
                log::warn!("frame count aborted for {}: {}", raw_path.display(), e);
                break;
            }
        }
    }
    pipeline.stop();
    count
}

/// Find a camera's raw recording within a batch: exact name first, then
/// any note-suffixed file sharing the batch prefix.
fn locate_raw(dir: &Path, batch_id: &str, camera: u8) -> Option<PathBuf> {
    let exact = dir.join(format!("{batch_id}_camera{camera}.bag"));
    if exact.exists() {
        return Some(exact);
    }

    let prefix = format!("{batch_id}_camera{camera}");
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(".bag") {
            return Some(path);
        }
    }
    None
}

fn playback_request(raw_path: &Path) -> StreamRequest {
    StreamRequest {
        source: StreamSource::Playback {
            path: raw_path.to_path_buf(),
            real_time: false,
            looped: false,
        },
        // No profile constraint: the recording's native format is the
        // ground truth, and constraining it can fail to resolve.
        profile: None,
        record_to: None,
    }
}

fn cleanup_temp(temp_path: &Path) {
    if temp_path.exists() {
        let _ = fs::remove_file(temp_path);
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn short_id(job_id: &str) -> &str {
    job_id.get(..8).unwrap_or(job_id)
}
