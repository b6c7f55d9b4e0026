use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::Serialize;

use crate::director::Director;
use crate::{ClipRequest, JobId, MergedMedia, PipelineError};

/// How long a finished job is kept around waiting to be collected
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Pollable view of a submitted job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,
    pub progress: u8,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct JobEntry {
    status: JobStatus,
    result: Option<MergedMedia>,
    finished_at: Option<Instant>,
}

/// Background jobs submitted over HTTP, keyed by id.
///
/// Only status and finished output live here; each job still owns its own workspace.
/// Finished jobs that nobody collects are dropped after the retention period.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    retention: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            inner: Arc::default(),
            retention,
        }
    }

    /// Lock the map, evicting finished jobs past their retention
    fn entries(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        let mut entries = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let retention = self.retention;
        entries.retain(|id, entry| {
            let keep = entry.finished_at.is_none_or(|t| t.elapsed() < retention);
            if !keep {
                debug!("Evicting uncollected job {id}");
            }
            keep
        });
        entries
    }

    /// Validate and queue a job, then run it on the tokio runtime
    pub fn submit(&self, director: Arc<Director>, clips: Vec<ClipRequest>) -> Result<JobId, PipelineError> {
        if clips.is_empty() {
            return Err(PipelineError::invalid("no clips requested"));
        }

        let id = JobId::new();
        self.entries().insert(
            id,
            JobEntry {
                status: JobStatus {
                    job_id: id,
                    state: JobState::Queued,
                    progress: 0,
                    status: "Queued".to_string(),
                    download_url: None,
                    error: None,
                },
                result: None,
                finished_at: None,
            },
        );
        info!("Queued job {id} with {} clips", clips.len());

        let registry = self.clone();
        tokio::spawn(async move {
            registry.update(id, |s| {
                s.state = JobState::Running;
                s.status = "Initializing video generation...".to_string();
            });

            let result = director
                .run_job_with_progress(&clips, |p| {
                    registry.update(id, |s| {
                        s.progress = p.percent;
                        s.status = p.stage.to_string();
                    })
                })
                .await;

            registry.complete(id, result);
        });

        Ok(id)
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut JobStatus)) {
        if let Some(entry) = self.entries().get_mut(&id) {
            f(&mut entry.status);
        }
    }

    fn complete(&self, id: JobId, result: Result<MergedMedia, PipelineError>) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else { return };
        entry.finished_at = Some(Instant::now());
        match result {
            Ok(media) => {
                entry.status.state = JobState::Completed;
                entry.status.progress = 100;
                entry.status.status = "Video generated successfully".to_string();
                entry.status.download_url = Some(format!("/video/download/{id}"));
                entry.result = Some(media);
            }
            Err(e) => {
                entry.status.state = JobState::Failed;
                entry.status.status = "Failed to generate video".to_string();
                entry.status.error = Some(e.to_string());
            }
        }
    }

    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.entries().get(id).map(|e| e.status.clone())
    }

    /// Hand out a finished job's media exactly once.
    ///
    /// `None` if the id is unknown, `Some(Err(status))` if the job has not completed.
    /// A failed job is forgotten once its failure has been handed out.
    pub fn take_result(&self, id: &JobId) -> Option<Result<MergedMedia, JobStatus>> {
        let mut entries = self.entries();
        let state = entries.get(id)?.status.state;
        match state {
            JobState::Completed => entries.remove(id).and_then(|e| e.result).map(Ok),
            JobState::Failed => entries.remove(id).map(|e| Err(e.status)),
            JobState::Queued | JobState::Running => entries.get(id).map(|e| Err(e.status.clone())),
        }
    }
}
