use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, bail};
use log::{error, info, warn};

use crate::config::{Config, FetchBackend};
use crate::fetch::{ApifyResolver, Fetcher, HttpFetcher, YtDlpFetcher, download_client};
use crate::merge::{FfmpegMerger, Merger};
use crate::tool::{Tool, ensure_non_empty};
use crate::trim::{FfmpegTrimmer, Trimmer};
use crate::workspace::Workspace;
use crate::{ClipRange, ClipRequest, JobId, MergedMedia, PipelineError, StepError, validate_source_id};

/// Where a running job currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching { index: usize, total: usize },
    Trimming { index: usize, total: usize },
    Merging { total: usize },
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetching { index, total } => write!(f, "Downloading clip {} of {total}", index + 1),
            Stage::Trimming { index, total } => write!(f, "Trimming clip {} of {total}", index + 1),
            Stage::Merging { total } => write!(f, "Merging {total} clips"),
            Stage::Done => write!(f, "Video generated successfully"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub percent: u8,
    pub stage: Stage,
}

impl Progress {
    /// Every clip is two steps (fetch, trim), plus one merge step
    fn at(stage: Stage) -> Self {
        let (step, steps) = match stage {
            Stage::Fetching { index, total } => (2 * index, 2 * total + 1),
            Stage::Trimming { index, total } => (2 * index + 1, 2 * total + 1),
            Stage::Merging { total } => (2 * total, 2 * total + 1),
            Stage::Done => (1, 1),
        };
        Self {
            percent: (step * 100 / steps) as u8,
            stage,
        }
    }
}

/// One generation request and everything it owns on disk
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub workspace: Workspace,
    pub clips: Vec<ClipRequest>,
    pub trimmed: Vec<PathBuf>,
    pub merged: Option<PathBuf>,
}

impl Job {
    async fn start(root: &Path, clips: &[ClipRequest]) -> Result<Self, PipelineError> {
        let id = JobId::new();
        let workspace = Workspace::acquire(root, &id).await?;
        Ok(Self {
            id,
            workspace,
            clips: clips.to_vec(),
            trimmed: Vec::with_capacity(clips.len()),
            merged: None,
        })
    }

    async fn finish(self) {
        self.workspace.release().await;
    }
}

/// Drives fetch, trim and merge for a job, strictly in clip order
#[derive(Clone)]
pub struct Director {
    fetcher: Arc<dyn Fetcher>,
    trimmer: Arc<dyn Trimmer>,
    merger: Arc<dyn Merger>,
    scratch_root: PathBuf,
    fetch_attempts: u32,
}

impl std::fmt::Debug for Director {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Director")
            .field("scratch_root", &self.scratch_root)
            .field("fetch_attempts", &self.fetch_attempts)
            .finish_non_exhaustive()
    }
}

impl Director {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        trimmer: Arc<dyn Trimmer>,
        merger: Arc<dyn Merger>,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            trimmer,
            merger,
            scratch_root: scratch_root.into(),
            fetch_attempts: 1,
        }
    }

    /// Retry transport failures of a download up to `attempts` times in total
    pub fn with_fetch_attempts(mut self, attempts: u32) -> Self {
        self.fetch_attempts = attempts.max(1);
        self
    }

    /// Wire up the ffmpeg/yt-dlp/HTTP implementations described by `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let ffmpeg = Tool::ffmpeg(config.ffmpeg_path());
        let fetcher: Arc<dyn Fetcher> = match config.fetch_backend() {
            FetchBackend::YtDlp => Arc::new(YtDlpFetcher::new(
                Tool::yt_dlp(config.yt_dlp_path()),
                config.source_url_template(),
                config.fetch_timeout(),
                config.fetch_deadline(),
            )),
            FetchBackend::Http => {
                let token = match std::env::var("APIFY_TOKEN") {
                    Ok(token) if !token.trim().is_empty() => token,
                    _ => bail!("APIFY_TOKEN environment variable not set (required for the http fetch backend)"),
                };
                let resolver = ApifyResolver::new(
                    download_client(config.fetch_timeout())?,
                    token,
                    config.apify_actor(),
                    config.source_url_template(),
                );
                Arc::new(HttpFetcher::new(download_client(config.fetch_timeout())?, resolver))
            }
        };

        Ok(Self::new(
            fetcher,
            Arc::new(FfmpegTrimmer::new(ffmpeg.clone(), config.video_codec(), config.audio_codec())),
            Arc::new(FfmpegMerger::new(ffmpeg)),
            config.scratch_dir(),
        )
        .with_fetch_attempts(config.fetch_attempts()))
    }

    pub async fn run_job(&self, clips: &[ClipRequest]) -> Result<MergedMedia, PipelineError> {
        self.run_job_with_progress(clips, |_| {}).await
    }

    /// Run the whole pipeline. The workspace is removed on every exit path.
    pub async fn run_job_with_progress<F>(
        &self,
        clips: &[ClipRequest],
        on_progress: F,
    ) -> Result<MergedMedia, PipelineError>
    where
        F: Fn(Progress) + Send + Sync,
    {
        if clips.is_empty() {
            return Err(PipelineError::invalid("no clips requested"));
        }

        let mut job = Job::start(&self.scratch_root, clips).await?;
        info!("Job {} started with {} clips in {}", job.id, clips.len(), job.workspace.path().display());

        let result = self.drive(&mut job, &on_progress).await;
        let id = job.id;
        job.finish().await;

        match &result {
            Ok(media) => info!("Job {id} finished: {} ({} bytes)", media.file_name, media.bytes.len()),
            Err(e) => error!("Job {id} failed: {e}"),
        }
        result
    }

    async fn drive<F>(&self, job: &mut Job, on_progress: &F) -> Result<MergedMedia, PipelineError>
    where
        F: Fn(Progress) + Send + Sync,
    {
        let total = job.clips.len();
        for (index, clip) in job.clips.iter().enumerate() {
            let segment = self
                .process_clip(&job.workspace, index, total, clip, on_progress)
                .await
                .map_err(|source| PipelineError::Clip { index, source })?;
            job.trimmed.push(segment);
        }

        on_progress(Progress::at(Stage::Merging { total }));
        let output = job.workspace.file(&format!("merged-{}.mp4", job.id));
        self.merger
            .merge(&job.trimmed, &output)
            .await
            .map_err(PipelineError::Merge)?;
        ensure_non_empty(&output)
            .await
            .map_err(|e| PipelineError::Merge(StepError::MergeFailed(e.to_string())))?;
        job.merged = Some(output.clone());

        let bytes = tokio::fs::read(&output).await?;
        on_progress(Progress::at(Stage::Done));

        Ok(MergedMedia {
            job_id: job.id,
            file_name: format!("merged-{}.mp4", job.id),
            bytes,
        })
    }

    async fn process_clip<F>(
        &self,
        workspace: &Workspace,
        index: usize,
        total: usize,
        clip: &ClipRequest,
        on_progress: &F,
    ) -> Result<PathBuf, StepError>
    where
        F: Fn(Progress) + Send + Sync,
    {
        let source = workspace.file(&format!("source-{index}.mp4"));
        let segment = workspace.file(&format!("segment-{index:03}.mp4"));

        info!("Processing clip {} of {total}: {clip}", index + 1);
        on_progress(Progress::at(Stage::Fetching { index, total }));
        self.fetch_with_retry(clip.source_id(), &source).await?;
        ensure_non_empty(&source)
            .await
            .map_err(|e| StepError::DownloadFailed(e.to_string()))?;

        on_progress(Progress::at(Stage::Trimming { index, total }));
        self.trimmer.trim(&source, clip.range(), &segment).await?;
        ensure_non_empty(&segment)
            .await
            .map_err(|e| StepError::TrimFailed(e.to_string()))?;

        // only the current source and its trim are on disk at once
        discard(&source).await;
        Ok(segment)
    }

    async fn fetch_with_retry(&self, source_id: &str, dest: &Path) -> Result<(), StepError> {
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch(source_id, dest).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < self.fetch_attempts => {
                    let delay = Duration::from_millis(500 * 2u64.pow(attempt));
                    warn!("Download attempt {} for {source_id} failed: {e}, retrying in {delay:?}", attempt + 1);
                    discard(dest).await;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch one source and optionally trim it, returning the resulting file
    pub async fn fetch_single(&self, source_id: &str, range: Option<ClipRange>) -> Result<MergedMedia, PipelineError> {
        let source_id = validate_source_id(source_id)?;
        let job_id = JobId::new();
        let workspace = Workspace::acquire(&self.scratch_root, &job_id).await?;
        info!("Job {job_id} fetching single source {source_id}");

        let result = self.single(&workspace, job_id, &source_id, range).await;
        workspace.release().await;

        if let Err(e) = &result {
            error!("Job {job_id} failed: {e}");
        }
        result
    }

    async fn single(
        &self,
        workspace: &Workspace,
        job_id: JobId,
        source_id: &str,
        range: Option<ClipRange>,
    ) -> Result<MergedMedia, PipelineError> {
        let clip_error = |source| PipelineError::Clip { index: 0, source };

        let source = workspace.file("source-0.mp4");
        self.fetch_with_retry(source_id, &source).await.map_err(clip_error)?;
        ensure_non_empty(&source)
            .await
            .map_err(|e| clip_error(StepError::DownloadFailed(e.to_string())))?;

        let (output, file_name) = match range {
            Some(range) => {
                let trimmed = workspace.file("segment-000.mp4");
                self.trimmer.trim(&source, range, &trimmed).await.map_err(clip_error)?;
                ensure_non_empty(&trimmed)
                    .await
                    .map_err(|e| clip_error(StepError::TrimFailed(e.to_string())))?;
                (trimmed, format!("trimmed-{source_id}.mp4"))
            }
            None => (source, format!("full-{source_id}.mp4")),
        };

        let bytes = tokio::fs::read(&output).await?;
        Ok(MergedMedia {
            job_id,
            file_name,
            bytes,
        })
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cleanup: failed to remove {}: {e}", path.display()),
    }
}
