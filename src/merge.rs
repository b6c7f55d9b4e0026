use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::StepError;
use crate::tool::{RunOptions, Tool};

/// Concatenates segments, in the given order, into one output file.
///
/// Implementations never reorder or deduplicate segments.
#[async_trait]
pub trait Merger: Send + Sync {
    async fn merge(&self, segments: &[PathBuf], output: &Path) -> Result<(), StepError>;
}

/// Merger backed by ffmpeg's concat demuxer with stream copy
#[derive(Debug, Clone)]
pub struct FfmpegMerger {
    ffmpeg: Tool,
}

impl FfmpegMerger {
    pub fn new(ffmpeg: Tool) -> Self {
        Self { ffmpeg }
    }

    fn build_args(list: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-nostats".to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list.to_string_lossy().to_string(),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().to_string(),
        ]
    }
}

/// Body of a concat-demuxer list file, one `file '...'` line per segment
fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

#[async_trait]
impl Merger for FfmpegMerger {
    async fn merge(&self, segments: &[PathBuf], output: &Path) -> Result<(), StepError> {
        if segments.is_empty() {
            return Err(StepError::MergeFailed("no segments to merge".to_string()));
        }

        info!("Merging {} segments into {}", segments.len(), output.display());

        let list = output.with_extension("concat.txt");
        tokio::fs::write(&list, concat_list(segments))
            .await
            .map_err(|e| StepError::MergeFailed(format!("cannot write {}: {e}", list.display())))?;
        debug!("Concat list written to {}", list.display());

        let result = self
            .ffmpeg
            .run_to_output(&Self::build_args(&list, output), output, &RunOptions::default())
            .await;

        if let Err(e) = tokio::fs::remove_file(&list).await {
            warn!("Cleanup: failed to remove {}: {e}", list.display());
        }

        result.map_err(|e| StepError::MergeFailed(e.to_string()))?;
        Ok(())
    }
}
