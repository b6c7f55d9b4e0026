use std::path::Path;

use async_trait::async_trait;
use log::info;

use crate::ClipRange;
use crate::StepError;
use crate::tool::{RunOptions, Tool, format_seconds};

/// Cuts a [start, end) interval out of a source file into a new file.
///
/// Implementations must not modify `source` and must fail if `dest` ends up
/// missing or empty.
#[async_trait]
pub trait Trimmer: Send + Sync {
    async fn trim(&self, source: &Path, range: ClipRange, dest: &Path) -> Result<(), StepError>;
}

/// Trimmer backed by ffmpeg
#[derive(Debug, Clone)]
pub struct FfmpegTrimmer {
    ffmpeg: Tool,
    video_codec: String,
    audio_codec: String,
}

impl FfmpegTrimmer {
    pub fn new(ffmpeg: Tool, video_codec: impl Into<String>, audio_codec: impl Into<String>) -> Self {
        Self {
            ffmpeg,
            video_codec: video_codec.into(),
            audio_codec: audio_codec.into(),
        }
    }

    fn build_args(&self, source: &Path, range: ClipRange, dest: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-nostats".to_string(),
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-ss".to_string(),
            format_seconds(range.start()),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-t".to_string(),
            format_seconds(range.duration()),
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-c:a".to_string(),
            self.audio_codec.clone(),
            dest.to_string_lossy().to_string(),
        ]
    }
}

#[async_trait]
impl Trimmer for FfmpegTrimmer {
    async fn trim(&self, source: &Path, range: ClipRange, dest: &Path) -> Result<(), StepError> {
        info!(
            "Trimming {} from {:.3}s to {:.3}s",
            source.display(),
            range.start(),
            range.end()
        );

        let args = self.build_args(source, range, dest);
        let opts = RunOptions {
            expected_duration: Some(range.duration()),
            timeout: None,
        };
        self.ffmpeg
            .run_to_output(&args, dest, &opts)
            .await
            .map_err(|e| StepError::TrimFailed(e.to_string()))?;
        Ok(())
    }
}
