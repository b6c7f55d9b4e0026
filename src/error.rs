use thiserror::Error;

/// Failure of a single pipeline step (fetch, trim or merge)
#[derive(Debug, Error)]
pub enum StepError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("trim failed: {0}")]
    TrimFailed(String),

    #[error("merge failed: {0}")]
    MergeFailed(String),
}

impl StepError {
    /// Only transport-level download failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::DownloadFailed(_))
    }
}

/// Failure of a whole job
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("clip {} failed: {source}", .index + 1)]
    Clip {
        /// Zero-based position of the failing clip in the request
        index: usize,
        #[source]
        source: StepError,
    },

    #[error(transparent)]
    Merge(StepError),

    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl PipelineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// The step error behind this failure, if any
    pub fn step(&self) -> Option<&StepError> {
        match self {
            PipelineError::Clip { source, .. } => Some(source),
            PipelineError::Merge(source) => Some(source),
            _ => None,
        }
    }

    /// Index of the clip that failed, if the failure is tied to one
    pub fn clip_index(&self) -> Option<usize> {
        match self {
            PipelineError::Clip { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// HTTP status this failure surfaces as
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::InvalidInput(_) => 400,
            PipelineError::Clip {
                source: StepError::SourceUnavailable(_),
                ..
            } => 404,
            _ => 500,
        }
    }
}
