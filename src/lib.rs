pub mod config;
pub mod director;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod merge;
pub mod server;
pub mod tool;
pub mod trim;
pub mod workspace;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{PipelineError, StepError};

static BARE_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{11}$").expect("valid regex"));

static URL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/watch\?.*v=|youtu\.be/|youtube\.com/embed/|youtube\.com/shorts/)([a-zA-Z0-9_-]{11})")
        .expect("valid regex")
});

/// A validated [start, end) interval in fractional seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClipRange {
    start: f64,
    end: f64,
}

impl ClipRange {
    pub fn new(start: f64, end: f64) -> Result<Self, PipelineError> {
        if !start.is_finite() || !end.is_finite() {
            return Err(PipelineError::invalid(format!(
                "clip offsets must be finite numbers (got {start}..{end})"
            )));
        }
        if start < 0.0 {
            return Err(PipelineError::invalid(format!("start offset {start} is negative")));
        }
        if end <= start {
            return Err(PipelineError::invalid(format!(
                "end offset {end} must be greater than start offset {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// One requested sub-clip of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawClip")]
pub struct ClipRequest {
    #[serde(rename = "videoId")]
    source_id: String,
    #[serde(rename = "startTime")]
    start: f64,
    #[serde(rename = "endTime")]
    end: f64,
}

impl ClipRequest {
    pub fn new(source_id: impl Into<String>, start: f64, end: f64) -> Result<Self, PipelineError> {
        let source_id = validate_source_id(&source_id.into())?;
        let range = ClipRange::new(start, end)?;
        Ok(Self {
            source_id,
            start: range.start,
            end: range.end,
        })
    }

    /// Parse a CLI clip spec of the form `ID:START-END`.
    ///
    /// ID may be a YouTube URL, in which case the video ID is extracted.
    pub fn parse_spec(spec: &str) -> Result<Self, PipelineError> {
        let (id, range) = spec
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| PipelineError::invalid(format!("expected ID:START-END, got '{spec}'")))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| PipelineError::invalid(format!("expected START-END offsets in '{spec}'")))?;
        let start = parse_seconds(start)?;
        let end = parse_seconds(end)?;
        let id = extract_video_id(id).unwrap_or_else(|| id.to_string());
        Self::new(id, start, end)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn range(&self) -> ClipRange {
        ClipRange {
            start: self.start,
            end: self.end,
        }
    }
}

impl std::fmt::Display for ClipRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{:.3}s-{:.3}s]", self.source_id, self.start, self.end)
    }
}

/// Offsets arrive either as JSON numbers or numeric strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Seconds {
    Number(f64),
    Text(String),
}

impl Seconds {
    pub(crate) fn value(&self) -> Result<f64, PipelineError> {
        match self {
            Seconds::Number(n) => Ok(*n),
            Seconds::Text(s) => parse_seconds(s),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClip {
    #[serde(rename = "videoId", alias = "sourceId")]
    video_id: String,
    #[serde(rename = "startTime", alias = "startOffset")]
    start_time: Seconds,
    #[serde(rename = "endTime", alias = "endOffset")]
    end_time: Seconds,
}

impl TryFrom<RawClip> for ClipRequest {
    type Error = PipelineError;

    fn try_from(raw: RawClip) -> Result<Self, Self::Error> {
        ClipRequest::new(raw.video_id, raw.start_time.value()?, raw.end_time.value()?)
    }
}

fn parse_seconds(input: &str) -> Result<f64, PipelineError> {
    input
        .trim()
        .parse::<f64>()
        .map_err(|_| PipelineError::invalid(format!("'{input}' is not a number of seconds")))
}

pub(crate) fn validate_source_id(source_id: &str) -> Result<String, PipelineError> {
    let id = source_id.trim();
    if id.is_empty() {
        return Err(PipelineError::invalid("missing source id"));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PipelineError::invalid(format!("source id '{id}' contains whitespace")));
    }
    Ok(id.to_string())
}

/// Unique identifier of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Final media produced by a job, fully read into memory
#[derive(Debug, Clone)]
pub struct MergedMedia {
    pub job_id: JobId,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Extract video ID from various YouTube URL formats
pub fn extract_video_id(input: &str) -> Option<String> {
    let input = input.trim();

    if BARE_ID.is_match(input) {
        return Some(input.to_string());
    }

    URL_ID.captures(input).map(|caps| caps[1].to_string())
}
