use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, info, trace};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

/// Number of stderr lines kept for error messages
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} not found. Install it:\n  {hint}")]
    NotFound { tool: String, hint: String },

    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },

    #[error("output file {} was not produced", .0.display())]
    MissingOutput(PathBuf),

    #[error("output file {} is empty", .0.display())]
    EmptyOutput(PathBuf),
}

/// Per-invocation options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Total media duration being produced, enables percent progress logging
    pub expected_duration: Option<f64>,
    /// Kill the process if it runs longer than this
    pub timeout: Option<Duration>,
}

/// An external command-line tool invoked as a subprocess
#[derive(Debug, Clone)]
pub struct Tool {
    name: &'static str,
    program: PathBuf,
    install_hint: &'static str,
}

impl Tool {
    pub fn ffmpeg(program: impl Into<PathBuf>) -> Self {
        Self {
            name: "ffmpeg",
            program: program.into(),
            install_hint: "apt install ffmpeg\n  or: brew install ffmpeg",
        }
    }

    pub fn yt_dlp(program: impl Into<PathBuf>) -> Self {
        Self {
            name: "yt-dlp",
            program: program.into(),
            install_hint: "pip install yt-dlp\n  or: brew install yt-dlp",
        }
    }

    /// Run the tool to completion. Non-zero exit is an error.
    pub async fn run(&self, args: &[String], opts: &RunOptions) -> Result<(), ToolError> {
        debug!("{} command: {} {}", self.name, self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let name = self.name;
        let expected = opts.expected_duration;

        let progress = async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut last_pct = None;
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("{name}: {line}");
                match (parse_progress_line(&line), expected) {
                    (Some(Progress::OutTime(secs)), Some(total)) if total > 0.0 => {
                        let pct = ((secs / total) * 100.0).clamp(0.0, 100.0).round() as u32;
                        if last_pct != Some(pct) {
                            debug!("{name}: processing {pct}%");
                            last_pct = Some(pct);
                        }
                    }
                    (Some(Progress::End), _) => debug!("{name}: processing 100%"),
                    _ => {}
                }
            }
        };

        let errors = async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        };

        let waited = match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, wait_all(&mut child, progress, errors))
                .await
                .ok(),
            None => Some(wait_all(&mut child, progress, errors).await),
        };
        let Some((stderr_text, status)) = waited else {
            let _ = child.kill().await;
            return Err(ToolError::TimedOut {
                tool: self.name.to_string(),
                secs: opts.timeout.map(|d| d.as_secs()).unwrap_or_default(),
            });
        };

        let status = status.map_err(|e| self.spawn_error(e))?;
        if !status.success() {
            return Err(ToolError::Failed {
                tool: self.name.to_string(),
                status: status.to_string(),
                stderr: tail(&stderr_text, STDERR_TAIL_LINES),
            });
        }

        info!("{} finished", self.name);
        Ok(())
    }

    /// Run the tool, then verify it left a non-empty file at `output`
    pub async fn run_to_output(&self, args: &[String], output: &Path, opts: &RunOptions) -> Result<u64, ToolError> {
        self.run(args, opts).await?;
        ensure_non_empty(output).await
    }

    fn spawn_error(&self, e: std::io::Error) -> ToolError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::NotFound {
                tool: self.name.to_string(),
                hint: self.install_hint.to_string(),
            }
        } else {
            ToolError::Spawn {
                tool: self.name.to_string(),
                source: e,
            }
        }
    }
}

async fn wait_all(
    child: &mut Child,
    progress: impl Future<Output = ()>,
    errors: impl Future<Output = String>,
) -> (String, std::io::Result<ExitStatus>) {
    let ((), stderr, status) = tokio::join!(progress, errors, child.wait());
    (stderr, status)
}

/// Fail unless `path` exists and holds at least one byte. Returns the size.
pub async fn ensure_non_empty(path: &Path) -> Result<u64, ToolError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(_) => Err(ToolError::EmptyOutput(path.to_path_buf())),
        Err(_) => Err(ToolError::MissingOutput(path.to_path_buf())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Progress {
    OutTime(f64),
    End,
}

/// Parse one line of ffmpeg's `-progress` key=value stream
fn parse_progress_line(line: &str) -> Option<Progress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // both keys are reported in microseconds
        "out_time_us" | "out_time_ms" => value.parse::<i64>().ok().map(|us| Progress::OutTime(us as f64 / 1_000_000.0)),
        "progress" if value == "end" => Some(Progress::End),
        _ => None,
    }
}

/// Seconds formatted the way ffmpeg accepts them
pub fn format_seconds(secs: f64) -> String {
    format!("{secs:.3}")
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(parse_progress_line("out_time_us=2500000"), Some(Progress::OutTime(2.5)));
        assert_eq!(parse_progress_line("out_time_ms=1000000"), Some(Progress::OutTime(1.0)));
        assert_eq!(parse_progress_line("progress=end"), Some(Progress::End));
        assert_eq!(parse_progress_line("progress=continue"), None);
        assert_eq!(parse_progress_line("frame=12"), None);
        assert_eq!(parse_progress_line("garbage"), None);
    }

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(10.0), "10.000");
        assert_eq!(format_seconds(1.23456), "1.235");
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let text = "a\nb\n\nc\nd\n";
        assert_eq!(tail(text, 2), "c\nd");
        assert_eq!(tail(text, 10), "a\nb\nc\nd");
    }

    #[tokio::test]
    async fn test_ensure_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.mp4");
        assert!(matches!(ensure_non_empty(&missing).await, Err(ToolError::MissingOutput(_))));

        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(ensure_non_empty(&empty).await, Err(ToolError::EmptyOutput(_))));

        let full = dir.path().join("full.mp4");
        std::fs::write(&full, b"data").unwrap();
        assert_eq!(ensure_non_empty(&full).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_missing_binary_reports_install_hint() {
        let tool = Tool::ffmpeg("/nonexistent/reelcut-ffmpeg");
        let err = tool.run(&[], &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
        assert!(err.to_string().contains("Install it"));
    }

    #[tokio::test]
    async fn test_timeout_kills_slow_tool() {
        let tool = Tool::yt_dlp("sleep");
        let opts = RunOptions {
            expected_duration: None,
            timeout: Some(Duration::from_millis(200)),
        };

        let started = std::time::Instant::now();
        let err = tool.run(&["30".to_string()], &opts).await.unwrap_err();

        assert!(matches!(err, ToolError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_fast_tool_finishes_within_timeout() {
        let tool = Tool::yt_dlp("true");
        let opts = RunOptions {
            expected_duration: None,
            timeout: Some(Duration::from_secs(10)),
        };
        tool.run(&[], &opts).await.unwrap();
    }
}
