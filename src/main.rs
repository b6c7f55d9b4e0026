use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use eyre::{Result, WrapErr, bail};
use log::{debug, info};
use serde::Deserialize;

mod cli;

use cli::Cli;
use reelcut::{ClipRange, ClipRequest};
use reelcut::config::Config;
use reelcut::director::Director;
use reelcut::server::{self, AppState};

fn setup_logging() -> Result<()> {
    let log_dir = log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_file = log_dir.join("reelcut.log");

    let target = Box::new(std::fs::OpenOptions::new().create(true).append(true).open(&log_file)?);

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized: {}", log_file.display());
    Ok(())
}

fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reelcut")
        .join("logs")
}

fn tool_version(name: &str) -> Option<String> {
    Command::new(name)
        .arg("-version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .or_else(|| {
            Command::new(name)
                .arg("--version")
                .output()
                .ok()
                .filter(|o| o.status.success())
        })
        .map(|o| {
            String::from_utf8_lossy(&o.stdout)
                .trim()
                .lines()
                .next()
                .unwrap_or("")
                .to_string()
        })
}

fn build_after_help() -> String {
    let tool_line = |name: &str, purpose: &str| match tool_version(name) {
        Some(v) => format!("  \x1b[32m✅\x1b[0m {name:<10} {v}"),
        None => format!("  \x1b[31m❌\x1b[0m {name:<10} (not found, needed to {purpose})"),
    };

    let log_path = log_dir().join("reelcut.log");

    format!(
        "\nREQUIRED TOOLS:\n{}\n{}\n\nConfig is read from: {}\nLogs are written to: {}",
        tool_line("ffmpeg", "trim and merge clips"),
        tool_line("yt-dlp", "download sources with the yt-dlp backend"),
        reelcut::config::config_path().display(),
        log_path.display()
    )
}

#[derive(Deserialize)]
struct ClipsFile {
    clips: Vec<ClipRequest>,
}

/// Gather clips from `--clip` specs followed by the clips file, in that order
fn collect_clips(specs: &[String], clips_file: Option<&Path>) -> Result<Vec<ClipRequest>> {
    let mut clips = specs
        .iter()
        .map(|spec| ClipRequest::parse_spec(spec).map_err(eyre::Report::from))
        .collect::<Result<Vec<_>>>()?;

    if let Some(path) = clips_file {
        let content = if path == Path::new("-") {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        } else {
            std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read {}", path.display()))?
        };
        let file: ClipsFile =
            serde_json::from_str(&content).wrap_err_with(|| format!("invalid clips file {}", path.display()))?;
        clips.extend(file.clips);
    }

    if clips.is_empty() {
        bail!("no clips given\n\nUsage: reelcut generate --clip ID:START-END [--clip ...] -o OUT.mp4");
    }
    Ok(clips)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging()?;

    let after_help = build_after_help();
    let cmd = <Cli as clap::CommandFactory>::command().after_help(after_help);
    let matches = cmd.get_matches();
    let cli = <Cli as clap::FromArgMatches>::from_arg_matches(&matches)?;

    let mut config = Config::load()?;

    // CLI flags take priority over the config file
    if let Some(backend) = cli.backend {
        config.fetch_backend = Some(backend);
    }
    if let Some(ref dir) = cli.scratch_dir {
        config.scratch_dir = Some(dir.clone());
    }

    if cli.verbose {
        let config_path = reelcut::config::config_path();
        if config_path.exists() {
            eprintln!("Config: {}", config_path.display());
        }
        eprintln!("Scratch dir: {}", config.scratch_dir().display());
    }
    debug!("Effective config: {config:?}");

    let director = Director::from_config(&config)?;

    match cli.command {
        cli::Command::Generate {
            clips,
            clips_file,
            output,
        } => {
            let clips = collect_clips(&clips, clips_file.as_deref())?;
            let verbose = cli.verbose;
            let media = director
                .run_job_with_progress(&clips, |p| {
                    if verbose {
                        eprintln!("[{:>3}%] {}", p.percent, p.stage);
                    }
                })
                .await?;
            tokio::fs::write(&output, &media.bytes)
                .await
                .wrap_err_with(|| format!("failed to write {}", output.display()))?;
            eprintln!("Wrote {} ({} bytes)", output.display(), media.bytes.len());
        }
        cli::Command::Clip {
            id,
            start,
            end,
            output,
        } => {
            let id = reelcut::extract_video_id(&id).unwrap_or(id);
            let range = match (start, end) {
                (Some(start), Some(end)) => Some(ClipRange::new(start, end)?),
                _ => None,
            };
            let media = director.fetch_single(&id, range).await?;
            let output = output.unwrap_or_else(|| PathBuf::from(&media.file_name));
            tokio::fs::write(&output, &media.bytes)
                .await
                .wrap_err_with(|| format!("failed to write {}", output.display()))?;
            eprintln!("Wrote {} ({} bytes)", output.display(), media.bytes.len());
        }
        cli::Command::Serve { bind } => {
            if bind.is_some() {
                config.bind = bind;
            }
            let addr = config.bind()?;
            if cli.verbose {
                eprintln!("Listening on http://{addr}");
            }
            server::serve(AppState::new(director), addr).await?;
        }
    }

    Ok(())
}
