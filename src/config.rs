use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use eyre::{Result, WrapErr};
use log::debug;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SOURCE_URL_TEMPLATE: &str = "https://www.youtube.com/watch?v={id}";
pub const DEFAULT_APIFY_ACTOR: &str = "y1IMcEPawMQPafm02";
pub const DEFAULT_BIND: &str = "0.0.0.0:4001";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_FETCH_DEADLINE_SECS: u64 = 1800;

/// Where source media comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FetchBackend {
    /// Download with yt-dlp
    #[default]
    YtDlp,
    /// Resolve a direct URL through Apify, then download over HTTP
    Http,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub scratch_dir: Option<PathBuf>,
    pub ffmpeg_path: Option<PathBuf>,
    pub yt_dlp_path: Option<PathBuf>,
    pub fetch_backend: Option<FetchBackend>,
    pub fetch_timeout_secs: Option<u64>,
    pub fetch_deadline_secs: Option<u64>,
    pub fetch_attempts: Option<u32>,
    pub source_url_template: Option<String>,
    pub apify_actor: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bind: Option<String>,
}

impl Config {
    /// Load config from ~/.config/reelcut/config.toml if it exists
    pub fn load() -> Result<Self> {
        let path = config_path();
        if path.exists() {
            debug!("Loading config from {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            let config: Config =
                toml::from_str(&content).wrap_err_with(|| format!("invalid config {}", path.display()))?;
            Ok(config)
        } else {
            debug!("No config file found at {}", path.display());
            Ok(Config::default())
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("reelcut"))
    }

    pub fn ffmpeg_path(&self) -> PathBuf {
        self.ffmpeg_path.clone().unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }

    pub fn yt_dlp_path(&self) -> PathBuf {
        self.yt_dlp_path.clone().unwrap_or_else(|| PathBuf::from("yt-dlp"))
    }

    pub fn fetch_backend(&self) -> FetchBackend {
        self.fetch_backend.unwrap_or_default()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS).max(1))
    }

    /// Wall-clock bound on a single yt-dlp download
    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_secs(self.fetch_deadline_secs.unwrap_or(DEFAULT_FETCH_DEADLINE_SECS).max(1))
    }

    pub fn fetch_attempts(&self) -> u32 {
        self.fetch_attempts.unwrap_or(1).max(1)
    }

    pub fn source_url_template(&self) -> &str {
        self.source_url_template
            .as_deref()
            .unwrap_or(DEFAULT_SOURCE_URL_TEMPLATE)
    }

    pub fn apify_actor(&self) -> &str {
        self.apify_actor.as_deref().unwrap_or(DEFAULT_APIFY_ACTOR)
    }

    pub fn video_codec(&self) -> &str {
        self.video_codec.as_deref().unwrap_or("libx264")
    }

    pub fn audio_codec(&self) -> &str {
        self.audio_codec.as_deref().unwrap_or("aac")
    }

    pub fn bind(&self) -> Result<SocketAddr> {
        let bind = self.bind.as_deref().unwrap_or(DEFAULT_BIND);
        bind.parse()
            .wrap_err_with(|| format!("invalid bind address '{bind}'"))
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("reelcut")
        .join("config.toml")
}
