use clap::{Parser, Subcommand};
use reelcut::config::FetchBackend;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "reelcut",
    about = "Cut clips out of online videos and stitch them into one",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Where sources come from (overrides the config file)
    #[arg(long, value_enum, global = true)]
    pub backend: Option<FetchBackend>,

    /// Root directory for per-job workspaces
    #[arg(long, global = true)]
    pub scratch_dir: Option<PathBuf>,

    /// Print progress and diagnostics to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Fetch, trim and merge clips into a single video
    Generate {
        /// Clip as ID:START-END (ID may be a YouTube URL), repeatable
        #[arg(short, long = "clip", value_name = "ID:START-END")]
        clips: Vec<String>,

        /// JSON file shaped like the HTTP body, `-` for stdin
        #[arg(long, value_name = "FILE")]
        clips_file: Option<PathBuf>,

        /// Where to write the merged video
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Download one source, trimmed when both offsets are given
    Clip {
        /// Video ID or YouTube URL
        id: String,

        #[arg(long, requires = "end")]
        start: Option<f64>,

        #[arg(long, requires = "start")]
        end: Option<f64>,

        /// Output file (defaults to the server's naming in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the HTTP server
    Serve {
        /// Address to listen on (default 0.0.0.0:4001)
        #[arg(long)]
        bind: Option<String>,
    },
}
