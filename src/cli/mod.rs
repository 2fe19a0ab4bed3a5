//! CLI argument parsing using clap 4.x derive macros

pub mod apps;
pub mod run;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use llmlab_core::config::DEFAULT_ENV_FILE;
use llmlab_core::paradigm::DEFAULT_APPS_DIR;

/// Run oTree experiments with LLM-driven participants
///
/// Each app directory holds a `player_models.csv` assigning every player to
/// `human` or a model, and optionally a `prompts.toml` with per-role prompts.
#[derive(Parser, Debug)]
#[command(name = "llmlab")]
#[command(author, about, long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file (default: llmlab.toml if present)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Environment file with API keys and model lists
    #[arg(long, global = true, value_name = "FILE", default_value = DEFAULT_ENV_FILE)]
    pub env_file: PathBuf,

    /// Print version information
    #[arg(long)]
    pub version: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List available apps and their participant counts
    Apps {
        #[arg(long, default_value = DEFAULT_APPS_DIR)]
        apps_dir: PathBuf,
    },

    /// List models configured through the environment
    Models,

    /// Check an app's configuration without running anything
    Validate {
        /// App to validate
        #[arg(short, long)]
        app: String,

        /// Output directory to check for write access
        #[arg(short, long, default_value = "botex_data")]
        output_dir: PathBuf,

        #[arg(long, default_value = DEFAULT_APPS_DIR)]
        apps_dir: PathBuf,
    },

    /// Run one or more sessions of an app
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// App to run
    #[arg(short, long)]
    pub app: String,

    /// Number of concurrent sessions
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub sessions: u32,

    /// Directory receiving one sub-directory per session
    #[arg(short, long, default_value = "botex_data")]
    pub output_dir: PathBuf,

    /// Sampling temperature [default: 0.7]
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Maximum tokens per LLM reply [default: 1024]
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// oTree server URL [default: http://localhost:8000]
    #[arg(long)]
    pub otree_url: Option<String>,

    /// Disable retries and rate limiting of LLM calls
    #[arg(short = 'x', long)]
    pub no_throttle: bool,

    /// Show what would run without creating sessions
    #[arg(long)]
    pub dry_run: bool,

    /// Do not open the session monitor in a browser
    #[arg(long)]
    pub no_browser: bool,

    /// Start `otree devserver` in this project directory for the run
    #[arg(long, value_name = "DIR")]
    pub start_server: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_APPS_DIR)]
    pub apps_dir: PathBuf,
}
