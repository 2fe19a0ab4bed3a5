//! `llmlab` - run oTree experiments with LLM-driven participants
//!
//! Validates an app's participant assignments, creates sessions on an oTree
//! server, drives the LLM players and exports the session data.

use anyhow::Result;
use clap::{CommandFactory, Parser};
use console::Style;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use llmlab_core::output::OutputFormatter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        let blue = Style::new().blue();
        println!(
            "{} v{} ({})",
            blue.apply_to("llmlab"),
            env!("CARGO_PKG_VERSION"),
            env!("GIT_HASH")
        );
        return Ok(());
    }

    // A missing env file is fine; keys may already be exported
    match dotenvy::from_path(&cli.env_file) {
        Ok(()) => {}
        Err(e) if e.not_found() => {}
        Err(e) => eprintln!("Warning: could not read {}: {}", cli.env_file.display(), e),
    }

    init_tracing(cli.verbose);
    tracing::debug!("Verbose logging enabled");

    let formatter = OutputFormatter::new();

    let ok = match &cli.command {
        Some(Commands::Apps { apps_dir }) => {
            cli::apps::handle_apps(apps_dir, &formatter)?;
            true
        }
        Some(Commands::Models) => {
            cli::apps::handle_models(&formatter);
            true
        }
        Some(Commands::Validate {
            app,
            output_dir,
            apps_dir,
        }) => cli::run::handle_validate(app, apps_dir, output_dir, &formatter)?,
        Some(Commands::Run(args)) => {
            formatter.print_banner();
            cli::run::handle_run(args, cli.config.as_deref(), &formatter).await?
        }
        None => {
            Cli::command().print_help()?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// `info` by default, `debug` with `-v`; `RUST_LOG` wins when set
fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{},reqwest=warn,hyper=warn,hyper_util=warn", level))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
