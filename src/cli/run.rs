use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use llmlab_core::bot::LlmBotRunner;
use llmlab_core::config::{ExperimentConfig, LabConfig, ModelRegistry, ValidationReport};
use llmlab_core::launcher::{start_otree_devserver, LaunchOptions, SessionLauncher};
use llmlab_core::llm::shared_rate_limiter;
use llmlab_core::otree::OtreeClient;
use llmlab_core::output::{OutputFormatter, RunOverview};
use llmlab_core::paradigm::find_app;
use llmlab_core::LabError;

use super::apps::available_apps;
use super::RunArgs;

/// Run the six checks; `Ok(false)` when any failed
pub fn handle_validate(
    app: &str,
    apps_dir: &Path,
    output_dir: &Path,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let app = resolve_app(apps_dir, app)?;
    let registry = ModelRegistry::from_env();
    let report = ValidationReport::run(&app, &registry, output_dir, |k| std::env::var(k).ok());
    formatter.print_validation(&report);
    Ok(report.is_ok())
}

/// Run the requested sessions; `Ok(false)` when none succeeded
pub async fn handle_run(args: &RunArgs, config: Option<&Path>, formatter: &OutputFormatter) -> Result<bool> {
    let mut lab = LabConfig::load(config).context("Failed to load settings")?;
    apply_overrides(&mut lab, args);

    let app = resolve_app(&args.apps_dir, &args.app)?;
    tracing::info!("Loading participant assignments for app '{}'", app.name);
    let registry = ModelRegistry::from_env();
    tracing::debug!(
        "Available models: {}",
        registry.iter().map(|m| m.name.as_str()).collect::<Vec<_>>().join(", ")
    );

    let experiment = match ExperimentConfig::load(app, &registry) {
        Ok(experiment) => experiment,
        Err(e) if e.is_config_error() => {
            bail!("{}\nPlease correct the model mapping file and try again.", e)
        }
        Err(e) => return Err(e.into()),
    };

    let invalid = experiment.invalid_roles();
    if !invalid.is_empty() {
        tracing::warn!(
            "Roles not defined for '{}': {}; those players use default prompts",
            experiment.app.name,
            invalid.join(", ")
        );
    }

    let overview = RunOverview {
        experiment: &experiment,
        sessions: args.sessions as usize,
        max_tokens: lab.bots.max_tokens,
        temperature: lab.bots.temperature,
        output_dir: &args.output_dir,
        otree_url: &lab.otree.url,
    };
    formatter.print_config_summary(&overview);

    if args.dry_run {
        formatter.print_dry_run(&overview);
        return Ok(true);
    }

    let missing = experiment.missing_api_keys(|k| std::env::var(k).ok());
    if !missing.is_empty() {
        bail!("Missing API keys: {}", missing.join(", "));
    }

    formatter.print_assignments(&experiment.roster);
    tokio::fs::create_dir_all(&args.output_dir)
        .await
        .with_context(|| format!("Cannot create output directory {}", args.output_dir.display()))?;
    tracing::info!("Output directory created/verified: {}", args.output_dir.display());

    let platform = OtreeClient::new(lab.otree.clone())?;
    let devserver = match &args.start_server {
        Some(project) => Some(
            start_otree_devserver(project, platform.base_url())
                .await
                .context("Failed to start oTree server")?,
        ),
        None => {
            if !platform.is_reachable().await {
                bail!(
                    "oTree server not reachable at {}. Start it or pass --start-server <project dir>.",
                    platform.base_url()
                );
            }
            None
        }
    };

    println!("\nStarting {} session(s) for app '{}'...", args.sessions, experiment.app.name);
    let bots = LlmBotRunner::new(lab.clone(), shared_rate_limiter(&lab));
    let launcher = SessionLauncher::new(
        Arc::new(experiment),
        Arc::new(lab),
        Arc::new(platform),
        Arc::new(bots),
        LaunchOptions {
            sessions: args.sessions as usize,
            output_dir: args.output_dir.clone(),
            open_browser: !args.no_browser,
        },
    );
    let result = launcher.run_all().await;

    if let Some(server) = devserver {
        if let Err(e) = server.stop().await {
            tracing::warn!("{}", e);
        }
    }

    let outcomes = result?;
    formatter.print_run_summary(&outcomes);
    Ok(outcomes.iter().any(|o| o.is_success()))
}

fn apply_overrides(lab: &mut LabConfig, args: &RunArgs) {
    if let Some(temperature) = args.temperature {
        lab.bots.temperature = temperature;
    }
    if let Some(max_tokens) = args.max_tokens {
        lab.bots.max_tokens = max_tokens;
    }
    if let Some(url) = &args.otree_url {
        lab.otree.url = url.clone();
    }
    if args.no_throttle {
        lab.bots.throttle = false;
    }
}

/// Find the app, listing the available ones when it is missing
fn resolve_app(apps_dir: &Path, name: &str) -> Result<llmlab_core::paradigm::AppInfo> {
    match find_app(apps_dir, name) {
        Ok(app) => Ok(app),
        Err(LabError::AppNotFound { .. }) => {
            let available = available_apps(apps_dir);
            if available.is_empty() {
                bail!("App '{}' not found. No apps found in {}.", name, apps_dir.display());
            }
            bail!("App '{}' not found. Available apps: {}", name, available.join(", "));
        }
        Err(e) => Err(e.into()),
    }
}
