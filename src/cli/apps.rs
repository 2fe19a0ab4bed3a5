use std::path::Path;

use anyhow::{Context, Result};
use llmlab_core::config::roster::RawRoster;
use llmlab_core::config::ModelRegistry;
use llmlab_core::output::{AppListing, OutputFormatter};
use llmlab_core::paradigm::discover_apps;

pub fn handle_apps(apps_dir: &Path, formatter: &OutputFormatter) -> Result<()> {
    let apps = discover_apps(apps_dir)
        .with_context(|| format!("Failed to scan {}", apps_dir.display()))?;

    let listings: Vec<AppListing> = apps
        .iter()
        .map(|app| match RawRoster::load(&app.roster_path()) {
            Ok(roster) => AppListing {
                name: app.name.clone(),
                participants: Some(roster.rows.len()),
                has_roles: roster.has_roles(),
            },
            Err(e) => {
                tracing::debug!("{}: {}", app.name, e);
                AppListing {
                    name: app.name.clone(),
                    participants: None,
                    has_roles: false,
                }
            }
        })
        .collect();

    formatter.print_apps(&listings);
    Ok(())
}

pub fn handle_models(formatter: &OutputFormatter) {
    formatter.print_models(&ModelRegistry::from_env());
}

/// Names of the apps under `apps_dir`, for error hints
pub fn available_apps(apps_dir: &Path) -> Vec<String> {
    discover_apps(apps_dir)
        .map(|apps| apps.into_iter().map(|a| a.name).collect())
        .unwrap_or_default()
}
