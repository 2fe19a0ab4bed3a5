//! Output formatting module
//!
//! Console reports for the CLI and the launcher: configuration summaries,
//! validation results, participant URLs and run results.

use std::fmt::Write as _;
use std::path::Path;

use console::Style;

use crate::config::{CheckStatus, ExperimentConfig, ModelRegistry, Roster, SlotAssignment, ValidationReport};
use crate::launcher::{SessionHandle, SessionOutcome, SlotHandle};

/// Inner width of the framed boxes
const BOX_WIDTH: usize = 78;

/// One line of `apps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppListing {
    pub name: String,
    /// `None` when the roster could not be read
    pub participants: Option<usize>,
    pub has_roles: bool,
}

/// What a `run` is about to do
#[derive(Debug, Clone, Copy)]
pub struct RunOverview<'a> {
    pub experiment: &'a ExperimentConfig,
    pub sessions: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub output_dir: &'a Path,
    pub otree_url: &'a str,
}

/// Output formatter for CLI results
#[derive(Debug, Clone)]
pub struct OutputFormatter {
    blue: Style,
    green: Style,
    yellow: Style,
    red: Style,
    bold: Style,
}

impl Default for OutputFormatter {
    fn default() -> Self {
        Self {
            blue: Style::new().blue(),
            green: Style::new().green(),
            yellow: Style::new().yellow(),
            red: Style::new().red(),
            bold: Style::new().bold(),
        }
    }
}

impl OutputFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn print_banner(&self) {
        println!();
        println!("╔{}╗", "═".repeat(BOX_WIDTH));
        println!("║{}║", centered("LLM LAB EXPERIMENTS"));
        println!("║{}║", centered("with Per-Player Roles"));
        println!("╚{}╝", "═".repeat(BOX_WIDTH));
        println!();
    }

    pub fn print_apps(&self, apps: &[AppListing]) {
        println!("\n{}", self.bold.apply_to("Available oTree Apps:"));
        println!("{}", "=".repeat(40));
        if apps.is_empty() {
            println!("  No apps found.");
            println!("\n  To create an app, ensure it has:");
            println!("  - player_models.csv (participant assignments)");
            println!("  - prompts.toml (optional prompting strategies)");
        }
        for app in apps {
            match app.participants {
                Some(n) => {
                    let roles = if app.has_roles { " (with roles)" } else { "" };
                    println!("  {:<15} ({} participants{})", app.name, n, roles);
                }
                None => println!("  {:<15} {}", app.name, self.red.apply_to("(configuration error)")),
            }
        }
        println!();
    }

    pub fn print_models(&self, registry: &ModelRegistry) {
        println!("\n{}", self.bold.apply_to("Available Models:"));
        println!("{}", "=".repeat(40));
        if registry.is_empty() {
            println!("  No models configured. Set GOOGLE_MODELS, OPENAI_MODELS, ANTHROPIC_MODELS,");
            println!("  GROQ_MODELS, DEEPSEEK_MODELS or LOCAL_LLM_MODELS.");
        }
        for spec in registry.iter() {
            let key = match spec.api_key_env() {
                Some(var) if std::env::var(var).is_ok_and(|v| !v.trim().is_empty()) => {
                    self.green.apply_to(format!("{} set", var)).to_string()
                }
                Some(var) => self.yellow.apply_to(format!("{} missing", var)).to_string(),
                None => "no key needed".to_string(),
            };
            println!("  {:<30} {:<18} {}", spec.name, spec.provider.to_string(), key);
        }
        println!();
    }

    pub fn print_config_summary(&self, overview: &RunOverview<'_>) {
        print!("{}", config_summary(overview));
    }

    pub fn print_assignments(&self, roster: &Roster) {
        print!("{}", assignments(roster));
    }

    pub fn print_dry_run(&self, overview: &RunOverview<'_>) {
        let experiment = overview.experiment;
        println!("\n{}", "=".repeat(60));
        println!("{}", self.bold.apply_to("DRY RUN MODE"));
        println!("{}", "=".repeat(60));
        self.print_assignments(&experiment.roster);

        println!("\nExperiment would run with:");
        println!("  • App: {}", experiment.app.name);
        println!("  • {} session(s)", overview.sessions);
        println!("  • {} participants per session", experiment.participants());
        println!("  • Output directory: {}", overview.output_dir.display());
        println!("  • oTree URL: {}", overview.otree_url);
        let roles = experiment.roster.roles();
        if !roles.is_empty() {
            let names: Vec<&str> = roles.keys().copied().collect();
            println!("  • Per-player roles: {}", names.join(", "));
        }
        println!("\nTo execute this configuration, run without --dry-run");
    }

    pub fn print_validation(&self, report: &ValidationReport) {
        println!("\n{}", "=".repeat(60));
        println!("{}", self.bold.apply_to("                 VALIDATION MODE"));
        println!("{}", "=".repeat(60));

        for (i, check) in report.checks.iter().enumerate() {
            println!("{}. {}...", i + 1, check.name);
            let line = match &check.status {
                CheckStatus::Passed(m) => self.green.apply_to(format!("   ✓ {}", m)),
                CheckStatus::Warning(m) => self.yellow.apply_to(format!("   ⚠ {}", m)),
                CheckStatus::Failed(m) => self.red.apply_to(format!("   ✗ {}", m)),
            };
            println!("{}", line);
        }

        println!(
            "\nValidation Summary: {}/{} checks passed",
            report.passed(),
            report.checks.len()
        );
        if report.is_ok() {
            println!(
                "{}",
                self.green
                    .apply_to("✓ All validation checks passed! Ready to run experiments.")
            );
        } else {
            println!(
                "{}",
                self.red
                    .apply_to("✗ Some validation checks failed. Please fix the issues above.")
            );
        }
    }

    pub fn print_human_urls(&self, session: usize, handle: &SessionHandle) {
        println!("\nSession {}: Human participant URLs:", session);
        for slot in handle.humans() {
            println!(
                "  Player {}: {} (role: {})",
                slot.player_id,
                self.blue.apply_to(&slot.url),
                slot.role.as_deref().unwrap_or("default")
            );
        }
    }

    pub fn print_bot_start(&self, session: usize, app: &str, bots: &[&SlotHandle]) {
        println!("\nSession {}: Starting {} bots for app '{}'", session, bots.len(), app);
        for (i, slot) in bots.iter().enumerate() {
            println!(
                "    Bot {} (Player {}): {} with role '{}'",
                i + 1,
                slot.player_id,
                slot.assignment.label(),
                slot.role.as_deref().unwrap_or("default")
            );
        }
    }

    pub fn print_monitor_url(&self, url: &str) {
        println!("Monitor progress at: {}", self.blue.apply_to(url));
    }

    pub fn print_waiting(&self, humans: usize, monitor_url: &str) {
        println!("\nWaiting for {} human participants...", humans);
        println!("You can monitor progress at:");
        println!("  {}", self.blue.apply_to(monitor_url));
        println!("Press Ctrl+C to stop early and export current data.");
    }

    pub fn print_session_result(&self, session: usize, outcome: &SessionOutcome) {
        match outcome {
            SessionOutcome::Completed { platform_code, .. } => println!(
                "{}",
                self.green.apply_to(format!(
                    "✓ Session {} completed successfully: {}",
                    session, platform_code
                ))
            ),
            SessionOutcome::Failed { error, .. } => println!(
                "{}",
                self.red
                    .apply_to(format!("✗ Session {} failed: {}", session, error))
            ),
        }
    }

    pub fn print_run_summary(&self, outcomes: &[SessionOutcome]) {
        let successes = outcomes.iter().filter(|o| o.is_success()).count();
        println!("\n{}", "=".repeat(60));
        println!(
            "{}",
            self.bold.apply_to(format!(
                "EXPERIMENT COMPLETED: {}/{} sessions successful",
                successes,
                outcomes.len()
            ))
        );
        println!("{}", "=".repeat(60));

        if successes > 0 {
            println!("{}", self.green.apply_to("✓ Successful sessions:"));
            for (i, outcome) in outcomes.iter().enumerate() {
                if let SessionOutcome::Completed {
                    platform_code,
                    output_dir,
                    ..
                } = outcome
                {
                    println!("  Session {}: {}", i + 1, platform_code);
                    println!("    Output: {}", output_dir.display());
                }
            }
        }
        if successes < outcomes.len() {
            println!("{}", self.red.apply_to("✗ Failed sessions:"));
            for (i, outcome) in outcomes.iter().enumerate() {
                if let SessionOutcome::Failed { error, .. } = outcome {
                    println!("  Session {}: {}", i + 1, error);
                }
            }
        }
    }
}

fn centered(text: &str) -> String {
    format!("{:^width$}", text, width = BOX_WIDTH)
}

/// Framed configuration box followed by models and roles in use
fn config_summary(overview: &RunOverview<'_>) -> String {
    let experiment = overview.experiment;
    let roster = &experiment.roster;
    let rows = [
        ("App:", experiment.app.name.clone()),
        ("Total participants:", roster.len().to_string()),
        ("Human participants:", roster.human_count().to_string()),
        ("Bot participants:", roster.bot_count().to_string()),
        ("Sessions to run:", overview.sessions.to_string()),
        ("Max tokens:", overview.max_tokens.to_string()),
        ("Temperature:", overview.temperature.to_string()),
        ("Output directory:", overview.output_dir.display().to_string()),
    ];

    let mut out = String::new();
    let _ = writeln!(out, "\n╔{}╗", "═".repeat(BOX_WIDTH));
    let _ = writeln!(out, "║{}║", centered("EXPERIMENT CONFIGURATION"));
    let _ = writeln!(out, "╠{}╣", "═".repeat(BOX_WIDTH));
    for (label, value) in rows {
        let _ = writeln!(out, "║ {:<20}{:<56} ║", label, value);
    }
    let _ = writeln!(out, "╚{}╝\n", "═".repeat(BOX_WIDTH));

    let models = roster.models();
    if models.is_empty() {
        let _ = writeln!(out, "Models in use: None (humans only)");
    } else {
        let _ = writeln!(out, "Models in use:");
        for model in models {
            let _ = writeln!(out, "  • {}", model);
        }
    }

    let roles = roster.roles();
    if roles.is_empty() {
        let _ = writeln!(out, "\nRoles assigned: None (default prompts only)");
    } else {
        let _ = writeln!(out, "\nRoles assigned:");
        for (role, players) in roles {
            let players: Vec<String> = players.iter().map(u32::to_string).collect();
            match experiment.prompts.description(role) {
                Some(description) => {
                    let _ = writeln!(
                        out,
                        "  • {}: players {} ({})",
                        role,
                        players.join(", "),
                        description
                    );
                }
                None => {
                    let _ = writeln!(out, "  • {}: players {}", role, players.join(", "));
                }
            }
        }
    }
    out.push('\n');
    out
}

fn assignments(roster: &Roster) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Participant Assignments:");
    let _ = writeln!(out, "{}", "-".repeat(60));
    for slot in roster.slots() {
        let role = slot.role.as_deref().unwrap_or("default");
        match &slot.assignment {
            SlotAssignment::Human => {
                let _ = writeln!(out, "  Player {}: HUMAN (role: {})", slot.player_id, role);
            }
            SlotAssignment::Llm(spec) => {
                let _ = writeln!(
                    out,
                    "  Player {}: {} ({}, role: {})",
                    slot.player_id, spec.name, spec.provider, role
                );
            }
        }
    }
    out
}
