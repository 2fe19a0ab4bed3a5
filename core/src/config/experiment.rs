//! Experiment configuration and validation
//!
//! Ties an app, its validated roster and its prompt book together. Built once
//! before any session starts and shared read-only by every session.

use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};

use super::models::ModelRegistry;
use super::roster::{RawRoster, Roster, SlotAssignment};
use crate::error::{LabError, Result};
use crate::paradigm::{AppInfo, PromptBook, PromptSet};

/// A fully resolved experiment
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub app: AppInfo,
    pub roster: Roster,
    pub prompts: PromptBook,
}

impl ExperimentConfig {
    /// Load the roster and prompt book of `app` and check grouping.
    ///
    /// Any configuration error is returned before a session exists.
    pub fn load(app: AppInfo, registry: &ModelRegistry) -> Result<Self> {
        let roster = Roster::load(&app.roster_path(), registry)?;
        let prompts = PromptBook::load_for_app(&app.dir)?;

        if let Some(group_size) = prompts.players_per_group {
            if roster.len() % group_size != 0 {
                return Err(LabError::InvalidGrouping {
                    participants: roster.len(),
                    group_size,
                });
            }
        }

        Ok(Self {
            app,
            roster,
            prompts,
        })
    }

    pub fn participants(&self) -> usize {
        self.roster.len()
    }

    /// Roles assigned in the roster that the prompt book does not define.
    ///
    /// Empty when the book declares no roles at all, since there is nothing
    /// to check against.
    pub fn invalid_roles(&self) -> Vec<String> {
        if self.prompts.roles.is_empty() {
            return Vec::new();
        }
        self.roster
            .roles()
            .into_keys()
            .filter(|role| !self.prompts.has_role(role))
            .map(str::to_string)
            .collect()
    }

    /// API key variables needed by the roster's models but not set
    pub fn missing_api_keys<F>(&self, lookup: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing: Vec<&'static str> = self
            .roster
            .slots()
            .iter()
            .filter_map(|s| s.assignment.model())
            .filter_map(|m| m.api_key_env())
            .filter(|var| lookup(var).map_or(true, |v| v.trim().is_empty()))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    /// Prompt set for one player, with the local-model brevity variant
    /// applied when needed.
    pub fn prompts_for(&self, player_id: u32) -> PromptSet {
        let slot = self.roster.slot(player_id);
        let role = slot.and_then(|s| s.role.as_deref());
        let set = self.prompts.for_role(role);
        let is_local = slot
            .and_then(|s| s.assignment.model())
            .is_some_and(|m| m.provider == super::types::Provider::Local);
        if is_local {
            set.with_brevity()
        } else {
            set
        }
    }

    /// `modified_session_config_fields` recorded with the platform session
    pub fn session_config_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        for slot in self.roster.slots() {
            let i = slot.player_id;
            let role = slot.role.clone().unwrap_or_else(|| "default".to_string());
            let model = match &slot.assignment {
                SlotAssignment::Human => "human".to_string(),
                SlotAssignment::Llm(spec) => spec.name.clone(),
            };
            fields.insert(format!("player_{}_intended_model", i), json!(model));
            fields.insert(format!("player_{}_role", i), json!(role));

            if !slot.assignment.is_human() {
                fields.insert(format!("bot_position_{}_model", i), json!(model));
                fields.insert(format!("bot_position_{}_role", i), json!(role));
            }
        }
        fields
    }
}

/// Outcome of one validation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Passed(String),
    Warning(String),
    Failed(String),
}

impl CheckStatus {
    pub fn is_ok(&self) -> bool {
        !matches!(self, CheckStatus::Failed(_))
    }

    pub fn message(&self) -> &str {
        match self {
            CheckStatus::Passed(m) | CheckStatus::Warning(m) | CheckStatus::Failed(m) => m,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationCheck {
    pub name: &'static str,
    pub status: CheckStatus,
}

/// Result of `validate`: six checks, run in order
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub checks: Vec<ValidationCheck>,
    /// The loaded experiment, when the roster could be resolved
    pub experiment: Option<ExperimentConfig>,
}

impl ValidationReport {
    /// Run every check. Later checks are skipped (failed) when the roster
    /// cannot be loaded.
    pub fn run<F>(app: &AppInfo, registry: &ModelRegistry, output_dir: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut report = Self::default();

        report.push("App configuration", check_app_files(app));

        let raw = RawRoster::load(&app.roster_path());
        match &raw {
            Ok(raw) if !raw.rows.is_empty() => report.push(
                "Model mapping",
                CheckStatus::Passed(format!("{} participants loaded", raw.rows.len())),
            ),
            Ok(_) => report.push(
                "Model mapping",
                CheckStatus::Failed("player_models.csv has no rows".to_string()),
            ),
            Err(e) => report.push("Model mapping", CheckStatus::Failed(e.to_string())),
        }

        let experiment = ExperimentConfig::load(app.clone(), registry);

        let roles = match (&raw, &experiment) {
            (Ok(raw), _) if !raw.has_roles() => {
                CheckStatus::Passed("No roles assigned, default prompts will be used".to_string())
            }
            (_, Ok(exp)) if exp.prompts.roles.is_empty() => CheckStatus::Warning(format!(
                "Roles assigned but app '{}' declares none",
                app.name
            )),
            (_, Ok(exp)) => {
                let invalid = exp.invalid_roles();
                if invalid.is_empty() {
                    CheckStatus::Passed(format!("All assigned roles are valid for '{}'", app.name))
                } else {
                    let valid: Vec<_> = exp.prompts.roles().collect();
                    CheckStatus::Failed(format!(
                        "Invalid roles: {} (valid: {})",
                        invalid.join(", "),
                        valid.join(", ")
                    ))
                }
            }
            (_, Err(_)) => CheckStatus::Failed("Roles could not be checked".to_string()),
        };
        report.push("Role assignment", roles);

        match &experiment {
            Ok(_) => report.push(
                "Model availability",
                CheckStatus::Passed("All assigned models are available".to_string()),
            ),
            Err(e) => report.push("Model availability", CheckStatus::Failed(e.to_string())),
        }

        let keys = match &experiment {
            Ok(exp) => {
                let missing = exp.missing_api_keys(&lookup);
                if missing.is_empty() {
                    CheckStatus::Passed("Required API keys are set".to_string())
                } else {
                    CheckStatus::Failed(format!("Missing API keys: {}", missing.join(", ")))
                }
            }
            Err(_) => CheckStatus::Failed("API keys could not be checked".to_string()),
        };
        report.push("Environment", keys);

        report.push("Output directory", check_output_dir(output_dir));

        report.experiment = experiment.ok();
        report
    }

    fn push(&mut self, name: &'static str, status: CheckStatus) {
        self.checks.push(ValidationCheck { name, status });
    }

    pub fn passed(&self) -> usize {
        self.checks.iter().filter(|c| c.status.is_ok()).count()
    }

    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.status.is_ok())
    }
}

fn check_app_files(app: &AppInfo) -> CheckStatus {
    let mut notes = Vec::new();
    if !app.roster_path().is_file() {
        return CheckStatus::Failed(format!("Missing player_models.csv in '{}'", app.name));
    }
    if !app.has_prompts() {
        notes.push("no prompts.toml, built-in prompts will be used");
    }
    if !app.has_platform_code() {
        notes.push("platform code not found locally");
    }
    if notes.is_empty() {
        CheckStatus::Passed("App configuration is complete".to_string())
    } else {
        CheckStatus::Warning(notes.join("; "))
    }
}

fn check_output_dir(dir: &Path) -> CheckStatus {
    let marker = dir.join(".write_test");
    let result = fs::create_dir_all(dir)
        .and_then(|_| fs::write(&marker, b"test"))
        .and_then(|_| fs::remove_file(&marker));
    match result {
        Ok(()) => CheckStatus::Passed(format!("{} is writable", dir.display())),
        Err(e) => CheckStatus::Failed(format!("{}: {}", dir.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::roster::ROSTER_FILE;
    use crate::paradigm::PROMPTS_FILE;
    use pretty_assertions::assert_eq;

    const PROMPTS: &str = r#"
players_per_group = 2

[default]
system = "Play."

[roles.P2]
description = "Detailed payoffs"

[roles.P5]
description = "Opponent prediction"
"#;

    fn app(roster: &str, prompts: Option<&str>) -> (tempfile::TempDir, AppInfo) {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("rps_repeat");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(ROSTER_FILE), roster).unwrap();
        if let Some(p) = prompts {
            fs::write(dir.join(PROMPTS_FILE), p).unwrap();
        }
        let info = AppInfo {
            name: "rps_repeat".to_string(),
            dir,
        };
        (root, info)
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::from_lookup(|k| match k {
            "GOOGLE_MODELS" => Some("gemini-1.5-flash".to_string()),
            "LOCAL_LLM_MODELS" => Some("tinyllama".to_string()),
            _ => None,
        })
    }

    #[test]
    fn test_session_config_fields() {
        let (_root, app) = app(
            "player_id,model_name,role\n1,human,\n2,gemini-1.5-flash,P5\n",
            Some(PROMPTS),
        );
        let exp = ExperimentConfig::load(app, &registry()).unwrap();
        let fields = exp.session_config_fields();

        assert_eq!(fields["player_1_intended_model"], json!("human"));
        assert_eq!(fields["player_1_role"], json!("default"));
        assert_eq!(fields["player_2_intended_model"], json!("gemini-1.5-flash"));
        assert_eq!(fields["bot_position_2_model"], json!("gemini-1.5-flash"));
        assert_eq!(fields["bot_position_2_role"], json!("P5"));
        assert!(!fields.contains_key("bot_position_1_model"));
    }

    #[test]
    fn test_grouping_checked() {
        let (_root, app) = app("player_id,model_name\n1,human\n2,human\n3,human\n", Some(PROMPTS));
        assert!(matches!(
            ExperimentConfig::load(app, &registry()),
            Err(LabError::InvalidGrouping {
                participants: 3,
                group_size: 2
            })
        ));
    }

    #[test]
    fn test_invalid_roles_and_keys() {
        let (_root, app) = app(
            "player_id,model_name,role\n1,gemini-1.5-flash,P9\n2,tinyllama,P2\n",
            Some(PROMPTS),
        );
        let exp = ExperimentConfig::load(app, &registry()).unwrap();
        assert_eq!(exp.invalid_roles(), vec!["P9".to_string()]);
        assert_eq!(exp.missing_api_keys(|_| None), vec!["GOOGLE_API_KEY"]);
        assert!(exp
            .missing_api_keys(|k| (k == "GOOGLE_API_KEY").then(|| "key".to_string()))
            .is_empty());
    }

    #[test]
    fn test_local_models_get_brief_prompts() {
        let (_root, app) = app(
            "player_id,model_name\n1,gemini-1.5-flash\n2,tinyllama\n",
            None,
        );
        let exp = ExperimentConfig::load(app, &registry()).unwrap();
        assert!(!exp.prompts_for(1).system.contains("extremely brief"));
        assert!(exp.prompts_for(2).system.contains("extremely brief"));
    }

    #[test]
    fn test_validation_report_all_pass() {
        let (root, app) = app(
            "player_id,model_name,role\n1,human,\n2,gemini-1.5-flash,P2\n",
            Some(PROMPTS),
        );
        let out = root.path().join("out");
        let report = ValidationReport::run(&app, &registry(), &out, |_| Some("key".to_string()));

        assert_eq!(report.checks.len(), 6);
        assert!(report.is_ok(), "{:?}", report.checks);
        assert_eq!(report.passed(), 6);
        assert!(report.experiment.is_some());
        assert!(out.is_dir());
        // no __init__.py next to the roster
        assert!(matches!(report.checks[0].status, CheckStatus::Warning(_)));
    }

    #[test]
    fn test_validation_report_failures() {
        let (root, app) = app(
            "player_id,model_name,role\n1,gpt-9,P2\n2,human,P7\n",
            Some(PROMPTS),
        );
        let report = ValidationReport::run(&app, &registry(), root.path(), |_| None);

        assert_eq!(report.checks.len(), 6);
        assert!(!report.is_ok());
        assert!(report.checks[1].status.is_ok());
        assert!(!report.checks[3].status.is_ok());
        assert!(report.checks[3].status.message().contains("gpt-9"));
        assert!(report.experiment.is_none());
    }
}
