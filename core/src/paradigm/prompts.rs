//! Prompt books
//!
//! Each app may ship a `prompts.toml` with a default prompt set and
//! per-role variants:
//!
//! ```toml
//! players_per_group = 2
//!
//! [default]
//! system = "You are participating in an experiment..."
//! analyze_page_q = "Page content: {body}\nQuestions: {questions_json}"
//!
//! [roles.P4]
//! description = "Clear points explanation"
//! analyze_page_q = "..."
//! ```
//!
//! Role fields that are left out fall back to `[default]`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

/// File name of the prompt book inside an app directory
pub const PROMPTS_FILE: &str = "prompts.toml";

const BODY: &str = "{body}";
const QUESTIONS: &str = "{questions_json}";
const SUMMARY: &str = "{summary}";

const BUILTIN_SYSTEM: &str =
    "You are participating in an experiment. Always respond in valid JSON format only.";
const BUILTIN_ANALYZE_Q: &str =
    "Page content: {body}\nQuestions: {questions_json}\nRespond with valid JSON only.";
const BUILTIN_ANALYZE_NO_Q: &str = "Page content: {body}\n\n\
     Your summary of the experiment so far: {summary}\n\n\
     This page has no questions. Update your summary with anything relevant \
     from this page. Respond with valid JSON only.";

/// Appended to every prompt sent to a local model
pub const BREVITY_NOTE: &str = "\n\nIMPORTANT: Your responses must be extremely brief and concise.";

/// Prompts a bot uses for one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSet {
    #[serde(default = "builtin_system")]
    pub system: String,
    #[serde(default = "builtin_analyze_q")]
    pub analyze_page_q: String,
    #[serde(default)]
    pub analyze_page_no_q: Option<String>,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system: builtin_system(),
            analyze_page_q: builtin_analyze_q(),
            analyze_page_no_q: None,
        }
    }
}

fn builtin_system() -> String {
    BUILTIN_SYSTEM.to_string()
}

fn builtin_analyze_q() -> String {
    BUILTIN_ANALYZE_Q.to_string()
}

impl PromptSet {
    /// Prompt for a page with questions
    pub fn render_questions(&self, body: &str, questions_json: &str, summary: &str) -> String {
        fill(&self.analyze_page_q, body, questions_json, summary)
    }

    /// Prompt for a page without questions
    pub fn render_no_questions(&self, body: &str, summary: &str) -> String {
        let template = self
            .analyze_page_no_q
            .as_deref()
            .unwrap_or(BUILTIN_ANALYZE_NO_Q);
        fill(template, body, "[]", summary)
    }

    /// Variant for local models: every prompt gets a brevity instruction
    pub fn with_brevity(&self) -> Self {
        Self {
            system: format!("{}{}", self.system, BREVITY_NOTE),
            analyze_page_q: format!("{}{}", self.analyze_page_q, BREVITY_NOTE),
            analyze_page_no_q: Some(format!(
                "{}{}",
                self.analyze_page_no_q
                    .as_deref()
                    .unwrap_or(BUILTIN_ANALYZE_NO_Q),
                BREVITY_NOTE
            )),
        }
    }
}

/// Replace the known placeholders in one pass, so substituted text is never
/// expanded again. A template without `{summary}` still gets a non-empty
/// summary, prepended.
fn fill(template: &str, body: &str, questions_json: &str, summary: &str) -> String {
    let mut rendered = String::with_capacity(template.len() + body.len() + questions_json.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start..];
        let (value, len) = if tail.starts_with(BODY) {
            (body, BODY.len())
        } else if tail.starts_with(QUESTIONS) {
            (questions_json, QUESTIONS.len())
        } else if tail.starts_with(SUMMARY) {
            (summary, SUMMARY.len())
        } else {
            ("{", 1)
        };
        rendered.push_str(value);
        rest = &tail[len..];
    }
    rendered.push_str(rest);

    if template.contains(SUMMARY) || summary.trim().is_empty() {
        rendered
    } else {
        format!(
            "Your summary of the experiment so far: {}\n\n{}",
            summary, rendered
        )
    }
}

/// A role's overrides on top of the default set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePrompts {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub analyze_page_q: Option<String>,
    #[serde(default)]
    pub analyze_page_no_q: Option<String>,
}

/// An app's prompt book
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptBook {
    /// Group size required by the paradigm, if any
    #[serde(default)]
    pub players_per_group: Option<usize>,
    #[serde(default)]
    pub default: PromptSet,
    #[serde(default)]
    pub roles: BTreeMap<String, RolePrompts>,
}

impl PromptBook {
    /// Built-in generic prompts with no roles
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Load `prompts.toml` from an app directory, or the built-in book when
    /// the app has none.
    pub fn load_for_app(app_dir: &Path) -> Result<Self> {
        let path = app_dir.join(PROMPTS_FILE);
        if !path.exists() {
            tracing::debug!("No prompt book at {}, using built-in prompts", path.display());
            return Ok(Self::builtin());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let book: PromptBook = toml::from_str(&content).map_err(|e| LabError::InvalidPrompts {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if book.players_per_group == Some(0) {
            return Err(LabError::InvalidPrompts {
                path: path.to_path_buf(),
                reason: "players_per_group must be at least 1".to_string(),
            });
        }
        Ok(book)
    }

    /// Role names declared by the book
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    pub fn description(&self, role: &str) -> Option<&str> {
        self.roles.get(role).and_then(|r| r.description.as_deref())
    }

    /// Resolve the prompt set for a role. Unknown or absent roles get the
    /// default set.
    pub fn for_role(&self, role: Option<&str>) -> PromptSet {
        let Some(overrides) = role.and_then(|r| self.roles.get(r)) else {
            if let Some(role) = role {
                tracing::warn!("Role '{}' not in prompt book, using default prompts", role);
            }
            return self.default.clone();
        };

        PromptSet {
            system: overrides
                .system
                .clone()
                .unwrap_or_else(|| self.default.system.clone()),
            analyze_page_q: overrides
                .analyze_page_q
                .clone()
                .unwrap_or_else(|| self.default.analyze_page_q.clone()),
            analyze_page_no_q: overrides
                .analyze_page_no_q
                .clone()
                .or_else(|| self.default.analyze_page_no_q.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BOOK: &str = r#"
players_per_group = 2

[default]
system = "Play well."
analyze_page_q = "Page: {body}\nQ: {questions_json}"

[roles.P4]
description = "Clear points explanation"
analyze_page_q = "P4 rules. Page: {body}\nQ: {questions_json}\nSo far: {summary}"

[roles.P5]
system = "Predict the opponent."
"#;

    #[test]
    fn test_role_overrides_fall_back_to_default() {
        let book: PromptBook = toml::from_str(BOOK).unwrap();
        assert_eq!(book.players_per_group, Some(2));
        assert_eq!(book.roles().collect::<Vec<_>>(), vec!["P4", "P5"]);
        assert_eq!(book.description("P4"), Some("Clear points explanation"));

        let p4 = book.for_role(Some("P4"));
        assert_eq!(p4.system, "Play well.");
        assert!(p4.analyze_page_q.starts_with("P4 rules."));

        let p5 = book.for_role(Some("P5"));
        assert_eq!(p5.system, "Predict the opponent.");
        assert_eq!(p5.analyze_page_q, book.default.analyze_page_q);

        assert_eq!(book.for_role(Some("P9")), book.default);
        assert_eq!(book.for_role(None), book.default);
    }

    #[test]
    fn test_render_placeholders() {
        let book: PromptBook = toml::from_str(BOOK).unwrap();

        let p4 = book.for_role(Some("P4"));
        assert_eq!(
            p4.render_questions("Round 1", "[{\"id\":\"choice\"}]", "won once"),
            "P4 rules. Page: Round 1\nQ: [{\"id\":\"choice\"}]\nSo far: won once"
        );

        let default = book.for_role(None);
        assert_eq!(default.render_questions("Hi", "[]", ""), "Page: Hi\nQ: []");
        assert_eq!(
            default.render_questions("Hi", "[]", "earlier"),
            "Your summary of the experiment so far: earlier\n\nPage: Hi\nQ: []"
        );
    }

    #[test]
    fn test_page_text_placeholders_are_not_expanded() {
        let set = PromptSet {
            analyze_page_q: "Page: {body}\nQ: {questions_json}\nSo far: {summary}".to_string(),
            ..PromptSet::default()
        };
        assert_eq!(
            set.render_questions("type {summary} or {questions_json} {x}", "[]", "lost"),
            "Page: type {summary} or {questions_json} {x}\nQ: []\nSo far: lost"
        );
    }

    #[test]
    fn test_no_question_prompt_defaults_to_builtin() {
        let set = PromptSet::default();
        let prompt = set.render_no_questions("Welcome", "nothing yet");
        assert!(prompt.contains("Page content: Welcome"));
        assert!(prompt.contains("so far: nothing yet"));
    }

    #[test]
    fn test_brevity_variant() {
        let set = PromptSet::default().with_brevity();
        assert!(set.system.ends_with(BREVITY_NOTE));
        assert!(set.analyze_page_q.ends_with(BREVITY_NOTE));
        assert!(set.analyze_page_no_q.unwrap().ends_with(BREVITY_NOTE));
    }

    #[test]
    fn test_load_for_app() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PromptBook::load_for_app(dir.path()).unwrap(), PromptBook::builtin());

        fs::write(dir.path().join(PROMPTS_FILE), BOOK).unwrap();
        let book = PromptBook::load_for_app(dir.path()).unwrap();
        assert!(book.has_role("P4"));

        fs::write(dir.path().join(PROMPTS_FILE), "players_per_group = 0\n").unwrap();
        assert!(matches!(
            PromptBook::load_for_app(dir.path()),
            Err(LabError::InvalidPrompts { .. })
        ));

        fs::write(dir.path().join(PROMPTS_FILE), "[default\n").unwrap();
        assert!(matches!(
            PromptBook::load_for_app(dir.path()),
            Err(LabError::InvalidPrompts { .. })
        ));
    }
}
