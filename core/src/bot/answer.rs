//! Parsing and checking the model's reply to a page

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::otree::{PageSnapshot, QuestionKind};

/// Appended to prompts for pages with questions
pub const ANSWER_FORMAT: &str = "\n\nReply with a single JSON object and nothing else, shaped like \
{\"answers\": {\"<question id>\": {\"answer\": <your answer>, \"reason\": \"<short reason>\"}}, \
\"summary\": \"<your updated summary of the experiment so far>\"}. \
Answer every question, using the question ids given. For questions with choices, \
answer with one of the listed choice values.";

/// Opens the follow-up prompt after an unusable reply
pub const RETRY_PREFIX: &str = "Your answer could not be used:";

/// Appended to prompts for pages without questions
pub const SUMMARY_FORMAT: &str = "\n\nReply with a single JSON object and nothing else, shaped like \
{\"summary\": \"<your updated summary of the experiment so far>\"}.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerEntry {
    pub answer: String,
    #[serde(default)]
    pub reason: String,
}

/// A model reply after parsing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BotReply {
    pub answers: BTreeMap<String, AnswerEntry>,
    pub summary: String,
}

impl BotReply {
    /// Parse a reply, tolerating code fences and prose around the JSON object
    pub fn parse(text: &str) -> Result<Self, String> {
        let json = extract_json_object(text).ok_or_else(|| {
            "your reply did not contain a JSON object".to_string()
        })?;
        let value: Value = serde_json::from_str(json)
            .map_err(|e| format!("your reply was not valid JSON ({})", e))?;
        let Value::Object(mut root) = value else {
            return Err("your reply must be a JSON object".to_string());
        };

        let summary = match root.remove("summary") {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        let mut answers = BTreeMap::new();
        match root.remove("answers") {
            Some(Value::Object(map)) => {
                for (id, entry) in map {
                    answers.insert(id, answer_entry(entry));
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => return Err("\"answers\" must be an object keyed by question id".to_string()),
        }

        Ok(Self { answers, summary })
    }

    /// Check the answers against the page and produce the form fields to
    /// submit. The error text is fed back to the model.
    pub fn form_fields(&self, page: &PageSnapshot) -> Result<Vec<(String, String)>, String> {
        let mut fields = Vec::new();
        let mut problems = Vec::new();

        for question in &page.questions {
            let Some(entry) = self.answers.get(&question.id) else {
                if question.kind == QuestionKind::Checkbox {
                    continue;
                }
                problems.push(format!("question '{}' was not answered", question.id));
                continue;
            };
            let answer = entry.answer.trim();

            match question.kind {
                QuestionKind::Checkbox => {
                    if is_truthy(answer) {
                        if let Some(choice) = question.choices.first() {
                            fields.push((question.id.clone(), choice.value.clone()));
                        }
                    }
                }
                _ if question.has_choices() => match question.match_choice(answer) {
                    Some(value) => fields.push((question.id.clone(), value.to_string())),
                    None => {
                        let allowed: Vec<&str> =
                            question.choices.iter().map(|c| c.value.as_str()).collect();
                        problems.push(format!(
                            "answer '{}' for question '{}' is not one of: {}",
                            answer,
                            question.id,
                            allowed.join(", ")
                        ));
                    }
                },
                QuestionKind::Number => {
                    if answer.parse::<f64>().is_ok() {
                        fields.push((question.id.clone(), answer.to_string()));
                    } else {
                        problems.push(format!(
                            "answer '{}' for question '{}' must be a number",
                            answer, question.id
                        ));
                    }
                }
                _ => {
                    if answer.is_empty() && question.required {
                        problems.push(format!("question '{}' needs a non-empty answer", question.id));
                    } else {
                        fields.push((question.id.clone(), answer.to_string()));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(fields)
        } else {
            Err(problems.join("; "))
        }
    }
}

fn answer_entry(value: Value) -> AnswerEntry {
    match value {
        Value::Object(mut map) => AnswerEntry {
            answer: map.remove("answer").map(scalar_text).unwrap_or_default(),
            reason: map.remove("reason").map(scalar_text).unwrap_or_default(),
        },
        other => AnswerEntry {
            answer: scalar_text(other),
            reason: String::new(),
        },
    }
}

fn scalar_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_truthy(answer: &str) -> bool {
    matches!(
        answer.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1" | "checked"
    )
}

/// The outermost `{...}` in `text`
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r#"<html><body><form method="post" class="otree-form">
        <label for="id_choice">Your move</label>
        <input type="radio" name="choice" value="R" id="id_choice-0"><label for="id_choice-0">Rock</label>
        <input type="radio" name="choice" value="P" id="id_choice-1"><label for="id_choice-1">Paper</label>
        <input type="number" name="guess" id="id_guess">
        <input type="checkbox" name="agree" id="id_agree">
        </form></body></html>"#;

    fn page() -> PageSnapshot {
        PageSnapshot::parse("http://localhost:8000/p/x/rps/Decision/1", PAGE)
    }

    #[test]
    fn test_parse_fenced_reply() {
        let text = "Sure!\n```json\n{\"answers\": {\"choice\": {\"answer\": \"Paper\", \"reason\": \"beats rock\"}, \
                    \"guess\": {\"answer\": 3}}, \"summary\": \"Round 1 done\"}\n```";
        let reply = BotReply::parse(text).unwrap();
        assert_eq!(reply.summary, "Round 1 done");
        assert_eq!(
            reply.answers["choice"],
            AnswerEntry {
                answer: "Paper".into(),
                reason: "beats rock".into()
            }
        );
        assert_eq!(reply.answers["guess"].answer, "3");

        let fields = reply.form_fields(&page()).unwrap();
        assert_eq!(
            fields,
            vec![
                ("choice".to_string(), "P".to_string()),
                ("guess".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_answers_are_reported() {
        let reply = BotReply::parse(
            r#"{"answers": {"choice": {"answer": "Lizard"}, "guess": {"answer": "many"}, "agree": {"answer": true}}}"#,
        )
        .unwrap();
        let err = reply.form_fields(&page()).unwrap_err();
        assert!(err.contains("'Lizard' for question 'choice' is not one of: R, P"));
        assert!(err.contains("'guess' must be a number"));

        let reply = BotReply::parse(r#"{"answers": {"guess": {"answer": 1}}}"#).unwrap();
        assert_eq!(
            reply.form_fields(&page()).unwrap_err(),
            "question 'choice' was not answered"
        );
    }

    #[test]
    fn test_checkbox_and_bare_answers() {
        let reply = BotReply::parse(r#"{"answers": {"choice": "R", "guess": 0, "agree": "yes"}}"#).unwrap();
        let fields = reply.form_fields(&page()).unwrap();
        assert_eq!(fields.last(), Some(&("agree".to_string(), "on".to_string())));
        assert_eq!(reply.summary, "");
    }

    #[test]
    fn test_malformed_replies() {
        assert!(BotReply::parse("I choose rock").unwrap_err().contains("JSON object"));
        assert!(BotReply::parse("{not json}").unwrap_err().contains("not valid JSON"));
        assert!(BotReply::parse(r#"{"answers": [1, 2]}"#).is_err());

        let summary_only = BotReply::parse(r#"{"summary": "welcome page"}"#).unwrap();
        assert!(summary_only.answers.is_empty());
        assert_eq!(summary_only.summary, "welcome page");
    }
}
