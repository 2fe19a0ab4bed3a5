//! Participant page scraping
//!
//! Turns an oTree page into a [`PageSnapshot`]: readable text, the form's
//! questions and hidden fields, and whether the page is a form, a wait page or
//! the end of the experiment.

use std::sync::OnceLock;

use regex::Regex;
use reqwest::Url;
use serde::Serialize;

/// Marker in the URL oTree redirects to once a participant has no pages left
pub const FINISHED_MARKER: &str = "OutOfRangeNotification";

/// What the bot should do with a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// A page with a form to submit
    Form,
    /// A wait page; poll until it moves on
    Wait,
    /// No more pages for this participant
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Radio,
    Select,
    Text,
    Number,
    Textarea,
    Checkbox,
    /// Named submit buttons; clicking one is the answer
    Buttons,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

/// A form field the bot must fill in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    /// Form field name
    pub id: String,
    #[serde(rename = "question_type")]
    pub kind: QuestionKind,
    pub label: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(skip)]
    pub required: bool,
    #[serde(skip)]
    position: usize,
}

impl Question {
    pub fn has_choices(&self) -> bool {
        matches!(
            self.kind,
            QuestionKind::Radio | QuestionKind::Select | QuestionKind::Buttons
        )
    }

    /// Map an answer onto an allowed choice value. Matches the value first,
    /// then the label, case-insensitively.
    pub fn match_choice(&self, answer: &str) -> Option<&str> {
        let answer = answer.trim();
        self.choices
            .iter()
            .find(|c| c.value == answer)
            .or_else(|| self.choices.iter().find(|c| c.value.eq_ignore_ascii_case(answer)))
            .or_else(|| self.choices.iter().find(|c| c.label.eq_ignore_ascii_case(answer)))
            .map(|c| c.value.as_str())
    }
}

/// A parsed participant page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    /// Visible text, tags stripped and whitespace collapsed
    pub body: String,
    pub questions: Vec<Question>,
    pub hidden_fields: Vec<(String, String)>,
    /// Absolute URL the form posts to
    pub form_action: Option<String>,
    /// Validation errors shown by the platform after a rejected submit
    pub errors: Vec<String>,
    pub kind: PageKind,
}

impl PageSnapshot {
    /// Parse page HTML fetched from `url`
    pub fn parse(url: &str, html: &str) -> Self {
        let title = first_capture(regex(&TITLE, r"(?is)<title[^>]*>(.*?)</title>"), html)
            .map(|t| clean_text(&t))
            .unwrap_or_default();

        let body_html = first_capture(regex(&BODY, r"(?is)<body[^>]*>(.*)</body>"), html)
            .unwrap_or_else(|| html.to_string());
        let body = visible_text(&body_html);

        let form = find_form(html);
        let errors = find_errors(html);

        let kind = if url.contains(FINISHED_MARKER) {
            PageKind::Finished
        } else if form.as_ref().is_some_and(Form::has_fields) {
            PageKind::Form
        } else if form.is_none() || is_wait_page(html) {
            PageKind::Wait
        } else {
            PageKind::Form
        };

        let (questions, hidden_fields, form_action) = match (&form, kind) {
            (Some(form), PageKind::Form) => {
                let (questions, hidden) = parse_fields(&form.inner);
                let action = resolve_action(url, form.action.as_deref());
                (questions, hidden, action)
            }
            _ => (Vec::new(), Vec::new(), None),
        };

        Self {
            url: url.to_string(),
            title,
            body,
            questions,
            hidden_fields,
            form_action,
            errors,
            kind,
        }
    }

    pub fn has_questions(&self) -> bool {
        !self.questions.is_empty()
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    /// Questions as the JSON list shown to the model
    pub fn questions_json(&self) -> String {
        serde_json::to_string_pretty(&self.questions).unwrap_or_else(|_| "[]".to_string())
    }
}

static TITLE: OnceLock<Regex> = OnceLock::new();
static BODY: OnceLock<Regex> = OnceLock::new();
static FORM: OnceLock<Regex> = OnceLock::new();
static ATTR: OnceLock<Regex> = OnceLock::new();
static INPUT: OnceLock<Regex> = OnceLock::new();
static LABEL: OnceLock<Regex> = OnceLock::new();
static SELECT: OnceLock<Regex> = OnceLock::new();
static OPTION: OnceLock<Regex> = OnceLock::new();
static TEXTAREA: OnceLock<Regex> = OnceLock::new();
static BUTTON: OnceLock<Regex> = OnceLock::new();
static FIELD: OnceLock<Regex> = OnceLock::new();
static WAIT_MARKER: OnceLock<Regex> = OnceLock::new();
static ERRORS: OnceLock<Regex> = OnceLock::new();
static INVISIBLE: OnceLock<Regex> = OnceLock::new();
static BLOCK_END: OnceLock<Regex> = OnceLock::new();
static TAG: OnceLock<Regex> = OnceLock::new();
static SPACES: OnceLock<Regex> = OnceLock::new();
static BLANK_LINES: OnceLock<Regex> = OnceLock::new();

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

struct Form {
    action: Option<String>,
    inner: String,
}

impl Form {
    /// Whether the form has anything to fill in or press
    fn has_fields(&self) -> bool {
        regex(&FIELD, r"(?i)<(?:input|select|textarea|button)\b").is_match(&self.inner)
    }
}

fn find_form(html: &str) -> Option<Form> {
    let re = regex(&FORM, r"(?is)<form\b([^>]*)>(.*?)</form>");
    let forms: Vec<_> = re.captures_iter(html).collect();
    // Prefer the platform's own form when a page has several
    let chosen = forms
        .iter()
        .find(|c| c[1].contains("otree-form") || c[1].contains("id=\"form\""))
        .or_else(|| {
            forms
                .iter()
                .find(|c| attr(&c[1], "method").is_some_and(|m| m.eq_ignore_ascii_case("post")))
        })
        .or(forms.first())?;

    Some(Form {
        action: attr(&chosen[1], "action"),
        inner: chosen[2].to_string(),
    })
}

/// oTree marks wait pages with its `otree-wait-page` classes and loads the
/// wait page script; page text is not consulted.
fn is_wait_page(html: &str) -> bool {
    regex(
        &WAIT_MARKER,
        r#"(?is)\bclass\s*=\s*["'][^"']*\botree-wait-page|<script\b[^>]*\bsrc\s*=\s*["'][^"']*wait_?page[^"']*["']"#,
    )
    .is_match(html)
}

fn find_errors(html: &str) -> Vec<String> {
    let re = regex(
        &ERRORS,
        r#"(?is)<(?:div|span|ul)\b[^>]*class="[^"]*(?:form-control-errors|invalid-feedback|errorlist|alert-danger)[^"]*"[^>]*>(.*?)</(?:div|span|ul)>"#,
    );
    re.captures_iter(html)
        .map(|c| clean_text(&c[1]))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Parse `name="value"` pairs of a tag's attribute string
fn attrs(tag: &str) -> Vec<(String, String)> {
    let re = regex(
        &ATTR,
        r#"(?is)([a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#,
    );
    re.captures_iter(tag)
        .map(|c| {
            let name = c[1].to_lowercase();
            let value = c
                .get(2)
                .or_else(|| c.get(3))
                .or_else(|| c.get(4))
                .map(|m| html_escape::decode_html_entities(m.as_str()).to_string())
                .unwrap_or_default();
            (name, value)
        })
        .collect()
}

fn attr(tag: &str, name: &str) -> Option<String> {
    attrs(tag)
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
}

fn has_attr(tag: &str, name: &str) -> bool {
    attrs(tag).iter().any(|(n, _)| n == name)
}

fn parse_fields(form: &str) -> (Vec<Question>, Vec<(String, String)>) {
    let labels = parse_labels(form);
    let label_for = |id: Option<&str>, name: &str| -> String {
        id.and_then(|id| labels.iter().find(|(f, _)| f == id))
            .or_else(|| {
                let default_id = format!("id_{}", name);
                labels.iter().find(|(f, _)| *f == default_id)
            })
            .map(|(_, text)| text.clone())
            .unwrap_or_else(|| name.to_string())
    };

    let mut questions: Vec<Question> = Vec::new();
    let mut hidden = Vec::new();

    for cap in regex(&INPUT, r"(?is)<input\b([^>]*)>").captures_iter(form) {
        let position = cap.get(0).map(|m| m.start()).unwrap_or(0);
        let tag = &cap[1];
        let Some(name) = attr(tag, "name").filter(|n| !n.is_empty()) else {
            continue;
        };
        let input_type = attr(tag, "type")
            .unwrap_or_else(|| "text".to_string())
            .to_lowercase();
        let value = attr(tag, "value").unwrap_or_default();
        let id = attr(tag, "id");
        let required = has_attr(tag, "required");

        match input_type.as_str() {
            "hidden" => hidden.push((name, value)),
            "submit" | "button" | "reset" | "image" => {}
            "radio" => {
                let choice_label = id
                    .as_deref()
                    .and_then(|id| labels.iter().find(|(f, _)| f == id))
                    .map(|(_, t)| t.clone())
                    .unwrap_or_else(|| value.clone());
                let choice = Choice {
                    value,
                    label: choice_label,
                };
                if let Some(q) = questions.iter_mut().find(|q| q.id == name) {
                    q.choices.push(choice);
                    q.required |= required;
                } else {
                    let label = label_for(None, &name);
                    questions.push(Question {
                        id: name,
                        kind: QuestionKind::Radio,
                        label,
                        choices: vec![choice],
                        required,
                        position,
                    });
                }
            }
            other => {
                let kind = match other {
                    "checkbox" => QuestionKind::Checkbox,
                    "number" | "range" => QuestionKind::Number,
                    _ => QuestionKind::Text,
                };
                let choices = if kind == QuestionKind::Checkbox {
                    vec![Choice {
                        value: if value.is_empty() { "on".to_string() } else { value },
                        label: "checked".to_string(),
                    }]
                } else {
                    Vec::new()
                };
                let label = label_for(id.as_deref(), &name);
                questions.push(Question {
                    id: name,
                    kind,
                    label,
                    choices,
                    required,
                    position,
                });
            }
        }
    }

    for cap in regex(&SELECT, r"(?is)<select\b([^>]*)>(.*?)</select>").captures_iter(form) {
        let position = cap.get(0).map(|m| m.start()).unwrap_or(0);
        let Some(name) = attr(&cap[1], "name") else {
            continue;
        };
        let choices = regex(&OPTION, r"(?is)<option\b([^>]*)>(.*?)</option>")
            .captures_iter(&cap[2])
            .filter_map(|o| {
                let label = clean_text(&o[2]);
                let value = attr(&o[1], "value").unwrap_or_else(|| label.clone());
                (!value.is_empty()).then_some(Choice { value, label })
            })
            .collect();
        let label = label_for(attr(&cap[1], "id").as_deref(), &name);
        questions.push(Question {
            id: name,
            kind: QuestionKind::Select,
            label,
            choices,
            required: has_attr(&cap[1], "required"),
            position,
        });
    }

    for cap in regex(&TEXTAREA, r"(?is)<textarea\b([^>]*)>(.*?)</textarea>").captures_iter(form) {
        let position = cap.get(0).map(|m| m.start()).unwrap_or(0);
        let Some(name) = attr(&cap[1], "name") else {
            continue;
        };
        let label = label_for(attr(&cap[1], "id").as_deref(), &name);
        questions.push(Question {
            id: name,
            kind: QuestionKind::Textarea,
            label,
            choices: Vec::new(),
            required: has_attr(&cap[1], "required"),
            position,
        });
    }

    for cap in regex(&BUTTON, r"(?is)<button\b([^>]*)>(.*?)</button>").captures_iter(form) {
        let position = cap.get(0).map(|m| m.start()).unwrap_or(0);
        let Some(name) = attr(&cap[1], "name").filter(|n| !n.is_empty()) else {
            continue;
        };
        let choice = Choice {
            value: attr(&cap[1], "value").unwrap_or_default(),
            label: clean_text(&cap[2]),
        };
        if let Some(q) = questions.iter_mut().find(|q| q.id == name) {
            q.choices.push(choice);
        } else {
            let label = label_for(None, &name);
            questions.push(Question {
                id: name,
                kind: QuestionKind::Buttons,
                label,
                choices: vec![choice],
                required: true,
                position,
            });
        }
    }

    questions.sort_by_key(|q| q.position);
    (questions, hidden)
}

fn parse_labels(form: &str) -> Vec<(String, String)> {
    regex(&LABEL, r"(?is)<label\b([^>]*)>(.*?)</label>")
        .captures_iter(form)
        .filter_map(|c| attr(&c[1], "for").map(|f| (f, clean_text(&c[2]))))
        .collect()
}

fn resolve_action(page_url: &str, action: Option<&str>) -> Option<String> {
    let action = action.map(str::trim).unwrap_or("");
    if action.is_empty() {
        return Some(page_url.to_string());
    }
    let base = Url::parse(page_url).ok()?;
    base.join(action).ok().map(|u| u.to_string())
}

/// Strip tags from an HTML fragment and decode entities into one line
fn clean_text(fragment: &str) -> String {
    let stripped = regex(&TAG, r"(?s)<[^>]*>").replace_all(fragment, " ");
    let decoded = html_escape::decode_html_entities(&stripped);
    regex(&SPACES, r"[ \t\r\n\u{a0}]+")
        .replace_all(decoded.trim(), " ")
        .trim()
        .to_string()
}

/// Readable page text with block boundaries kept as line breaks
fn visible_text(html: &str) -> String {
    let without_scripts = regex(
        &INVISIBLE,
        r"(?is)<(script|style|noscript|template|head)\b[^>]*>.*?</(?:script|style|noscript|template|head)>",
    )
    .replace_all(html, " ");
    let with_breaks = regex(
        &BLOCK_END,
        r"(?i)<br\s*/?>|</(?:p|div|h[1-6]|li|tr|table|section|label)>",
    )
    .replace_all(&without_scripts, "\n");
    let stripped = regex(&TAG, r"(?s)<[^>]*>").replace_all(&with_breaks, " ");
    let decoded = html_escape::decode_html_entities(&stripped);

    let lines: Vec<String> = decoded
        .lines()
        .map(|l| {
            regex(&SPACES, r"[ \t\r\n\u{a0}]+")
                .replace_all(l.trim(), " ")
                .to_string()
        })
        .filter(|l| !l.is_empty())
        .collect();
    let text = lines.join("\n");
    regex(&BLANK_LINES, r"\n{3,}")
        .replace_all(&text, "\n\n")
        .to_string()
}
