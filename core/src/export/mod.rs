//! Session data export
//!
//! Bot data comes from the session's [`ConversationStore`]; platform data from
//! the wide CSV the platform exports, split up by [`normalize::normalize_wide`].

pub mod normalize;
pub mod summary;

pub use normalize::{normalize_wide, NormalizedFiles};
pub use summary::{write_summary, RoleLine, SummaryInfo};

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::bot::answer::RETRY_PREFIX;
use crate::bot::{BotReply, ConversationStore};
use crate::error::Result;
use crate::llm::MessageRole;
use crate::util::truncate_with_ellipsis;

/// Prompts longer than this are cut in the responses export
const PROMPT_PREVIEW_CHARS: usize = 500;
/// Answer ids that usually open a new round
const ROUND_START_HINTS: [&str; 5] = ["choice", "decision", "select", "pick", "vote"];

/// One answered question
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseRow {
    pub session_id: String,
    pub participant_id: String,
    pub round: u32,
    pub question_id: String,
    pub answer: String,
    pub reason: String,
    pub summary: String,
    pub prompt: String,
}

/// One row of the bot participants export
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantRow {
    pub session_id: String,
    pub participant_id: String,
    pub player_id: u32,
    pub is_human: bool,
    pub url: String,
    pub model: String,
    pub role: String,
    pub time_in: String,
    pub time_out: String,
}

static ROUND_MARKER: OnceLock<Regex> = OnceLock::new();
static DIGITS: OnceLock<Regex> = OnceLock::new();

fn round_marker() -> &'static Regex {
    ROUND_MARKER.get_or_init(|| Regex::new(r"[Rr]ound\s*(\d+)").expect("valid regex"))
}

/// Answers of every bot conversation, with the round each was given in.
///
/// A user prompt mentioning `Round N` moves to round N. An answer set whose
/// ids look like a round's opening decision starts a new round once more than
/// two answers were recorded in the current one. Replies that were rejected
/// and re-asked are dropped.
pub fn collect_responses(store: &ConversationStore, session_id: &str) -> Result<Vec<ResponseRow>> {
    let mut rows = Vec::new();

    for conversation in store.conversations(Some(session_id))? {
        let mut round = 1u32;
        let mut answered_in_round = 0usize;
        let mut prompt = String::new();
        // Rows and round state from the last reply, undone if it gets re-asked
        let mut last_reply: Option<(usize, u32, usize)> = None;

        for message in &conversation.messages {
            match message.role {
                MessageRole::User => {
                    if message.content.starts_with(RETRY_PREFIX) {
                        if let Some((len, r, answered)) = last_reply.take() {
                            rows.truncate(len);
                            round = r;
                            answered_in_round = answered;
                        }
                        continue;
                    }
                    if let Some(n) = round_marker()
                        .captures(&message.content)
                        .and_then(|c| c[1].parse::<u32>().ok())
                    {
                        if n != round {
                            round = n;
                            answered_in_round = 0;
                        }
                    }
                    prompt = message.content.clone();
                    last_reply = None;
                }
                MessageRole::Assistant => {
                    let Ok(reply) = BotReply::parse(&message.content) else {
                        continue;
                    };
                    if reply.answers.is_empty() {
                        continue;
                    }
                    last_reply = Some((rows.len(), round, answered_in_round));

                    let opens_round = reply.answers.keys().any(|id| {
                        let id = id.to_lowercase();
                        ROUND_START_HINTS.iter().any(|hint| id.contains(hint))
                    });
                    if opens_round && answered_in_round > 2 {
                        round += 1;
                        answered_in_round = 0;
                    }

                    for (question_id, entry) in &reply.answers {
                        if question_id == "round" {
                            continue;
                        }
                        rows.push(ResponseRow {
                            session_id: conversation.params.session_id.clone(),
                            participant_id: conversation.id.clone(),
                            round,
                            question_id: question_id.clone(),
                            answer: entry.answer.clone(),
                            reason: entry.reason.clone(),
                            summary: reply.summary.clone(),
                            prompt: truncate_with_ellipsis(&prompt, PROMPT_PREVIEW_CHARS),
                        });
                        answered_in_round += 1;
                    }
                }
                MessageRole::System => {}
            }
        }
    }

    rows.sort_by(|a, b| {
        a.participant_id
            .cmp(&b.participant_id)
            .then(a.round.cmp(&b.round))
            .then(question_number(&a.question_id).cmp(&question_number(&b.question_id)))
            .then(a.question_id.cmp(&b.question_id))
    });
    Ok(rows)
}

/// Write the responses CSV. On failure a single error row is written instead
/// and the error is returned.
pub fn export_responses(store: &ConversationStore, session_id: &str, csv_path: &Path) -> Result<usize> {
    let result = collect_responses(store, session_id).and_then(|rows| {
        write_rows(csv_path, &RESPONSE_HEADERS, &rows)?;
        Ok(rows.len())
    });

    match result {
        Ok(0) => {
            tracing::warn!("No bot responses found for session {}", session_id);
            Ok(0)
        }
        Ok(n) => {
            tracing::info!("Wrote {} bot responses to {}", n, csv_path.display());
            Ok(n)
        }
        Err(e) => {
            tracing::error!("Response export for {} failed: {}", session_id, e);
            let error_row = ResponseRow {
                session_id: session_id.to_string(),
                participant_id: "error".to_string(),
                round: 1,
                question_id: "export_error".to_string(),
                answer: format!("Export failed: {}", e),
                reason: "System error during data export".to_string(),
                summary: "Error occurred during data export process".to_string(),
                prompt: "N/A".to_string(),
            };
            if let Err(write_err) = write_rows(csv_path, &RESPONSE_HEADERS, &[error_row]) {
                tracing::error!("Could not write error row to {}: {}", csv_path.display(), write_err);
            }
            Err(e)
        }
    }
}

/// Write every participant slot the store knows for this session
pub fn export_participants(store: &ConversationStore, session_id: &str, csv_path: &Path) -> Result<usize> {
    let rows: Vec<ParticipantRow> = store
        .participants(session_id)?
        .into_iter()
        .map(|p| ParticipantRow {
            session_id: p.session_id,
            participant_id: p.participant_id,
            player_id: p.player_id,
            is_human: p.is_human,
            url: p.url,
            model: p.model.unwrap_or_default(),
            role: p.role.unwrap_or_default(),
            time_in: p.time_in.unwrap_or_default(),
            time_out: p.time_out.unwrap_or_default(),
        })
        .collect();
    write_rows(csv_path, &PARTICIPANT_HEADERS, &rows)?;
    tracing::info!("Wrote {} participants to {}", rows.len(), csv_path.display());
    Ok(rows.len())
}

const RESPONSE_HEADERS: [&str; 8] = [
    "session_id",
    "participant_id",
    "round",
    "question_id",
    "answer",
    "reason",
    "summary",
    "prompt",
];

const PARTICIPANT_HEADERS: [&str; 9] = [
    "session_id",
    "participant_id",
    "player_id",
    "is_human",
    "url",
    "model",
    "role",
    "time_in",
    "time_out",
];

/// Write `headers` then `rows`. Headers are explicit so an empty export still
/// gets them.
fn write_rows<T: Serialize>(path: &Path, headers: &[&str], rows: &[T]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(headers)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// First number in a question id, 999 if it has none
fn question_number(question_id: &str) -> u32 {
    DIGITS
        .get_or_init(|| Regex::new(r"\d+").expect("valid regex"))
        .find(question_id)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(999)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::{BotParams, ParticipantRecord};
    use crate::llm::ChatMessage;
    use pretty_assertions::assert_eq;

    fn params(session: &str, participant: &str) -> BotParams {
        BotParams {
            session_id: session.to_string(),
            participant_id: participant.to_string(),
            player_id: 1,
            url: String::new(),
            model: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            role: None,
            temperature: 0.7,
            max_tokens: 1024,
            throttle: true,
        }
    }

    fn answers(pairs: &[(&str, &str)], summary: &str) -> ChatMessage {
        let answers: serde_json::Map<String, serde_json::Value> = pairs
            .iter()
            .map(|(id, a)| (id.to_string(), serde_json::json!({"answer": a, "reason": "r"})))
            .collect();
        ChatMessage::assistant(serde_json::json!({"answers": answers, "summary": summary}).to_string())
    }

    #[test]
    fn test_round_tracking_and_ordering() {
        let store = ConversationStore::open_in_memory().unwrap();
        let messages = vec![
            ChatMessage::system("rules"),
            ChatMessage::user("Round 1 of 3. Choose."),
            answers(&[("choice", "R"), ("round", "1")], "r1"),
            ChatMessage::user("Round 2 of 3. Choose."),
            answers(&[("choice", "Lizard")], "bad"),
            ChatMessage::user(format!("{} answer 'Lizard' is not allowed", RETRY_PREFIX)),
            answers(&[("choice", "P")], "r2"),
            ChatMessage::user("Survey page"),
            answers(&[("q2_age", "30"), ("q10_comment", "fun"), ("q1_gender", "x")], "survey"),
            ChatMessage::user("Another page with no round marker"),
            answers(&[("final_choice", "S")], "end"),
            ChatMessage::assistant("not json at all"),
        ];
        store.save_conversation("p1", &params("s1", "p1"), &messages).unwrap();
        store
            .save_conversation("p0", &params("s2", "p0"), &[answers(&[("choice", "R")], "")])
            .unwrap();

        let rows = collect_responses(&store, "s1").unwrap();
        let view: Vec<(u32, &str, &str)> = rows
            .iter()
            .map(|r| (r.round, r.question_id.as_str(), r.answer.as_str()))
            .collect();
        assert_eq!(
            view,
            vec![
                (1, "choice", "R"),
                (2, "q1_gender", "x"),
                (2, "q2_age", "30"),
                (2, "q10_comment", "fun"),
                (2, "choice", "P"),
                (3, "final_choice", "S"),
            ]
        );
        assert!(rows.iter().all(|r| r.session_id == "s1" && r.participant_id == "p1"));
        assert_eq!(rows[0].summary, "r1");
        assert_eq!(rows[0].prompt, "Round 1 of 3. Choose.");
    }

    #[test]
    fn test_prompt_preview_is_truncated() {
        let long = "x".repeat(600);
        let p = truncate_with_ellipsis(&long, PROMPT_PREVIEW_CHARS);
        assert_eq!(p.len(), 503);
        assert!(p.ends_with("..."));
        assert_eq!(truncate_with_ellipsis("short", PROMPT_PREVIEW_CHARS), "short");
        assert_eq!(question_number("q12_b3"), 12);
        assert_eq!(question_number("choice"), 999);
    }

    #[test]
    fn test_export_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::open_in_memory().unwrap();
        store
            .add_participant(&ParticipantRecord {
                session_id: "s1".into(),
                participant_id: "p1".into(),
                player_id: 1,
                is_human: false,
                url: "http://x/p1".into(),
                model: Some("gpt-4o-mini".into()),
                role: Some("P2r".into()),
                time_in: None,
                time_out: None,
            })
            .unwrap();

        let participants = dir.path().join("participants.csv");
        assert_eq!(export_participants(&store, "s1", &participants).unwrap(), 1);
        let text = std::fs::read_to_string(&participants).unwrap();
        assert!(text.starts_with("session_id,participant_id,player_id,is_human"));
        assert!(text.contains("s1,p1,1,false,http://x/p1,gpt-4o-mini,P2r,,"));

        let responses = dir.path().join("responses.csv");
        assert_eq!(export_responses(&store, "s1", &responses).unwrap(), 0);
        let text = std::fs::read_to_string(&responses).unwrap();
        assert_eq!(
            text.trim(),
            "session_id,participant_id,round,question_id,answer,reason,summary,prompt"
        );
    }

    #[test]
    fn test_export_failure_writes_error_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("botex_s1.sqlite3");
        let store = ConversationStore::open(&db).unwrap();
        store
            .save_conversation("p1", &params("s1", "p1"), &[answers(&[("choice", "R")], "")])
            .unwrap();
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch("DROP TABLE conversations")
            .unwrap();

        let csv_path = dir.path().join("responses.csv");
        assert!(export_responses(&store, "s1", &csv_path).is_err());

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        assert_eq!(
            reader.headers().unwrap().iter().collect::<Vec<_>>(),
            RESPONSE_HEADERS.to_vec()
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][0], "s1");
        assert_eq!(&rows[0][1], "error");
        assert_eq!(&rows[0][3], "export_error");
        assert!(rows[0][4].starts_with("Export failed: "));
        assert_eq!(&rows[0][7], "N/A");
    }
}
