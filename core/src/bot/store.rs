//! Conversation store
//!
//! One SQLite file per session with two tables:
//! - `participants`: every slot of the session, human or bot
//! - `conversations`: one row per bot with its parameters and messages as JSON

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::llm::ChatMessage;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS participants (
    session_id TEXT NOT NULL,
    participant_id TEXT PRIMARY KEY,
    player_id INTEGER NOT NULL,
    is_human INTEGER NOT NULL,
    url TEXT NOT NULL,
    model TEXT,
    role TEXT,
    time_in TEXT,
    time_out TEXT
);
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    bot_parms TEXT NOT NULL,
    conversation TEXT NOT NULL
);
"#;

/// File name of a session's store
pub fn store_file_name(local_id: &str, suffix: &str) -> String {
    format!("botex_{}{}.sqlite3", local_id, suffix)
}

/// One row of the `participants` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub session_id: String,
    pub participant_id: String,
    pub player_id: u32,
    pub is_human: bool,
    pub url: String,
    pub model: Option<String>,
    pub role: Option<String>,
    pub time_in: Option<String>,
    pub time_out: Option<String>,
}

/// Settings a bot ran with, stored alongside its conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotParams {
    pub session_id: String,
    pub participant_id: String,
    pub player_id: u32,
    pub url: String,
    pub model: String,
    pub provider: String,
    pub role: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub throttle: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: String,
    pub params: BotParams,
    pub messages: Vec<ChatMessage>,
}

/// Shared handle to a session's SQLite store
#[derive(Clone)]
pub struct ConversationStore {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("path", &self.path)
            .finish()
    }
}

impl ConversationStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::debug!(path = %path.display(), "Conversation store opened");
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            path: None,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn add_participant(&self, record: &ParticipantRecord) -> Result<()> {
        self.conn.lock().execute(
            r#"
            INSERT OR REPLACE INTO participants
                (session_id, participant_id, player_id, is_human, url, model, role, time_in, time_out)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.session_id,
                record.participant_id,
                record.player_id,
                record.is_human,
                record.url,
                record.model,
                record.role,
                record.time_in,
                record.time_out,
            ],
        )?;
        Ok(())
    }

    /// Stamp the time a bot started on its participant
    pub fn mark_started(&self, participant_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE participants SET time_in = ?1 WHERE participant_id = ?2",
            params![now(), participant_id],
        )?;
        Ok(())
    }

    pub fn mark_finished(&self, participant_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE participants SET time_out = ?1 WHERE participant_id = ?2",
            params![now(), participant_id],
        )?;
        Ok(())
    }

    pub fn participants(&self, session_id: &str) -> Result<Vec<ParticipantRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, participant_id, player_id, is_human, url, model, role, time_in, time_out
            FROM participants WHERE session_id = ?1 ORDER BY player_id
            "#,
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(ParticipantRecord {
                session_id: row.get(0)?,
                participant_id: row.get(1)?,
                player_id: row.get(2)?,
                is_human: row.get(3)?,
                url: row.get(4)?,
                model: row.get(5)?,
                role: row.get(6)?,
                time_in: row.get(7)?,
                time_out: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Insert or replace a bot's conversation
    pub fn save_conversation(
        &self,
        id: &str,
        params: &BotParams,
        messages: &[ChatMessage],
    ) -> Result<()> {
        let bot_parms = serde_json::to_string(params)?;
        let conversation = serde_json::to_string(messages)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO conversations (id, bot_parms, conversation) VALUES (?1, ?2, ?3)",
            params![id, bot_parms, conversation],
        )?;
        Ok(())
    }

    pub fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT id, bot_parms, conversation FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, parms, conv)| decode_conversation(id, &parms, &conv))
            .transpose()
    }

    /// All conversations, optionally only those of one platform session.
    ///
    /// Rows whose JSON no longer parses are skipped with a warning.
    pub fn conversations(&self, session_id: Option<&str>) -> Result<Vec<ConversationRecord>> {
        let raw: Vec<(String, String, String)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT id, bot_parms, conversation FROM conversations ORDER BY id")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut records = Vec::new();
        for (id, parms, conv) in raw {
            match decode_conversation(id.clone(), &parms, &conv) {
                Ok(record) => {
                    if session_id.map_or(true, |s| record.params.session_id == s) {
                        records.push(record);
                    }
                }
                Err(e) => tracing::warn!("Skipping conversation {}: {}", id, e),
            }
        }
        Ok(records)
    }
}

fn decode_conversation(id: String, parms: &str, conv: &str) -> Result<ConversationRecord> {
    Ok(ConversationRecord {
        id,
        params: serde_json::from_str(parms)?,
        messages: serde_json::from_str(conv)?,
    })
}

fn now() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(session: &str, participant: &str) -> BotParams {
        BotParams {
            session_id: session.to_string(),
            participant_id: participant.to_string(),
            player_id: 1,
            url: format!("http://localhost:8000/InitializeParticipant/{}", participant),
            model: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            role: Some("P2r".to_string()),
            temperature: 0.7,
            max_tokens: 1024,
            throttle: true,
        }
    }

    #[test]
    fn test_participants_round_trip_and_timestamps() {
        let store = ConversationStore::open_in_memory().unwrap();
        for (i, code) in ["b", "a"].iter().enumerate() {
            store
                .add_participant(&ParticipantRecord {
                    session_id: "s1".into(),
                    participant_id: code.to_string(),
                    player_id: 2 - i as u32,
                    is_human: i == 0,
                    url: format!("http://x/{}", code),
                    model: (i == 1).then(|| "gpt-4o-mini".to_string()),
                    role: None,
                    time_in: None,
                    time_out: None,
                })
                .unwrap();
        }
        store.mark_started("a").unwrap();
        store.mark_finished("a").unwrap();

        let rows = store.participants("s1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].participant_id, "a");
        assert!(rows[0].time_in.is_some() && rows[0].time_out.is_some());
        assert!(rows[1].is_human);
        assert!(store.participants("other").unwrap().is_empty());
    }

    #[test]
    fn test_conversations_filter_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(store_file_name("session_1_20260101_120000", "_rps"));
        let store = ConversationStore::open(&path).unwrap();
        assert!(path.ends_with("botex_session_1_20260101_120000_rps.sqlite3"));

        let messages = vec![ChatMessage::system("rules"), ChatMessage::user("Round 1")];
        store.save_conversation("a", &params("s1", "a"), &messages).unwrap();
        store.save_conversation("b", &params("s2", "b"), &[]).unwrap();
        store
            .save_conversation("a", &params("s1", "a"), &messages[..1])
            .unwrap();

        let all = store.conversations(None).unwrap();
        assert_eq!(all.len(), 2);

        let s1 = store.conversations(Some("s1")).unwrap();
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].messages, vec![ChatMessage::system("rules")]);
        assert_eq!(s1[0].params.role.as_deref(), Some("P2r"));

        assert!(store.conversation("missing").unwrap().is_none());
        assert_eq!(store.conversation("b").unwrap().unwrap().params.session_id, "s2");
    }
}
