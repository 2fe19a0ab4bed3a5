//! Splitting the platform's wide export by level
//!
//! The wide CSV has one row per participant and one column per variable:
//! `session.*`, `participant.*`, and `{app}.{round}.{player|group|subsession}.*`.
//! Each level gets its own file with the prefixes stripped.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{LabError, Result};

static ROUND_COLUMN: OnceLock<Regex> = OnceLock::new();

/// Paths of the four level files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFiles {
    pub session: PathBuf,
    pub participant: PathBuf,
    pub group: PathBuf,
    pub player: PathBuf,
}

impl NormalizedFiles {
    pub fn all(&self) -> [&Path; 4] {
        [&self.session, &self.participant, &self.group, &self.player]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Player,
    Group,
    Subsession,
}

/// Where a wide column belongs
#[derive(Debug, Clone)]
enum Column {
    Session(String),
    Participant(String),
    Round {
        app: String,
        round: u32,
        level: Level,
        field: String,
    },
    Other,
}

fn classify(header: &str) -> Column {
    if let Some(field) = header.strip_prefix("session.") {
        return Column::Session(field.to_string());
    }
    if let Some(field) = header.strip_prefix("participant.") {
        return Column::Participant(field.to_string());
    }
    let re = ROUND_COLUMN.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\.(\d+)\.(player|group|subsession)\.(.+)$")
            .expect("valid regex")
    });
    match re.captures(header) {
        Some(c) => Column::Round {
            app: c[1].to_string(),
            round: c[2].parse().unwrap_or(0),
            level: match &c[3] {
                "player" => Level::Player,
                "group" => Level::Group,
                _ => Level::Subsession,
            },
            field: c[4].to_string(),
        },
        None => Column::Other,
    }
}

/// Rows of one level with columns in first-seen order
#[derive(Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<BTreeMap<String, String>>,
}

impl Table {
    fn column(&mut self, name: &str) {
        if !self.columns.iter().any(|c| c == name) {
            self.columns.push(name.to_string());
        }
    }

    fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(
                self.columns
                    .iter()
                    .map(|c| row.get(c).map(String::as_str).unwrap_or("")),
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Split `wide_csv` into `{prefix}_session.csv`, `{prefix}_participant.csv`,
/// `{prefix}_group.csv` and `{prefix}_player.csv` in `out_dir`.
pub fn normalize_wide(wide_csv: &Path, out_dir: &Path, prefix: &str) -> Result<NormalizedFiles> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(wide_csv)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.is_empty() {
        return Err(LabError::InvalidConfig {
            message: format!("{} has no header row", wide_csv.display()),
        });
    }
    let columns: Vec<Column> = headers.iter().map(|h| classify(h)).collect();

    let mut sessions = Table::default();
    let mut participants = Table::default();
    let mut groups = Table::default();
    let mut players = Table::default();
    sessions.column("code");
    participants.column("session_code");
    for key in ["session_code", "app", "round", "id_in_subsession"] {
        groups.column(key);
    }
    for key in ["session_code", "participant_code", "app", "round"] {
        players.column(key);
    }

    let mut seen_sessions = BTreeSet::new();
    let mut seen_groups = BTreeSet::new();

    for record in reader.records() {
        let record = record?;
        let value = |i: usize| record.get(i).unwrap_or("").to_string();

        let mut session = BTreeMap::new();
        let mut participant = BTreeMap::new();
        // (app, round) -> level fields
        let mut per_round: BTreeMap<(String, u32), [BTreeMap<String, String>; 3]> = BTreeMap::new();

        for (i, column) in columns.iter().enumerate() {
            match column {
                Column::Session(field) => {
                    session.insert(field.clone(), value(i));
                }
                Column::Participant(field) => {
                    participant.insert(field.clone(), value(i));
                }
                Column::Round {
                    app,
                    round,
                    level,
                    field,
                } => {
                    let slot = match level {
                        Level::Player => 0,
                        Level::Group => 1,
                        Level::Subsession => 2,
                    };
                    per_round.entry((app.clone(), *round)).or_default()[slot]
                        .insert(field.clone(), value(i));
                }
                Column::Other => {}
            }
        }

        let session_code = session.get("code").cloned().unwrap_or_default();
        let participant_code = participant.get("code").cloned().unwrap_or_default();

        if seen_sessions.insert(session_code.clone()) {
            for column in &columns {
                if let Column::Session(field) = column {
                    sessions.column(field);
                }
            }
            sessions.rows.push(session);
        }

        for column in &columns {
            if let Column::Participant(field) = column {
                participants.column(field);
            }
        }
        participant.insert("session_code".to_string(), session_code.clone());
        participants.rows.push(participant);

        for ((app, round), [player, group, subsession]) in per_round {
            // Rounds a participant never reached are exported blank
            if player.values().all(|v| v.is_empty()) {
                continue;
            }

            let group_id = group.get("id_in_subsession").cloned().unwrap_or_default();
            if seen_groups.insert((session_code.clone(), app.clone(), round, group_id.clone())) {
                let mut row = BTreeMap::new();
                row.insert("session_code".to_string(), session_code.clone());
                row.insert("app".to_string(), app.clone());
                row.insert("round".to_string(), round.to_string());
                for (field, v) in group {
                    groups.column(&field);
                    row.insert(field, v);
                }
                for (field, v) in subsession {
                    let name = format!("subsession.{}", field);
                    groups.column(&name);
                    row.insert(name, v);
                }
                groups.rows.push(row);
            }

            let mut row = BTreeMap::new();
            row.insert("session_code".to_string(), session_code.clone());
            row.insert("participant_code".to_string(), participant_code.clone());
            row.insert("app".to_string(), app);
            row.insert("round".to_string(), round.to_string());
            row.insert("group_id".to_string(), group_id);
            players.column("group_id");
            for (field, v) in player {
                players.column(&field);
                row.insert(field, v);
            }
            players.rows.push(row);
        }
    }

    std::fs::create_dir_all(out_dir)?;
    let files = NormalizedFiles {
        session: out_dir.join(format!("{}_session.csv", prefix)),
        participant: out_dir.join(format!("{}_participant.csv", prefix)),
        group: out_dir.join(format!("{}_group.csv", prefix)),
        player: out_dir.join(format!("{}_player.csv", prefix)),
    };
    sessions.write(&files.session)?;
    participants.write(&files.participant)?;
    groups.write(&files.group)?;
    players.write(&files.player)?;

    tracing::info!(
        "Normalized {} into {} participants, {} groups, {} player rounds",
        wide_csv.display(),
        participants.rows.len(),
        groups.rows.len(),
        players.rows.len()
    );
    Ok(files)
}
