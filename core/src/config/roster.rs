//! Participant roster
//!
//! Each app carries a `player_models.csv`:
//!
//! ```text
//! player_id,model_name,role
//! 1,human,
//! 2,gemini-1.5-flash,P2
//! ```
//!
//! `model_name` is `human` or a model known to the [`ModelRegistry`]. The
//! `role` column is optional and selects a prompt variant.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::models::{ModelRegistry, ModelSpec};
use crate::error::{LabError, Result};

/// File name of the roster inside an app directory
pub const ROSTER_FILE: &str = "player_models.csv";

const HUMAN: &str = "human";

/// One CSV row, before validation
#[derive(Debug, Clone, Deserialize)]
pub struct RosterRow {
    pub player_id: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Roster rows as read from disk
#[derive(Debug, Clone)]
pub struct RawRoster {
    pub path: PathBuf,
    pub rows: Vec<RosterRow>,
}

impl RawRoster {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(|e| LabError::InvalidRoster {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let headers = reader.headers()?.clone();
        for required in ["player_id", "model_name"] {
            if !headers.iter().any(|h| h == required) {
                return Err(LabError::InvalidRoster {
                    path: path.to_path_buf(),
                    reason: format!("missing '{}' column", required),
                });
            }
        }

        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: RosterRow = record.map_err(|e| LabError::InvalidRoster {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            rows.push(row);
        }

        Ok(Self {
            path: path.to_path_buf(),
            rows,
        })
    }

    /// True if any row assigns a role
    pub fn has_roles(&self) -> bool {
        self.rows
            .iter()
            .any(|r| r.role.as_deref().is_some_and(|role| !role.is_empty()))
    }
}

/// What fills a participant slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotAssignment {
    Human,
    Llm(ModelSpec),
}

impl SlotAssignment {
    pub fn is_human(&self) -> bool {
        matches!(self, SlotAssignment::Human)
    }

    pub fn model(&self) -> Option<&ModelSpec> {
        match self {
            SlotAssignment::Human => None,
            SlotAssignment::Llm(spec) => Some(spec),
        }
    }

    /// Short label for reports: `HUMAN` or the model name
    pub fn label(&self) -> &str {
        match self {
            SlotAssignment::Human => "HUMAN",
            SlotAssignment::Llm(spec) => &spec.name,
        }
    }
}

/// A validated participant position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSlot {
    /// 1-based position in the session
    pub player_id: u32,
    pub assignment: SlotAssignment,
    pub role: Option<String>,
}

/// Validated roster: ids are exactly `1..=n`, each slot human or LLM
#[derive(Debug, Clone)]
pub struct Roster {
    path: PathBuf,
    slots: Vec<PlayerSlot>,
}

impl Roster {
    /// Load and validate an app's roster
    pub fn load(path: &Path, registry: &ModelRegistry) -> Result<Self> {
        let raw = RawRoster::load(path)?;
        Self::resolve(raw, registry)
    }

    /// Validate raw rows against the model registry
    pub fn resolve(raw: RawRoster, registry: &ModelRegistry) -> Result<Self> {
        if raw.rows.is_empty() {
            return Err(LabError::EmptyRoster { path: raw.path });
        }

        let mut by_id: BTreeMap<u32, PlayerSlot> = BTreeMap::new();
        for row in &raw.rows {
            let player_id: u32 = row.player_id.parse().map_err(|_| LabError::InvalidRoster {
                path: raw.path.clone(),
                reason: format!("player_id '{}' is not a positive integer", row.player_id),
            })?;
            if player_id == 0 {
                return Err(LabError::InvalidRoster {
                    path: raw.path.clone(),
                    reason: "player ids start at 1".to_string(),
                });
            }

            let model_name = row.model_name.trim();
            if model_name.is_empty() {
                return Err(LabError::UnassignedSlot { player_id });
            }

            let assignment = if model_name.eq_ignore_ascii_case(HUMAN) {
                SlotAssignment::Human
            } else {
                SlotAssignment::Llm(registry.resolve(player_id, model_name)?)
            };

            let role = row
                .role
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string);

            let slot = PlayerSlot {
                player_id,
                assignment,
                role,
            };
            if by_id.insert(player_id, slot).is_some() {
                return Err(LabError::DuplicateSlot { player_id });
            }
        }

        // BTreeMap keys are sorted; any gap shows up as a mismatch
        for (expected, id) in (1u32..).zip(by_id.keys()) {
            if *id != expected {
                return Err(LabError::MissingSlot {
                    player_id: expected,
                });
            }
        }

        Ok(Self {
            path: raw.path,
            slots: by_id.into_values().collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Slots ordered by player id
    pub fn slots(&self) -> &[PlayerSlot] {
        &self.slots
    }

    pub fn slot(&self, player_id: u32) -> Option<&PlayerSlot> {
        self.slots.iter().find(|s| s.player_id == player_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn human_count(&self) -> usize {
        self.slots.iter().filter(|s| s.assignment.is_human()).count()
    }

    pub fn bot_count(&self) -> usize {
        self.len() - self.human_count()
    }

    /// Per-position human flags, in player order
    pub fn is_human(&self) -> Vec<bool> {
        self.slots.iter().map(|s| s.assignment.is_human()).collect()
    }

    /// Distinct models in use
    pub fn models(&self) -> BTreeSet<&str> {
        self.slots
            .iter()
            .filter_map(|s| s.assignment.model())
            .map(|m| m.name.as_str())
            .collect()
    }

    /// Role name to the players holding it
    pub fn roles(&self) -> BTreeMap<&str, Vec<u32>> {
        let mut roles: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for slot in &self.slots {
            if let Some(role) = &slot.role {
                roles.entry(role.as_str()).or_default().push(slot.player_id);
            }
        }
        roles
    }

    pub fn uses_local_model(&self) -> bool {
        self.slots.iter().any(|s| {
            s.assignment
                .model()
                .is_some_and(|m| m.provider == super::types::Provider::Local)
        })
    }
}
