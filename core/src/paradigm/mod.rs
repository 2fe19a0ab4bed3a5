//! Paradigm catalogue
//!
//! An app is a directory under the apps root holding a `player_models.csv`.
//! The oTree code itself lives with the platform project; only the roster and
//! the optional `prompts.toml` are read here.

pub mod prompts;

use std::fs;
use std::path::{Path, PathBuf};

pub use prompts::{PromptBook, PromptSet, RolePrompts, BREVITY_NOTE, PROMPTS_FILE};

use crate::config::roster::{RawRoster, ROSTER_FILE};
use crate::error::{LabError, Result};

/// Default directory scanned for apps
pub const DEFAULT_APPS_DIR: &str = "paradigms";

/// An app found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub dir: PathBuf,
}

impl AppInfo {
    pub fn roster_path(&self) -> PathBuf {
        self.dir.join(ROSTER_FILE)
    }

    pub fn prompts_path(&self) -> PathBuf {
        self.dir.join(PROMPTS_FILE)
    }

    pub fn has_prompts(&self) -> bool {
        self.prompts_path().is_file()
    }

    /// Whether the platform's app module sits next to the roster
    pub fn has_platform_code(&self) -> bool {
        self.dir.join("__init__.py").is_file()
    }

    /// Participant count from the roster, without validating models
    pub fn participant_count(&self) -> Result<usize> {
        Ok(RawRoster::load(&self.roster_path())?.rows.len())
    }
}

/// List apps under `apps_dir`, sorted by name.
///
/// Hidden and underscore-prefixed directories are skipped.
pub fn discover_apps(apps_dir: &Path) -> Result<Vec<AppInfo>> {
    let mut apps = Vec::new();
    if !apps_dir.is_dir() {
        return Ok(apps);
    }

    for entry in fs::read_dir(apps_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name.starts_with('_') || !path.is_dir() {
            continue;
        }
        if path.join(ROSTER_FILE).is_file() {
            apps.push(AppInfo { name, dir: path });
        }
    }

    apps.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(apps)
}

/// Look up a single app by name
pub fn find_app(apps_dir: &Path, name: &str) -> Result<AppInfo> {
    let dir = apps_dir.join(name);
    if dir.join(ROSTER_FILE).is_file() {
        Ok(AppInfo {
            name: name.to_string(),
            dir,
        })
    } else {
        Err(LabError::AppNotFound {
            name: name.to_string(),
        })
    }
}
