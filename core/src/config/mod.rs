//! Configuration management
//!
//! Lab settings come from `llmlab.toml` and the environment; experiments come
//! from an app directory (roster plus prompt book).

pub mod experiment;
pub mod models;
pub mod roster;
pub mod settings;
pub mod types;

pub use experiment::{CheckStatus, ExperimentConfig, ValidationCheck, ValidationReport};
pub use models::{ModelRegistry, ModelSpec};
pub use roster::{PlayerSlot, Roster, SlotAssignment};
pub use settings::{BotSettings, LabConfig, LocalServerSettings, OtreeSettings, SETTINGS_FILE};
pub use types::{ConfigError, Provider};

/// Default env file loaded by the CLI
pub const DEFAULT_ENV_FILE: &str = "botex.env";
