pub mod bot;
pub mod config;
pub mod error;
pub mod export;
pub mod launcher;
pub mod llm;
pub mod otree;
pub mod output;
pub mod paradigm;
pub mod rate_limiter;
pub mod util;

// Re-exports for convenience
pub use config::{ExperimentConfig, LabConfig};
pub use error::{LabError, Result};
pub use launcher::{LaunchOptions, SessionLauncher, SessionOutcome};
