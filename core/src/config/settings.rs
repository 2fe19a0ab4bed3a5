//! Lab settings (`llmlab.toml`)
//!
//! Every field has a default, so an absent or partial file is fine.
//!
//! ```toml
//! [otree]
//! url = "http://localhost:8000"
//! rest_key = "..."
//! poll_interval_secs = 20
//!
//! [bots]
//! temperature = 0.7
//! max_tokens = 1024
//!
//! [providers.openai]
//! base_url = "https://api.openai.com/v1"
//!
//! [local]
//! server_url = "http://localhost:8080"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{ConfigError, Provider};

/// Default settings file name, looked up in the working directory
pub const SETTINGS_FILE: &str = "llmlab.toml";

/// Root of `llmlab.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabConfig {
    #[serde(default)]
    pub otree: OtreeSettings,
    #[serde(default)]
    pub bots: BotSettings,
    /// Base URL overrides keyed by provider (`openai`, `google`, ...)
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default)]
    pub local: LocalServerSettings,
}

/// Experiment platform connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OtreeSettings {
    #[serde(default = "default_otree_url")]
    pub url: String,
    /// Sent as the `otree-rest-key` header when set
    #[serde(default)]
    pub rest_key: Option<String>,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    #[serde(default)]
    pub admin_password: Option<String>,
    /// Admin page serving the wide CSV export; `{code}` is the session code
    #[serde(default = "default_export_path")]
    pub export_path: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for OtreeSettings {
    fn default() -> Self {
        Self {
            url: default_otree_url(),
            rest_key: None,
            admin_username: default_admin_username(),
            admin_password: None,
            export_path: default_export_path(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl OtreeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn default_otree_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_export_path() -> String {
    "/ExportSessionWide/{code}".to_string()
}

fn default_poll_interval_secs() -> u64 {
    20
}

/// Bot and LLM call behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Retry and rate-limit provider calls
    #[serde(default = "default_true")]
    pub throttle: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            throttle: true,
            max_retries: default_max_retries(),
            requests_per_minute: default_requests_per_minute(),
            max_pages: default_max_pages(),
            max_wait_secs: default_max_wait_secs(),
            wait_poll_ms: default_wait_poll_ms(),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_max_pages() -> usize {
    200
}

fn default_max_wait_secs() -> u64 {
    3600
}

fn default_wait_poll_ms() -> u64 {
    2000
}

/// Per-provider overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    #[serde(default)]
    pub base_url: Option<String>,
}

/// llama.cpp server used by local models
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalServerSettings {
    #[serde(default = "default_local_server_url")]
    pub server_url: String,
    /// `llama-server` binary; when unset the server must already be running
    #[serde(default)]
    pub server_path: Option<PathBuf>,
    #[serde(default)]
    pub model_path: Option<PathBuf>,
}

impl Default for LocalServerSettings {
    fn default() -> Self {
        Self {
            server_url: default_local_server_url(),
            server_path: None,
            model_path: None,
        }
    }
}

fn default_local_server_url() -> String {
    "http://localhost:8080".to_string()
}

impl LabConfig {
    /// Load settings.
    ///
    /// An explicit path must exist. Without one, `llmlab.toml` in the working
    /// directory is used if present, otherwise defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(p) => Self::load_from(p)?,
            None => {
                let default_path = Path::new(SETTINGS_FILE);
                if default_path.exists() {
                    Self::load_from(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        Ok(config.with_env_secrets(|k| std::env::var(k).ok()))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: LabConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Fill unset secrets from `OTREE_REST_KEY` / `OTREE_ADMIN_PASSWORD`
    pub fn with_env_secrets<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if self.otree.rest_key.is_none() {
            self.otree.rest_key = non_empty("OTREE_REST_KEY");
        }
        if self.otree.admin_password.is_none() {
            self.otree.admin_password = non_empty("OTREE_ADMIN_PASSWORD");
        }
        self
    }

    /// Base URL for a provider, honouring `[providers.<key>]`.
    ///
    /// The local provider falls back to `[local] server_url` + `/v1`.
    pub fn base_url_for(&self, provider: Provider) -> String {
        if let Some(url) = self
            .providers
            .get(provider.key())
            .and_then(|p| p.base_url.as_deref())
        {
            return url.to_string();
        }
        match provider {
            Provider::Local => format!("{}/v1", self.local.server_url.trim_end_matches('/')),
            _ => provider.default_url().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = LabConfig::default();
        assert_eq!(config.otree.url, "http://localhost:8000");
        assert_eq!(config.otree.poll_interval(), Duration::from_secs(20));
        assert_eq!(config.bots.max_retries, 5);
        assert_eq!(config.bots.max_pages, 200);
        assert!(config.bots.throttle);
        assert_eq!(
            config.base_url_for(Provider::Openai),
            "https://api.openai.com/v1"
        );
        assert_eq!(config.base_url_for(Provider::Local), "http://localhost:8080/v1");
    }

    #[test]
    fn test_partial_toml() {
        let config: LabConfig = toml::from_str(
            r#"
            [otree]
            url = "http://lab.example.org"
            rest_key = "secret"

            [bots]
            temperature = 0.2

            [providers.groq]
            base_url = "http://proxy.local/groq"

            [local]
            server_url = "http://127.0.0.1:9090/"
            "#,
        )
        .unwrap();

        assert_eq!(config.otree.url, "http://lab.example.org");
        assert_eq!(config.otree.rest_key.as_deref(), Some("secret"));
        assert_eq!(config.otree.export_path, "/ExportSessionWide/{code}");
        assert_eq!(config.bots.temperature, 0.2);
        assert_eq!(config.bots.max_tokens, 1024);
        assert_eq!(config.base_url_for(Provider::Groq), "http://proxy.local/groq");
        assert_eq!(config.base_url_for(Provider::Local), "http://127.0.0.1:9090/v1");
    }

    #[test]
    fn test_env_secrets_fill_only_unset() {
        let mut config = LabConfig::default();
        config.otree.rest_key = Some("from-file".to_string());
        let config = config.with_env_secrets(|k| match k {
            "OTREE_REST_KEY" => Some("from-env".to_string()),
            "OTREE_ADMIN_PASSWORD" => Some("pw".to_string()),
            _ => None,
        });
        assert_eq!(config.otree.rest_key.as_deref(), Some("from-file"));
        assert_eq!(config.otree.admin_password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[bots]\nmax_pages = 12\n").unwrap();

        let config = LabConfig::load_from(&path).unwrap();
        assert_eq!(config.bots.max_pages, 12);

        fs::write(&path, "[bots\n").unwrap();
        assert!(matches!(
            LabConfig::load_from(&path),
            Err(ConfigError::TomlParse(_))
        ));

        assert!(matches!(
            LabConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::Io(_))
        ));
    }
}
