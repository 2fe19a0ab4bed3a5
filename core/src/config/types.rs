use serde::{Deserialize, Serialize};

use crate::error::LabError;

/// LLM Provider types
///
/// Supported LLM providers with their specific characteristics.
/// Each provider has a default base URL and an environment variable
/// holding its API key.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// OpenAI API (GPT models)
    ///
    /// Default URL: https://api.openai.com/v1
    /// Env var: OPENAI_API_KEY
    Openai,

    /// Anthropic Messages API (Claude models)
    ///
    /// Default URL: https://api.anthropic.com
    /// Env var: ANTHROPIC_API_KEY
    Anthropic,

    /// Google Gemini API
    ///
    /// Default URL: https://generativelanguage.googleapis.com
    /// Env var: GOOGLE_API_KEY
    Google,

    /// Groq (OpenAI-compatible)
    ///
    /// Default URL: https://api.groq.com/openai/v1
    /// Env var: GROQ_API_KEY
    Groq,

    /// DeepSeek (OpenAI-compatible)
    ///
    /// Default URL: https://api.deepseek.com/v1
    /// Env var: DEEPSEEK_API_KEY
    Deepseek,

    /// Local llama.cpp server (OpenAI-compatible)
    ///
    /// Default URL: http://localhost:8080/v1
    /// No API key required
    Local,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::Google,
        Provider::Openai,
        Provider::Anthropic,
        Provider::Groq,
        Provider::Deepseek,
        Provider::Local,
    ];

    /// Default API base URL
    pub fn default_url(&self) -> &'static str {
        match self {
            Provider::Openai => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::Google => "https://generativelanguage.googleapis.com",
            Provider::Groq => "https://api.groq.com/openai/v1",
            Provider::Deepseek => "https://api.deepseek.com/v1",
            Provider::Local => "http://localhost:8080/v1",
        }
    }

    /// Environment variable holding the API key, if the provider needs one
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Provider::Openai => Some("OPENAI_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Google => Some("GOOGLE_API_KEY"),
            Provider::Groq => Some("GROQ_API_KEY"),
            Provider::Deepseek => Some("DEEPSEEK_API_KEY"),
            Provider::Local => None,
        }
    }

    /// Environment variable listing the provider's models (comma-separated)
    pub fn models_env(&self) -> &'static str {
        match self {
            Provider::Openai => "OPENAI_MODELS",
            Provider::Anthropic => "ANTHROPIC_MODELS",
            Provider::Google => "GOOGLE_MODELS",
            Provider::Groq => "GROQ_MODELS",
            Provider::Deepseek => "DEEPSEEK_MODELS",
            Provider::Local => "LOCAL_LLM_MODELS",
        }
    }

    /// Key used in `[providers.<key>]` tables and on the command line
    pub fn key(&self) -> &'static str {
        match self {
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::Groq => "groq",
            Provider::Deepseek => "deepseek",
            Provider::Local => "local",
        }
    }

    /// Providers that speak the OpenAI chat completions protocol
    pub fn is_openai_compatible(&self) -> bool {
        matches!(
            self,
            Provider::Openai | Provider::Groq | Provider::Deepseek | Provider::Local
        )
    }
}

impl std::str::FromStr for Provider {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Provider::Openai),
            "anthropic" | "claude" => Ok(Provider::Anthropic),
            "google" | "gemini" => Ok(Provider::Google),
            "groq" => Ok(Provider::Groq),
            "deepseek" => Ok(Provider::Deepseek),
            "local" | "llamacpp" | "llama.cpp" => Ok(Provider::Local),
            _ => Err(LabError::UnsupportedProvider {
                name: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Openai => write!(f, "OpenAI"),
            Provider::Anthropic => write!(f, "Anthropic"),
            Provider::Google => write!(f, "Google"),
            Provider::Groq => write!(f, "Groq"),
            Provider::Deepseek => write!(f, "DeepSeek"),
            Provider::Local => write!(f, "Local (llama.cpp)"),
        }
    }
}

/// Errors raised while reading `llmlab.toml`
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error occurred while reading the config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl From<ConfigError> for LabError {
    fn from(err: ConfigError) -> Self {
        LabError::InvalidConfig {
            message: err.to_string(),
        }
    }
}
