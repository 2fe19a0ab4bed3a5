//! Model registry
//!
//! Models are declared per provider through comma-separated environment
//! variables (`GOOGLE_MODELS`, `OPENAI_MODELS`, ...). Roster entries refer to
//! them by name, or name a provider explicitly as `provider/model`.

use std::collections::BTreeMap;

use serde::Serialize;

use super::types::Provider;
use crate::error::{LabError, Result};
use crate::util::split_list;

/// Default Google model when `GOOGLE_MODELS` is unset
pub const DEFAULT_GOOGLE_MODEL: &str = "gemini-1.5-flash";

/// A model that bots can be assigned to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    /// Name used in rosters
    pub name: String,
    /// Model identifier sent to the provider
    pub model_id: String,
    pub provider: Provider,
}

impl ModelSpec {
    pub fn new(provider: Provider, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            model_id: name.clone(),
            name,
            provider,
        }
    }

    pub fn api_key_env(&self) -> Option<&'static str> {
        self.provider.api_key_env()
    }
}

/// Models available to this run, keyed by roster name
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSpec>,
}

impl ModelRegistry {
    /// Build the registry from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the registry from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut registry = Self::default();
        for provider in Provider::ALL {
            let declared = lookup(provider.models_env());
            let names = match (provider, declared) {
                (_, Some(list)) => split_list(&list),
                (Provider::Google, None) => vec![DEFAULT_GOOGLE_MODEL.to_string()],
                (_, None) => Vec::new(),
            };
            // Later providers win on a name clash
            for name in names {
                registry.insert(ModelSpec::new(provider, name));
            }
        }
        registry
    }

    pub fn insert(&mut self, spec: ModelSpec) {
        self.models.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    /// Resolve a roster model name to a model.
    ///
    /// Registered names win. Otherwise `provider/model` selects the provider
    /// explicitly; any other name is unknown.
    pub fn resolve(&self, player_id: u32, name: &str) -> Result<ModelSpec> {
        if let Some(spec) = self.models.get(name) {
            return Ok(spec.clone());
        }

        if let Some((prefix, model)) = name.split_once('/') {
            let provider: Provider = prefix.parse()?;
            if model.trim().is_empty() {
                return Err(LabError::UnknownModel {
                    player_id,
                    model: name.to_string(),
                });
            }
            return Ok(ModelSpec {
                name: name.to_string(),
                model_id: model.trim().to_string(),
                provider,
            });
        }

        Err(LabError::UnknownModel {
            player_id,
            model: name.to_string(),
        })
    }
}
