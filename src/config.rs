use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::{Result, RouterError};

fn default_port() -> u16 {
    8080
}

/// Process configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Accepted so existing config files load; the selector does not read it.
    #[serde(default)]
    pub error_penalty: i64,
    /// Accepted so existing config files load; the selector does not read it.
    #[serde(default)]
    pub request_penalty: i64,
}

/// A client-facing model name and the upstream models it expands to.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelEntryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntryConfig {
    /// Multiplier on observed usage; 0 turns the entry into a hard preference.
    pub weight: u32,
    pub provider: String,
    /// Upstream model name sent to the provider.
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Config {
    /// Reads and validates a config file. YAML unless the extension is
    /// `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => serde_yaml::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup validation: every failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(RouterError::Config("api_key must be set".to_string()));
        }

        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if !provider_names.insert(provider.name.as_str()) {
                return Err(RouterError::Config(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            if provider.base_url.trim().is_empty() {
                return Err(RouterError::Config(format!(
                    "provider {} has no base_url",
                    provider.name
                )));
            }
            if provider.api_keys.is_empty() {
                return Err(RouterError::Config(format!(
                    "provider {} has no api_keys",
                    provider.name
                )));
            }
        }

        let mut group_names = HashSet::new();
        for group in &self.groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(RouterError::Config(format!(
                    "duplicate group name: {}",
                    group.name
                )));
            }
            if group.models.is_empty() {
                return Err(RouterError::Config(format!(
                    "group {} has no models",
                    group.name
                )));
            }
            for entry in &group.models {
                if !provider_names.contains(entry.provider.as_str()) {
                    return Err(RouterError::Config(format!(
                        "group {} references unknown provider: {}",
                        group.name, entry.provider
                    )));
                }
            }
        }

        Ok(())
    }
}
