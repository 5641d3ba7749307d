//! Registry configuration

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "CERT_REGISTRY_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

/// Which optional sources get wired in when their provider is supplied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_true")]
    pub policy_enabled: bool,

    #[serde(default = "default_true")]
    pub extensions_enabled: bool,
}

/// Display name decoration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Appended in parentheses to hardware-backed certificate names
    #[serde(default = "default_hardware_backed_label")]
    pub hardware_backed_label: String,

    /// Appended to extension-provided certificate names
    #[serde(default = "default_extension_provided_suffix")]
    pub extension_provided_suffix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Capacity of the owner task's command mailbox
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_true() -> bool {
    true
}

fn default_hardware_backed_label() -> String {
    "hardware-backed".to_string()
}

fn default_extension_provided_suffix() -> String {
    "(extension provided)".to_string()
}

fn default_command_buffer() -> usize {
    64
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            policy_enabled: default_true(),
            extensions_enabled: default_true(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            hardware_backed_label: default_hardware_backed_label(),
            extension_provided_suffix: default_extension_provided_suffix(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            command_buffer: default_command_buffer(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: RegistryConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `CERT_REGISTRY_*` variables (a `.env` file is
    /// read first when present)
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`, keyed by full variable name
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(value) = var("POLICY_ENABLED") {
            self.sources.policy_enabled = parse_bool("POLICY_ENABLED", &value)?;
        }
        if let Some(value) = var("EXTENSIONS_ENABLED") {
            self.sources.extensions_enabled = parse_bool("EXTENSIONS_ENABLED", &value)?;
        }
        if let Some(value) = var("HARDWARE_BACKED_LABEL") {
            self.display.hardware_backed_label = value;
        }
        if let Some(value) = var("EXTENSION_PROVIDED_SUFFIX") {
            self.display.extension_provided_suffix = value;
        }
        if let Some(value) = var("COMMAND_BUFFER") {
            self.service.command_buffer = value.trim().parse().map_err(|e| {
                RegistryError::ConfigError(format!("{}COMMAND_BUFFER: {}", ENV_PREFIX, e))
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.command_buffer == 0 {
            return Err(RegistryError::ConfigError(
                "service.command_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(RegistryError::ConfigError(format!(
            "{}{}: expected a boolean, got '{}'",
            ENV_PREFIX, name, other
        ))),
    }
}
