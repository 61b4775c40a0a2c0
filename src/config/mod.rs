//! Configuration loading.
//!
//! The file lives at `$AGENT_BUILDER_CONFIG` or in the platform config
//! directory (`~/.config/agent-builder/config.toml` on Linux). A missing file
//! is not an error: defaults apply and environment overrides still run.

pub mod schema;

pub use schema::{AgentConfig, Config, GatewayConfig, SandboxConfig};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_PATH_ENV: &str = "AGENT_BUILDER_CONFIG";

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);

        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a TOML file without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Secrets and the runtime URL from the environment take precedence.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty(schema::AGENT_API_KEY_ENV) {
            self.agent.api_key = key;
        }
        if let Some(key) = non_empty(schema::SANDBOX_API_KEY_ENV) {
            self.sandbox.api_key = key;
        }
        if let Some(url) = non_empty(schema::SANDBOX_API_URL_ENV) {
            self.sandbox.api_url = url;
        }
    }

    /// JSON schema of the config file, pretty-printed.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).context("Failed to serialize config schema")
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("dev", "agent-builder", "agent-builder")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
