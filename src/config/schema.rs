//! Configuration schema.
//!
//! Every section has serde defaults so a partial (or missing) `config.toml`
//! is valid. Secrets may come from the environment, which always wins over
//! the file.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the AI service credential.
pub const AGENT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
/// Environment variable holding the sandbox runtime credential.
pub const SANDBOX_API_KEY_ENV: &str = "SANDBOX_API_KEY";
/// Environment variable overriding the sandbox runtime base URL.
pub const SANDBOX_API_URL_ENV: &str = "SANDBOX_API_URL";

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub sandbox: SandboxConfig,
    pub agent: AgentConfig,
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Remote sandbox runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SandboxConfig {
    pub api_url: String,
    pub api_key: String,
    /// Runtime image requested at creation, e.g. `node22`.
    pub runtime: String,
    /// Upper bound on provisioning and the sandbox's own lifetime.
    pub creation_timeout_secs: u64,
    /// Sandboxes older than this are stopped by the sweep.
    pub stale_threshold_secs: u64,
    /// Reserved for idle-based teardown; not enforced yet.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.vercel.com/sandbox".to_string(),
            api_key: String::new(),
            runtime: "node22".to_string(),
            creation_timeout_secs: 10 * 60,
            stale_threshold_secs: 15 * 60,
            idle_timeout_secs: 3 * 60,
            sweep_interval_secs: 60,
            request_timeout_secs: 120,
        }
    }
}

impl SandboxConfig {
    pub fn creation_timeout(&self) -> Duration {
        Duration::from_secs(self.creation_timeout_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Coding-CLI and generated-project settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AgentConfig {
    /// Credential injected into the CLI's environment.
    pub api_key: String,
    /// npm package installed globally in the sandbox.
    pub cli_package: String,
    pub cli_command: String,
    /// Project root inside the sandbox.
    pub project_dir: String,
    /// Dev-server port exposed for the preview.
    pub preview_port: u16,
    /// Dev-server log text that signals it is serving.
    pub server_ready_marker: String,
    pub server_ready_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            cli_package: "@anthropic-ai/claude-code".to_string(),
            cli_command: "claude".to_string(),
            project_dir: "/vercel/sandbox/app".to_string(),
            preview_port: 5173,
            server_ready_marker: "Local:".to_string(),
            server_ready_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    pub fn server_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.server_ready_timeout_secs)
    }

    /// The credential, if one is configured.
    pub fn credential(&self) -> Option<&str> {
        Some(self.api_key.trim()).filter(|key| !key.is_empty())
    }
}
