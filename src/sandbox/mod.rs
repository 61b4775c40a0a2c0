//! Sandbox abstraction layer.
//!
//! A [`SandboxRuntime`] provisions or reconnects to remote ephemeral
//! environments and hands out [`SandboxHandle`]s. Handles run commands
//! (attached, or detached with a live log stream), upload files, expose ports
//! and stop the environment. The only provider shipped is
//! [`remote::RemoteSandboxRuntime`], an HTTP client for the hosted runtime;
//! tests use the scripted runtime in `testing`.
//!
//! [`lifecycle::SandboxManager`] sits on top and owns registration, seeding
//! and the staleness sweep.

pub mod lifecycle;
pub mod registry;
pub mod remote;
pub mod templates;

#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output from a command executed inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command to run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub sudo: bool,
}

impl CommandSpec {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// `cmd arg1 arg2`, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.cmd.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Which output stream a log record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One chunk of output from a detached command. `data` is raw output and
/// may hold a partial line or several lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub stream: LogStream,
    pub data: String,
}

impl LogRecord {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            data: data.into(),
        }
    }
}

/// A command left running in the background.
///
/// Logs arrive on a bounded channel fed by the provider; the channel closes
/// when the process exits. Dropping the command stops log delivery but leaves
/// the remote process running.
pub struct DetachedCommand {
    pub cmd_id: String,
    logs: mpsc::Receiver<LogRecord>,
    exit: BoxFuture<'static, anyhow::Result<CommandOutput>>,
}

impl DetachedCommand {
    pub fn new(
        cmd_id: impl Into<String>,
        logs: mpsc::Receiver<LogRecord>,
        exit: BoxFuture<'static, anyhow::Result<CommandOutput>>,
    ) -> Self {
        Self {
            cmd_id: cmd_id.into(),
            logs,
            exit,
        }
    }

    /// Next log record, or `None` once the process has closed its output.
    pub async fn next_log(&mut self) -> Option<LogRecord> {
        self.logs.recv().await
    }

    /// Wait for the process to exit.
    pub async fn wait(self) -> anyhow::Result<CommandOutput> {
        self.exit.await
    }
}

/// A file to upload into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    pub path: String,
    pub content: Vec<u8>,
}

impl SandboxFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Options for provisioning a new sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOptions {
    pub runtime: String,
    pub timeout: Duration,
    pub ports: Vec<u16>,
}

/// Failures of runtime-level operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox {0} not found")]
    NotFound(String),
    #[error("{0}")]
    Provision(String),
    #[error("sandbox API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("sandbox API request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Provisioning side of a sandbox provider.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Provision a new sandbox.
    async fn create(&self, options: &CreateOptions) -> Result<Arc<dyn SandboxHandle>, SandboxError>;

    /// Reconnect to an existing sandbox. Fails with
    /// [`SandboxError::NotFound`] when it has expired or never existed.
    async fn get(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError>;
}

/// A live sandbox.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Run a command to completion.
    async fn run_command(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput>;

    /// Start a command in the background and stream its logs.
    async fn run_detached(&self, spec: &CommandSpec) -> anyhow::Result<DetachedCommand>;

    /// Upload files in one bulk request.
    async fn write_files(&self, files: &[SandboxFile]) -> anyhow::Result<()>;

    /// Externally routable URL for a port.
    async fn domain(&self, port: u16) -> anyhow::Result<String>;

    /// Stop the sandbox.
    async fn stop(&self) -> anyhow::Result<()>;
}
