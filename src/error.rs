//! Error taxonomy for the build pipeline.
//!
//! [`BuildError`] covers everything that can end a build or reject a request.
//! Stream decoding problems and client cancellation never show up here: the
//! decoder drops bad units on its own and cancellation is a client phase.

use crate::sandbox::SandboxError;

/// Errors that reject a request or terminate a build.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Bad or missing request fields. Client-correctable.
    #[error("{0}")]
    Validation(String),

    /// Missing operator configuration (e.g. the AI service credential).
    #[error("{0}")]
    Configuration(String),

    /// Reconnect target has expired or never existed.
    #[error("sandbox {0} not found (it may have expired)")]
    SandboxNotFound(String),

    /// The remote runtime could not provision a sandbox.
    #[error("sandbox provisioning failed: {0}")]
    SandboxProvision(String),

    /// Another build currently holds the sandbox.
    #[error("sandbox {0} is busy with another build")]
    SandboxBusy(String),

    /// Uploading the project scaffold failed. The sandbox has already been
    /// stopped by the time this is returned.
    #[error("failed to seed sandbox workspace: {detail}")]
    Seed { sandbox_id: String, detail: String },

    /// A sandboxed command exited non-zero.
    #[error("{context} failed: {detail}")]
    CommandFailed { context: String, detail: String },

    /// Transport or API failure talking to the sandbox runtime.
    #[error("{0:#}")]
    Sandbox(anyhow::Error),
}

impl BuildError {
    /// Build a [`BuildError::CommandFailed`] from captured stderr, falling
    /// back to `unknown error` when the command printed nothing.
    pub fn command_failed(context: impl Into<String>, stderr: &str) -> Self {
        let stderr = stderr.trim();
        Self::CommandFailed {
            context: context.into(),
            detail: if stderr.is_empty() {
                "unknown error".to_string()
            } else {
                stderr.to_string()
            },
        }
    }

    /// Whether the orchestrator should stop the sandbox after this error.
    ///
    /// A busy sandbox belongs to another build and must be left alone. A
    /// failed seed was already torn down by the manager.
    pub fn stops_sandbox(&self) -> bool {
        !matches!(
            self,
            Self::SandboxBusy(_) | Self::SandboxNotFound(_) | Self::Seed { .. }
        )
    }

    /// Sandbox the error happened in, when the orchestrator could not have
    /// learned it from a successful init.
    pub fn sandbox_id(&self) -> Option<&str> {
        match self {
            Self::Seed { sandbox_id, .. } => Some(sandbox_id),
            _ => None,
        }
    }
}

impl From<SandboxError> for BuildError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(id) => Self::SandboxNotFound(id),
            SandboxError::Provision(msg) => Self::SandboxProvision(msg),
            other => Self::Sandbox(anyhow::Error::new(other)),
        }
    }
}

impl From<anyhow::Error> for BuildError {
    fn from(err: anyhow::Error) -> Self {
        Self::Sandbox(err)
    }
}
