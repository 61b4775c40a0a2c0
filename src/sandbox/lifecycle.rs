//! Sandbox lifecycle: provisioning, reconnecting, seeding, stopping and the
//! staleness sweep.
//!
//! Sandboxes created here are registered in a [`SandboxStore`] with their
//! creation time. Anything older than the stale threshold is stopped by
//! [`SandboxManager::sweep_stale`], whether or not a build is still using it.
//!
//! Each build holds a lease on its sandbox id for its whole duration. A
//! second build naming the same id while the lease is held is rejected with
//! [`BuildError::SandboxBusy`] instead of interleaving commands.

use super::registry::{SandboxEntry, SandboxStore};
use super::{templates, CreateOptions, SandboxError, SandboxHandle, SandboxRuntime};
use crate::config::Config;
use crate::error::BuildError;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exclusive claim on a sandbox id, released on drop.
#[derive(Debug)]
pub struct SandboxLease {
    sandbox_id: String,
    leases: Arc<DashSet<String>>,
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        self.leases.remove(&self.sandbox_id);
    }
}

/// A sandbox ready for a build.
pub struct SandboxSession {
    pub handle: Arc<dyn SandboxHandle>,
    /// True when reconnected rather than freshly provisioned.
    pub is_existing: bool,
    _lease: SandboxLease,
}

impl SandboxSession {
    pub fn id(&self) -> &str {
        self.handle.id()
    }
}

/// Settings the manager needs from [`Config`].
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub runtime: String,
    pub creation_timeout: Duration,
    pub stale_threshold: Duration,
    pub project_dir: String,
    pub preview_port: u16,
}

impl From<&Config> for LifecycleOptions {
    fn from(config: &Config) -> Self {
        Self {
            runtime: config.sandbox.runtime.clone(),
            creation_timeout: config.sandbox.creation_timeout(),
            stale_threshold: config.sandbox.stale_threshold(),
            project_dir: config.agent.project_dir.clone(),
            preview_port: config.agent.preview_port,
        }
    }
}

pub struct SandboxManager {
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<dyn SandboxStore>,
    leases: Arc<DashSet<String>>,
    options: LifecycleOptions,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<dyn SandboxStore>,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            runtime,
            store,
            leases: Arc::new(DashSet::new()),
            options,
        }
    }

    pub fn store(&self) -> &dyn SandboxStore {
        self.store.as_ref()
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    /// Reconnect to `existing_id`, or provision and seed a new sandbox.
    pub async fn init(&self, existing_id: Option<&str>) -> Result<SandboxSession, BuildError> {
        match existing_id {
            Some(id) => self.connect(id).await,
            None => self.create().await,
        }
    }

    fn lease(&self, sandbox_id: &str) -> Result<SandboxLease, BuildError> {
        if !self.leases.insert(sandbox_id.to_string()) {
            return Err(BuildError::SandboxBusy(sandbox_id.to_string()));
        }
        Ok(SandboxLease {
            sandbox_id: sandbox_id.to_string(),
            leases: Arc::clone(&self.leases),
        })
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxSession, BuildError> {
        let lease = self.lease(sandbox_id)?;
        let handle = self.runtime.get(sandbox_id).await?;
        tracing::info!("Reconnected to sandbox {sandbox_id}");
        Ok(SandboxSession {
            handle,
            is_existing: true,
            _lease: lease,
        })
    }

    async fn create(&self) -> Result<SandboxSession, BuildError> {
        let options = CreateOptions {
            runtime: self.options.runtime.clone(),
            timeout: self.options.creation_timeout,
            ports: vec![self.options.preview_port],
        };

        let handle = tokio::time::timeout(self.options.creation_timeout, self.runtime.create(&options))
            .await
            .map_err(|_| {
                SandboxError::Provision(format!(
                    "sandbox creation timed out after {}s",
                    self.options.creation_timeout.as_secs()
                ))
            })??;

        let sandbox_id = handle.id().to_string();
        self.store.put(SandboxEntry::new(&sandbox_id));
        let lease = self.lease(&sandbox_id)?;
        tracing::info!("Created sandbox {sandbox_id}");

        let files = templates::seed_files(&self.options.project_dir, self.options.preview_port);
        if let Err(e) = handle.write_files(&files).await {
            // Without a scaffold the sandbox is useless to anyone.
            tracing::warn!("Seeding sandbox {sandbox_id} failed: {e:#}");
            drop(lease);
            self.stop(&sandbox_id).await;
            return Err(BuildError::Seed {
                sandbox_id,
                detail: format!("{e:#}"),
            });
        }
        tracing::debug!("Seeded sandbox {sandbox_id} with {} files", files.len());

        Ok(SandboxSession {
            handle,
            is_existing: false,
            _lease: lease,
        })
    }

    /// Best-effort stop. The registry entry is always removed, even when the
    /// remote call fails.
    pub async fn stop(&self, sandbox_id: &str) {
        match self.runtime.get(sandbox_id).await {
            Ok(handle) => match handle.stop().await {
                Ok(()) => tracing::info!("Stopped sandbox {sandbox_id}"),
                Err(e) => tracing::warn!("Failed to stop sandbox {sandbox_id}: {e:#}"),
            },
            Err(SandboxError::NotFound(_)) => {
                tracing::debug!("Sandbox {sandbox_id} already stopped or expired");
            }
            Err(e) => tracing::warn!("Failed to reach sandbox {sandbox_id}: {e}"),
        }
        self.store.remove(sandbox_id);
    }

    /// Stop every registered sandbox older than the stale threshold. Returns
    /// how many were swept.
    pub async fn sweep_stale(&self) -> usize {
        let stale = self.store.list_older_than(self.options.stale_threshold);
        for entry in &stale {
            tracing::info!(
                "Sweeping stale sandbox {} (created {})",
                entry.sandbox_id,
                entry.created_at.to_rfc3339()
            );
            self.stop(&entry.sandbox_id).await;
        }
        stale.len()
    }

    /// Run [`Self::sweep_stale`] every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = self.sweep_stale().await;
                        if swept > 0 {
                            tracing::info!("Stale sweep stopped {swept} sandbox(es)");
                        }
                    }
                }
            }
            tracing::debug!("Sandbox sweeper stopped");
        })
    }
}
