//! Registry of sandboxes provisioned by this process.
//!
//! The registry only exists to find sandboxes old enough for the staleness
//! sweep. [`InMemorySandboxStore`] keeps it in a `DashMap`; it is lost on
//! restart. A multi-instance deployment can plug a shared store in through
//! [`SandboxStore`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// A tracked sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEntry {
    pub sandbox_id: String,
    pub created_at: DateTime<Utc>,
}

impl SandboxEntry {
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            created_at: Utc::now(),
        }
    }

    /// Age relative to `now`; zero for entries stamped in the future.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// Storage for [`SandboxEntry`] records.
pub trait SandboxStore: Send + Sync {
    fn put(&self, entry: SandboxEntry);
    fn get(&self, sandbox_id: &str) -> Option<SandboxEntry>;
    fn remove(&self, sandbox_id: &str) -> Option<SandboxEntry>;
    /// Entries whose age strictly exceeds `age`.
    fn list_older_than(&self, age: Duration) -> Vec<SandboxEntry>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemorySandboxStore {
    entries: DashMap<String, SandboxEntry>,
}

impl InMemorySandboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SandboxStore for InMemorySandboxStore {
    fn put(&self, entry: SandboxEntry) {
        self.entries.insert(entry.sandbox_id.clone(), entry);
    }

    fn get(&self, sandbox_id: &str) -> Option<SandboxEntry> {
        self.entries.get(sandbox_id).map(|e| e.value().clone())
    }

    fn remove(&self, sandbox_id: &str) -> Option<SandboxEntry> {
        self.entries.remove(sandbox_id).map(|(_, entry)| entry)
    }

    fn list_older_than(&self, age: Duration) -> Vec<SandboxEntry> {
        let now = Utc::now();
        // Collect first so no shard lock is held while callers act on the result.
        self.entries
            .iter()
            .filter(|e| e.value().age(now) > age)
            .map(|e| e.value().clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
