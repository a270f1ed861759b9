//! Natsync store – the remote firewall state capability.
//!
//! The reconciler only sees [`FirewallStore`]; wire mechanics live in the
//! adapter crates. [`MemoryStore`] backs tests and dry-run operation.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use natsync_core::RemoteFirewallState;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Addressing triple identifying the one firewall object this process owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallAddress {
    pub subscription: String,
    pub resource_group: String,
    pub firewall: String,
}

impl fmt::Display for FirewallAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subscription, self.resource_group, self.firewall)
    }
}

/// Read/replace access to the whole remote firewall object.
///
/// `write` is a full replace, not a patch: callers must pass back everything
/// `read` returned, changed only in the collection they own. No conflict
/// detection is assumed; serializing writers is the caller's job.
#[async_trait]
pub trait FirewallStore: Send + Sync {
    async fn read(&self) -> Result<RemoteFirewallState>;
    async fn write(&self, state: &RemoteFirewallState) -> Result<()>;
}

/// In-memory store holding one firewall object behind a mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<RemoteFirewallState>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RemoteFirewallState) -> Self {
        Self { state: Mutex::new(state), writes: AtomicU64::new(0) }
    }

    /// Current content, for assertions and `show` output.
    pub async fn snapshot(&self) -> RemoteFirewallState {
        self.state.lock().await.clone()
    }

    /// Number of writes accepted since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FirewallStore for MemoryStore {
    async fn read(&self) -> Result<RemoteFirewallState> {
        Ok(self.state.lock().await.clone())
    }

    async fn write(&self, state: &RemoteFirewallState) -> Result<()> {
        *self.state.lock().await = state.clone();
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_replaces_whole_state_and_counts_writes() {
        let store = MemoryStore::new();
        assert_eq!(store.write_count(), 0);

        let state: RemoteFirewallState =
            serde_json::from_value(serde_json::json!({ "location": "westeurope", "properties": {} })).unwrap();
        store.write(&state).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.read().await.unwrap(), state);
    }
}
