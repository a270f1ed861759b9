//! Natsync reconciler: fetch → derive → merge → write for one service event.
//!
//! Every remote interaction happens here, one event at a time, behind the
//! [`FirewallStore`] capability. The supervisor (see [`supervisor`]) owns the
//! event stream and calls [`Reconciler::reconcile`] serially; concurrent
//! reconciliations from one process would race the non-atomic whole-object
//! replace, so serialization is a correctness requirement, not a tuning knob.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::anyhow;
use metrics::{counter, histogram};
use natsync_core::{derive_rules, merge_into_state, rule_prefix, EventKind, ServiceEvent};
use natsync_store::FirewallStore;
use thiserror::Error;
use tracing::{debug, info};

mod supervisor;

pub use supervisor::{run, EventSource, SupervisorConfig};

/// Default bound on a single remote read or write.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why one reconcile attempt failed. Contained at the supervisor boundary;
/// recovery is always "wait for the next event and try again".
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("remote state read failed: {0}")]
    RemoteUnavailable(#[source] anyhow::Error),
    #[error("remote state write failed: {0}")]
    RemoteWriteFailed(#[source] anyhow::Error),
}

/// What one successful reconcile did to the remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Merged collection differed; the replacement object was written.
    Updated,
    /// Merged collection was already current; the write was elided.
    Unchanged,
}

pub struct Reconciler<S> {
    store: S,
    remote_timeout: Duration,
}

impl<S: FirewallStore> Reconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store, remote_timeout: DEFAULT_REMOTE_TIMEOUT }
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Converge the remote firewall object for one observed service event.
    ///
    /// Level-triggered: re-running with the same snapshot reaches the same
    /// remote content, so a failed attempt is simply retried by whichever
    /// event arrives next. Only the owned collection is rewritten; the rest
    /// of the fetched object is passed back field-for-field.
    pub async fn reconcile(&self, event: &ServiceEvent) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        let id = &event.snapshot.id;

        let state = tokio::time::timeout(self.remote_timeout, self.store.read())
            .await
            .map_err(|_| {
                ReconcileError::RemoteUnavailable(anyhow!(
                    "read timed out after {:?}",
                    self.remote_timeout
                ))
            })?
            .map_err(ReconcileError::RemoteUnavailable)?;

        let desired = match event.kind {
            EventKind::Deleted => Vec::new(),
            EventKind::Added | EventKind::Modified => derive_rules(&event.snapshot),
        };
        for rule in &desired {
            info!(
                service = %id,
                rule = %rule.name,
                proto = %rule.protocol,
                dest = %format!("{}:{}", rule.destination_address, rule.destination_port),
                target = %format!("{}:{}", rule.translated_address, rule.translated_port),
                "prepared rule"
            );
        }

        let mut next = state;
        if !merge_into_state(&mut next, &rule_prefix(id), &desired) {
            debug!(service = %id, "owned collection already current; skipping write");
            counter!("reconcile_skipped", 1u64);
            return Ok(Outcome::Unchanged);
        }

        tokio::time::timeout(self.remote_timeout, self.store.write(&next))
            .await
            .map_err(|_| {
                ReconcileError::RemoteWriteFailed(anyhow!(
                    "write timed out after {:?}",
                    self.remote_timeout
                ))
            })?
            .map_err(ReconcileError::RemoteWriteFailed)?;

        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("reconcile_ok", 1u64);
        info!(service = %id, rules = desired.len(), "remote collection updated");
        Ok(Outcome::Updated)
    }
}
