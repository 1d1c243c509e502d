//! Core admission filter implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::key::ClientKey;
use super::policy::Policy;
use super::table::{AdmissionTable, Decision};

/// Decides, per client, whether a request may proceed.
///
/// The filter owns its table outright; the only way to read or change it is
/// through [`AdmissionFilter::evaluate`] and the eviction helpers. It is
/// thread-safe and meant to be shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct AdmissionFilter {
    policy: Policy,
    table: AdmissionTable,
}

impl AdmissionFilter {
    /// Create a filter with a fresh, empty table.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            table: AdmissionTable::new(),
        }
    }

    /// Admit or reject a request from `key` arriving at `now`.
    ///
    /// Every call must use the same clock. Never blocks beyond the shard
    /// lock for `key` and never fails.
    pub fn evaluate(&self, key: &ClientKey, now: Instant) -> Decision {
        let decision = self.table.try_admit(key, now, self.policy.window());

        trace!(key = %key, decision = ?decision, "Admission evaluated");

        decision
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Number of distinct clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.table.len()
    }

    /// Timestamp of the last admitted request for `key`, if tracked.
    pub fn last_admitted(&self, key: &ClientKey) -> Option<Instant> {
        self.table.last_admitted(key)
    }

    /// Drop records idle for at least `idle_after` (never less than the window).
    ///
    /// Removed records were already eligible, so eviction cannot turn a
    /// reject into an admit.
    pub fn evict_idle(&self, now: Instant, idle_after: Duration) -> usize {
        let idle_after = idle_after.max(self.policy.window());
        self.table.evict_idle(now, idle_after)
    }
}

/// Shortest interval the sweeper will run at.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Periodically evict idle records from `filter`.
///
/// `every` is raised to at least 10ms. Runs until the returned handle is
/// aborted or the runtime shuts down.
pub fn spawn_sweeper(
    filter: Arc<AdmissionFilter>,
    every: Duration,
    idle_after: Duration,
) -> JoinHandle<()> {
    let every = every.max(MIN_SWEEP_INTERVAL);

    info!(
        interval = ?every,
        idle_after = ?idle_after,
        "Starting admission table sweeper"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;

            let removed = filter.evict_idle(Instant::now(), idle_after);
            if removed > 0 {
                debug!(
                    removed = removed,
                    remaining = filter.tracked_clients(),
                    "Evicted idle admission records"
                );
            }
        }
    })
}
