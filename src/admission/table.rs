//! Admission table: last-admitted timestamps keyed by client.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::key::ClientKey;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request to the downstream handler.
    Admit,
    /// Answer immediately without calling the downstream handler.
    Reject,
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Per-client admission state.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRecord {
    /// When the most recent admitted request from this client arrived
    last_admitted_at: Instant,
}

impl AdmissionRecord {
    pub fn new(admitted_at: Instant) -> Self {
        Self {
            last_admitted_at: admitted_at,
        }
    }

    pub fn last_admitted_at(&self) -> Instant {
        self.last_admitted_at
    }

    /// Whether a request at `now` is outside the window of the last admission.
    ///
    /// A `now` earlier than the stored timestamp counts as zero elapsed time.
    pub fn is_eligible(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_admitted_at) >= window
    }

    fn admit(&mut self, now: Instant) {
        if now > self.last_admitted_at {
            self.last_admitted_at = now;
        }
    }
}

/// Map of client key to admission record.
///
/// Sharded, so check-and-update for one key only locks that key's shard
/// and distinct clients rarely contend.
#[derive(Debug, Default)]
pub struct AdmissionTable {
    records: DashMap<ClientKey, AdmissionRecord>,
}

impl AdmissionTable {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Atomically test and update the record for `key`.
    ///
    /// The shard write lock is held across the eligibility check and the
    /// timestamp update, so two concurrent callers for the same key can
    /// never both be admitted within one window.
    pub fn try_admit(&self, key: &ClientKey, now: Instant, window: Duration) -> Decision {
        // Fast path for known clients avoids cloning the key.
        if let Some(mut record) = self.records.get_mut(key) {
            return Self::check(&mut record, now, window);
        }

        match self.records.entry(key.clone()) {
            Entry::Occupied(mut occupied) => Self::check(occupied.get_mut(), now, window),
            Entry::Vacant(vacant) => {
                vacant.insert(AdmissionRecord::new(now));
                Decision::Admit
            }
        }
    }

    fn check(record: &mut AdmissionRecord, now: Instant, window: Duration) -> Decision {
        if record.is_eligible(now, window) {
            record.admit(now);
            Decision::Admit
        } else {
            Decision::Reject
        }
    }

    /// Timestamp of the last admitted request for `key`, if any.
    pub fn last_admitted(&self, key: &ClientKey) -> Option<Instant> {
        self.records.get(key).map(|r| r.last_admitted_at())
    }

    /// Remove every record that has been idle for at least `idle_after`.
    ///
    /// Returns the number of records removed.
    pub fn evict_idle(&self, now: Instant, idle_after: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| now.saturating_duration_since(record.last_admitted_at) < idle_after);
        before.saturating_sub(self.records.len())
    }

    /// Number of clients with a record.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
