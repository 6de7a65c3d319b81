//! Backoff ledger for allocation retries.
//!
//! Per-requester retry throttling, keyed by `namespace/name`. This is the
//! only in-memory state of the controller: losing it on restart costs at most
//! one early retry per requester.

use crate::backoff::ExponentialBackoff;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct LedgerEntry {
    backoff: ExponentialBackoff,
    /// Earliest time the next retry may happen, while a wait is running
    deadline: Option<DateTime<Utc>>,
    /// Last time the entry was consulted (eviction order)
    touched: DateTime<Utc>,
}

/// Bounded, thread-safe map from requester to retry deadline
#[derive(Debug)]
pub struct BackoffLedger {
    base: Duration,
    max: Duration,
    capacity: usize,
    entries: Mutex<HashMap<String, LedgerEntry>>,
}

impl BackoffLedger {
    /// Create a ledger whose waits grow from `base` to `max`, holding at most `capacity` requesters
    #[must_use]
    pub fn new(base: Duration, max: Duration, capacity: usize) -> Self {
        Self {
            base,
            max,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Time left before `key` may retry.
    ///
    /// The first call for a key starts a wait and returns its full length.
    /// Once the wait has elapsed the call returns zero and clears the
    /// deadline; the next call starts a longer wait.
    pub fn remaining(&self, key: &str, now: DateTime<Utc>) -> Duration {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if !entries.contains_key(key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!("Backoff ledger full, evicting {}", oldest);
                entries.remove(&oldest);
            }
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| LedgerEntry {
            backoff: ExponentialBackoff::new(self.base, self.max),
            deadline: None,
            touched: now,
        });
        entry.touched = now;

        match entry.deadline {
            None => {
                let wait = entry.backoff.next_backoff();
                let deadline = TimeDelta::from_std(wait)
                    .ok()
                    .and_then(|delta| now.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                entry.deadline = Some(deadline);
                wait
            }
            Some(deadline) if deadline > now => (deadline - now).to_std().unwrap_or(Duration::ZERO),
            Some(_) => {
                entry.deadline = None;
                Duration::ZERO
            }
        }
    }

    /// Drop all state for `key`
    pub fn forget(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Number of tracked requesters
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ledger() -> BackoffLedger {
        BackoffLedger::new(Duration::from_secs(10), Duration::from_secs(40), 16)
    }

    #[test]
    fn test_wait_runs_then_elapses() {
        let ledger = ledger();
        assert_eq!(ledger.remaining("default/child", at(0)), Duration::from_secs(10));
        assert_eq!(ledger.remaining("default/child", at(4)), Duration::from_secs(6));
        assert_eq!(ledger.remaining("default/child", at(10)), Duration::ZERO);
    }

    #[test]
    fn test_waits_grow_until_ceiling() {
        let ledger = ledger();
        assert_eq!(ledger.remaining("default/child", at(0)), Duration::from_secs(10));
        assert_eq!(ledger.remaining("default/child", at(10)), Duration::ZERO);
        assert_eq!(ledger.remaining("default/child", at(11)), Duration::from_secs(20));
        assert_eq!(ledger.remaining("default/child", at(31)), Duration::ZERO);
        assert_eq!(ledger.remaining("default/child", at(32)), Duration::from_secs(40));
        assert_eq!(ledger.remaining("default/child", at(72)), Duration::ZERO);
        assert_eq!(ledger.remaining("default/child", at(73)), Duration::from_secs(40));
    }

    #[test]
    fn test_forget_restarts_sequence() {
        let ledger = ledger();
        ledger.remaining("default/child", at(0));
        ledger.remaining("default/child", at(10));
        ledger.forget("default/child");
        assert_eq!(ledger.len(), 0);
        assert_eq!(ledger.remaining("default/child", at(11)), Duration::from_secs(10));
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let ledger = BackoffLedger::new(Duration::from_secs(10), Duration::from_secs(40), 2);
        ledger.remaining("default/a", at(0));
        ledger.remaining("default/b", at(1));
        ledger.remaining("default/a", at(2));
        ledger.remaining("default/c", at(3));
        assert_eq!(ledger.len(), 2);
        // "b" was evicted, so it starts over with the base wait
        assert_eq!(ledger.remaining("default/b", at(4)), Duration::from_secs(10));
    }
}
