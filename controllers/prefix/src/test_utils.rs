//! Test utilities for unit testing reconcilers
//!
//! This module provides builders for test resources, a manually driven clock
//! and a harness wiring a `Reconciler` to the in-memory store.

use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use chrono::{DateTime, TimeZone, Utc};
use crds::{
    IPFamily, Prefix, PrefixAllocation, PrefixAllocationSpec, PrefixReference, PrefixSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use prefix_store::{MockEventSink, MockPrefixStore};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed instant `secs` seconds after an arbitrary epoch
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Label map from pairs
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// `matchLabels` selector from pairs
pub fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(labels(pairs)),
        match_expressions: None,
    }
}

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        uid: Some(format!("uid-{name}")),
        ..Default::default()
    }
}

/// Helper to create a root Prefix owning `cidr`
pub fn root_prefix(name: &str, cidr: &str) -> Prefix {
    let family = if cidr.contains(':') { IPFamily::IPv6 } else { IPFamily::IPv4 };
    Prefix {
        metadata: meta(name),
        spec: PrefixSpec {
            ip_family: family,
            prefix: Some(cidr.to_string()),
            prefix_length: None,
            parent_ref: None,
            parent_selector: None,
        },
        status: None,
    }
}

/// Helper to create an IPv4 child Prefix requesting a block of `length`
pub fn child_prefix(
    name: &str,
    parent_ref: Option<&str>,
    parent_selector: Option<LabelSelector>,
    length: Option<u8>,
) -> Prefix {
    Prefix {
        metadata: meta(name),
        spec: PrefixSpec {
            ip_family: IPFamily::IPv4,
            prefix: None,
            prefix_length: length,
            parent_ref: parent_ref.map(PrefixReference::new),
            parent_selector,
        },
        status: None,
    }
}

/// Helper to create an unbound PrefixAllocation
pub fn allocation_with(
    name: &str,
    family: IPFamily,
    prefix: Option<&str>,
    length: Option<u8>,
) -> PrefixAllocation {
    PrefixAllocation {
        metadata: meta(name),
        spec: PrefixAllocationSpec {
            ip_family: family,
            prefix: prefix.map(str::to_string),
            prefix_length: length,
            prefix_ref: None,
            prefix_selector: None,
        },
        status: None,
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at the current wall-clock time so store-assigned creation
    /// timestamps are never in the future
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Utc::now())),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::TimeDelta::from_std(by).unwrap();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Reconciler wired to an in-memory store, event sink and manual clock
pub struct TestHarness {
    pub store: MockPrefixStore,
    pub events: MockEventSink,
    pub clock: ManualClock,
    pub reconciler: Reconciler,
}

impl TestHarness {
    /// Harness with a 60s allocation timeout and 1s..300s backoff
    pub fn new() -> Self {
        Self::with_config(&ControllerConfig::default())
    }

    pub fn with_config(config: &ControllerConfig) -> Self {
        let store = MockPrefixStore::new("default");
        let events = MockEventSink::new();
        let clock = ManualClock::new();
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(events.clone()),
            Arc::new(clock.clone()),
            config,
        );
        Self {
            store,
            events,
            clock,
            reconciler,
        }
    }

    /// Reconcile the stored state of a Prefix
    pub async fn reconcile_prefix(&self, name: &str) -> Result<Action, ControllerError> {
        let prefix = self.store.prefix(name).expect("prefix exists");
        self.reconciler.reconcile_prefix(&prefix).await
    }

    /// Reconcile the stored state of a PrefixAllocation
    pub async fn reconcile_allocation(&self, name: &str) -> Result<Action, ControllerError> {
        let allocation = self.store.allocation(name).expect("allocation exists");
        self.reconciler.reconcile_allocation(&allocation).await
    }

    /// Reconcile every object in name order until a full round writes nothing
    pub async fn settle(&self) {
        for _ in 0..20 {
            let before = self.store.write_count();
            for prefix in self.store.prefixes() {
                if let Some(current) = self.store.prefix(&prefix.name_any()) {
                    self.reconciler.reconcile_prefix(&current).await.unwrap();
                }
            }
            for allocation in self.store.allocations() {
                if let Some(current) = self.store.allocation(&allocation.name_any()) {
                    self.reconciler.reconcile_allocation(&current).await.unwrap();
                }
            }
            if self.store.write_count() == before {
                return;
            }
        }
        panic!("store did not settle");
    }

    /// Allocations owned by the named prefix
    pub fn owned_allocations(&self, owner: &str) -> Vec<PrefixAllocation> {
        let uid = self.store.prefix(owner).and_then(|p| p.uid());
        self.store
            .allocations()
            .into_iter()
            .filter(|a| prefix_store::controller_uid(a) == uid.as_deref())
            .collect()
    }
}
