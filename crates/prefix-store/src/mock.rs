//! Mock prefix store for unit testing
//!
//! This module provides in-memory implementations of `PrefixStoreTrait` and
//! `EventSink` that behave like the API server where the reconcilers care:
//! resource versions and conflicts, `generateName`, status being ignored on
//! create, finalizer-aware deletion, and lists that only see objects whose
//! index labels match.

use crate::error::StoreError;
use crate::events::{DiagnosticEvent, EventSink};
use crate::filter::{Indexed, ListFilter, index_labels_for, prefix_ref_labels};
use crate::meta::to_meta_time;
use crate::store_trait::PrefixStoreTrait;
use chrono::Utc;
use crds::{
    Prefix, PrefixAllocation, PrefixAllocationStatus, PrefixReference, PrefixSpec, PrefixStatus,
};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::core::SelectorExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MockState {
    prefixes: BTreeMap<String, Prefix>,
    allocations: BTreeMap<String, PrefixAllocation>,
    next_version: u64,
    next_suffix: u64,
    conflict_next_write: bool,
    writes: u64,
}

impl MockState {
    fn next_resource_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Optimistic-concurrency check shared by every write
    fn admit_write(
        &mut self,
        what: &str,
        current: Option<&str>,
        expected: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.conflict_next_write {
            self.conflict_next_write = false;
            return Err(StoreError::Conflict(format!("{what}: injected conflict")));
        }
        if let Some(expected) = expected {
            if current != Some(expected) {
                return Err(StoreError::Conflict(format!(
                    "{what}: resourceVersion {expected} is stale (current {})",
                    current.unwrap_or("<none>")
                )));
            }
        }
        self.writes += 1;
        Ok(())
    }

    fn stamp(&mut self, meta: &mut ObjectMeta, namespace: &str) {
        meta.namespace = Some(namespace.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = to_meta_time(Utc::now());
        }
        meta.resource_version = Some(self.next_resource_version());
    }
}

/// What the API server would return for `filter`
fn listed<K: Indexed + Clone>(objects: &BTreeMap<String, K>, filter: &ListFilter) -> Vec<K> {
    let server_side = filter.label_selector();
    objects
        .values()
        .filter(|obj| server_side.as_ref().is_none_or(|selector| selector.matches(obj.labels())))
        .filter(|obj| filter.matches(*obj))
        .cloned()
        .collect()
}

/// Mock prefix store for testing
///
/// Objects are kept in name order, which is also the order lists return them in.
/// Objects added for test setup carry their index labels, as if the controller
/// had already written them once; the `*_unindexed` variants leave them off.
#[derive(Debug, Clone)]
pub struct MockPrefixStore {
    namespace: String,
    state: Arc<Mutex<MockState>>,
}

impl MockPrefixStore {
    /// Create an empty store for `namespace`
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add (or replace) a prefix, status included (for test setup)
    pub fn add_prefix(&self, mut prefix: Prefix) -> Prefix {
        let labels = prefix.index_labels();
        prefix.labels_mut().extend(labels);
        self.add_prefix_unindexed(prefix)
    }

    /// Add (or replace) a prefix exactly as given, without index labels
    pub fn add_prefix_unindexed(&self, mut prefix: Prefix) -> Prefix {
        let mut state = self.state();
        state.stamp(&mut prefix.metadata, &self.namespace);
        let name = prefix.metadata.name.clone().unwrap_or_default();
        state.prefixes.insert(name, prefix.clone());
        prefix
    }

    /// Add (or replace) an allocation, status included (for test setup)
    pub fn add_allocation(&self, mut allocation: PrefixAllocation) -> PrefixAllocation {
        let labels = allocation.index_labels();
        allocation.labels_mut().extend(labels);
        self.add_allocation_unindexed(allocation)
    }

    /// Add (or replace) an allocation exactly as given, without index labels
    pub fn add_allocation_unindexed(&self, mut allocation: PrefixAllocation) -> PrefixAllocation {
        let mut state = self.state();
        state.stamp(&mut allocation.metadata, &self.namespace);
        let name = allocation.metadata.name.clone().unwrap_or_default();
        state.allocations.insert(name, allocation.clone());
        allocation
    }

    /// Current state of a prefix
    pub fn prefix(&self, name: &str) -> Option<Prefix> {
        self.state().prefixes.get(name).cloned()
    }

    /// Current state of an allocation
    pub fn allocation(&self, name: &str) -> Option<PrefixAllocation> {
        self.state().allocations.get(name).cloned()
    }

    /// All prefixes in name order
    pub fn prefixes(&self) -> Vec<Prefix> {
        self.state().prefixes.values().cloned().collect()
    }

    /// All allocations in name order
    pub fn allocations(&self) -> Vec<PrefixAllocation> {
        self.state().allocations.values().cloned().collect()
    }

    /// Delete a prefix the way the API server does: objects carrying
    /// finalizers only get a deletion timestamp.
    pub fn delete_prefix(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        let version = state.next_resource_version();
        let prefix = state
            .prefixes
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?;
        if prefix.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if prefix.metadata.deletion_timestamp.is_none() {
                prefix.metadata.deletion_timestamp = to_meta_time(Utc::now());
            }
            prefix.metadata.resource_version = Some(version);
        } else {
            state.prefixes.remove(name);
        }
        Ok(())
    }

    /// Make the next write fail with a conflict
    pub fn conflict_on_next_write(&self) {
        self.state().conflict_next_write = true;
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.state().writes
    }
}

#[async_trait::async_trait]
impl PrefixStoreTrait for MockPrefixStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_prefix(&self, name: &str) -> Result<Option<Prefix>, StoreError> {
        Ok(self.prefix(name))
    }

    async fn list_prefixes(&self, filter: &ListFilter) -> Result<Vec<Prefix>, StoreError> {
        Ok(listed(&self.state().prefixes, filter))
    }

    async fn patch_prefix_spec(&self, name: &str, resource_version: Option<&str>, spec: &PrefixSpec) -> Result<Prefix, StoreError> {
        let mut state = self.state();
        let current = state.prefixes.get(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?
            .metadata.resource_version.clone();
        state.admit_write(&format!("Prefix {name}"), current.as_deref(), resource_version)?;
        let version = state.next_resource_version();
        let prefix = state.prefixes.get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?;
        prefix.spec = spec.clone();
        let parent = spec.parent_ref.as_ref().map(|r| r.name.as_str());
        prefix.labels_mut().extend(index_labels_for(spec.ip_family, parent, None));
        prefix.metadata.resource_version = Some(version);
        Ok(prefix.clone())
    }

    async fn patch_prefix_status(&self, name: &str, resource_version: Option<&str>, status: &PrefixStatus) -> Result<Prefix, StoreError> {
        let mut state = self.state();
        let current = state.prefixes.get(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?
            .metadata.resource_version.clone();
        state.admit_write(&format!("Prefix {name}"), current.as_deref(), resource_version)?;
        let version = state.next_resource_version();
        let prefix = state.prefixes.get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?;
        prefix.status = Some(status.clone());
        prefix.metadata.resource_version = Some(version);
        Ok(prefix.clone())
    }

    async fn patch_prefix_finalizers(&self, name: &str, resource_version: Option<&str>, finalizers: &[String]) -> Result<Prefix, StoreError> {
        let mut state = self.state();
        let current = state.prefixes.get(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?
            .metadata.resource_version.clone();
        state.admit_write(&format!("Prefix {name}"), current.as_deref(), resource_version)?;
        let version = state.next_resource_version();
        let prefix = state.prefixes.get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?;
        prefix.metadata.finalizers = Some(finalizers.to_vec());
        prefix.metadata.resource_version = Some(version);
        let updated = prefix.clone();
        if finalizers.is_empty() && updated.metadata.deletion_timestamp.is_some() {
            state.prefixes.remove(name);
        }
        Ok(updated)
    }

    async fn patch_prefix_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Prefix, StoreError> {
        let mut state = self.state();
        let current = state.prefixes.get(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?
            .metadata.resource_version.clone();
        state.admit_write(&format!("Prefix {name}"), current.as_deref(), resource_version)?;
        let version = state.next_resource_version();
        let prefix = state.prefixes.get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("Prefix {name}")))?;
        prefix.labels_mut().extend(labels.clone());
        prefix.metadata.resource_version = Some(version);
        Ok(prefix.clone())
    }

    async fn list_allocations(&self, filter: &ListFilter) -> Result<Vec<PrefixAllocation>, StoreError> {
        Ok(listed(&self.state().allocations, filter))
    }

    async fn create_allocation(&self, allocation: &PrefixAllocation) -> Result<PrefixAllocation, StoreError> {
        let mut state = self.state();
        state.admit_write("PrefixAllocation create", None, None)?;
        let mut created = allocation.clone();
        let name = match (&created.metadata.name, &created.metadata.generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(base)) => {
                state.next_suffix += 1;
                format!("{base}{:05}", state.next_suffix)
            }
            (None, None) => {
                return Err(StoreError::InvalidObject(
                    "PrefixAllocation needs a name or generateName".to_string(),
                ));
            }
        };
        if state.allocations.contains_key(&name) {
            return Err(StoreError::Conflict(format!("PrefixAllocation {name} already exists")));
        }
        created.metadata.name = Some(name.clone());
        created.metadata.uid = None;
        created.metadata.creation_timestamp = None;
        created.status = None;
        let labels = created.index_labels();
        created.labels_mut().extend(labels);
        state.stamp(&mut created.metadata, &self.namespace);
        state.allocations.insert(name, created.clone());
        Ok(created)
    }

    async fn patch_allocation_status(&self, name: &str, resource_version: Option<&str>, status: &PrefixAllocationStatus) -> Result<PrefixAllocation, StoreError> {
        let mut state = self.state();
        let current = state.allocations.get(name)
            .ok_or_else(|| StoreError::NotFound(format!("PrefixAllocation {name}")))?
            .metadata.resource_version.clone();
        state.admit_write(&format!("PrefixAllocation {name}"), current.as_deref(), resource_version)?;
        let version = state.next_resource_version();
        let allocation = state.allocations.get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("PrefixAllocation {name}")))?;
        allocation.status = Some(status.clone());
        allocation.metadata.resource_version = Some(version);
        Ok(allocation.clone())
    }

    async fn patch_allocation_prefix_ref(&self, name: &str, resource_version: Option<&str>, prefix_ref: &PrefixReference) -> Result<PrefixAllocation, StoreError> {
        let mut state = self.state();
        let current = state.allocations.get(name)
            .ok_or_else(|| StoreError::NotFound(format!("PrefixAllocation {name}")))?
            .metadata.resource_version.clone();
        state.admit_write(&format!("PrefixAllocation {name}"), current.as_deref(), resource_version)?;
        let version = state.next_resource_version();
        let allocation = state.allocations.get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("PrefixAllocation {name}")))?;
        allocation.spec.prefix_ref = Some(prefix_ref.clone());
        allocation.labels_mut().extend(prefix_ref_labels(&prefix_ref.name));
        allocation.metadata.resource_version = Some(version);
        Ok(allocation.clone())
    }

    async fn patch_allocation_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<PrefixAllocation, StoreError> {
        let mut state = self.state();
        let current = state.allocations.get(name)
            .ok_or_else(|| StoreError::NotFound(format!("PrefixAllocation {name}")))?
            .metadata.resource_version.clone();
        state.admit_write(&format!("PrefixAllocation {name}"), current.as_deref(), resource_version)?;
        let version = state.next_resource_version();
        let allocation = state.allocations.get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("PrefixAllocation {name}")))?;
        allocation.labels_mut().extend(labels.clone());
        allocation.metadata.resource_version = Some(version);
        Ok(allocation.clone())
    }

    async fn delete_allocation(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        if !state.allocations.contains_key(name) {
            return Err(StoreError::NotFound(format!("PrefixAllocation {name}")));
        }
        state.admit_write(&format!("PrefixAllocation {name}"), None, None)?;
        state.allocations.remove(name);
        Ok(())
    }
}

/// Mock event sink recording every published event
#[derive(Debug, Clone, Default)]
pub struct MockEventSink {
    events: Arc<Mutex<Vec<(ObjectReference, DiagnosticEvent)>>>,
}

impl MockEventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far
    pub fn events(&self) -> Vec<(ObjectReference, DiagnosticEvent)> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Reasons of the events published about the object called `name`
    pub fn reasons_for(&self, name: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(regarding, _)| regarding.name.as_deref() == Some(name))
            .map(|(_, event)| event.reason)
            .collect()
    }
}

#[async_trait::async_trait]
impl EventSink for MockEventSink {
    async fn publish(&self, regarding: &ObjectReference, event: DiagnosticEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((regarding.clone(), event));
    }
}
