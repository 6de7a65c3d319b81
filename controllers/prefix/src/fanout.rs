//! Event fan-out.
//!
//! Mappers from a changed object to the objects whose reconciliation depends
//! on it, plugged into `Controller::watches`. Dependents are looked up in a
//! `DependentIndex`, a reverse index from prefix names to the objects that
//! react to them, kept current by its own watch on the dependent kind.

use crate::error::ControllerError;
use crds::{IPFamily, Prefix, PrefixAllocation};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{WatchStreamExt, watcher};
use prefix_store::selector_matches;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// How an object depends on prefixes
pub trait Dependent: kube::Resource<DynamicType = ()> + Clone {
    /// Name of the prefix the object is bound to
    fn bound_to(&self) -> Option<&str>;

    /// Family and selector while the object is still looking for a prefix
    fn selecting(&self) -> Option<(IPFamily, &LabelSelector)>;
}

impl Dependent for Prefix {
    fn bound_to(&self) -> Option<&str> {
        self.spec.parent_ref.as_ref().map(|r| r.name.as_str())
    }

    fn selecting(&self) -> Option<(IPFamily, &LabelSelector)> {
        if self.spec.parent_ref.is_some() {
            return None;
        }
        self.spec.parent_selector.as_ref().map(|s| (self.spec.ip_family, s))
    }
}

impl Dependent for PrefixAllocation {
    fn bound_to(&self) -> Option<&str> {
        self.prefix_ref_name()
    }

    fn selecting(&self) -> Option<(IPFamily, &LabelSelector)> {
        if self.spec.prefix_ref.is_some() || self.phase().is_terminal() {
            return None;
        }
        self.spec.prefix_selector.as_ref().map(|s| (self.spec.ip_family, s))
    }
}

#[derive(Debug, Default)]
struct IndexState {
    /// prefix name -> names of the objects bound to it
    bound: HashMap<String, BTreeSet<String>>,
    /// family -> name -> selector of unbound objects
    selecting: HashMap<IPFamily, BTreeMap<String, LabelSelector>>,
    /// name -> (bound prefix, selecting family) currently recorded
    entries: HashMap<String, (Option<String>, Option<IPFamily>)>,
}

impl IndexState {
    fn remove(&mut self, name: &str) {
        let Some((bound, family)) = self.entries.remove(name) else {
            return;
        };
        if let Some(parent) = bound {
            if let Some(names) = self.bound.get_mut(&parent) {
                names.remove(name);
                if names.is_empty() {
                    self.bound.remove(&parent);
                }
            }
        }
        if let Some(family) = family {
            if let Some(names) = self.selecting.get_mut(&family) {
                names.remove(name);
            }
        }
    }

    fn insert<K: Dependent>(&mut self, obj: &K) {
        let name = obj.name_any();
        self.remove(&name);
        let bound = obj.bound_to().map(str::to_string);
        if let Some(parent) = &bound {
            self.bound.entry(parent.clone()).or_default().insert(name.clone());
        }
        let family = obj.selecting().map(|(family, selector)| {
            self.selecting
                .entry(family)
                .or_default()
                .insert(name.clone(), selector.clone());
            family
        });
        self.entries.insert(name, (bound, family));
    }
}

/// Reverse index of one namespace's dependents of kind `K`
#[derive(Debug)]
pub struct DependentIndex<K> {
    state: RwLock<IndexState>,
    kind: PhantomData<fn() -> K>,
}

impl<K> Default for DependentIndex<K> {
    fn default() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            kind: PhantomData,
        }
    }
}

impl<K: Dependent> DependentIndex<K> {
    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the current state of `obj`
    pub fn apply(&self, obj: &K) {
        self.write().insert(obj);
    }

    /// Forget `obj`
    pub fn delete(&self, obj: &K) {
        self.write().remove(&obj.name_any());
    }

    /// Replace the whole index, after a re-list
    pub fn replace(&self, objs: &[K]) {
        let mut state = IndexState::default();
        for obj in objs {
            state.insert(obj);
        }
        *self.write() = state;
    }

    /// Number of indexed objects
    pub fn indexed_count(&self) -> usize {
        self.read().entries.len()
    }

    /// Names of the objects that react to `changed`: those bound to it, and
    /// unbound same-family ones whose selector matches its labels
    pub fn dependents_of(&self, changed: &Prefix) -> Vec<String> {
        let name = changed.name_any();
        let state = self.read();
        let mut names: BTreeSet<String> = state.bound.get(&name).cloned().unwrap_or_default();
        if let Some(selecting) = state.selecting.get(&changed.spec.ip_family) {
            names.extend(
                selecting
                    .iter()
                    .filter(|(_, selector)| selector_matches(selector, changed.labels()))
                    .map(|(dependent, _)| dependent.clone()),
            );
        }
        names.into_iter().collect()
    }

    /// Keep the index in step with `api`; watch errors are retried with backoff
    pub async fn follow(&self, api: Api<K>, resource_name: &str) -> Result<(), ControllerError>
    where
        K: serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
    {
        info!("Starting {} index", resource_name);
        let mut stream = Box::pin(watcher(api, watcher::Config::default()).default_backoff());
        let mut relist: Vec<K> = Vec::new();

        while let Some(result) = stream.next().await {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("{} index watch error: {}", resource_name, e);
                    continue;
                }
            };
            match event {
                watcher::Event::Apply(obj) => self.apply(&obj),
                watcher::Event::Delete(obj) => self.delete(&obj),
                watcher::Event::Init => relist.clear(),
                watcher::Event::InitApply(obj) => relist.push(obj),
                watcher::Event::InitDone => {
                    self.replace(&relist);
                    relist.clear();
                    debug!("{} index holds {} object(s)", resource_name, self.indexed_count());
                }
            }
        }

        Err(ControllerError::Watch(format!("{resource_name} index stream ended")))
    }
}

/// Prefixes to re-evaluate when `changed` changes:
/// children naming it as `parentRef`, and unbound same-family prefixes whose
/// `parentSelector` matches its labels.
#[must_use]
pub fn prefix_dependents(changed: &Prefix, index: &DependentIndex<Prefix>) -> Vec<ObjectRef<Prefix>> {
    let Some(namespace) = changed.namespace() else {
        return Vec::new();
    };
    let name = changed.name_any();
    index
        .dependents_of(changed)
        .into_iter()
        .filter(|dependent| *dependent != name)
        .map(|dependent| ObjectRef::new(&dependent).within(&namespace))
        .collect()
}

/// Prefixes to re-evaluate when an allocation changes: its requester (the
/// controlling owner) and the parent it is bound to.
#[must_use]
pub fn allocation_requesters(allocation: &PrefixAllocation) -> Vec<ObjectRef<Prefix>> {
    let Some(namespace) = allocation.namespace() else {
        return Vec::new();
    };
    let owner = allocation
        .owner_references()
        .iter()
        .filter(|o| o.controller == Some(true) && o.kind == "Prefix")
        .map(|o| o.name.clone());
    let source = allocation.prefix_ref_name().map(str::to_string);

    let mut names: Vec<String> = owner.chain(source).collect();
    names.sort();
    names.dedup();
    names
        .into_iter()
        .map(|name| ObjectRef::new(&name).within(&namespace))
        .collect()
}

/// Allocations to re-evaluate when `changed` changes: those bound to it, and
/// unbound, non-terminal, same-family ones whose selector matches its labels.
#[must_use]
pub fn allocations_for_prefix(
    changed: &Prefix,
    index: &DependentIndex<PrefixAllocation>,
) -> Vec<ObjectRef<PrefixAllocation>> {
    let Some(namespace) = changed.namespace() else {
        return Vec::new();
    };
    index
        .dependents_of(changed)
        .into_iter()
        .map(|name| ObjectRef::new(&name).within(&namespace))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{allocation_with, child_prefix, labels, root_prefix, selector};
    use crds::{PrefixAllocationPhase, PrefixAllocationStatus, PrefixReference};
    use kube::Resource;

    fn names<K: kube::Resource<DynamicType = ()>>(refs: &[ObjectRef<K>]) -> Vec<String> {
        let mut names: Vec<String> = refs.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    fn blue_pool() -> Prefix {
        let mut parent = root_prefix("pool", "10.0.0.0/8");
        parent.metadata.labels = Some(labels(&[("pool", "blue")]));
        parent
    }

    #[test]
    fn test_prefix_dependents_children_and_selectors() {
        let parent = blue_pool();
        let by_ref = child_prefix("by-ref", Some("pool"), None, Some(24));
        let by_selector = child_prefix("by-selector", None, Some(selector(&[("pool", "blue")])), Some(24));
        let other_selector = child_prefix("other", None, Some(selector(&[("pool", "red")])), Some(24));
        let mut other_family = child_prefix("v6", None, Some(selector(&[("pool", "blue")])), Some(64));
        other_family.spec.ip_family = IPFamily::IPv6;
        let unrelated = child_prefix("unrelated", Some("elsewhere"), None, Some(24));

        let index = DependentIndex::default();
        index.replace(&[parent.clone(), by_ref, by_selector, other_selector, other_family, unrelated]);

        assert_eq!(names(&prefix_dependents(&parent, &index)), vec!["by-ref", "by-selector"]);
        assert!(
            prefix_dependents(&parent, &index)
                .iter()
                .all(|r| r.namespace.as_deref() == Some("default"))
        );
    }

    #[test]
    fn test_index_follows_updates_and_deletes() {
        let parent = blue_pool();
        let index = DependentIndex::default();

        let mut child = child_prefix("child", None, Some(selector(&[("pool", "blue")])), Some(24));
        index.apply(&child);
        assert_eq!(index.dependents_of(&parent), vec!["child"]);

        // Bound elsewhere: no longer selecting, and not a child of `pool`
        child.spec.parent_ref = Some(PrefixReference::new("other"));
        index.apply(&child);
        assert!(index.dependents_of(&parent).is_empty());
        assert_eq!(index.dependents_of(&root_prefix("other", "10.1.0.0/16")), vec!["child"]);
        assert_eq!(index.indexed_count(), 1);

        index.delete(&child);
        assert!(index.dependents_of(&root_prefix("other", "10.1.0.0/16")).is_empty());
        assert_eq!(index.indexed_count(), 0);
    }

    #[test]
    fn test_allocation_requesters_owner_and_source() {
        let requester = child_prefix("child", Some("pool"), None, Some(24));
        let mut allocation = allocation_with("child-00001", IPFamily::IPv4, None, Some(24));
        allocation.metadata.owner_references = requester.controller_owner_ref(&()).map(|o| vec![o]);
        allocation.spec.prefix_ref = Some(PrefixReference::new("pool"));

        let refs = allocation_requesters(&allocation);
        assert_eq!(names(&refs), vec!["child", "pool"]);
        assert!(refs.iter().all(|r| r.namespace.as_deref() == Some("default")));
    }

    #[test]
    fn test_allocations_for_prefix_bound_and_schedulable() {
        let parent = blue_pool();

        let mut bound = allocation_with("bound", IPFamily::IPv4, None, Some(24));
        bound.spec.prefix_ref = Some(PrefixReference::new("pool"));
        let mut schedulable = allocation_with("schedulable", IPFamily::IPv4, None, Some(24));
        schedulable.spec.prefix_selector = Some(selector(&[("pool", "blue")]));
        let mut elsewhere = allocation_with("elsewhere", IPFamily::IPv4, None, Some(24));
        elsewhere.spec.prefix_ref = Some(PrefixReference::new("other"));
        elsewhere.spec.prefix_selector = Some(selector(&[("pool", "blue")]));
        let mut failed = allocation_with("failed", IPFamily::IPv4, None, Some(24));
        failed.spec.prefix_selector = Some(selector(&[("pool", "blue")]));
        failed.status = Some(PrefixAllocationStatus {
            phase: PrefixAllocationPhase::Failed,
            prefix: None,
            last_phase_transition_time: None,
        });

        let index = DependentIndex::default();
        index.replace(&[bound, schedulable, elsewhere, failed]);
        assert_eq!(names(&allocations_for_prefix(&parent, &index)), vec!["bound", "schedulable"]);
    }
}
