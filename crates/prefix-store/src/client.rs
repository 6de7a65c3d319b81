//! Kubernetes-backed prefix store
//!
//! Implements `PrefixStoreTrait` over `kube::Api`. Lists send the caller's
//! selector together with the index labels to the API server; writes that
//! change an indexed field refresh the matching index labels in the same patch.

use crate::error::StoreError;
use crate::filter::{Indexed, ListFilter, index_labels_for, prefix_ref_labels};
use crate::store_trait::PrefixStoreTrait;
use crds::{
    Prefix, PrefixAllocation, PrefixAllocationStatus, PrefixReference, PrefixSpec, PrefixStatus,
};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

/// Prefix store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubePrefixStore {
    namespace: String,
    prefix_api: Api<Prefix>,
    allocation_api: Api<PrefixAllocation>,
}

impl std::fmt::Debug for KubePrefixStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePrefixStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubePrefixStore {
    /// Create a store scoped to one namespace
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            prefix_api: Api::namespaced(client.clone(), namespace),
            allocation_api: Api::namespaced(client, namespace),
        }
    }

    /// Merge patch body guarded by `resourceVersion`
    ///
    /// The API server rejects a merge patch whose `metadata.resourceVersion`
    /// no longer matches the stored object with 409 Conflict.
    fn guarded(resource_version: Option<&str>, mut body: serde_json::Value) -> serde_json::Value {
        if let Some(rv) = resource_version {
            if let Some(obj) = body.as_object_mut() {
                let metadata = obj.entry("metadata").or_insert_with(|| json!({}));
                if let Some(metadata) = metadata.as_object_mut() {
                    metadata.insert("resourceVersion".to_string(), json!(rv));
                }
            }
        }
        body
    }
}

#[async_trait::async_trait]
impl PrefixStoreTrait for KubePrefixStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_prefix(&self, name: &str) -> Result<Option<Prefix>, StoreError> {
        Ok(self.prefix_api.get_opt(name).await?)
    }

    async fn list_prefixes(&self, filter: &ListFilter) -> Result<Vec<Prefix>, StoreError> {
        let list = self.prefix_api.list(&filter.list_params()).await?;
        let items: Vec<Prefix> = list.items.into_iter().filter(|p| filter.matches(p)).collect();
        debug!("Listed {} Prefixes in {} ({:?})", items.len(), self.namespace, filter);
        Ok(items)
    }

    async fn patch_prefix_spec(&self, name: &str, resource_version: Option<&str>, spec: &PrefixSpec) -> Result<Prefix, StoreError> {
        let parent = spec.parent_ref.as_ref().map(|r| r.name.as_str());
        let labels = index_labels_for(spec.ip_family, parent, None);
        let patch = Self::guarded(resource_version, json!({ "metadata": { "labels": labels }, "spec": spec }));
        Ok(self.prefix_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_prefix_status(&self, name: &str, resource_version: Option<&str>, status: &PrefixStatus) -> Result<Prefix, StoreError> {
        let patch = Self::guarded(resource_version, json!({ "status": status }));
        Ok(self.prefix_api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_prefix_finalizers(&self, name: &str, resource_version: Option<&str>, finalizers: &[String]) -> Result<Prefix, StoreError> {
        let patch = Self::guarded(resource_version, json!({ "metadata": { "finalizers": finalizers } }));
        Ok(self.prefix_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_prefix_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Prefix, StoreError> {
        let patch = Self::guarded(resource_version, json!({ "metadata": { "labels": labels } }));
        Ok(self.prefix_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn list_allocations(&self, filter: &ListFilter) -> Result<Vec<PrefixAllocation>, StoreError> {
        let list = self.allocation_api.list(&filter.list_params()).await?;
        let items: Vec<PrefixAllocation> = list.items.into_iter().filter(|a| filter.matches(a)).collect();
        debug!("Listed {} PrefixAllocations in {} ({:?})", items.len(), self.namespace, filter);
        Ok(items)
    }

    async fn create_allocation(&self, allocation: &PrefixAllocation) -> Result<PrefixAllocation, StoreError> {
        let mut indexed = allocation.clone();
        let labels = indexed.index_labels();
        indexed.labels_mut().extend(labels);
        Ok(self.allocation_api.create(&PostParams::default(), &indexed).await?)
    }

    async fn patch_allocation_status(&self, name: &str, resource_version: Option<&str>, status: &PrefixAllocationStatus) -> Result<PrefixAllocation, StoreError> {
        let patch = Self::guarded(resource_version, json!({ "status": status }));
        Ok(self.allocation_api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_allocation_prefix_ref(&self, name: &str, resource_version: Option<&str>, prefix_ref: &PrefixReference) -> Result<PrefixAllocation, StoreError> {
        let labels = prefix_ref_labels(&prefix_ref.name);
        let patch = Self::guarded(
            resource_version,
            json!({ "metadata": { "labels": labels }, "spec": { "prefixRef": prefix_ref } }),
        );
        Ok(self.allocation_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_allocation_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<PrefixAllocation, StoreError> {
        let patch = Self::guarded(resource_version, json!({ "metadata": { "labels": labels } }));
        Ok(self.allocation_api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete_allocation(&self, name: &str) -> Result<(), StoreError> {
        self.allocation_api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_patch_carries_resource_version() {
        let patch = KubePrefixStore::guarded(Some("42"), json!({ "status": { "phase": "Allocated" } }));
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["status"]["phase"], "Allocated");
    }

    #[test]
    fn test_guarded_patch_merges_into_existing_metadata() {
        let patch = KubePrefixStore::guarded(Some("7"), json!({ "metadata": { "finalizers": ["f"] } }));
        assert_eq!(patch["metadata"]["resourceVersion"], "7");
        assert_eq!(patch["metadata"]["finalizers"][0], "f");
    }

    #[test]
    fn test_unguarded_patch_is_untouched() {
        let body = json!({ "spec": { "prefixRef": { "name": "p" } } });
        assert_eq!(KubePrefixStore::guarded(None, body.clone()), body);
    }
}
