//! PrefixStoreTrait for mocking
//!
//! This trait abstracts the resource store so the reconcilers can run against
//! the Kubernetes API in production and against an in-memory store in tests.

use crate::error::StoreError;
use crate::filter::ListFilter;
use crds::{
    Prefix, PrefixAllocation, PrefixAllocationStatus, PrefixReference, PrefixSpec, PrefixStatus,
};
use std::collections::BTreeMap;

/// Namespaced store operations for prefix resources
///
/// Every write takes the `resource_version` the caller computed the change
/// from; a stale version is rejected with `StoreError::Conflict` and the
/// caller relies on the next triggered reconciliation instead of retrying.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait PrefixStoreTrait: Send + Sync {
    /// Namespace the store operates in
    fn namespace(&self) -> &str;

    // Prefix operations

    /// Fetch a prefix by name, `None` if it does not exist
    async fn get_prefix(&self, name: &str) -> Result<Option<Prefix>, StoreError>;
    /// List the prefixes passing `filter`
    async fn list_prefixes(&self, filter: &ListFilter) -> Result<Vec<Prefix>, StoreError>;
    /// Replace the spec, refreshing the index labels derived from it
    async fn patch_prefix_spec(&self, name: &str, resource_version: Option<&str>, spec: &PrefixSpec) -> Result<Prefix, StoreError>;
    /// Replace the status subresource
    async fn patch_prefix_status(&self, name: &str, resource_version: Option<&str>, status: &PrefixStatus) -> Result<Prefix, StoreError>;
    /// Replace the finalizer list
    async fn patch_prefix_finalizers(&self, name: &str, resource_version: Option<&str>, finalizers: &[String]) -> Result<Prefix, StoreError>;
    /// Merge `labels` into the existing labels
    async fn patch_prefix_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Prefix, StoreError>;

    // PrefixAllocation operations

    /// List the allocations passing `filter`
    async fn list_allocations(&self, filter: &ListFilter) -> Result<Vec<PrefixAllocation>, StoreError>;
    /// Create an allocation carrying its index labels; honours `generateName`
    async fn create_allocation(&self, allocation: &PrefixAllocation) -> Result<PrefixAllocation, StoreError>;
    /// Replace the status subresource
    async fn patch_allocation_status(&self, name: &str, resource_version: Option<&str>, status: &PrefixAllocationStatus) -> Result<PrefixAllocation, StoreError>;
    /// Bind the allocation to a parent, refreshing the parent index label
    async fn patch_allocation_prefix_ref(&self, name: &str, resource_version: Option<&str>, prefix_ref: &PrefixReference) -> Result<PrefixAllocation, StoreError>;
    /// Merge `labels` into the existing labels
    async fn patch_allocation_labels(&self, name: &str, resource_version: Option<&str>, labels: &BTreeMap<String, String>) -> Result<PrefixAllocation, StoreError>;
    /// Delete an allocation; a missing one is reported as `StoreError::NotFound`
    async fn delete_allocation(&self, name: &str) -> Result<(), StoreError>;
}
