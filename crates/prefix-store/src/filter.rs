//! List filters and secondary indexes
//!
//! The reconcilers never scan the whole store: every list is narrowed on the
//! API server by a label selector built from the caller's selector and the
//! index fields below. The index fields live in `spec` (or in the owner
//! references), which custom resources cannot field-select on, so each one is
//! mirrored into an index label whenever the object is written.
//!
//! | Index        | Prefix                 | PrefixAllocation        | Label                 |
//! |--------------|------------------------|-------------------------|-----------------------|
//! | address      | `spec.ipFamily`        | `spec.ipFamily`         | `IP_FAMILY_LABEL`     |
//! | parent name  | `spec.parentRef.name`  | `spec.prefixRef.name`   | `PREFIX_REF_LABEL`    |
//! | owner        | controller owner uid   | controller owner uid    | `OWNER_UID_LABEL`     |
//!
//! Listed items are checked against the index fields again, so a stale label
//! can only widen a query, never hide an object from it.

use crate::error::StoreError;
use crds::{IPFamily, Prefix, PrefixAllocation};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::core::{Expression, Selector, SelectorExt};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Index label mirroring the address family
pub const IP_FAMILY_LABEL: &str = "dcops.microscaler.io/ip-family";

/// Index label mirroring the parent (Prefix) or source (PrefixAllocation) name
pub const PREFIX_REF_LABEL: &str = "dcops.microscaler.io/prefix-ref";

/// Index label mirroring the controller owner uid
pub const OWNER_UID_LABEL: &str = "dcops.microscaler.io/owner-uid";

/// `raw` if it is usable as a label value.
///
/// Names longer than a label value allows are not indexed; queries on them
/// fall back to checking the listed items.
fn label_value(raw: &str) -> Option<&str> {
    let valid = !raw.is_empty()
        && raw.len() <= 63
        && raw.starts_with(|c: char| c.is_ascii_alphanumeric())
        && raw.ends_with(|c: char| c.is_ascii_alphanumeric())
        && raw.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    valid.then_some(raw)
}

/// Parent index label for `name`, empty when the name cannot be a label value
#[must_use]
pub fn prefix_ref_labels(name: &str) -> BTreeMap<String, String> {
    label_value(name)
        .map(|parent| (PREFIX_REF_LABEL.to_string(), parent.to_string()))
        .into_iter()
        .collect()
}

/// Index labels for the given field values
#[must_use]
pub fn index_labels_for(
    ip_family: IPFamily,
    parent_name: Option<&str>,
    owner_uid: Option<&str>,
) -> BTreeMap<String, String> {
    let mut labels = parent_name.map(prefix_ref_labels).unwrap_or_default();
    labels.insert(IP_FAMILY_LABEL.to_string(), ip_family.to_string());
    if let Some(uid) = owner_uid.and_then(label_value) {
        labels.insert(OWNER_UID_LABEL.to_string(), uid.to_string());
    }
    labels
}

/// Index fields extracted from a resource
pub trait Indexed: Resource + Sized {
    /// Address family of the resource
    fn ip_family(&self) -> IPFamily;

    /// Name of the prefix this resource hangs off (parent or source)
    fn parent_name(&self) -> Option<&str>;

    /// Index labels the object should carry
    fn index_labels(&self) -> BTreeMap<String, String> {
        index_labels_for(self.ip_family(), self.parent_name(), controller_uid(self))
    }

    /// Index labels that are absent or out of date, `None` when all are current
    fn stale_index_labels(&self) -> Option<BTreeMap<String, String>> {
        let current = self.labels();
        let stale: BTreeMap<String, String> = self
            .index_labels()
            .into_iter()
            .filter(|(key, value)| current.get(key) != Some(value))
            .collect();
        (!stale.is_empty()).then_some(stale)
    }
}

impl Indexed for Prefix {
    fn ip_family(&self) -> IPFamily {
        self.spec.ip_family
    }

    fn parent_name(&self) -> Option<&str> {
        self.spec.parent_ref.as_ref().map(|r| r.name.as_str())
    }
}

impl Indexed for PrefixAllocation {
    fn ip_family(&self) -> IPFamily {
        self.spec.ip_family
    }

    fn parent_name(&self) -> Option<&str> {
        self.prefix_ref_name()
    }
}

/// UID of the controlling owner of an object
#[must_use]
pub fn controller_uid<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller == Some(true))
        .map(|owner| owner.uid.as_str())
}

/// Parse a Kubernetes label selector into a matchable query
pub fn parse_selector(selector: &LabelSelector) -> Result<Selector, StoreError> {
    Selector::try_from(selector.clone()).map_err(|e| StoreError::InvalidSelector(e.to_string()))
}

/// Whether `labels` satisfy `selector`; an unparsable selector matches nothing
#[must_use]
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    parse_selector(selector).is_ok_and(|s| s.matches(labels))
}

/// Filter applied to list operations
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Label query (evaluated server-side where possible)
    pub selector: Option<Selector>,
    /// `spec.ipFamily` index
    pub ip_family: Option<IPFamily>,
    /// Parent / source prefix name index
    pub parent_name: Option<String>,
    /// Controller owner uid index
    pub owner_uid: Option<String>,
}

impl ListFilter {
    /// Filter that matches everything
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to objects whose labels match `selector`
    #[must_use]
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Restrict to one address family
    #[must_use]
    pub fn with_ip_family(mut self, ip_family: IPFamily) -> Self {
        self.ip_family = Some(ip_family);
        self
    }

    /// Restrict to objects hanging off the named prefix
    #[must_use]
    pub fn with_parent_name(mut self, name: impl Into<String>) -> Self {
        self.parent_name = Some(name.into());
        self
    }

    /// Restrict to objects controlled by the owner with this uid
    #[must_use]
    pub fn with_owner_uid(mut self, uid: impl Into<String>) -> Self {
        self.owner_uid = Some(uid.into());
        self
    }

    /// Index requirements the API server can evaluate
    fn index_expressions(&self) -> Vec<Expression> {
        let mut expressions = Vec::new();
        if let Some(family) = self.ip_family {
            expressions.push(Expression::Equal(IP_FAMILY_LABEL.to_string(), family.to_string()));
        }
        if let Some(parent) = self.parent_name.as_deref().and_then(label_value) {
            expressions.push(Expression::Equal(PREFIX_REF_LABEL.to_string(), parent.to_string()));
        }
        if let Some(uid) = self.owner_uid.as_deref().and_then(label_value) {
            expressions.push(Expression::Equal(OWNER_UID_LABEL.to_string(), uid.to_string()));
        }
        expressions
    }

    /// Label query sent to the API server: the caller's selector plus the
    /// index labels; `None` lists everything
    #[must_use]
    pub fn label_selector(&self) -> Option<Selector> {
        let index = self.index_expressions();
        match &self.selector {
            Some(selector) => {
                let mut selector = selector.clone();
                selector.extend(index);
                Some(selector)
            }
            None if index.is_empty() => None,
            None => Some(index.into_iter().collect()),
        }
    }

    /// List parameters carrying the server-side part of the filter
    #[must_use]
    pub fn list_params(&self) -> ListParams {
        match self.label_selector() {
            Some(selector) => ListParams::default().labels_from(&selector),
            None => ListParams::default(),
        }
    }

    /// Whether `obj` passes every part of the filter
    pub fn matches<K: Indexed>(&self, obj: &K) -> bool {
        if let Some(selector) = &self.selector {
            if !selector.matches(obj.labels()) {
                return false;
            }
        }
        if let Some(family) = self.ip_family {
            if obj.ip_family() != family {
                return false;
            }
        }
        if let Some(parent) = &self.parent_name {
            if obj.parent_name() != Some(parent.as_str()) {
                return false;
            }
        }
        if let Some(uid) = &self.owner_uid {
            if controller_uid(obj) != Some(uid.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{PrefixAllocationSpec, PrefixReference, PrefixSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn labelled_prefix(name: &str, labels: &[(&str, &str)], parent: Option<&str>) -> Prefix {
        Prefix {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            spec: PrefixSpec {
                ip_family: IPFamily::IPv4,
                prefix: None,
                prefix_length: Some(24),
                parent_ref: parent.map(PrefixReference::new),
                parent_selector: None,
            },
            status: None,
        }
    }

    fn match_labels(pairs: &[(&str, &str)]) -> LabelSelector {
        LabelSelector {
            match_labels: Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            match_expressions: None,
        }
    }

    #[test]
    fn test_selector_matches_labels() {
        let prefix = labelled_prefix("a", &[("pool", "blue"), ("zone", "1")], None);
        assert!(selector_matches(&match_labels(&[("pool", "blue")]), prefix.labels()));
        assert!(!selector_matches(&match_labels(&[("pool", "red")]), prefix.labels()));
    }

    #[test]
    fn test_filter_by_parent_and_family() {
        let child = labelled_prefix("child", &[], Some("root"));
        let filter = ListFilter::new().with_parent_name("root").with_ip_family(IPFamily::IPv4);
        assert!(filter.matches(&child));
        assert!(!ListFilter::new().with_parent_name("other").matches(&child));
        assert!(!ListFilter::new().with_ip_family(IPFamily::IPv6).matches(&child));
    }

    #[test]
    fn test_filter_by_owner_uid() {
        let allocation = PrefixAllocation {
            metadata: ObjectMeta {
                name: Some("child-0001".to_string()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "dcops.microscaler.io/v1alpha1".to_string(),
                    kind: "Prefix".to_string(),
                    name: "child".to_string(),
                    uid: "uid-1".to_string(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            spec: PrefixAllocationSpec {
                ip_family: IPFamily::IPv4,
                prefix: None,
                prefix_length: Some(24),
                prefix_ref: Some(PrefixReference::new("root")),
                prefix_selector: None,
            },
            status: None,
        };
        assert_eq!(controller_uid(&allocation), Some("uid-1"));
        assert!(ListFilter::new().with_owner_uid("uid-1").matches(&allocation));
        assert!(!ListFilter::new().with_owner_uid("uid-2").matches(&allocation));
        assert!(ListFilter::new().with_parent_name("root").matches(&allocation));
    }

    #[test]
    fn test_index_filters_are_pushed_to_the_server() {
        let params = ListFilter::new()
            .with_parent_name("pool")
            .with_ip_family(IPFamily::IPv4)
            .with_owner_uid("uid-1")
            .list_params();
        let query = params.label_selector.unwrap();
        assert!(query.contains("dcops.microscaler.io/prefix-ref=pool"), "{query}");
        assert!(query.contains("dcops.microscaler.io/ip-family=IPv4"), "{query}");
        assert!(query.contains("dcops.microscaler.io/owner-uid=uid-1"), "{query}");
        assert_eq!(params.field_selector, None);
    }

    #[test]
    fn test_caller_selector_is_combined_with_index_labels() {
        let selector = parse_selector(&match_labels(&[("pool", "blue")])).unwrap();
        let query = ListFilter::new()
            .with_selector(selector)
            .with_ip_family(IPFamily::IPv6)
            .list_params()
            .label_selector
            .unwrap();
        assert!(query.contains("pool=blue"), "{query}");
        assert!(query.contains("dcops.microscaler.io/ip-family=IPv6"), "{query}");
        assert_eq!(ListFilter::new().list_params().label_selector, None);
    }

    #[test]
    fn test_overlong_parent_name_is_not_pushed_down() {
        let long = "p".repeat(70);
        let filter = ListFilter::new().with_parent_name(long.clone());
        assert!(filter.label_selector().is_none());

        let child = labelled_prefix("child", &[], Some(&long));
        assert!(filter.matches(&child));
        assert!(!child.index_labels().contains_key(PREFIX_REF_LABEL));
    }

    #[test]
    fn test_stale_index_labels() {
        let child = labelled_prefix("child", &[("pool", "blue")], Some("root"));
        let stale = child.stale_index_labels().unwrap();
        assert_eq!(stale.get(IP_FAMILY_LABEL).map(String::as_str), Some("IPv4"));
        assert_eq!(stale.get(PREFIX_REF_LABEL).map(String::as_str), Some("root"));

        let mut indexed = child.clone();
        indexed.labels_mut().extend(stale);
        assert_eq!(indexed.stale_index_labels(), None);
        assert_eq!(indexed.labels().get("pool").map(String::as_str), Some("blue"));

        indexed.spec.parent_ref = Some(PrefixReference::new("other"));
        let moved = indexed.stale_index_labels().unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved.get(PREFIX_REF_LABEL).map(String::as_str), Some("other"));
    }
}
