//! Prefix Custom Resource Definition
//!
//! A Prefix owns (or requests) exactly one CIDR block. Root prefixes declare the
//! block outright; child prefixes request a block of a given length (or a
//! specific block) from a parent named either directly or by label selector.

use crate::ip_family::IPFamily;
use crate::references::PrefixReference;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer guarding a Prefix while allocations still hold space carved from it
pub const PREFIX_FINALIZER: &str = "dcops.microscaler.io/prefix";

/// PrefixSpec defines the desired state of a Prefix
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "Prefix",
    namespaced,
    status = "PrefixStatus",
    shortname = "pfx"
)]
#[serde(rename_all = "camelCase")]
pub struct PrefixSpec {
    /// Address family of the prefix
    pub ip_family: IPFamily,

    /// Concrete CIDR (e.g., "10.0.0.0/8")
    /// Mandatory for root prefixes; filled in by the controller once a child's allocation succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Requested block size when no concrete CIDR is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u8>,

    /// Parent to carve the block from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<PrefixReference>,

    /// Label query selecting candidate parents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_selector: Option<LabelSelector>,
}

/// PrefixStatus defines the observed state of a Prefix
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrefixStatus {
    /// Allocation phase (never leaves `Allocated`)
    #[serde(default)]
    pub phase: PrefixPhase,

    /// When `phase` last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_phase_transition_time: Option<DateTime<Utc>>,

    /// Blocks already handed out to children, sorted and non-overlapping
    #[serde(default)]
    pub used: Vec<String>,
}

/// Prefix allocation phase
///
/// Serializes as PascalCase ("Pending", "Allocated") but deserializes
/// lowercase as well.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum PrefixPhase {
    /// Waiting for a concrete CIDR
    #[default]
    #[serde(alias = "pending")]
    Pending,

    /// Owns a concrete CIDR
    #[serde(alias = "allocated")]
    Allocated,
}

impl Prefix {
    /// A root prefix names neither a parent nor a parent selector
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.spec.parent_ref.is_none() && self.spec.parent_selector.is_none()
    }

    /// Current phase, `Pending` when no status has been written yet
    #[must_use]
    pub fn phase(&self) -> PrefixPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the prefix owns its CIDR
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        self.phase() == PrefixPhase::Allocated
    }

    /// Blocks recorded as handed out to children
    #[must_use]
    pub fn used(&self) -> &[String] {
        self.status.as_ref().map_or(&[], |s| s.used.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn prefix(parent_ref: Option<&str>) -> Prefix {
        Prefix {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                ..Default::default()
            },
            spec: PrefixSpec {
                ip_family: IPFamily::IPv4,
                prefix: Some("10.0.0.0/8".to_string()),
                prefix_length: None,
                parent_ref: parent_ref.map(PrefixReference::new),
                parent_selector: None,
            },
            status: None,
        }
    }

    #[test]
    fn test_root_detection() {
        assert!(prefix(None).is_root());
        assert!(!prefix(Some("parent")).is_root());
    }

    #[test]
    fn test_phase_defaults_to_pending() {
        let p = prefix(None);
        assert_eq!(p.phase(), PrefixPhase::Pending);
        assert!(p.used().is_empty());
    }

    #[test]
    fn test_status_accepts_lowercase_phase() {
        let status: PrefixStatus =
            serde_json::from_value(serde_json::json!({"phase": "allocated", "used": ["10.0.0.0/24"]})).unwrap();
        assert_eq!(status.phase, PrefixPhase::Allocated);
        assert_eq!(status.used, vec!["10.0.0.0/24".to_string()]);
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let value = serde_json::to_value(&prefix(Some("parent")).spec).unwrap();
        assert_eq!(value["ipFamily"], "IPv4");
        assert_eq!(value["parentRef"]["name"], "parent");
        assert!(value.get("prefixLength").is_none());
    }
}
