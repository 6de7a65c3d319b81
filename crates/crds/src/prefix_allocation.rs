//! PrefixAllocation Custom Resource Definition
//!
//! One carve-out transaction: a requester Prefix asks a parent Prefix (bound via
//! `prefixRef`, or chosen later by the scheduler via `prefixSelector`) for either a
//! specific CIDR or a block of a given length. `Allocated` and `Failed` are
//! terminal; a retry replaces the object instead of rewinding it.

use crate::ip_family::IPFamily;
use crate::references::PrefixReference;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PrefixAllocationSpec defines one allocation request
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "PrefixAllocation",
    namespaced,
    status = "PrefixAllocationStatus",
    shortname = "pfxa"
)]
#[serde(rename_all = "camelCase")]
pub struct PrefixAllocationSpec {
    /// Address family of the requested block
    pub ip_family: IPFamily,

    /// Specific CIDR requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Length of the requested block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_length: Option<u8>,

    /// Parent the block is carved from (set by the requester or by the scheduler)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_ref: Option<PrefixReference>,

    /// Label query for the scheduler when no parent is bound yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_selector: Option<LabelSelector>,
}

/// PrefixAllocationStatus defines the outcome of an allocation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrefixAllocationStatus {
    /// Allocation phase
    #[serde(default)]
    pub phase: PrefixAllocationPhase,

    /// Allocated block, only set when `phase` is `Allocated`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// When `phase` last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_phase_transition_time: Option<DateTime<Utc>>,
}

/// PrefixAllocation phase
///
/// Serializes as PascalCase ("Pending", "Allocated", "Failed") but deserializes
/// lowercase as well.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum PrefixAllocationPhase {
    /// Not processed yet, or no space available right now
    #[default]
    #[serde(alias = "pending")]
    Pending,

    /// Block carved out (terminal)
    #[serde(alias = "allocated")]
    Allocated,

    /// Request can never be satisfied by its parent (terminal)
    #[serde(alias = "failed")]
    Failed,
}

impl PrefixAllocationPhase {
    /// `Allocated` and `Failed` never change once reached
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Allocated | Self::Failed)
    }
}

impl PrefixAllocation {
    /// Current phase, `Pending` when no status has been written yet
    #[must_use]
    pub fn phase(&self) -> PrefixAllocationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Allocated block, if any
    #[must_use]
    pub fn allocated_prefix(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.prefix.as_deref())
    }

    /// Name of the bound parent, if any
    #[must_use]
    pub fn prefix_ref_name(&self) -> Option<&str> {
        self.spec.prefix_ref.as_ref().map(|r| r.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_phases() {
        assert!(!PrefixAllocationPhase::Pending.is_terminal());
        assert!(PrefixAllocationPhase::Allocated.is_terminal());
        assert!(PrefixAllocationPhase::Failed.is_terminal());
    }

    #[test]
    fn test_status_round_trips_pascal_case() {
        let status = PrefixAllocationStatus {
            phase: PrefixAllocationPhase::Failed,
            prefix: None,
            last_phase_transition_time: None,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "Failed");
        assert!(value.get("prefix").is_none());

        let lower: PrefixAllocationStatus =
            serde_json::from_value(serde_json::json!({"phase": "failed"})).unwrap();
        assert_eq!(lower.phase, PrefixAllocationPhase::Failed);
    }
}
