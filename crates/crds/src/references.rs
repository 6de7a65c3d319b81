//! Object references between prefix resources
//!
//! Both `Prefix.spec.parentRef` and `PrefixAllocation.spec.prefixRef` point at a
//! `Prefix` in the same namespace, following the Kubernetes `LocalObjectReference`
//! pattern (name only, kind implied by the field).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Same-namespace reference to a `Prefix`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PrefixReference {
    /// Name of the referenced Prefix
    pub name: String,
}

impl PrefixReference {
    /// Create a reference to the Prefix with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
