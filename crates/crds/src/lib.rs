//! DCops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the prefix allocation controller:
//! - `Prefix`: owns (or requests) one CIDR block, optionally subdivided among children
//! - `PrefixAllocation`: one carve-out transaction between a requester and a parent

pub mod ip_family;
pub mod references;
pub mod prefix;
pub mod prefix_allocation;

pub use ip_family::*;
pub use references::*;
pub use prefix::*;
pub use prefix_allocation::*;
