//! Address family shared by `Prefix` and `PrefixAllocation`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// IP address family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum IPFamily {
    /// IPv4 (32-bit addresses)
    #[serde(rename = "IPv4")]
    IPv4,

    /// IPv6 (128-bit addresses)
    #[serde(rename = "IPv6")]
    IPv6,
}

impl IPFamily {
    /// Width of an address of this family in bits
    #[must_use]
    pub fn max_prefix_len(self) -> u8 {
        match self {
            Self::IPv4 => 32,
            Self::IPv6 => 128,
        }
    }

    /// Wire name of the family ("IPv4" / "IPv6")
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IPv4 => "IPv4",
            Self::IPv6 => "IPv6",
        }
    }
}

impl fmt::Display for IPFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
