//! CIDR set algebra.
//!
//! A `CidrSet` is a set of addresses of one family, stored as sorted,
//! disjoint, adjacency-merged inclusive ranges over `u128`. IPv4 addresses
//! occupy the low 32 bits. Every operation is exact integer arithmetic;
//! only `insert` works in place, removals return a new set.

use crds::IPFamily;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Errors produced by set operations and CIDR parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    /// Operand belongs to the other address family
    #[error("address family mismatch: expected {expected}, got {actual}")]
    FamilyMismatch {
        /// Family of the set
        expected: IPFamily,
        /// Family of the operand
        actual: IPFamily,
    },

    /// Block overlaps one already present
    #[error("{0} overlaps a block already in the set")]
    Overlap(IpNet),

    /// Block is not fully inside the set
    #[error("{0} is not contained in the set")]
    NotContained(IpNet),

    /// No aligned free block of the requested length
    #[error("no free /{0} block")]
    NoFreeBlock(u8),

    /// Prefix length out of range for the family
    #[error("invalid prefix length /{length} for {family}")]
    InvalidLength {
        /// Address family
        family: IPFamily,
        /// Requested length
        length: u8,
    },

    /// Not a canonical CIDR string
    #[error("invalid CIDR {0:?}")]
    Parse(String),
}

/// Address family of a parsed network
#[must_use]
pub fn family_of(net: &IpNet) -> IPFamily {
    match net {
        IpNet::V4(_) => IPFamily::IPv4,
        IpNet::V6(_) => IPFamily::IPv6,
    }
}

/// Parse a canonical CIDR string. Host bits must be zero.
pub fn parse_cidr(raw: &str) -> Result<IpNet, CidrError> {
    let net: IpNet = raw
        .trim()
        .parse()
        .map_err(|_| CidrError::Parse(raw.to_string()))?;
    if net.trunc() != net {
        return Err(CidrError::Parse(raw.to_string()));
    }
    Ok(net)
}

/// Mask of the low `bits` bits
fn low_mask(bits: u8) -> u128 {
    if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

/// First and last address of a network as integers
fn bounds(net: &IpNet) -> (u128, u128) {
    match net {
        IpNet::V4(n) => (
            u128::from(u32::from(n.network())),
            u128::from(u32::from(n.broadcast())),
        ),
        IpNet::V6(n) => (u128::from(n.network()), u128::from(n.broadcast())),
    }
}

/// Network starting at `start` with prefix length `len`
fn block(family: IPFamily, start: u128, len: u8) -> Result<IpNet, CidrError> {
    let invalid = || CidrError::InvalidLength { family, length: len };
    let net = match family {
        IPFamily::IPv4 => {
            let addr = u32::try_from(start).map_err(|_| invalid())?;
            IpNet::V4(Ipv4Net::new(Ipv4Addr::from(addr), len).map_err(|_| invalid())?)
        }
        IPFamily::IPv6 => IpNet::V6(Ipv6Net::new(Ipv6Addr::from(start), len).map_err(|_| invalid())?),
    };
    Ok(net)
}

/// Set of non-overlapping address ranges of one family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrSet {
    family: IPFamily,
    ranges: Vec<(u128, u128)>,
}

impl CidrSet {
    /// Empty set of `family`
    #[must_use]
    pub fn empty(family: IPFamily) -> Self {
        Self {
            family,
            ranges: Vec::new(),
        }
    }

    /// Set holding exactly `net`
    #[must_use]
    pub fn from_prefix(net: &IpNet) -> Self {
        Self {
            family: family_of(net),
            ranges: vec![bounds(net)],
        }
    }

    /// `prefix` minus the union of `used`.
    ///
    /// Every used block must lie inside `prefix` and the used blocks must not
    /// overlap each other.
    pub fn available(prefix: &IpNet, used: &[IpNet]) -> Result<Self, CidrError> {
        let whole = Self::from_prefix(prefix);
        let mut taken = Self::empty(whole.family);
        for net in used {
            whole.check_family(net)?;
            if !whole.contains(net) {
                return Err(CidrError::NotContained(*net));
            }
            taken.insert(net)?;
        }
        whole.difference(&taken)
    }

    /// Whether the set holds no address
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn check_family(&self, net: &IpNet) -> Result<(), CidrError> {
        let actual = family_of(net);
        if actual == self.family {
            Ok(())
        } else {
            Err(CidrError::FamilyMismatch {
                expected: self.family,
                actual,
            })
        }
    }

    /// Add one block. Overlap with the existing content is an error.
    pub fn insert(&mut self, net: &IpNet) -> Result<(), CidrError> {
        self.check_family(net)?;
        let (start, end) = bounds(net);
        if self.ranges.iter().any(|&(a, b)| a <= end && start <= b) {
            return Err(CidrError::Overlap(*net));
        }
        let at = self.ranges.partition_point(|&(a, _)| a < start);
        self.ranges.insert(at, (start, end));

        // Merge with touching neighbours
        let mut merged: Vec<(u128, u128)> = Vec::with_capacity(self.ranges.len());
        for &(a, b) in &self.ranges {
            match merged.last_mut() {
                Some(last) if last.1.checked_add(1) == Some(a) => last.1 = b,
                _ => merged.push((a, b)),
            }
        }
        self.ranges = merged;
        Ok(())
    }

    /// Whether every address of `net` is in the set
    #[must_use]
    pub fn contains(&self, net: &IpNet) -> bool {
        if family_of(net) != self.family {
            return false;
        }
        let (start, end) = bounds(net);
        self.ranges.iter().any(|&(a, b)| a <= start && end <= b)
    }

    /// The set without `net`, which must be fully contained
    pub fn remove(&self, net: &IpNet) -> Result<Self, CidrError> {
        self.check_family(net)?;
        if !self.contains(net) {
            return Err(CidrError::NotContained(*net));
        }
        Ok(self.subtract(bounds(net)))
    }

    fn subtract(&self, (start, end): (u128, u128)) -> Self {
        let mut ranges = Vec::with_capacity(self.ranges.len() + 1);
        for &(a, b) in &self.ranges {
            if b < start || a > end {
                ranges.push((a, b));
                continue;
            }
            if a < start {
                ranges.push((a, start - 1));
            }
            if b > end {
                ranges.push((end + 1, b));
            }
        }
        Self {
            family: self.family,
            ranges,
        }
    }

    /// Every address of `self` not in `other`
    pub fn difference(&self, other: &Self) -> Result<Self, CidrError> {
        if other.family != self.family {
            return Err(CidrError::FamilyMismatch {
                expected: self.family,
                actual: other.family,
            });
        }
        Ok(other
            .ranges
            .iter()
            .fold(self.clone(), |acc, &range| acc.subtract(range)))
    }

    /// Lowest aligned free block of length `len`, without removing it
    #[must_use]
    pub fn find_free_block(&self, len: u8) -> Option<IpNet> {
        let width = self.family.max_prefix_len();
        if len > width {
            return None;
        }
        let mask = low_mask(width - len);
        for &(a, b) in &self.ranges {
            let start = if a & mask == 0 {
                a
            } else {
                match (a | mask).checked_add(1) {
                    Some(next) => next,
                    None => continue,
                }
            };
            if start | mask <= b {
                return block(self.family, start, len).ok();
            }
        }
        None
    }

    /// Take the lowest aligned free block of length `len`
    pub fn remove_free_block(&self, len: u8) -> Result<(IpNet, Self), CidrError> {
        if len > self.family.max_prefix_len() {
            return Err(CidrError::InvalidLength {
                family: self.family,
                length: len,
            });
        }
        let net = self.find_free_block(len).ok_or(CidrError::NoFreeBlock(len))?;
        let rest = self.subtract(bounds(&net));
        Ok((net, rest))
    }

    /// Decompose the set into the minimal list of aligned blocks, in address order
    #[must_use]
    pub fn to_prefixes(&self) -> Vec<IpNet> {
        let width = self.family.max_prefix_len();
        let mut out = Vec::new();
        for &(a, b) in &self.ranges {
            let mut cur = a;
            loop {
                let mut host_bits = if cur == 0 {
                    width
                } else {
                    u8::try_from(cur.trailing_zeros()).unwrap_or(width).min(width)
                };
                while cur | low_mask(host_bits) > b {
                    host_bits -= 1;
                }
                let end = cur | low_mask(host_bits);
                if let Ok(net) = block(self.family, cur, width - host_bits) {
                    out.push(net);
                }
                match end.checked_add(1) {
                    Some(next) if end < b => cur = next,
                    _ => break,
                }
            }
        }
        out
    }

    /// Addresses in the set, saturating at `u128::MAX`
    #[must_use]
    pub fn size(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, &(a, b)| acc.saturating_add((b - a).saturating_add(1)))
    }
}
