//! Allocation matching predicates.
//!
//! `compatible` answers whether a parent could ever satisfy a request given
//! its declared shape; `fits` answers whether it can satisfy it right now
//! given its recorded used set. Neither reserves anything: committing space
//! happens only through `acquire`, inside the parent's own reconcile cycle.

use crate::ipam::cidr_set::{CidrError, CidrSet, family_of, parse_cidr};
use crds::{IPFamily, Prefix, PrefixAllocationSpec, PrefixSpec};
use ipnet::IpNet;
use thiserror::Error;

/// Errors in the shape of a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Both `prefix` and `prefixLength` are set
    #[error("exactly one of prefix and prefixLength must be set")]
    Ambiguous,

    /// Neither `prefix` nor `prefixLength` is set
    #[error("neither prefix nor prefixLength is set")]
    Missing,

    /// CIDR or length invalid for the family
    #[error(transparent)]
    Cidr(#[from] CidrError),
}

/// Parse `raw` and check it belongs to `family`
fn parse_in_family(family: IPFamily, raw: &str) -> Result<IpNet, CidrError> {
    let net = parse_cidr(raw)?;
    let actual = family_of(&net);
    if actual != family {
        return Err(CidrError::FamilyMismatch {
            expected: family,
            actual,
        });
    }
    Ok(net)
}

/// What a requester asks a parent for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRequest {
    /// One specific block
    Exact(IpNet),
    /// Any aligned block of this length
    Length(u8),
}

impl AllocationRequest {
    /// Parse a request from its two mutually exclusive fields
    pub fn from_parts(
        family: IPFamily,
        prefix: Option<&str>,
        prefix_length: Option<u8>,
    ) -> Result<Self, RequestError> {
        match (prefix, prefix_length) {
            (Some(_), Some(_)) => Err(RequestError::Ambiguous),
            (None, None) => Err(RequestError::Missing),
            (Some(raw), None) => Self::exact(family, raw),
            (None, Some(length)) => Self::length(family, length),
        }
    }

    fn exact(family: IPFamily, raw: &str) -> Result<Self, RequestError> {
        Ok(Self::Exact(parse_in_family(family, raw)?))
    }

    fn length(family: IPFamily, length: u8) -> Result<Self, RequestError> {
        if length > family.max_prefix_len() {
            return Err(CidrError::InvalidLength { family, length }.into());
        }
        Ok(Self::Length(length))
    }

    /// Request carried by an allocation
    pub fn for_allocation(spec: &PrefixAllocationSpec) -> Result<Self, RequestError> {
        Self::from_parts(spec.ip_family, spec.prefix.as_deref(), spec.prefix_length)
    }

    /// Request a non-root prefix currently desires.
    ///
    /// Once the controller has filled `spec.prefix` the concrete block wins
    /// over the original length.
    pub fn for_prefix(spec: &PrefixSpec) -> Result<Self, RequestError> {
        match (spec.prefix.as_deref(), spec.prefix_length) {
            (Some(raw), _) => Self::exact(spec.ip_family, raw),
            (None, Some(length)) => Self::length(spec.ip_family, length),
            (None, None) => Err(RequestError::Missing),
        }
    }
}

/// Parsed view of a candidate parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentView {
    /// Address family
    pub family: IPFamily,
    /// The parent's own block
    pub prefix: IpNet,
    /// Blocks already handed out
    pub used: Vec<IpNet>,
}

impl ParentView {
    /// Build a view from a Prefix resource; the prefix must have a concrete block
    pub fn from_prefix(prefix: &Prefix) -> Result<Self, RequestError> {
        let raw = prefix.spec.prefix.as_deref().ok_or(RequestError::Missing)?;
        let net = parse_in_family(prefix.spec.ip_family, raw)?;
        let used = prefix
            .used()
            .iter()
            .map(|u| parse_cidr(u))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            family: prefix.spec.ip_family,
            prefix: net,
            used,
        })
    }

    /// Free space of the parent
    pub fn available(&self) -> Result<CidrSet, CidrError> {
        CidrSet::available(&self.prefix, &self.used)
    }
}

/// Whether `parent` could ever satisfy `request` of `family`
#[must_use]
pub fn compatible(parent: &ParentView, family: IPFamily, request: &AllocationRequest) -> bool {
    if parent.family != family {
        return false;
    }
    match request {
        AllocationRequest::Exact(net) => *net != parent.prefix && parent.prefix.contains(net),
        AllocationRequest::Length(length) => {
            *length > parent.prefix.prefix_len() && *length <= family.max_prefix_len()
        }
    }
}

/// Whether `parent` can satisfy `request` with its current free space
#[must_use]
pub fn fits(parent: &ParentView, request: &AllocationRequest) -> bool {
    let Ok(pool) = parent.available() else {
        return false;
    };
    match request {
        AllocationRequest::Exact(net) => pool.contains(net),
        AllocationRequest::Length(length) => pool.find_free_block(*length).is_some(),
    }
}

/// Take the block for `request` out of `pool`
pub fn acquire(pool: &CidrSet, request: &AllocationRequest) -> Result<(IpNet, CidrSet), CidrError> {
    match request {
        AllocationRequest::Exact(net) => pool.remove(net).map(|rest| (*net, rest)),
        AllocationRequest::Length(length) => pool.remove_free_block(*length),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parent(prefix: &str, used: &[&str]) -> ParentView {
        ParentView {
            family: family_of(&parse_cidr(prefix).unwrap()),
            prefix: parse_cidr(prefix).unwrap(),
            used: used.iter().map(|u| parse_cidr(u).unwrap()).collect(),
        }
    }

    fn exact(raw: &str) -> AllocationRequest {
        AllocationRequest::Exact(parse_cidr(raw).unwrap())
    }

    #[rstest]
    #[case(IPFamily::IPv4, exact("10.0.1.0/24"), true)]
    #[case(IPFamily::IPv4, exact("10.0.0.0/8"), false)]
    #[case(IPFamily::IPv4, exact("11.0.0.0/24"), false)]
    #[case(IPFamily::IPv4, AllocationRequest::Length(24), true)]
    #[case(IPFamily::IPv4, AllocationRequest::Length(8), false)]
    #[case(IPFamily::IPv4, AllocationRequest::Length(4), false)]
    #[case(IPFamily::IPv6, AllocationRequest::Length(64), false)]
    fn test_compatible(
        #[case] family: IPFamily,
        #[case] request: AllocationRequest,
        #[case] expected: bool,
    ) {
        assert_eq!(compatible(&parent("10.0.0.0/8", &[]), family, &request), expected);
    }

    #[rstest]
    #[case(&[], AllocationRequest::Length(25), true)]
    #[case(&["10.0.0.0/25"], AllocationRequest::Length(25), true)]
    #[case(&["10.0.0.0/25", "10.0.0.128/25"], AllocationRequest::Length(32), false)]
    #[case(&["10.0.0.0/25"], exact("10.0.0.128/26"), true)]
    #[case(&["10.0.0.0/25"], exact("10.0.0.64/26"), false)]
    fn test_fits(#[case] used: &[&str], #[case] request: AllocationRequest, #[case] expected: bool) {
        assert_eq!(fits(&parent("10.0.0.0/24", used), &request), expected);
    }

    #[test]
    fn test_fits_does_not_reserve() {
        let view = parent("10.0.0.0/24", &["10.0.0.0/25"]);
        assert!(fits(&view, &AllocationRequest::Length(25)));
        assert!(fits(&view, &AllocationRequest::Length(25)));
        assert_eq!(view.used.len(), 1);
    }

    #[test]
    fn test_acquire_commits_against_pool() {
        let pool = parent("10.0.0.0/24", &[]).available().unwrap();
        let (first, pool) = acquire(&pool, &AllocationRequest::Length(25)).unwrap();
        let (second, pool) = acquire(&pool, &AllocationRequest::Length(25)).unwrap();
        assert_eq!(first, parse_cidr("10.0.0.0/25").unwrap());
        assert_eq!(second, parse_cidr("10.0.0.128/25").unwrap());
        assert_eq!(
            acquire(&pool, &AllocationRequest::Length(25)),
            Err(CidrError::NoFreeBlock(25))
        );
    }

    #[rstest]
    #[case(Some("10.0.0.0/24"), Some(24), Err(RequestError::Ambiguous))]
    #[case(None, None, Err(RequestError::Missing))]
    #[case(None, Some(24), Ok(AllocationRequest::Length(24)))]
    #[case(Some("10.0.0.0/24"), None, Ok(exact("10.0.0.0/24")))]
    #[case(None, Some(33), Err(RequestError::Cidr(CidrError::InvalidLength { family: IPFamily::IPv4, length: 33 })))]
    #[case(Some("2001:db8::/64"), None, Err(RequestError::Cidr(CidrError::FamilyMismatch { expected: IPFamily::IPv4, actual: IPFamily::IPv6 })))]
    fn test_request_from_parts(
        #[case] prefix: Option<&str>,
        #[case] length: Option<u8>,
        #[case] expected: Result<AllocationRequest, RequestError>,
    ) {
        assert_eq!(AllocationRequest::from_parts(IPFamily::IPv4, prefix, length), expected);
    }

    #[test]
    fn test_prefix_request_prefers_filled_block() {
        let spec = PrefixSpec {
            ip_family: IPFamily::IPv4,
            prefix: Some("10.0.3.0/24".to_string()),
            prefix_length: Some(24),
            parent_ref: None,
            parent_selector: None,
        };
        assert_eq!(AllocationRequest::for_prefix(&spec), Ok(exact("10.0.3.0/24")));
    }
}
