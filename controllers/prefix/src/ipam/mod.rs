//! IP address management primitives
//!
//! Pure set algebra over CIDR blocks and the predicates the reconcilers use
//! to decide whether a parent can serve a request.

pub mod cidr_set;
pub mod matching;

pub use cidr_set::{CidrError, CidrSet, family_of, parse_cidr};
pub use matching::{AllocationRequest, ParentView, RequestError, acquire, compatible, fits};
