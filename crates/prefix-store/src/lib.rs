//! Prefix Store
//!
//! Abstractions over the declarative resource store used by the prefix
//! controller: typed reads and optimistic-concurrency writes for `Prefix` and
//! `PrefixAllocation`, secondary-index filtering, and a side channel for
//! diagnostic events.
//!
//! # Example
//!
//! ```no_run
//! use prefix_store::{KubePrefixStore, ListFilter, PrefixStoreTrait};
//! use crds::IPFamily;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let store = KubePrefixStore::new(client, "default");
//!
//! // All IPv4 allocations carved from the prefix "pool-a"
//! let filter = ListFilter::new()
//!     .with_ip_family(IPFamily::IPv4)
//!     .with_parent_name("pool-a");
//! let allocations = store.list_allocations(&filter).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Optimistic concurrency**: every patch carries the `resourceVersion` it was computed from
//! - **Index labels**: address family, parent name and controller owner are
//!   mirrored into labels on write and queried server-side
//! - **Mocking**: `MockPrefixStore` / `MockEventSink` behind the `test-util` feature

pub mod client;
pub mod error;
pub mod events;
pub mod filter;
pub mod meta;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubePrefixStore;
pub use error::StoreError;
pub use events::{DiagnosticEvent, DiagnosticType, EventSink, KubeEventSink};
pub use filter::{
    IP_FAMILY_LABEL, Indexed, ListFilter, OWNER_UID_LABEL, PREFIX_REF_LABEL, controller_uid,
    index_labels_for, parse_selector, prefix_ref_labels, selector_matches,
};
pub use store_trait::PrefixStoreTrait;
#[cfg(feature = "test-util")]
pub use mock::{MockEventSink, MockPrefixStore};
