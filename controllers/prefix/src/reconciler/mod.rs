//! Reconciliation logic for Prefix and PrefixAllocation resources.
//!
//! - `prefix`: finalizer gate, self-allocation and used-set aggregation of a Prefix
//! - `sub_allocation`: lifecycle of the single active allocation a child Prefix owns
//! - `scheduler`: binding selector-based allocations to a concrete parent

pub mod prefix;
pub mod scheduler;
pub mod sub_allocation;


use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::ledger::BackoffLedger;
use crds::{Prefix, PrefixAllocation, PrefixAllocationPhase, PrefixAllocationStatus};
use kube::{Resource, ResourceExt};
use prefix_store::{DiagnosticEvent, EventSink, Indexed, PrefixStoreTrait};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Reconciles Prefix and PrefixAllocation resources.
pub struct Reconciler {
    pub(crate) store: Arc<dyn PrefixStoreTrait>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Retry throttling per requester (namespace/name -> deadline)
    pub(crate) ledger: BackoffLedger,
    /// Soft timeout for bound allocations nobody resolves
    pub(crate) allocation_timeout: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("namespace", &self.store.namespace())
            .field("allocation_timeout", &self.allocation_timeout)
            .field("tracked_requesters", &self.ledger.len())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler over `store`.
    pub fn new(
        store: Arc<dyn PrefixStoreTrait>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            ledger: BackoffLedger::new(config.backoff_base, config.backoff_max, config.ledger_capacity),
            allocation_timeout: config.allocation_timeout,
        }
    }

    /// `namespace/name` identity of an object
    pub(crate) fn key<K: Resource>(&self, obj: &K) -> String {
        format!(
            "{}/{}",
            obj.namespace().unwrap_or_else(|| self.store.namespace().to_string()),
            obj.name_any()
        )
    }

    /// Publish a diagnostic event about `obj`
    pub(crate) async fn publish<K>(&self, obj: &K, event: DiagnosticEvent)
    where
        K: Resource<DynamicType = ()>,
    {
        debug!("Event {} for {}: {}", event.reason, obj.name_any(), event.note);
        self.events.publish(&obj.object_ref(&()), event).await;
    }

    /// Bring a prefix's index labels up to date so indexed lists can find it
    pub(crate) async fn index_prefix<'a>(&self, prefix: &'a Prefix) -> Result<Cow<'a, Prefix>, ControllerError> {
        let Some(labels) = prefix.stale_index_labels() else {
            return Ok(Cow::Borrowed(prefix));
        };
        let updated = self
            .store
            .patch_prefix_labels(&prefix.name_any(), prefix.resource_version().as_deref(), &labels)
            .await?;
        debug!("Indexed Prefix {} under {:?}", self.key(prefix), labels);
        Ok(Cow::Owned(updated))
    }

    /// Bring an allocation's index labels up to date so indexed lists can find it
    pub(crate) async fn index_allocation<'a>(
        &self,
        allocation: &'a PrefixAllocation,
    ) -> Result<Cow<'a, PrefixAllocation>, ControllerError> {
        let Some(labels) = allocation.stale_index_labels() else {
            return Ok(Cow::Borrowed(allocation));
        };
        let updated = self
            .store
            .patch_allocation_labels(&allocation.name_any(), allocation.resource_version().as_deref(), &labels)
            .await?;
        debug!("Indexed PrefixAllocation {} under {:?}", self.key(allocation), labels);
        Ok(Cow::Owned(updated))
    }

    /// Write an allocation's status unless it already matches.
    ///
    /// The transition time only moves when the phase changes, and terminal
    /// phases are never overwritten.
    pub(crate) async fn write_allocation_status(
        &self,
        allocation: &PrefixAllocation,
        phase: PrefixAllocationPhase,
        prefix: Option<String>,
    ) -> Result<PrefixAllocation, ControllerError> {
        let current = allocation.status.as_ref();
        if allocation.phase().is_terminal() {
            debug!(
                "PrefixAllocation {} is already {:?}, leaving status untouched",
                self.key(allocation),
                allocation.phase()
            );
            return Ok(allocation.clone());
        }
        let last_phase_transition_time = match current {
            Some(status) if status.phase == phase => status.last_phase_transition_time,
            _ => Some(self.clock.now()),
        };
        let desired = PrefixAllocationStatus {
            phase,
            prefix,
            last_phase_transition_time,
        };
        if current == Some(&desired) {
            return Ok(allocation.clone());
        }
        let updated = self
            .store
            .patch_allocation_status(
                &allocation.name_any(),
                allocation.resource_version().as_deref(),
                &desired,
            )
            .await?;
        Ok(updated)
    }

    /// Delete an allocation, treating "already gone" as success
    pub(crate) async fn delete_allocation(&self, allocation: &PrefixAllocation) -> Result<(), ControllerError> {
        match self.store.delete_allocation(&allocation.name_any()).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
