//! Sub-allocation: the single active PrefixAllocation a child Prefix owns.
//!
//! Allocations are told apart by their controller owner uid. Each cycle
//! prunes attempts that no longer match the requester's spec, keeps the best
//! remaining one and deletes the rest, then decides whether to wait, retry
//! or report the outcome.

use crate::error::ControllerError;
use crate::ipam::{AllocationRequest, ParentView, compatible, fits};
use crate::reconciler::Reconciler;
use chrono::{DateTime, Utc};
use crds::{Prefix, PrefixAllocation, PrefixAllocationPhase, PrefixAllocationSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use prefix_store::meta::{creation_time, is_deleting};
use prefix_store::{ListFilter, StoreError};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of one sub-allocation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubAllocation {
    /// A block was carved out of `parent`
    Allocated {
        /// Canonical CIDR of the block
        prefix: String,
        /// Name of the parent it came from
        parent: String,
    },
    /// Still in progress; check again after `retry_after` if set
    Pending {
        /// Wall-clock wait before anything can change without an event
        retry_after: Option<Duration>,
    },
    /// The explicitly requested parent can no longer serve the request
    Failed {
        /// Why retrying would not help
        reason: String,
    },
}

/// Phase of an allocation adjusted for the soft timeout.
///
/// A non-terminal allocation that is bound to a parent counts as `Failed`
/// once more than `timeout` has passed since its last phase transition (or
/// since creation when no transition was recorded).
#[must_use]
pub fn effective_phase(
    allocation: &PrefixAllocation,
    now: DateTime<Utc>,
    timeout: Duration,
) -> PrefixAllocationPhase {
    let phase = allocation.phase();
    if phase.is_terminal() || allocation.spec.prefix_ref.is_none() {
        return phase;
    }
    match elapsed_since_transition(allocation, now) {
        Some(elapsed) if elapsed > timeout => PrefixAllocationPhase::Failed,
        _ => phase,
    }
}

fn elapsed_since_transition(allocation: &PrefixAllocation, now: DateTime<Utc>) -> Option<Duration> {
    let since = allocation
        .status
        .as_ref()
        .and_then(|s| s.last_phase_transition_time)
        .or_else(|| creation_time(allocation))?;
    Some((now - since).to_std().unwrap_or(Duration::ZERO))
}

/// Selection rank: allocated beats in-flight beats failed
fn rank(allocation: &PrefixAllocation) -> u8 {
    match allocation.phase() {
        PrefixAllocationPhase::Allocated => 2,
        PrefixAllocationPhase::Pending => 1,
        PrefixAllocationPhase::Failed => 0,
    }
}

/// Whether `allocation` no longer reflects what `prefix` currently asks for
fn is_outdated(prefix: &Prefix, desired: &AllocationRequest, allocation: &PrefixAllocation) -> bool {
    // The spec write of a successful allocation may land without the status write
    if allocation.phase() == PrefixAllocationPhase::Allocated
        && prefix.spec.prefix.is_some()
        && allocation.allocated_prefix() == prefix.spec.prefix.as_deref()
    {
        return false;
    }
    if allocation.spec.ip_family != prefix.spec.ip_family {
        return true;
    }
    match AllocationRequest::for_allocation(&allocation.spec) {
        Ok(request) if request == *desired => {}
        _ => return true,
    }
    match (&prefix.spec.parent_ref, &prefix.spec.parent_selector) {
        (Some(parent), _) => {
            allocation.spec.prefix_ref.as_ref() != Some(parent) || allocation.spec.prefix_selector.is_some()
        }
        (None, Some(selector)) => allocation.spec.prefix_selector.as_ref() != Some(selector),
        (None, None) => true,
    }
}

impl Reconciler {
    /// Drive the requester's active allocation one step
    pub(crate) async fn allocate_sub_prefix(
        &self,
        prefix: &Prefix,
        request: &AllocationRequest,
    ) -> Result<SubAllocation, ControllerError> {
        let key = self.key(prefix);
        let uid = prefix
            .uid()
            .ok_or_else(|| StoreError::InvalidObject(format!("Prefix {key} has no uid")))?;

        let owned = self
            .store
            .list_allocations(&ListFilter::new().with_owner_uid(uid))
            .await?;
        let (current, outdated): (Vec<_>, Vec<_>) = owned
            .into_iter()
            .filter(|a| !is_deleting(a))
            .partition(|a| !is_outdated(prefix, request, a));

        for allocation in &outdated {
            info!("Deleting outdated PrefixAllocation {} of Prefix {}", allocation.name_any(), key);
            self.delete_allocation(allocation).await?;
        }

        let active = current
            .iter()
            .max_by_key(|a| (rank(a), creation_time(*a), a.name_any()))
            .cloned();
        let active_name = active.as_ref().map(ResourceExt::name_any);
        for allocation in current.iter().filter(|a| Some(a.name_any()) != active_name) {
            debug!("Deleting superseded PrefixAllocation {} of Prefix {}", allocation.name_any(), key);
            self.delete_allocation(allocation).await?;
        }

        let Some(active) = active else {
            self.create_allocation(prefix, request).await?;
            return Ok(SubAllocation::Pending { retry_after: None });
        };

        let now = self.clock.now();
        match effective_phase(&active, now, self.allocation_timeout) {
            PrefixAllocationPhase::Allocated => {
                let block = active.allocated_prefix().map(str::to_string);
                let parent = active.prefix_ref_name().map(str::to_string);
                match (block, parent) {
                    (Some(block), Some(parent)) => Ok(SubAllocation::Allocated { prefix: block, parent }),
                    _ => Err(ControllerError::InvalidSpec {
                        name: self.key(&active),
                        reason: "allocated without a block or parent".to_string(),
                    }),
                }
            }
            PrefixAllocationPhase::Failed => self.retry_failed(prefix, request, &active, now).await,
            PrefixAllocationPhase::Pending => {
                // Requeue when the soft timeout would expire; no event marks that moment
                let retry_after = if active.spec.prefix_ref.is_some() {
                    elapsed_since_transition(&active, now)
                        .map(|elapsed| self.allocation_timeout.saturating_sub(elapsed) + Duration::from_secs(1))
                } else {
                    None
                };
                Ok(SubAllocation::Pending { retry_after })
            }
        }
    }

    /// Decide between waiting, replacing the failed allocation, or giving up
    async fn retry_failed(
        &self,
        prefix: &Prefix,
        request: &AllocationRequest,
        failed: &PrefixAllocation,
        now: DateTime<Utc>,
    ) -> Result<SubAllocation, ControllerError> {
        let key = self.key(prefix);

        if let Some(parent_ref) = &prefix.spec.parent_ref {
            let parent = self.store.get_prefix(&parent_ref.name).await?;
            let still_fits = parent
                .filter(|p| p.is_allocated() && !is_deleting(p))
                .and_then(|p| ParentView::from_prefix(&p).ok())
                .is_some_and(|view| compatible(&view, prefix.spec.ip_family, request) && fits(&view, request));
            if !still_fits {
                return Ok(SubAllocation::Failed {
                    reason: format!("parent prefix {} cannot serve the request", parent_ref.name),
                });
            }
        }

        let remaining = self.ledger.remaining(&key, now);
        if !remaining.is_zero() {
            debug!("Prefix {} backing off for {:?} before retrying", key, remaining);
            return Ok(SubAllocation::Pending {
                retry_after: Some(remaining),
            });
        }

        info!("Replacing failed PrefixAllocation {} of Prefix {}", failed.name_any(), key);
        self.delete_allocation(failed).await?;
        self.create_allocation(prefix, request).await?;
        Ok(SubAllocation::Pending { retry_after: None })
    }

    /// Create a fresh allocation mirroring the requester's request and parent
    async fn create_allocation(
        &self,
        prefix: &Prefix,
        request: &AllocationRequest,
    ) -> Result<PrefixAllocation, ControllerError> {
        let name = prefix.name_any();
        let owner = prefix
            .controller_owner_ref(&())
            .ok_or_else(|| StoreError::InvalidObject(format!("Prefix {name} has no uid")))?;
        let (block, length) = match request {
            AllocationRequest::Exact(net) => (Some(net.to_string()), None),
            AllocationRequest::Length(length) => (None, Some(*length)),
        };
        let allocation = PrefixAllocation {
            metadata: ObjectMeta {
                generate_name: Some(format!("{name}-")),
                namespace: Some(self.store.namespace().to_string()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: PrefixAllocationSpec {
                ip_family: prefix.spec.ip_family,
                prefix: block,
                prefix_length: length,
                prefix_ref: prefix.spec.parent_ref.clone(),
                prefix_selector: if prefix.spec.parent_ref.is_some() {
                    None
                } else {
                    prefix.spec.parent_selector.clone()
                },
            },
            status: None,
        };
        let created = self.store.create_allocation(&allocation).await?;
        info!("Created PrefixAllocation {} for Prefix {}", created.name_any(), self.key(prefix));
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{allocation_with, at};
    use crds::{IPFamily, PrefixAllocationStatus, PrefixReference};

    fn bound(phase: PrefixAllocationPhase, transition: i64) -> PrefixAllocation {
        let mut allocation = allocation_with("child-00001", IPFamily::IPv4, None, Some(24));
        allocation.spec.prefix_ref = Some(PrefixReference::new("root"));
        allocation.status = Some(PrefixAllocationStatus {
            phase,
            prefix: None,
            last_phase_transition_time: Some(at(transition)),
        });
        allocation
    }

    #[test]
    fn test_effective_phase_times_out_bound_pending() {
        let timeout = Duration::from_secs(60);
        let allocation = bound(PrefixAllocationPhase::Pending, 0);
        assert_eq!(effective_phase(&allocation, at(60), timeout), PrefixAllocationPhase::Pending);
        assert_eq!(effective_phase(&allocation, at(61), timeout), PrefixAllocationPhase::Failed);
    }

    #[test]
    fn test_effective_phase_ignores_unbound_and_terminal() {
        let timeout = Duration::from_secs(60);
        let mut unbound = bound(PrefixAllocationPhase::Pending, 0);
        unbound.spec.prefix_ref = None;
        assert_eq!(effective_phase(&unbound, at(3600), timeout), PrefixAllocationPhase::Pending);

        let allocated = bound(PrefixAllocationPhase::Allocated, 0);
        assert_eq!(effective_phase(&allocated, at(3600), timeout), PrefixAllocationPhase::Allocated);
    }

    #[test]
    fn test_effective_phase_falls_back_to_creation_time() {
        let mut allocation = bound(PrefixAllocationPhase::Pending, 0);
        allocation.status = None;
        allocation.metadata.creation_timestamp = prefix_store::meta::to_meta_time(at(100));
        let timeout = Duration::from_secs(60);
        assert_eq!(effective_phase(&allocation, at(150), timeout), PrefixAllocationPhase::Pending);
        assert_eq!(effective_phase(&allocation, at(161), timeout), PrefixAllocationPhase::Failed);
    }

    #[test]
    fn test_rank_orders_allocated_first() {
        assert!(rank(&bound(PrefixAllocationPhase::Allocated, 0)) > rank(&bound(PrefixAllocationPhase::Pending, 0)));
        assert!(rank(&bound(PrefixAllocationPhase::Pending, 0)) > rank(&bound(PrefixAllocationPhase::Failed, 0)));
    }
}
