//! Prefix reconciler
//!
//! One cycle per change notification:
//! 1. index labels and finalizer gate (add it, or release it once nothing
//!    holds space from us)
//! 2. self-allocation (root prefixes own their block, children obtain one
//!    through a PrefixAllocation)
//! 3. used-set aggregation over every allocation sourcing this prefix

use crate::error::ControllerError;
use crate::ipam::{AllocationRequest, CidrSet, ParentView, acquire, compatible, parse_cidr};
use crate::reconciler::Reconciler;
use crate::reconciler::sub_allocation::SubAllocation;
use crds::{
    PREFIX_FINALIZER, Prefix, PrefixAllocationPhase, PrefixPhase, PrefixReference, PrefixStatus,
};
use ipnet::IpNet;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use prefix_store::meta::is_deleting;
use prefix_store::{DiagnosticEvent, ListFilter};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

impl Reconciler {
    /// Reconcile a Prefix resource
    pub async fn reconcile_prefix(&self, prefix: &Prefix) -> Result<Action, ControllerError> {
        let key = self.key(prefix);
        info!("Reconciling Prefix {}", key);

        if is_deleting(prefix) {
            return self.finalize_prefix(prefix).await;
        }

        let prefix = self.index_prefix(prefix).await?;
        let prefix = prefix.as_ref();

        if !prefix.finalizers().iter().any(|f| f == PREFIX_FINALIZER) {
            let mut finalizers = prefix.finalizers().to_vec();
            finalizers.push(PREFIX_FINALIZER.to_string());
            self.store
                .patch_prefix_finalizers(&prefix.name_any(), prefix.resource_version().as_deref(), &finalizers)
                .await?;
            debug!("Added finalizer to Prefix {}", key);
            return Ok(Action::requeue(Duration::ZERO));
        }

        if !prefix.is_allocated() {
            return self.allocate_self(prefix).await;
        }

        self.process_allocations(prefix).await
    }

    /// Release the finalizer once no allocated block is carved from this prefix
    async fn finalize_prefix(&self, prefix: &Prefix) -> Result<Action, ControllerError> {
        let key = self.key(prefix);
        if !prefix.finalizers().iter().any(|f| f == PREFIX_FINALIZER) {
            return Ok(Action::await_change());
        }

        let holders: Vec<String> = self
            .store
            .list_allocations(&ListFilter::new().with_parent_name(prefix.name_any()))
            .await?
            .into_iter()
            .filter(|a| a.phase() == PrefixAllocationPhase::Allocated)
            .map(|a| a.name_any())
            .collect();

        if !holders.is_empty() {
            info!(
                "Prefix {} is being deleted but {} allocation(s) still hold space: {}",
                key,
                holders.len(),
                holders.join(", ")
            );
            self.publish(
                prefix,
                DiagnosticEvent::warning(
                    "DeletionBlocked",
                    "Deleting",
                    format!("Allocated blocks still carved from this prefix: {}", holders.join(", ")),
                ),
            )
            .await;
            return Ok(Action::await_change());
        }

        self.ledger.forget(&key);
        let finalizers: Vec<String> = prefix
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != PREFIX_FINALIZER)
            .cloned()
            .collect();
        self.store
            .patch_prefix_finalizers(&prefix.name_any(), prefix.resource_version().as_deref(), &finalizers)
            .await?;
        info!("Released finalizer of Prefix {}", key);
        Ok(Action::await_change())
    }

    /// Obtain this prefix's own block
    async fn allocate_self(&self, prefix: &Prefix) -> Result<Action, ControllerError> {
        let key = self.key(prefix);

        if prefix.is_root() {
            let problem = match (prefix.spec.prefix.as_deref(), prefix.spec.prefix_length) {
                (_, Some(_)) => Some("root prefix must not set prefixLength".to_string()),
                (None, None) => Some("root prefix must set prefix".to_string()),
                (Some(raw), None) => AllocationRequest::from_parts(prefix.spec.ip_family, Some(raw), None)
                    .err()
                    .map(|e| e.to_string()),
            };
            if let Some(reason) = problem {
                return self.reject_prefix_spec(prefix, &reason).await;
            }
            self.write_prefix_status(prefix, PrefixPhase::Allocated, Vec::new()).await?;
            info!("Root Prefix {} allocated", key);
            return Ok(Action::requeue(Duration::ZERO));
        }

        if prefix.spec.parent_ref.is_some() && prefix.spec.parent_selector.is_some() && prefix.spec.prefix.is_none() {
            return self
                .reject_prefix_spec(prefix, "parentRef and parentSelector are mutually exclusive")
                .await;
        }
        let request = match AllocationRequest::for_prefix(&prefix.spec) {
            Ok(request) => request,
            Err(e) => return self.reject_prefix_spec(prefix, &e.to_string()).await,
        };

        match self.allocate_sub_prefix(prefix, &request).await {
            Ok(SubAllocation::Allocated { prefix: block, parent }) => {
                let mut current = prefix.clone();
                if prefix.spec.prefix.is_none() || prefix.spec.parent_ref.is_none() {
                    let mut spec = prefix.spec.clone();
                    spec.prefix.get_or_insert(block.clone());
                    spec.parent_ref.get_or_insert_with(|| PrefixReference::new(parent.clone()));
                    current = self
                        .store
                        .patch_prefix_spec(&prefix.name_any(), prefix.resource_version().as_deref(), &spec)
                        .await?;
                }
                self.write_prefix_status(&current, PrefixPhase::Allocated, Vec::new()).await?;
                self.ledger.forget(&key);
                info!("Prefix {} allocated {} from {}", key, block, parent);
                Ok(Action::requeue(Duration::ZERO))
            }
            Ok(SubAllocation::Pending { retry_after }) => {
                self.write_prefix_status(prefix, PrefixPhase::Pending, Vec::new()).await?;
                match retry_after {
                    Some(delay) => {
                        debug!("Prefix {} pending, checking again in {:?}", key, delay);
                        Ok(Action::requeue(delay))
                    }
                    None => {
                        debug!("Prefix {} pending", key);
                        Ok(Action::await_change())
                    }
                }
            }
            Ok(SubAllocation::Failed { reason }) => {
                warn!("Prefix {} cannot be allocated: {}", key, reason);
                self.write_prefix_status(prefix, PrefixPhase::Pending, Vec::new()).await?;
                self.publish(prefix, DiagnosticEvent::warning("AllocationFailed", "Allocating", reason))
                    .await;
                Ok(Action::await_change())
            }
            Err(e) => {
                if prefix.status.is_none() {
                    if let Err(status_err) = self.write_prefix_status(prefix, PrefixPhase::Pending, Vec::new()).await {
                        debug!("Could not mark Prefix {} pending: {}", key, status_err);
                    }
                }
                error!("Sub-allocation for Prefix {} failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Report an unusable spec and wait for the operator to change it.
    ///
    /// An allocated prefix keeps its status: the blocks in `used` are still
    /// held by its children.
    async fn reject_prefix_spec(&self, prefix: &Prefix, reason: &str) -> Result<Action, ControllerError> {
        warn!("Prefix {} has an invalid spec: {}", self.key(prefix), reason);
        if !prefix.is_allocated() {
            self.write_prefix_status(prefix, PrefixPhase::Pending, Vec::new()).await?;
        }
        self.publish(prefix, DiagnosticEvent::warning("InvalidSpec", "Allocating", reason))
            .await;
        Ok(Action::await_change())
    }

    /// Recompute `used` from every allocation sourcing this prefix, committing
    /// space for the ones that fit.
    pub(crate) async fn process_allocations(&self, prefix: &Prefix) -> Result<Action, ControllerError> {
        let key = self.key(prefix);
        let Some(net) = prefix.spec.prefix.as_deref().and_then(|raw| parse_cidr(raw).ok()) else {
            return self
                .reject_prefix_spec(prefix, "allocated prefix has no valid CIDR in spec.prefix")
                .await;
        };
        let shape = ParentView {
            family: prefix.spec.ip_family,
            prefix: net,
            used: Vec::new(),
        };

        let allocations = self
            .store
            .list_allocations(&ListFilter::new().with_parent_name(prefix.name_any()))
            .await?;

        let mut pool = CidrSet::from_prefix(&net);
        let mut used: Vec<IpNet> = Vec::new();
        let mut candidates = Vec::new();
        for allocation in allocations {
            match allocation.phase() {
                PrefixAllocationPhase::Allocated => {
                    let Some(block) = allocation.allocated_prefix().and_then(|raw| parse_cidr(raw).ok()) else {
                        warn!("PrefixAllocation {} is allocated without a valid block", self.key(&allocation));
                        continue;
                    };
                    match pool.remove(&block) {
                        Ok(rest) => {
                            pool = rest;
                            used.push(block);
                        }
                        Err(e) => warn!(
                            "Ignoring block {} of PrefixAllocation {}: {}",
                            block,
                            self.key(&allocation),
                            e
                        ),
                    }
                }
                PrefixAllocationPhase::Failed => {}
                PrefixAllocationPhase::Pending => candidates.push(allocation),
            }
        }

        for allocation in candidates {
            let alloc_key = self.key(&allocation);
            let request = match AllocationRequest::for_allocation(&allocation.spec) {
                Ok(request) if compatible(&shape, allocation.spec.ip_family, &request) => request,
                Ok(_) => {
                    info!("PrefixAllocation {} is incompatible with Prefix {}", alloc_key, key);
                    self.write_allocation_status(&allocation, PrefixAllocationPhase::Failed, None).await?;
                    self.publish(
                        &allocation,
                        DiagnosticEvent::warning(
                            "Incompatible",
                            "Allocating",
                            format!("Request cannot be served by prefix {net}"),
                        ),
                    )
                    .await;
                    continue;
                }
                Err(e) => {
                    info!("PrefixAllocation {} has an invalid request: {}", alloc_key, e);
                    self.write_allocation_status(&allocation, PrefixAllocationPhase::Failed, None).await?;
                    self.publish(&allocation, DiagnosticEvent::warning("InvalidRequest", "Allocating", e.to_string()))
                        .await;
                    continue;
                }
            };

            match acquire(&pool, &request) {
                Ok((block, rest)) => {
                    pool = rest;
                    used.push(block);
                    self.write_allocation_status(&allocation, PrefixAllocationPhase::Allocated, Some(block.to_string()))
                        .await?;
                    info!("Allocated {} from Prefix {} to PrefixAllocation {}", block, key, alloc_key);
                }
                Err(e) => {
                    debug!("PrefixAllocation {} does not fit into Prefix {}: {}", alloc_key, key, e);
                    self.write_allocation_status(&allocation, PrefixAllocationPhase::Pending, None).await?;
                }
            }
        }

        if pool.is_empty() {
            debug!("Prefix {} is fully used", key);
        } else {
            debug!("Prefix {} has {} address(es) free in {:?}", key, pool.size(), pool.to_prefixes());
        }

        let used: Vec<String> = used
            .iter()
            .map(ToString::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.write_prefix_status(prefix, PrefixPhase::Allocated, used).await?;
        Ok(Action::await_change())
    }

    /// Write a prefix's status unless it already matches.
    ///
    /// A prefix never leaves `Allocated`, and the transition time only moves
    /// when the phase changes.
    async fn write_prefix_status(
        &self,
        prefix: &Prefix,
        phase: PrefixPhase,
        used: Vec<String>,
    ) -> Result<Prefix, ControllerError> {
        let current = prefix.status.as_ref();
        let phase = if prefix.is_allocated() { PrefixPhase::Allocated } else { phase };
        let last_phase_transition_time = match current {
            Some(status) if status.phase == phase => status.last_phase_transition_time,
            _ => Some(self.clock.now()),
        };
        let desired = PrefixStatus {
            phase,
            last_phase_transition_time,
            used,
        };
        if current == Some(&desired) {
            return Ok(prefix.clone());
        }
        let updated = self
            .store
            .patch_prefix_status(&prefix.name_any(), prefix.resource_version().as_deref(), &desired)
            .await?;
        Ok(updated)
    }
}
