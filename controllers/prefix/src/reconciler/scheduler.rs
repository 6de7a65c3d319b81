//! Allocation scheduler
//!
//! Binds PrefixAllocations that only carry a label selector to one concrete
//! parent. The scheduler never reserves address space: it only checks that a
//! candidate fits right now and sets `prefixRef`. Committing the block is
//! left to the parent's own reconcile cycle, so two allocations bound to the
//! same parent at the same instant are arbitrated there.

use crate::error::ControllerError;
use crate::ipam::{AllocationRequest, ParentView, compatible, fits};
use crate::reconciler::Reconciler;
use crds::{Prefix, PrefixAllocation, PrefixAllocationPhase, PrefixAllocationStatus, PrefixReference};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use prefix_store::meta::is_deleting;
use prefix_store::{DiagnosticEvent, ListFilter, controller_uid, parse_selector};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

impl Reconciler {
    /// Reconcile a PrefixAllocation resource (indexing and scheduling)
    pub async fn reconcile_allocation(&self, allocation: &PrefixAllocation) -> Result<Action, ControllerError> {
        if is_deleting(allocation) {
            return Ok(Action::await_change());
        }
        let allocation = self.index_allocation(allocation).await?;
        let allocation = allocation.as_ref();

        let key = self.key(allocation);
        let Some(selector) = allocation.spec.prefix_selector.as_ref() else {
            return Ok(Action::await_change());
        };
        if allocation.spec.prefix_ref.is_some() || allocation.phase().is_terminal() {
            return Ok(Action::await_change());
        }
        info!("Scheduling PrefixAllocation {}", key);

        let selector = match parse_selector(selector) {
            Ok(selector) => selector,
            Err(e) => return self.fail_allocation(allocation, "InvalidSelector", e.to_string()).await,
        };
        let request = match AllocationRequest::for_allocation(&allocation.spec) {
            Ok(request) => request,
            Err(e) => return self.fail_allocation(allocation, "InvalidRequest", e.to_string()).await,
        };

        let requester = controller_uid(allocation);
        let family = allocation.spec.ip_family;
        let candidates = self
            .store
            .list_prefixes(&ListFilter::new().with_selector(selector).with_ip_family(family))
            .await?;
        let suitable: Vec<Prefix> = candidates
            .into_iter()
            .filter(|p| p.is_allocated() && !is_deleting(p))
            .filter(|p| requester.is_none() || p.meta().uid.as_deref() != requester)
            .filter(|p| {
                ParentView::from_prefix(p)
                    .is_ok_and(|view| compatible(&view, family, &request) && fits(&view, &request))
            })
            .collect();
        debug!("PrefixAllocation {} has {} suitable parent(s)", key, suitable.len());

        // Uniform choice; the rng must not live across an await
        let chosen = {
            let mut rng = rand::thread_rng();
            suitable.choose(&mut rng).map(ResourceExt::name_any)
        };
        let Some(chosen) = chosen else {
            warn!("No suitable prefix found for PrefixAllocation {}", key);
            self.publish(
                allocation,
                DiagnosticEvent::warning("NoSuitablePrefix", "Scheduling", "No suitable prefix found"),
            )
            .await;
            return Ok(Action::await_change());
        };

        let bound = self
            .store
            .patch_allocation_prefix_ref(
                &allocation.name_any(),
                allocation.resource_version().as_deref(),
                &PrefixReference::new(chosen.clone()),
            )
            .await?;
        // Restart the soft timeout from the moment of binding
        let status = PrefixAllocationStatus {
            phase: PrefixAllocationPhase::Pending,
            prefix: None,
            last_phase_transition_time: Some(self.clock.now()),
        };
        self.store
            .patch_allocation_status(&bound.name_any(), bound.resource_version().as_deref(), &status)
            .await?;
        info!("Scheduled PrefixAllocation {} onto Prefix {}", key, chosen);
        self.publish(
            allocation,
            DiagnosticEvent::normal("Scheduled", "Scheduling", format!("Scheduled onto prefix {chosen}")),
        )
        .await;
        Ok(Action::await_change())
    }

    /// Mark an allocation with an unusable request as failed
    async fn fail_allocation(
        &self,
        allocation: &PrefixAllocation,
        reason: &str,
        note: String,
    ) -> Result<Action, ControllerError> {
        warn!("PrefixAllocation {} failed: {}", self.key(allocation), note);
        self.write_allocation_status(allocation, PrefixAllocationPhase::Failed, None)
            .await?;
        self.publish(allocation, DiagnosticEvent::warning(reason, "Scheduling", note))
            .await;
        Ok(Action::await_change())
    }
}
