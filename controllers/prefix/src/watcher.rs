//! Kubernetes resource watchers.
//!
//! Two `kube_runtime::Controller`s drive the reconciler:
//! - Prefixes, also triggered by changes to related prefixes (children and
//!   selector matches) and to the allocations they own or source
//! - PrefixAllocations, also triggered by prefixes they could be scheduled onto
//!
//! Both share the generic `drive()` loop, which handles reconnection, retries
//! and error logging. Each runs next to a `DependentIndex` of its own kind so
//! the trigger mappers look dependents up by name instead of scanning.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::fanout::{DependentIndex, allocation_requesters, allocations_for_prefix, prefix_dependents};
use crate::reconciler::Reconciler;
use crds::{Prefix, PrefixAllocation};
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::{Controller, watcher};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Run a prepared controller until its watch streams end.
///
/// Errors requeue after `error_requeue`; optimistic-concurrency conflicts are
/// expected under contention and retried after `backoff_base` instead.
async fn drive<K, F>(
    controller: Controller<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    resource_name: &'static str,
    config: &ControllerConfig,
) where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", resource_name);

    let error_requeue = config.error_requeue;
    let conflict_requeue = config.backoff_base;
    let error_policy = move |obj: Arc<K>, error: &ControllerError, _ctx: Arc<Reconciler>| match error {
        ControllerError::Store(e) if e.is_conflict() => {
            warn!("Conflict reconciling {} {}, retrying: {}", resource_name, obj.name_any(), e);
            Action::requeue(conflict_requeue)
        }
        _ => {
            error!("Reconciliation error for {} {}: {}", resource_name, obj.name_any(), error);
            Action::requeue(error_requeue)
        }
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            debug!("Reconciling {} {}", resource_name, obj.name_any());
            reconcile_fn(ctx, obj).await
        }
    };

    let runtime_config = RuntimeConfig::default()
        .debounce(config.debounce)
        .concurrency(config.concurrency);

    controller
        .with_config(runtime_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", resource_name, obj.name),
                Err(e) => warn!("Controller error for {}: {}", resource_name, e),
            }
        })
        .await;
}

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    prefix_api: Api<Prefix>,
    allocation_api: Api<PrefixAllocation>,
    config: ControllerConfig,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        prefix_api: Api<Prefix>,
        allocation_api: Api<PrefixAllocation>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler,
            prefix_api,
            allocation_api,
            config,
        }
    }

    /// Starts watching Prefix resources.
    pub async fn watch_prefixes(&self) -> Result<(), ControllerError> {
        let index: Arc<DependentIndex<Prefix>> = Arc::default();
        let lookup = Arc::clone(&index);
        let controller = Controller::new(self.prefix_api.clone(), watcher::Config::default())
            .watches(self.prefix_api.clone(), watcher::Config::default(), move |changed: Prefix| {
                prefix_dependents(&changed, &lookup)
            })
            .watches(
                self.allocation_api.clone(),
                watcher::Config::default(),
                |allocation: PrefixAllocation| allocation_requesters(&allocation),
            );

        let run = drive(
            controller,
            self.reconciler.clone(),
            |reconciler: Arc<Reconciler>, prefix: Arc<Prefix>| -> ReconcileFuture {
                Box::pin(async move { reconciler.reconcile_prefix(&prefix).await })
            },
            "Prefix",
            &self.config,
        );

        tokio::select! {
            result = index.follow(self.prefix_api.clone(), "Prefix") => result,
            () = run => Err(ControllerError::Watch("Prefix watch stream ended".to_string())),
        }
    }

    /// Starts watching PrefixAllocation resources.
    pub async fn watch_allocations(&self) -> Result<(), ControllerError> {
        let index: Arc<DependentIndex<PrefixAllocation>> = Arc::default();
        let lookup = Arc::clone(&index);
        let controller = Controller::new(self.allocation_api.clone(), watcher::Config::default()).watches(
            self.prefix_api.clone(),
            watcher::Config::default(),
            move |changed: Prefix| allocations_for_prefix(&changed, &lookup),
        );

        let run = drive(
            controller,
            self.reconciler.clone(),
            |reconciler: Arc<Reconciler>, allocation: Arc<PrefixAllocation>| -> ReconcileFuture {
                Box::pin(async move { reconciler.reconcile_allocation(&allocation).await })
            },
            "PrefixAllocation",
            &self.config,
        );

        tokio::select! {
            result = index.follow(self.allocation_api.clone(), "PrefixAllocation") => result,
            () = run => Err(ControllerError::Watch("PrefixAllocation watch stream ended".to_string())),
        }
    }
}
