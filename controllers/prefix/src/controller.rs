//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the store, the
//! reconciler and both resource watchers together.

use crate::clock::SystemClock;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use crds::{Prefix, PrefixAllocation};
use kube::{Api, Client};
use prefix_store::{KubeEventSink, KubePrefixStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Name events are reported under
const CONTROLLER_NAME: &str = "prefix-controller";

/// Main controller for prefix allocation.
pub struct Controller {
    prefix_watcher: JoinHandle<Result<(), ControllerError>>,
    allocation_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Prefix Controller");

        let kube_client = Client::try_default().await?;

        let ns = config.namespace.as_str();
        let prefix_api: Api<Prefix> = Api::namespaced(kube_client.clone(), ns);
        let allocation_api: Api<PrefixAllocation> = Api::namespaced(kube_client.clone(), ns);

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(KubePrefixStore::new(kube_client.clone(), ns)),
            Arc::new(KubeEventSink::new(kube_client, CONTROLLER_NAME)),
            Arc::new(SystemClock),
            &config,
        ));

        let prefix_watcher_instance = Watcher::new(
            reconciler.clone(),
            prefix_api.clone(),
            allocation_api.clone(),
            config.clone(),
        );
        let allocation_watcher_instance = Watcher::new(reconciler, prefix_api, allocation_api, config);

        let prefix_watcher = tokio::spawn(async move { prefix_watcher_instance.watch_prefixes().await });
        let allocation_watcher =
            tokio::spawn(async move { allocation_watcher_instance.watch_allocations().await });

        Ok(Self {
            prefix_watcher,
            allocation_watcher,
        })
    }

    /// Runs the controller until a watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Prefix Controller running");

        tokio::select! {
            result = &mut self.prefix_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Prefix watcher panicked: {}", e)))??;
            }
            result = &mut self.allocation_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("PrefixAllocation watcher panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
