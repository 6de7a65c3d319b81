//! Prefix Controller
//!
//! Hierarchical IP address management on top of two CRDs:
//! - Prefix: owns one CIDR block; children obtain theirs from a parent
//! - PrefixAllocation: one request to carve a block out of a parent
//!
//! Parents commit space for the allocations sourcing them and publish the
//! result in `status.used`; a scheduler binds selector-based allocations to a
//! concrete parent first.

mod backoff;
mod clock;
mod config;
mod controller;
mod error;
mod fanout;
mod ipam;
mod ledger;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube is built without a default crypto backend; pick ring before the first TLS connection
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting Prefix Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Allocation timeout: {:?}", config.allocation_timeout);
    info!("  Retry backoff: {:?} .. {:?}", config.backoff_base, config.backoff_max);
    info!("  Backoff ledger capacity: {}", config.ledger_capacity);
    info!("  Debounce: {:?}, concurrency: {}", config.debounce, config.concurrency);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
