//! Controller-specific error types.
//!
//! This module defines error types specific to the Prefix Controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use prefix_store::StoreError;
use thiserror::Error;

/// Errors that can occur in the Prefix Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Resource store error (conflicts, races, API failures)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource spec the engine cannot act on
    #[error("Invalid spec for {name}: {reason}")]
    InvalidSpec {
        /// `namespace/name` of the resource
        name: String,
        /// What is wrong
        reason: String,
    },

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
