//! Prefix store errors

use thiserror::Error;

/// Errors that can occur when reading or writing prefix resources
#[derive(Debug, Error)]
pub enum StoreError {
    /// Kubernetes API error not covered by a more specific variant
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// Write rejected because the object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object does not exist (any more)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Label selector could not be turned into a query
    #[error("Invalid label selector: {0}")]
    InvalidSelector(String),

    /// Object is missing data the store needs (name, uid, ...)
    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

impl StoreError {
    /// Whether the error is an optimistic-concurrency rejection
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether the error reports a missing object
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 409 => Self::Conflict(response.message.clone()),
            kube::Error::Api(response) if response.code == 404 => Self::NotFound(response.message.clone()),
            _ => Self::Kube(error),
        }
    }
}
