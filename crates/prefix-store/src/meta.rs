//! Conversions between Kubernetes metadata timestamps and `chrono`.
//!
//! `metav1.Time` is converted through its RFC 3339 wire form so the controller
//! works in `chrono::DateTime<Utc>` like the status timestamps of the CRDs.

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;

/// Convert a metadata timestamp into a UTC `DateTime`
#[must_use]
pub fn from_meta_time(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Convert a UTC `DateTime` into a metadata timestamp
#[must_use]
pub fn to_meta_time(time: DateTime<Utc>) -> Option<Time> {
    let raw = time.to_rfc3339_opts(SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(raw)).ok()
}

/// Creation timestamp of an object, if the store assigned one
#[must_use]
pub fn creation_time<K: Resource>(obj: &K) -> Option<DateTime<Utc>> {
    obj.meta().creation_timestamp.as_ref().and_then(from_meta_time)
}

/// Whether the object is marked for deletion
#[must_use]
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}
