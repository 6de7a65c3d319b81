//! Diagnostic events
//!
//! Human-readable events ("no suitable prefix found", ...) are published
//! through an `EventSink`. They are observability only: publishing never
//! fails the caller, errors are logged and dropped.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Severity of a diagnostic event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticType {
    /// Informational
    Normal,
    /// Something an operator may need to act on
    Warning,
}

/// A diagnostic event about one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEvent {
    /// Severity
    pub type_: DiagnosticType,
    /// Short machine-readable reason (e.g. "NoSuitablePrefix")
    pub reason: String,
    /// What the controller was doing (e.g. "Scheduling")
    pub action: String,
    /// Human-readable detail
    pub note: String,
}

impl DiagnosticEvent {
    /// Informational event
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            type_: DiagnosticType::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }

    /// Warning event
    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            type_: DiagnosticType::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }
}

/// Side channel for diagnostic events
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Publish `event` about the object `regarding`
    async fn publish(&self, regarding: &ObjectReference, event: DiagnosticEvent);
}

/// Event sink writing `events.k8s.io` events through the kube recorder
pub struct KubeEventSink {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventSink").finish_non_exhaustive()
    }
}

impl KubeEventSink {
    /// Create a sink reporting as `controller` (instance taken from `POD_NAME` when set)
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, regarding: &ObjectReference, event: DiagnosticEvent) {
        let kube_event = Event {
            type_: match event.type_ {
                DiagnosticType::Normal => EventType::Normal,
                DiagnosticType::Warning => EventType::Warning,
            },
            reason: event.reason.clone(),
            note: Some(event.note.clone()),
            action: event.action.clone(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&kube_event, regarding).await {
            warn!(
                "Failed to publish {} event for {}: {}",
                event.reason,
                regarding.name.as_deref().unwrap_or("<unknown>"),
                e
            );
        }
    }
}
