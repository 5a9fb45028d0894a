//! Best-effort audit recording.

use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::clock::Clock;
use super::store::AuditStore;
use crate::models::{AuditEvent, AuditEventKind};

/// Recording never fails the calling operation; failures are only logged.
pub trait AuditSink: Send + Sync {
    fn record(
        &self,
        principal_id: Option<Uuid>,
        kind: AuditEventKind,
        description: &str,
        metadata: serde_json::Value,
    );
}

/// Writes events to the store on a spawned task.
pub struct StoreAuditSink {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

impl AuditSink for StoreAuditSink {
    fn record(
        &self,
        principal_id: Option<Uuid>,
        kind: AuditEventKind,
        description: &str,
        metadata: serde_json::Value,
    ) {
        let event = AuditEvent::new(principal_id, kind, description, metadata, self.clock.now());
        let store = self.store.clone();

        tokio::spawn(async move {
            if let Err(e) = store.insert_audit_event(&event).await {
                tracing::error!(
                    error = %e,
                    event_kind = event.kind.as_str(),
                    principal_id = ?event.principal_id,
                    "Failed to record audit event"
                );
            }
        });
    }
}

/// Keeps events in memory, in order.
#[derive(Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: AuditEventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(
        &self,
        principal_id: Option<Uuid>,
        kind: AuditEventKind,
        description: &str,
        metadata: serde_json::Value,
    ) {
        let event = AuditEvent::new(
            principal_id,
            kind,
            description,
            metadata,
            chrono::Utc::now(),
        );
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
