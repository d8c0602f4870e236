use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use super::{SearchEvent, SearchEventKind};

/// Observer of scheduler events. Implementations must be cheap: sinks are
/// called from scheduling passes.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &SearchEvent);
}

/// Fans events out to all registered sinks, assigning sequence numbers.
pub struct EventBus {
    seq: AtomicU64,
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        EventBus {
            seq: AtomicU64::new(0),
            sinks,
        }
    }

    pub fn emit(&self, structure_id: Option<Uuid>, kind: SearchEventKind) -> SearchEvent {
        let event = SearchEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            structure_id,
            kind,
            ts: Utc::now(),
        };
        for sink in &self.sinks {
            sink.record(&event);
        }
        event
    }
}

/// Append-only in-memory event log. Used by tests and by callers that
/// reconstruct trajectories after the fact.
#[derive(Default)]
pub struct InMemoryEventLog {
    inner: Mutex<Vec<SearchEvent>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in append order.
    pub fn list(&self) -> Vec<SearchEvent> {
        self.inner.lock().expect("event log poisoned").clone()
    }

    /// Events concerning one structure, in append order.
    pub fn list_for(&self, structure_id: Uuid) -> Vec<SearchEvent> {
        self.list()
            .into_iter()
            .filter(|e| e.structure_id == Some(structure_id))
            .collect()
    }
}

impl EventSink for InMemoryEventLog {
    fn record(&self, event: &SearchEvent) {
        self.inner.lock().expect("event log poisoned").push(event.clone());
    }
}

/// Sink that forwards events to the `tracing` diagnostics layer.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &SearchEvent) {
        match &event.kind {
            SearchEventKind::StructureFailed { message } => {
                tracing::warn!(structure = ?event.structure_id, %message, "structure failed");
            }
            SearchEventKind::CommunicationFailure { attempt, message } => {
                tracing::warn!(structure = ?event.structure_id, attempt = *attempt, %message, "communication failure");
            }
            kind => {
                tracing::info!(structure = ?event.structure_id, event = ?kind, "scheduler event");
            }
        }
    }
}
