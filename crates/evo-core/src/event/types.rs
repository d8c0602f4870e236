//! Event kinds emitted by the scheduler.
//!
//! - Every state transition produces a `StateChanged` event.
//! - Terminal outcomes additionally produce `StructureFinished`,
//!   `StructureKilled` or `StructureFailed`.
//! - The sequence of events for one structure reconstructs its full
//!   job-lifecycle trajectory, including transient excursions.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use evo_domain::JobState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SearchEventKind {
    /// The scheduler loop started accepting work.
    SearchStarted,
    /// A structure entered the scheduler's responsibility.
    StructureTracked { tag: String },
    /// A job state transition. Emitted for every change, terminal or not.
    StateChanged { from: JobState, to: JobState },
    /// A job was accepted by the queue.
    StructureSubmitted { job_id: u64 },
    /// All optimization steps completed; ownership returns to the caller.
    StructureFinished,
    StructureKilled,
    /// Terminal failure, with a human-readable reason.
    StructureFailed { message: String },
    /// One failed communication attempt within an excursion.
    CommunicationFailure { attempt: u32, message: String },
    /// The failure budget was spent and the configured action asks the
    /// population manager to regenerate this structure.
    ReplacementRequested { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchEvent {
    /// Assigned by the event bus in append order.
    pub seq: u64,
    /// Structure the event concerns; `None` for scheduler-level events.
    pub structure_id: Option<Uuid>,
    pub kind: SearchEventKind,
    pub ts: DateTime<Utc>,
}
