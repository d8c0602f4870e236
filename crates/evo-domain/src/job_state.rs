use serde::{Deserialize, Serialize};
use std::fmt;

/// Job state of a structure, driven exclusively by the scheduler.
///
/// Valid transitions:
/// - `Unoptimized` -> `WaitingForOptimization` (input files written)
/// - `WaitingForOptimization` -> `Submitted` (job accepted by the queue)
/// - `Submitted` -> `Queued` | `QueuedRemotely` | `Running`
/// - `Queued`/`QueuedRemotely`/`Running` -> `Success` | `Error` |
///   `CommunicationError`
/// - `CommunicationError` -> prior state (bounded retries) | `Error`
/// - `Error` -> `WaitingForOptimization` (resubmission below the failure
///   budget)
/// - any non-terminal -> `Killed`
///
/// No other transitions are permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Freshly generated; no input files exist yet.
    Unoptimized,
    /// Input files written; waiting for a free submission slot.
    WaitingForOptimization,
    /// Submitted, but not yet visible to the queue.
    Submitted,
    /// Visible in a local queue, not yet dispatched.
    Queued,
    /// Visible in a remote scheduler's queue, not yet dispatched.
    QueuedRemotely,
    /// The external job is executing.
    Running,
    /// All optimization steps finished; ownership returns to the caller.
    Success,
    /// The calculation failed. Terminal once the failure budget is spent.
    Error,
    /// Transient transport failure while polling; retried with backoff.
    CommunicationError,
    /// Cancelled by the user or an administrative action.
    Killed,
    /// Rejected by an objective filter outside the scheduler.
    ObjectiveFail,
}

impl JobState {
    /// Terminal states end the scheduler's responsibility for a structure.
    /// `Error` is only conditionally terminal (failure budget), so the
    /// scheduler treats it separately.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Killed | JobState::ObjectiveFail)
    }

    /// States that occupy a slot against the running-job limit.
    pub fn occupies_queue_slot(self) -> bool {
        matches!(
            self,
            JobState::Submitted | JobState::Queued | JobState::QueuedRemotely | JobState::Running
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Unoptimized => "unoptimized",
            JobState::WaitingForOptimization => "waiting-for-optimization",
            JobState::Submitted => "submitted",
            JobState::Queued => "queued",
            JobState::QueuedRemotely => "queued-remotely",
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Error => "error",
            JobState::CommunicationError => "communication-error",
            JobState::Killed => "killed",
            JobState::ObjectiveFail => "objective-fail",
        };
        write!(f, "{}", s)
    }
}
