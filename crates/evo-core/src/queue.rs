//! Queue-interface contract implemented by every scheduler backend.
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::QueueError;
use crate::optimizer::OutputVerdict;
use crate::tracker::StructureHandle;

/// Status of a job as seen by a queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Waiting in the queue for dispatch.
    Queued,
    /// Executing.
    Running,
    /// Finished and the output carries a completion marker.
    Success,
    /// Finished unsuccessfully, or vanished without output.
    Error,
    /// Cannot be determined yet (e.g. submitted but not yet listed).
    Unknown,
}

/// Completion-detection rule supplied by the optimizer: a target output
/// file plus marker strings. Markers are case-sensitive substrings; the
/// first matching line wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionProbe {
    pub filename: String,
    pub completion_markers: Vec<String>,
    pub failure_markers: Vec<String>,
}

impl CompletionProbe {
    pub fn new(filename: impl Into<String>) -> Self {
        CompletionProbe {
            filename: filename.into(),
            completion_markers: Vec::new(),
            failure_markers: Vec::new(),
        }
    }

    pub fn with_completion_marker(mut self, marker: impl Into<String>) -> Self {
        self.completion_markers.push(marker.into());
        self
    }

    pub fn with_failure_marker(mut self, marker: impl Into<String>) -> Self {
        self.failure_markers.push(marker.into());
        self
    }

    /// Scan output content for markers. Absence of any marker is
    /// `Inconclusive`, never failure: the file may still be in flight.
    pub fn scan(&self, content: &str) -> OutputVerdict {
        for line in content.lines() {
            if self.failure_markers.iter().any(|m| line.contains(m.as_str())) {
                return OutputVerdict::Failure;
            }
            if self.completion_markers.iter().any(|m| line.contains(m.as_str())) {
                return OutputVerdict::Success;
            }
        }
        OutputVerdict::Inconclusive
    }
}

/// Abstraction over a family of job-scheduling backends.
///
/// All operations report failures as `QueueError` values; none panic or
/// retry internally. Retry policy belongs to the scheduler.
#[async_trait]
pub trait QueueInterface: Send + Sync {
    /// Short identifier, e.g. "Local", "PBS".
    fn name(&self) -> &str;

    /// Whether jobs run on a remote host (drives `QueuedRemotely`).
    fn is_remote(&self) -> bool {
        false
    }

    /// Pre-flight check that all mandatory settings are present. Called
    /// once before the scheduler starts accepting work.
    fn is_ready_to_search(&self) -> Result<(), QueueError>;

    /// Materialize the interpreted templates into the structure's working
    /// directory (and the remote directory for remote backends).
    async fn write_input_files(
        &self,
        s: &StructureHandle,
        files: &IndexMap<String, String>,
    ) -> Result<(), QueueError>;

    /// Submit the prepared job; returns the scheduler-assigned job id.
    async fn start_job(&self, s: &StructureHandle) -> Result<u64, QueueError>;

    /// Cancel the structure's job. Idempotent: an unknown or finished job
    /// id is success.
    async fn stop_job(&self, s: &StructureHandle) -> Result<(), QueueError>;

    /// Status of the structure's job, consulting the cached queue snapshot
    /// for remote backends. `probe` lets the backend disambiguate a job
    /// that has left the queue into Success/Error/still-pending.
    async fn get_status(
        &self,
        s: &StructureHandle,
        probe: &CompletionProbe,
    ) -> Result<QueueStatus, QueueError>;

    /// The raw queue listing. `forced` bypasses the snapshot cache;
    /// otherwise a snapshot younger than the refresh interval is reused.
    async fn get_queue_list(&self, forced: bool) -> Result<Vec<String>, QueueError>;

    /// Retrieve completed-job outputs into the local cache directory.
    /// Truncated transfers are detected and reported, never silently kept.
    async fn copy_remote_to_local_cache(&self, s: &StructureHandle) -> Result<(), QueueError>;
}
