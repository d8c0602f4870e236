//! Error taxonomy for the scheduler and its collaborators.
//!
//! Components report failures as values; the scheduler is the only place
//! that turns an error kind into a retry-vs-terminal decision.
use thiserror::Error;

/// Failures reported by a queue interface.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Missing or invalid configuration (credentials, commands, paths).
    /// Fatal for the affected structure; never retried.
    #[error("queue configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure talking to a remote host. Transient.
    #[error("communication error: {0}")]
    Communication(String),

    /// The submit command ran but did not accept the job.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// A retrieved file is shorter than the remote copy. Inconclusive;
    /// the transfer is retried on the next poll.
    #[error("partial transfer of {file}: expected {expected} bytes, got {got}")]
    PartialTransfer { file: String, expected: u64, got: u64 },

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for QueueError {
    fn from(e: std::io::Error) -> Self {
        QueueError::Io(e.to_string())
    }
}

/// Failures reported by an optimizer adapter.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("no template registered for {0}")]
    MissingTemplate(String),

    #[error("unresolved keyword %{keyword}% in template {filename}")]
    UnresolvedKeyword { keyword: String, filename: String },

    #[error("optimization step {step} out of range (1-{max})")]
    OptStepOutOfRange { step: usize, max: usize },

    #[error("output parse error: {0}")]
    Parse(String),

    /// In-process evaluation failure.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for OptimizerError {
    fn from(e: std::io::Error) -> Self {
        OptimizerError::Io(e.to_string())
    }
}

/// Failures that abort the whole scheduler, not a single structure.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("not ready to search: {0}")]
    NotReady(String),
}
