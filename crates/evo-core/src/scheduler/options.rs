use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a structure once its failure budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailAction {
    /// Mark the structure terminally failed.
    Terminate,
    /// Keep resubmitting at the current step indefinitely.
    KeepTrying,
    /// Kill the structure.
    Kill,
    /// Ask the population manager to regenerate it, then restart the
    /// pipeline from scratch.
    Replace,
}

/// Tunable scheduler parameters. All retry and backoff values are explicit
/// here rather than constants buried in queue code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Delay between scheduling passes, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum structures simultaneously submitted/queued/running.
    pub running_job_limit: usize,
    /// Calculation failures tolerated per structure before `fail_action`
    /// applies.
    pub fail_limit: u32,
    pub fail_action: FailAction,
    /// Consecutive failed communication attempts tolerated within one
    /// excursion before the structure is demoted to Error.
    pub comm_retry_limit: u32,
    /// Base backoff before a communication retry, in milliseconds;
    /// doubles with each consecutive failure.
    pub comm_backoff_ms: u64,
    /// Scan the queue snapshot for this structure's job name before
    /// counting an error, re-adopting the job if it is still listed.
    pub reclaim_job_names: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            poll_interval_ms: 1000,
            running_job_limit: 10,
            fail_limit: 3,
            fail_action: FailAction::Terminate,
            comm_retry_limit: 3,
            comm_backoff_ms: 2000,
            reclaim_job_names: true,
        }
    }
}

impl SchedulerOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling per
    /// consecutive failure, capped at 16x the base.
    pub fn comm_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(4);
        Duration::from_millis(self.comm_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let o = SchedulerOptions::default();
        assert_eq!(o.poll_interval(), Duration::from_millis(1000));
        assert_eq!(o.fail_action, FailAction::Terminate);
        assert!(o.comm_retry_limit > 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let o = SchedulerOptions {
            comm_backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(o.comm_backoff(1), Duration::from_millis(100));
        assert_eq!(o.comm_backoff(2), Duration::from_millis(200));
        assert_eq!(o.comm_backoff(3), Duration::from_millis(400));
        assert_eq!(o.comm_backoff(10), Duration::from_millis(1600));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let o: SchedulerOptions = serde_json::from_str("{\"fail_limit\": 5}").unwrap();
        assert_eq!(o.fail_limit, 5);
        assert_eq!(o.poll_interval_ms, 1000);
    }
}
