//! Scheduler state-machine tests against scripted queue and optimizer
//! stubs. Every remote interaction is scripted, so each test drives the
//! exact sequence of passes it asserts about.
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use indexmap::IndexMap;

use evo_core::{
    CompletionProbe, FailAction, InMemoryEventLog, Optimizer, OptimizerError, OutputVerdict,
    QueueError, QueueInterface, QueueStatus, Scheduler, SchedulerOptions, SearchEventKind,
    StructureHandle,
};
use evo_domain::{Composition, JobState, OptRecord, RecordMode, Structure};

#[derive(Default)]
struct StubQueue {
    remote: bool,
    statuses: Mutex<VecDeque<Result<QueueStatus, QueueError>>>,
    copy_results: Mutex<VecDeque<Result<(), QueueError>>>,
    write_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl StubQueue {
    fn script_status(&self, result: Result<QueueStatus, QueueError>) {
        self.statuses.lock().unwrap().push_back(result);
    }

    fn script_copy(&self, result: Result<(), QueueError>) {
        self.copy_results.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl QueueInterface for StubQueue {
    fn name(&self) -> &str {
        "Stub"
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn is_ready_to_search(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn write_input_files(
        &self,
        _s: &StructureHandle,
        _files: &IndexMap<String, String>,
    ) -> Result<(), QueueError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_job(&self, _s: &StructureHandle) -> Result<u64, QueueError> {
        let n = self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(100 + n as u64)
    }

    async fn stop_job(&self, _s: &StructureHandle) -> Result<(), QueueError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_status(
        &self,
        _s: &StructureHandle,
        _probe: &CompletionProbe,
    ) -> Result<QueueStatus, QueueError> {
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(QueueStatus::Unknown))
    }

    async fn get_queue_list(&self, _forced: bool) -> Result<Vec<String>, QueueError> {
        Ok(Vec::new())
    }

    async fn copy_remote_to_local_cache(&self, _s: &StructureHandle) -> Result<(), QueueError> {
        self.copy_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

struct StubOptimizer {
    steps: usize,
    fail_templates: bool,
    verdicts: Mutex<VecDeque<OutputVerdict>>,
}

impl StubOptimizer {
    fn new(steps: usize) -> Self {
        StubOptimizer {
            steps,
            fail_templates: false,
            verdicts: Mutex::new(VecDeque::new()),
        }
    }

    fn failing_templates() -> Self {
        StubOptimizer {
            steps: 1,
            fail_templates: true,
            verdicts: Mutex::new(VecDeque::new()),
        }
    }

    fn script_verdict(&self, verdict: OutputVerdict) {
        self.verdicts.lock().unwrap().push_back(verdict);
    }
}

#[async_trait]
impl Optimizer for StubOptimizer {
    fn name(&self) -> &str {
        "StubOpt"
    }

    fn num_opt_steps(&self) -> usize {
        self.steps
    }

    fn template_names(&self) -> Vec<String> {
        vec!["job.in".to_string()]
    }

    fn interpreted_templates(
        &self,
        _s: &Structure,
    ) -> Result<IndexMap<String, String>, OptimizerError> {
        if self.fail_templates {
            return Err(OptimizerError::UnresolvedKeyword {
                keyword: "volume".to_string(),
                filename: "job.in".to_string(),
            });
        }
        let mut files = IndexMap::new();
        files.insert("job.in".to_string(), "input".to_string());
        Ok(files)
    }

    fn completion_probe(&self) -> CompletionProbe {
        CompletionProbe::new("job.out").with_completion_marker("DONE")
    }

    async fn check_for_successful_output(
        &self,
        _s: &Structure,
    ) -> Result<OutputVerdict, OptimizerError> {
        Ok(self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OutputVerdict::Success))
    }

    async fn read(
        &self,
        s: &mut Structure,
        _filename: &str,
        mode: RecordMode,
    ) -> Result<(), OptimizerError> {
        let step = s.current_opt_step;
        s.record_opt_result(
            OptRecord {
                step,
                energy: -(step as f64),
                enthalpy: None,
                recorded_at: chrono::Utc::now(),
            },
            mode,
        );
        Ok(())
    }
}

fn structure(id_number: u32) -> Structure {
    Structure::new(
        1,
        id_number,
        Composition::from_pairs(&[("C", 1)]),
        vec!["C".into()],
        vec![[0.0; 3]],
        None,
        PathBuf::from(format!("/tmp/evoflow-tests/1x{id_number}")),
    )
    .unwrap()
}

fn options() -> SchedulerOptions {
    SchedulerOptions {
        poll_interval_ms: 1,
        comm_backoff_ms: 0,
        ..Default::default()
    }
}

fn state_changes(log: &InMemoryEventLog) -> Vec<(JobState, JobState)> {
    log.list()
        .into_iter()
        .filter_map(|e| match e.kind {
            SearchEventKind::StateChanged { from, to } => Some((from, to)),
            _ => None,
        })
        .collect()
}

fn comm_failures(log: &InMemoryEventLog) -> usize {
    log.list()
        .iter()
        .filter(|e| matches!(e.kind, SearchEventKind::CommunicationFailure { .. }))
        .count()
}

async fn passes(scheduler: &Arc<Scheduler>, n: usize) {
    for _ in 0..n {
        Arc::clone(scheduler).run_pass().await;
    }
}

#[tokio::test]
async fn structure_runs_to_success_with_one_history_entry() {
    let queue = Arc::new(StubQueue::default());
    queue.script_status(Ok(QueueStatus::Running));
    queue.script_status(Ok(QueueStatus::Running));
    queue.script_status(Ok(QueueStatus::Success));
    let optimizer = Arc::new(StubOptimizer::new(1));
    optimizer.script_verdict(OutputVerdict::Success);
    let log = Arc::new(InMemoryEventLog::new());

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .event_sink(log.clone())
        .build();
    let handle = scheduler.track(structure(1)).await;

    passes(&scheduler, 6).await;

    let s = handle.read().await;
    assert_eq!(s.state, JobState::Success);
    assert_eq!(s.history.len(), 1, "exactly one new history entry");
    assert_eq!(s.current_energy(), Some(-1.0));
    drop(s);

    assert_eq!(
        state_changes(&log),
        vec![
            (JobState::Unoptimized, JobState::WaitingForOptimization),
            (JobState::WaitingForOptimization, JobState::Submitted),
            (JobState::Submitted, JobState::Running),
            (JobState::Running, JobState::Success),
        ]
    );
    assert_eq!(queue.start_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_comm_failures_recover_without_corrupting_state() {
    let queue = Arc::new(StubQueue::default());
    queue.script_status(Err(QueueError::Communication("link down".into())));
    queue.script_status(Err(QueueError::Communication("link down".into())));
    queue.script_status(Ok(QueueStatus::Running));
    queue.script_status(Ok(QueueStatus::Success));
    let optimizer = Arc::new(StubOptimizer::new(1));
    let log = Arc::new(InMemoryEventLog::new());

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .event_sink(log.clone())
        .build();
    let handle = scheduler.track(structure(2)).await;

    for _ in 0..8 {
        assert!(!handle.read().await.is_settled() || handle.read().await.state == JobState::Success);
        Arc::clone(&scheduler).run_pass().await;
    }

    assert_eq!(handle.read().await.state, JobState::Success);
    assert_eq!(comm_failures(&log), 2, "exactly two excursion attempts recorded");
    // The excursion resumed the prior trajectory before applying the
    // fresh status.
    let changes = state_changes(&log);
    assert!(changes.contains(&(JobState::Submitted, JobState::CommunicationError)));
    assert!(changes.contains(&(JobState::CommunicationError, JobState::Submitted)));
    assert!(changes.contains(&(JobState::Submitted, JobState::Running)));
}

#[tokio::test]
async fn comm_retry_exhaustion_demotes_to_terminal_error() {
    let queue = Arc::new(StubQueue::default());
    for _ in 0..4 {
        queue.script_status(Err(QueueError::Communication("host unreachable".into())));
    }
    let optimizer = Arc::new(StubOptimizer::new(1));
    let log = Arc::new(InMemoryEventLog::new());

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(SchedulerOptions {
            comm_retry_limit: 2,
            ..options()
        })
        .event_sink(log.clone())
        .build();
    let handle = scheduler.track(structure(3)).await;

    passes(&scheduler, 8).await;

    let s = handle.read().await;
    assert_eq!(s.state, JobState::Error);
    assert!(s.error_terminal);
    assert_eq!(comm_failures(&log), 3);
    assert!(log
        .list()
        .iter()
        .any(|e| matches!(e.kind, SearchEventKind::StructureFailed { .. })));
}

#[tokio::test]
async fn unresolved_template_key_never_reaches_submission() {
    let queue = Arc::new(StubQueue::default());
    let optimizer = Arc::new(StubOptimizer::failing_templates());
    let log = Arc::new(InMemoryEventLog::new());

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .event_sink(log.clone())
        .build();
    let handle = scheduler.track(structure(4)).await;

    passes(&scheduler, 4).await;

    let s = handle.read().await;
    assert_eq!(s.state, JobState::Error);
    assert!(s.error_terminal, "configuration errors are not retried");
    assert_eq!(queue.start_calls.load(Ordering::SeqCst), 0);
    assert!(!log
        .list()
        .iter()
        .any(|e| matches!(e.kind, SearchEventKind::StructureSubmitted { .. })));
}

#[tokio::test]
async fn concurrent_passes_never_double_submit() {
    let queue = Arc::new(StubQueue::default());
    for _ in 0..8 {
        queue.script_status(Ok(QueueStatus::Running));
    }
    let optimizer = Arc::new(StubOptimizer::new(1));

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .build();
    scheduler.track(structure(5)).await;

    for _ in 0..4 {
        tokio::join!(
            Arc::clone(&scheduler).run_pass(),
            Arc::clone(&scheduler).run_pass()
        );
    }

    assert_eq!(queue.write_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        queue.start_calls.load(Ordering::SeqCst),
        1,
        "a structure is associated with at most one in-flight job"
    );
}

#[tokio::test]
async fn running_job_limit_throttles_submissions() {
    let queue = Arc::new(StubQueue::default());
    let optimizer = Arc::new(StubOptimizer::new(1));

    let scheduler = Scheduler::builder(queue.clone(), optimizer.clone())
        .options(SchedulerOptions {
            running_job_limit: 1,
            ..options()
        })
        .build();
    let first = scheduler.track(structure(6)).await;
    let second = scheduler.track(structure(7)).await;

    // Both prepare, but only one submission slot exists.
    passes(&scheduler, 2).await;
    assert_eq!(queue.start_calls.load(Ordering::SeqCst), 1);
    let states = (first.state().await, second.state().await);
    assert!(
        matches!(
            states,
            (JobState::Submitted, JobState::WaitingForOptimization)
                | (JobState::WaitingForOptimization, JobState::Submitted)
        ),
        "unexpected states: {states:?}"
    );

    // Let the submitted one finish; the other then gets the slot.
    queue.script_status(Ok(QueueStatus::Success));
    optimizer.script_verdict(OutputVerdict::Success);
    queue.script_status(Ok(QueueStatus::Success));
    optimizer.script_verdict(OutputVerdict::Success);
    passes(&scheduler, 6).await;
    assert_eq!(queue.start_calls.load(Ordering::SeqCst), 2);
    assert!(scheduler.all_settled().await);
}

#[tokio::test]
async fn multi_step_pipeline_resubmits_at_next_step() {
    let queue = Arc::new(StubQueue::default());
    queue.script_status(Ok(QueueStatus::Success)); // step 1 completes
    queue.script_status(Ok(QueueStatus::Success)); // step 2 completes
    let optimizer = Arc::new(StubOptimizer::new(2));
    optimizer.script_verdict(OutputVerdict::Success);
    optimizer.script_verdict(OutputVerdict::Success);
    let log = Arc::new(InMemoryEventLog::new());

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .event_sink(log.clone())
        .build();
    let handle = scheduler.track(structure(8)).await;

    passes(&scheduler, 8).await;

    let s = handle.read().await;
    assert_eq!(s.state, JobState::Success);
    assert_eq!(s.current_opt_step, 2);
    assert_eq!(s.history.len(), 2, "one record per optimization step");
    assert_eq!(queue.start_calls.load(Ordering::SeqCst), 2);
    assert_eq!(queue.write_calls.load(Ordering::SeqCst), 2);
    // The step handoff goes back through WaitingForOptimization.
    let changes = state_changes(&log);
    let waits = changes
        .iter()
        .filter(|(_, to)| *to == JobState::WaitingForOptimization)
        .count();
    assert_eq!(waits, 2);
}

#[tokio::test]
async fn calculation_failures_resubmit_until_the_budget_is_spent() {
    let queue = Arc::new(StubQueue::default());
    queue.script_status(Ok(QueueStatus::Error));
    queue.script_status(Ok(QueueStatus::Error));
    let optimizer = Arc::new(StubOptimizer::new(1));
    let log = Arc::new(InMemoryEventLog::new());

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(SchedulerOptions {
            fail_limit: 2,
            fail_action: FailAction::Terminate,
            ..options()
        })
        .event_sink(log.clone())
        .build();
    let handle = scheduler.track(structure(9)).await;

    passes(&scheduler, 10).await;

    let s = handle.read().await;
    assert_eq!(s.state, JobState::Error);
    assert!(s.error_terminal);
    assert_eq!(s.fail_count, 2);
    assert_eq!(queue.start_calls.load(Ordering::SeqCst), 2, "one resubmission");
    assert_eq!(queue.write_calls.load(Ordering::SeqCst), 2);
    assert!(log
        .list()
        .iter()
        .any(|e| matches!(e.kind, SearchEventKind::StructureFailed { .. })));
}

#[tokio::test]
async fn replace_action_hands_the_structure_back() {
    let queue = Arc::new(StubQueue::default());
    queue.script_status(Ok(QueueStatus::Error));
    let optimizer = Arc::new(StubOptimizer::new(1));
    let log = Arc::new(InMemoryEventLog::new());

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(SchedulerOptions {
            fail_limit: 1,
            fail_action: FailAction::Replace,
            ..options()
        })
        .event_sink(log.clone())
        .build();
    let handle = scheduler.track(structure(10)).await;

    passes(&scheduler, 4).await;

    assert!(log
        .list()
        .iter()
        .any(|e| matches!(e.kind, SearchEventKind::ReplacementRequested { .. })));
    let s = handle.read().await;
    assert_eq!(s.state, JobState::Unoptimized);
    assert_eq!(s.fail_count, 0);
    assert_eq!(s.current_opt_step, 1);
}

#[tokio::test]
async fn kill_settles_into_killed_regardless_of_polling() {
    let queue = Arc::new(StubQueue::default());
    for _ in 0..4 {
        queue.script_status(Ok(QueueStatus::Running));
    }
    let optimizer = Arc::new(StubOptimizer::new(1));
    let log = Arc::new(InMemoryEventLog::new());

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .event_sink(log.clone())
        .build();
    let handle = scheduler.track(structure(11)).await;

    passes(&scheduler, 3).await; // submitted and running
    tokio::join!(Arc::clone(&scheduler).run_pass(), async {
        scheduler.kill(&handle).await;
    });
    passes(&scheduler, 2).await;

    assert_eq!(handle.read().await.state, JobState::Killed);
    assert!(queue.stop_calls.load(Ordering::SeqCst) >= 1);
    assert!(log
        .list()
        .iter()
        .any(|e| matches!(e.kind, SearchEventKind::StructureKilled)));
}

#[tokio::test]
async fn partial_transfer_is_retried_not_failed() {
    let queue = Arc::new(StubQueue::default());
    queue.script_status(Ok(QueueStatus::Success));
    queue.script_status(Ok(QueueStatus::Success));
    queue.script_copy(Err(QueueError::PartialTransfer {
        file: "job.out".into(),
        expected: 2048,
        got: 512,
    }));
    queue.script_copy(Ok(()));
    let optimizer = Arc::new(StubOptimizer::new(1));
    optimizer.script_verdict(OutputVerdict::Success);

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .build();
    let handle = scheduler.track(structure(12)).await;

    passes(&scheduler, 6).await;

    let s = handle.read().await;
    assert_eq!(s.state, JobState::Success);
    assert_eq!(s.fail_count, 0, "a truncated transfer is not a failure");
}

#[tokio::test]
async fn remote_queue_maps_queued_to_queued_remotely() {
    let queue = Arc::new(StubQueue {
        remote: true,
        ..Default::default()
    });
    queue.script_status(Ok(QueueStatus::Queued));
    let optimizer = Arc::new(StubOptimizer::new(1));

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .build();
    let handle = scheduler.track(structure(13)).await;

    passes(&scheduler, 3).await;
    assert_eq!(handle.read().await.state, JobState::QueuedRemotely);
}

#[tokio::test]
async fn objective_fail_is_respected_as_terminal() {
    let queue = Arc::new(StubQueue::default());
    let optimizer = Arc::new(StubOptimizer::new(1));
    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .build();
    let handle = scheduler.track(structure(14)).await;
    handle.write().await.state = JobState::ObjectiveFail;

    passes(&scheduler, 2).await;

    assert!(scheduler.all_settled().await);
    assert_eq!(handle.read().await.state, JobState::ObjectiveFail);
    assert_eq!(queue.write_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inconclusive_output_keeps_polling() {
    let queue = Arc::new(StubQueue::default());
    queue.script_status(Ok(QueueStatus::Success));
    queue.script_status(Ok(QueueStatus::Success));
    let optimizer = Arc::new(StubOptimizer::new(1));
    optimizer.script_verdict(OutputVerdict::Inconclusive);
    optimizer.script_verdict(OutputVerdict::Success);

    let scheduler = Scheduler::builder(queue.clone(), optimizer)
        .options(options())
        .build();
    let handle = scheduler.track(structure(15)).await;

    passes(&scheduler, 6).await;
    assert_eq!(handle.read().await.state, JobState::Success);
}
