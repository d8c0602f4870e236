//! Core scheduler implementation.
//!
//! Each tracked structure is advanced by at most one pass at a time; a
//! pass either moves the state machine forward or leaves the structure
//! untouched pending an external event (the remote job still running).
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use evo_domain::{JobState, RecordMode, Structure};

use crate::errors::{QueueError, SchedulerError};
use crate::event::{EventBus, EventSink, SearchEventKind};
use crate::optimizer::{Optimizer, OutputVerdict};
use crate::queue::{QueueInterface, QueueStatus};
use crate::scheduler::options::{FailAction, SchedulerOptions};
use crate::tracker::{StructureHandle, Tracker};

pub struct Scheduler {
    queue: Arc<dyn QueueInterface>,
    optimizer: Arc<dyn Optimizer>,
    tracker: Tracker,
    options: SchedulerOptions,
    events: EventBus,
}

pub struct SchedulerBuilder {
    queue: Arc<dyn QueueInterface>,
    optimizer: Arc<dyn Optimizer>,
    options: SchedulerOptions,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl SchedulerBuilder {
    pub fn options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Arc<Scheduler> {
        Arc::new(Scheduler {
            queue: self.queue,
            optimizer: self.optimizer,
            tracker: Tracker::new(),
            options: self.options,
            events: EventBus::new(self.sinks),
        })
    }
}

impl Scheduler {
    pub fn builder(
        queue: Arc<dyn QueueInterface>,
        optimizer: Arc<dyn Optimizer>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            queue,
            optimizer,
            options: SchedulerOptions::default(),
            sinks: Vec::new(),
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Pre-flight capability check; run before accepting work.
    pub fn is_ready_to_search(&self) -> Result<(), SchedulerError> {
        self.queue
            .is_ready_to_search()
            .map_err(|e| SchedulerError::NotReady(e.to_string()))?;
        if self.optimizer.num_opt_steps() == 0 {
            return Err(SchedulerError::NotReady(format!(
                "optimizer {} declares no optimization steps",
                self.optimizer.name()
            )));
        }
        Ok(())
    }

    /// Accept a new structure from the population manager.
    pub async fn track(&self, structure: Structure) -> Arc<StructureHandle> {
        let tag = structure.tag();
        let handle = self.tracker.track(structure);
        self.events
            .emit(Some(handle.id()), SearchEventKind::StructureTracked { tag });
        handle
    }

    /// True once every tracked structure reached a settled state.
    pub async fn all_settled(&self) -> bool {
        for handle in self.tracker.handles() {
            if !handle.read().await.is_settled() {
                return false;
            }
        }
        true
    }

    /// One sweep over all tracked structures. Structures needing attention
    /// are advanced concurrently, each guarded by its in-flight token, so
    /// a slow remote operation for one structure never blocks the others.
    pub async fn run_pass(self: Arc<Self>) {
        let handles = self.tracker.handles();

        let mut active = 0usize;
        for handle in &handles {
            if handle.read().await.state.occupies_queue_slot() {
                active += 1;
            }
        }
        let free_slots = Arc::new(AtomicUsize::new(
            self.options.running_job_limit.saturating_sub(active),
        ));

        let mut passes = JoinSet::new();
        for handle in handles {
            if handle.read().await.is_settled() {
                continue;
            }
            if !handle.try_begin_pass() {
                continue;
            }
            let this = Arc::clone(&self);
            let slots = Arc::clone(&free_slots);
            passes.spawn(async move {
                this.advance(&handle, &slots).await;
                handle.end_pass();
            });
        }
        while passes.join_next().await.is_some() {}
    }

    /// Drive passes until every structure settles or `max_passes` is hit.
    /// Returns true if everything settled.
    pub async fn run_until_settled(self: Arc<Self>, max_passes: usize) -> bool {
        for _ in 0..max_passes {
            Arc::clone(&self).run_pass().await;
            if self.all_settled().await {
                return true;
            }
            tokio::time::sleep(self.options.poll_interval()).await;
        }
        self.all_settled().await
    }

    /// Scheduler loop: tick every poll interval until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), SchedulerError> {
        self.is_ready_to_search()?;
        self.events.emit(None, SearchEventKind::SearchStarted);
        let mut ticker = tokio::time::interval(self.options.poll_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    Arc::clone(&self).run_pass().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Cancel a structure. Safe to call while a poll for the same
    /// structure is in progress: terminal states are never left, so the
    /// structure settles into Killed regardless of interleaving.
    pub async fn kill(&self, handle: &Arc<StructureHandle>) {
        if let Err(e) = self.queue.stop_job(handle).await {
            warn!(structure = %handle.id(), error = %e, "stop_job during kill failed");
        }
        {
            let mut s = handle.write().await;
            s.stop_opt_timer();
            s.job_id = 0;
        }
        self.transition(handle, JobState::Killed).await;
        self.events
            .emit(Some(handle.id()), SearchEventKind::StructureKilled);
    }

    /// One pass of the per-structure state machine.
    async fn advance(&self, handle: &Arc<StructureHandle>, free_slots: &AtomicUsize) {
        let state = handle.state().await;
        match state {
            JobState::Unoptimized => self.prepare(handle).await,
            JobState::WaitingForOptimization => {
                if take_slot(free_slots) {
                    self.submit(handle).await;
                }
            }
            JobState::Submitted
            | JobState::Queued
            | JobState::QueuedRemotely
            | JobState::Running => self.poll(handle).await,
            JobState::CommunicationError => self.retry_communication(handle).await,
            JobState::Error => self.handle_error(handle).await,
            JobState::Success | JobState::Killed | JobState::ObjectiveFail => {}
        }
    }

    /// Unoptimized -> WaitingForOptimization: interpret templates and
    /// write input files. Failures here are configuration errors and are
    /// terminal for the structure, without retry.
    async fn prepare(&self, handle: &Arc<StructureHandle>) {
        let snapshot = handle.read().await.clone();
        let files = match self.optimizer.interpreted_templates(&snapshot) {
            Ok(files) => files,
            Err(e) => {
                self.terminal_error(handle, e.to_string()).await;
                return;
            }
        };
        match self.queue.write_input_files(handle, &files).await {
            Ok(()) => {
                self.transition(handle, JobState::WaitingForOptimization)
                    .await
            }
            Err(e) => self.terminal_error(handle, e.to_string()).await,
        }
    }

    /// WaitingForOptimization -> Submitted.
    async fn submit(&self, handle: &Arc<StructureHandle>) {
        match self.queue.start_job(handle).await {
            Ok(job_id) => {
                {
                    let mut s = handle.write().await;
                    s.job_id = job_id;
                    s.start_opt_timer();
                }
                self.transition(handle, JobState::Submitted).await;
                self.events.emit(
                    Some(handle.id()),
                    SearchEventKind::StructureSubmitted { job_id },
                );
            }
            Err(QueueError::Communication(msg)) => self.comm_excursion(handle, msg).await,
            Err(e) => self.calculation_failure(handle, e.to_string()).await,
        }
    }

    /// Poll the queue for Submitted/Queued/QueuedRemotely/Running.
    async fn poll(&self, handle: &Arc<StructureHandle>) {
        let probe = self.optimizer.completion_probe();
        match self.queue.get_status(handle, &probe).await {
            Ok(status) => self.apply_status(handle, status).await,
            Err(QueueError::Communication(msg)) => self.comm_excursion(handle, msg).await,
            Err(e) => self.calculation_failure(handle, e.to_string()).await,
        }
    }

    async fn apply_status(&self, handle: &Arc<StructureHandle>, status: QueueStatus) {
        match status {
            QueueStatus::Queued => {
                let target = if self.queue.is_remote() {
                    JobState::QueuedRemotely
                } else {
                    JobState::Queued
                };
                self.transition(handle, target).await;
            }
            QueueStatus::Running => self.transition(handle, JobState::Running).await,
            QueueStatus::Unknown => {
                // Submitted but not yet listed, or an unrecognized queue
                // code. Nothing to do but wait.
            }
            QueueStatus::Error => {
                self.calculation_failure(handle, "queue reported job error".into())
                    .await
            }
            QueueStatus::Success => self.finalize(handle).await,
        }
    }

    /// Queue says Success: retrieve outputs, confirm the completion
    /// marker, parse results, then advance to the next step or finish.
    async fn finalize(&self, handle: &Arc<StructureHandle>) {
        match self.queue.copy_remote_to_local_cache(handle).await {
            Ok(()) => {}
            Err(QueueError::PartialTransfer { file, .. }) => {
                debug!(structure = %handle.id(), %file, "partial transfer; will re-poll");
                return;
            }
            Err(QueueError::Communication(msg)) => {
                self.comm_excursion(handle, msg).await;
                return;
            }
            Err(e) => {
                self.calculation_failure(handle, e.to_string()).await;
                return;
            }
        }

        let snapshot = handle.read().await.clone();
        let verdict = match self.optimizer.check_for_successful_output(&snapshot).await {
            Ok(v) => v,
            Err(e) => {
                self.calculation_failure(handle, e.to_string()).await;
                return;
            }
        };
        match verdict {
            OutputVerdict::Inconclusive => {
                // Output may still be in flight; poll again next pass.
            }
            OutputVerdict::Failure => {
                self.calculation_failure(handle, "failure marker found in output".into())
                    .await
            }
            OutputVerdict::Success => self.complete_step(handle).await,
        }
    }

    async fn complete_step(&self, handle: &Arc<StructureHandle>) {
        let filename = self.optimizer.completion_probe().filename;
        {
            let mut s = handle.write().await;
            s.stop_opt_timer();
            if let Err(e) = self
                .optimizer
                .read(&mut s, &filename, RecordMode::FirstEvaluation)
                .await
            {
                drop(s);
                self.calculation_failure(handle, e.to_string()).await;
                return;
            }
            s.reset_failures();
        }

        // Make sure the finished job is not tying up the queue.
        if let Err(e) = self.queue.stop_job(handle).await {
            debug!(structure = %handle.id(), error = %e, "stop_job after completion failed");
        }

        let (step, max) = {
            let s = handle.read().await;
            (s.current_opt_step, self.optimizer.num_opt_steps())
        };
        if step < max {
            {
                let mut s = handle.write().await;
                s.current_opt_step += 1;
                s.job_id = 0;
            }
            // The next step needs freshly interpreted input files.
            self.prepare(handle).await;
        } else {
            {
                let mut s = handle.write().await;
                s.job_id = 0;
            }
            self.transition(handle, JobState::Success).await;
            self.events
                .emit(Some(handle.id()), SearchEventKind::StructureFinished);
        }
    }

    /// Record one failed communication attempt and schedule the retry, or
    /// demote to terminal Error once the excursion budget is spent.
    async fn comm_excursion(&self, handle: &Arc<StructureHandle>, message: String) {
        let attempt = {
            let mut s = handle.write().await;
            if s.state != JobState::CommunicationError {
                s.resume_state = Some(s.state);
            }
            s.comm_failures += 1;
            s.comm_failures
        };
        self.events.emit(
            Some(handle.id()),
            SearchEventKind::CommunicationFailure {
                attempt,
                message: message.clone(),
            },
        );
        if attempt > self.options.comm_retry_limit {
            self.terminal_error(
                handle,
                format!("communication retries exhausted after {attempt} attempts: {message}"),
            )
            .await;
            return;
        }
        let backoff = self.options.comm_backoff(attempt);
        {
            let mut s = handle.write().await;
            s.next_comm_retry =
                Some(Utc::now() + chrono::Duration::milliseconds(backoff.as_millis() as i64));
        }
        self.transition(handle, JobState::CommunicationError).await;
    }

    /// CommunicationError -> prior state once a poll succeeds again.
    async fn retry_communication(&self, handle: &Arc<StructureHandle>) {
        let (due, resume) = {
            let s = handle.read().await;
            let due = s
                .next_comm_retry
                .map(|t| Utc::now() >= t)
                .unwrap_or(true);
            (due, s.resume_state.unwrap_or(JobState::Submitted))
        };
        if !due {
            return;
        }
        let probe = self.optimizer.completion_probe();
        match self.queue.get_status(handle, &probe).await {
            Err(QueueError::Communication(msg)) => self.comm_excursion(handle, msg).await,
            Err(e) => self.calculation_failure(handle, e.to_string()).await,
            Ok(status) => {
                {
                    let mut s = handle.write().await;
                    s.comm_failures = 0;
                    s.resume_state = None;
                    s.next_comm_retry = None;
                }
                // Restore the pre-excursion trajectory, then apply the
                // fresh status on top of it.
                self.transition(handle, resume).await;
                self.apply_status(handle, status).await;
            }
        }
    }

    /// A calculation (not transport) failure: count it and move to Error;
    /// the Error handler decides resubmit-vs-terminal on the next pass.
    async fn calculation_failure(&self, handle: &Arc<StructureHandle>, message: String) {
        warn!(structure = %handle.id(), %message, "calculation failure");
        {
            let mut s = handle.write().await;
            s.add_failure();
            s.stop_opt_timer();
        }
        self.transition(handle, JobState::Error).await;
    }

    /// Error-state pass: attempt job-name reclaim, then resubmit or apply
    /// the configured fail action.
    async fn handle_error(&self, handle: &Arc<StructureHandle>) {
        if handle.read().await.error_terminal {
            return;
        }

        // The job occasionally lives on under its name even though the
        // status query lost track of the id.
        if self.options.reclaim_job_names && self.queue.is_remote() {
            if let Ok(lines) = self.queue.get_queue_list(false).await {
                let name = handle.read().await.job_name();
                if let Some(job_id) = reclaim_job_id(&lines, &name) {
                    warn!(structure = %handle.id(), job_id, "reclaiming queued job by name");
                    {
                        let mut s = handle.write().await;
                        s.job_id = job_id;
                        s.fail_count = s.fail_count.saturating_sub(1);
                    }
                    self.transition(handle, JobState::Running).await;
                    return;
                }
            }
        }

        let fails = handle.read().await.fail_count;
        if fails < self.options.fail_limit {
            self.resubmit(handle).await;
            return;
        }
        match self.options.fail_action {
            FailAction::Terminate => {
                self.terminal_error(handle, format!("failure limit reached ({fails})"))
                    .await
            }
            FailAction::KeepTrying => self.resubmit(handle).await,
            FailAction::Kill => self.kill(handle).await,
            FailAction::Replace => {
                self.events.emit(
                    Some(handle.id()),
                    SearchEventKind::ReplacementRequested {
                        reason: format!("failure limit reached ({fails})"),
                    },
                );
                {
                    let mut s = handle.write().await;
                    s.reset_failures();
                    s.job_id = 0;
                    s.current_opt_step = 1;
                    s.history.clear();
                }
                self.transition(handle, JobState::Unoptimized).await;
            }
        }
    }

    /// Resubmit at the current step: rewrite inputs, then wait for a slot.
    async fn resubmit(&self, handle: &Arc<StructureHandle>) {
        if let Err(e) = self.queue.stop_job(handle).await {
            debug!(structure = %handle.id(), error = %e, "stop_job before resubmission failed");
        }
        {
            let mut s = handle.write().await;
            s.job_id = 0;
        }
        self.prepare(handle).await;
    }

    async fn terminal_error(&self, handle: &Arc<StructureHandle>, message: String) {
        if let Err(e) = self.queue.stop_job(handle).await {
            debug!(structure = %handle.id(), error = %e, "stop_job during terminal error failed");
        }
        {
            let mut s = handle.write().await;
            s.error_terminal = true;
            s.stop_opt_timer();
            s.job_id = 0;
        }
        self.transition(handle, JobState::Error).await;
        self.events
            .emit(Some(handle.id()), SearchEventKind::StructureFailed { message });
    }

    /// Set the structure's state and publish the transition. Terminal
    /// states are never left; a redundant transition emits nothing.
    async fn transition(&self, handle: &Arc<StructureHandle>, to: JobState) {
        let from = {
            let mut s = handle.write().await;
            let from = s.state;
            if from == to || from.is_terminal() {
                return;
            }
            s.state = to;
            from
        };
        self.events
            .emit(Some(handle.id()), SearchEventKind::StateChanged { from, to });
    }
}

fn take_slot(slots: &AtomicUsize) -> bool {
    slots
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

/// Find a queue line whose fields contain `job_name` and parse the leading
/// job id. Queue listings start each entry with the job id, possibly
/// suffixed (`123.hostname`).
fn reclaim_job_id(lines: &[String], job_name: &str) -> Option<u64> {
    for line in lines {
        let mut fields = line.split_whitespace();
        let first = match fields.next() {
            Some(f) => f,
            None => continue,
        };
        if fields.any(|f| f == job_name) {
            let digits: String = first.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(id) = digits.parse::<u64>() {
                if id != 0 {
                    return Some(id);
                }
            }
        }
    }
    None
}
