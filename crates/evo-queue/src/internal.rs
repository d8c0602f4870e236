//! Internal queue: evaluation runs in-process on a blocking thread
//! instead of as an external program. Pairs with an in-process optimizer
//! whose completion marker appears in the body written by the runner.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;

use evo_core::optimizer::{EvalOutcome, InProcessRunner};
use evo_core::{
    CompletionProbe, OutputVerdict, QueueError, QueueInterface, QueueStatus, StructureHandle,
};
use evo_domain::JobState;

struct JobSlot {
    result: Option<Result<EvalOutcome, String>>,
    output_written: bool,
}

pub struct InternalQueue {
    runner: Arc<dyn InProcessRunner>,
    jobs: DashMap<u64, Arc<Mutex<JobSlot>>>,
    next_job_id: AtomicU64,
}

impl InternalQueue {
    pub fn new(runner: Arc<dyn InProcessRunner>) -> Self {
        InternalQueue {
            runner,
            jobs: DashMap::new(),
            next_job_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl QueueInterface for InternalQueue {
    fn name(&self) -> &str {
        "Internal"
    }

    fn is_ready_to_search(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn write_input_files(
        &self,
        s: &StructureHandle,
        files: &IndexMap<String, String>,
    ) -> Result<(), QueueError> {
        let dir = s.read().await.local_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;
        for (name, content) in files {
            tokio::fs::write(dir.join(name), content).await?;
        }
        Ok(())
    }

    async fn start_job(&self, s: &StructureHandle) -> Result<u64, QueueError> {
        let snapshot = s.read().await.clone();
        let slot = Arc::new(Mutex::new(JobSlot {
            result: None,
            output_written: false,
        }));
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        self.jobs.insert(job_id, slot.clone());

        let runner = Arc::clone(&self.runner);
        tokio::task::spawn_blocking(move || {
            let result = runner.evaluate(&snapshot);
            if let Ok(mut guard) = slot.lock() {
                guard.result = Some(result);
            }
        });
        Ok(job_id)
    }

    async fn stop_job(&self, s: &StructureHandle) -> Result<(), QueueError> {
        // The blocking evaluation cannot be interrupted; dropping the slot
        // just makes its result unobservable.
        let job_id = s.read().await.job_id;
        if job_id != 0 {
            self.jobs.remove(&job_id);
        }
        Ok(())
    }

    async fn get_status(
        &self,
        s: &StructureHandle,
        probe: &CompletionProbe,
    ) -> Result<QueueStatus, QueueError> {
        let (job_id, state, dir) = {
            let st = s.read().await;
            (st.job_id, st.state, st.local_dir.clone())
        };
        if job_id == 0 && state != JobState::Submitted {
            return Ok(QueueStatus::Error);
        }
        let slot = match self.jobs.get(&job_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(QueueStatus::Error),
        };

        let (result, written) = {
            let guard = slot.lock().map_err(|_| {
                QueueError::Io("internal job slot poisoned".to_string())
            })?;
            (guard.result.clone(), guard.output_written)
        };
        match result {
            None => Ok(QueueStatus::Running),
            Some(Err(message)) => {
                tracing::warn!(job_id, %message, "in-process evaluation failed");
                Ok(QueueStatus::Error)
            }
            Some(Ok(outcome)) => {
                if !written {
                    tokio::fs::create_dir_all(&dir).await?;
                    tokio::fs::write(dir.join(&probe.filename), &outcome.output_body).await?;
                    if let Ok(mut guard) = slot.lock() {
                        guard.output_written = true;
                    }
                }
                Ok(match probe.scan(&outcome.output_body) {
                    OutputVerdict::Success => QueueStatus::Success,
                    _ => QueueStatus::Error,
                })
            }
        }
    }

    async fn get_queue_list(&self, _forced: bool) -> Result<Vec<String>, QueueError> {
        Ok(self
            .jobs
            .iter()
            .map(|e| format!("{} internal", e.key()))
            .collect())
    }

    async fn copy_remote_to_local_cache(&self, _s: &StructureHandle) -> Result<(), QueueError> {
        Ok(())
    }
}
