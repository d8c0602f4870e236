//! Local queue: jobs are child processes on this machine.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use evo_core::{
    CompletionProbe, LocalRunSpec, OutputVerdict, QueueError, QueueInterface, QueueStatus,
    StructureHandle,
};
use evo_domain::JobState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalQueueConfig {
    /// Root under which structure working directories live; must be
    /// writable.
    pub base_dir: PathBuf,
    /// Archive the run directory of failed structures under
    /// `errorDirs/` when their job is stopped.
    pub log_error_dirs: bool,
}

impl Default for LocalQueueConfig {
    fn default() -> Self {
        LocalQueueConfig {
            base_dir: PathBuf::from("."),
            log_error_dirs: false,
        }
    }
}

struct LocalJob {
    child: tokio::process::Child,
    exit: Option<std::process::ExitStatus>,
}

pub struct LocalQueue {
    config: LocalQueueConfig,
    run_spec: LocalRunSpec,
    processes: DashMap<u64, Mutex<LocalJob>>,
    next_job_id: AtomicU64,
}

impl LocalQueue {
    /// `run_spec` comes from the optimizer's `local_run_spec()`.
    pub fn new(config: LocalQueueConfig, run_spec: LocalRunSpec) -> Self {
        LocalQueue {
            config,
            run_spec,
            processes: DashMap::new(),
            next_job_id: AtomicU64::new(1),
        }
    }

    fn poll_exit(&self, job_id: u64) -> Option<Option<std::process::ExitStatus>> {
        let entry = self.processes.get(&job_id)?;
        let mut job = match entry.value().lock() {
            Ok(j) => j,
            Err(_) => return None,
        };
        if job.exit.is_none() {
            if let Ok(Some(status)) = job.child.try_wait() {
                job.exit = Some(status);
            }
        }
        Some(job.exit)
    }

    async fn archive_error_dir(&self, local_dir: &Path, tag: &str) {
        let dest = self.config.base_dir.join("errorDirs").join(tag);
        if let Err(e) = copy_dir_files(local_dir, &dest).await {
            warn!(%tag, error = %e, "failed to archive error directory");
        }
    }
}

async fn copy_dir_files(src: &Path, dest: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::copy(entry.path(), dest.join(entry.file_name())).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl QueueInterface for LocalQueue {
    fn name(&self) -> &str {
        "Local"
    }

    fn is_ready_to_search(&self) -> Result<(), QueueError> {
        if self.run_spec.command.is_empty() {
            return Err(QueueError::Configuration(
                "local run command is not set".into(),
            ));
        }
        std::fs::create_dir_all(&self.config.base_dir).map_err(|e| {
            QueueError::Configuration(format!(
                "cannot create working directory {}: {}",
                self.config.base_dir.display(),
                e
            ))
        })?;
        let probe = self.config.base_dir.join(".queuetest");
        std::fs::write(&probe, b"ok").map_err(|e| {
            QueueError::Configuration(format!(
                "cannot write to working directory {}: {}",
                self.config.base_dir.display(),
                e
            ))
        })?;
        let _ = std::fs::remove_file(&probe);
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
        let dir = s.read().await.local_dir.clone();
        let mut cmd = tokio::process::Command::new(&self.run_spec.command);
        cmd.args(&self.run_spec.args).current_dir(&dir);

        match &self.run_spec.stdin_file {
            Some(f) => {
                let file = std::fs::File::open(dir.join(f)).map_err(|e| {
                    QueueError::Submission(format!("cannot open stdin file {}: {}", f, e))
                })?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        match &self.run_spec.stdout_file {
            Some(f) => {
                let file = std::fs::File::create(dir.join(f)).map_err(|e| {
                    QueueError::Submission(format!("cannot create stdout file {}: {}", f, e))
                })?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::null());
            }
        }
        match &self.run_spec.stderr_file {
            Some(f) => {
                let file = std::fs::File::create(dir.join(f)).map_err(|e| {
                    QueueError::Submission(format!("cannot create stderr file {}: {}", f, e))
                })?;
                cmd.stderr(Stdio::from(file));
            }
            None => {
                cmd.stderr(Stdio::null());
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| QueueError::Submission(format!("cannot spawn {}: {}", self.run_spec.command, e)))?;
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        self.processes
            .insert(job_id, Mutex::new(LocalJob { child, exit: None }));
        Ok(job_id)
    }

    async fn stop_job(&self, s: &StructureHandle) -> Result<(), QueueError> {
        let (job_id, state, dir, tag) = {
            let st = s.read().await;
            (st.job_id, st.state, st.local_dir.clone(), st.tag())
        };
        if self.config.log_error_dirs && state == JobState::Error {
            self.archive_error_dir(&dir, &tag).await;
        }
        if job_id == 0 {
            return Ok(());
        }
        if let Some((_, job)) = self.processes.remove(&job_id) {
            if let Ok(mut job) = job.into_inner() {
                if job.exit.is_none() {
                    let _ = job.child.start_kill();
                }
            }
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

        let exit = self.poll_exit(job_id);
        let output_path = dir.join(&probe.filename);

        let exit = match exit {
            None => {
                // No process on record. Either the job finished before we
                // could watch it, or the id is stale.
                if state == JobState::Submitted
                    && !tokio::fs::try_exists(&output_path).await.unwrap_or(false)
                {
                    // Still pending.
                    return Ok(QueueStatus::Unknown);
                }
                match tokio::fs::read_to_string(&output_path).await {
                    Ok(content) => {
                        return Ok(match probe.scan(&content) {
                            OutputVerdict::Success => QueueStatus::Success,
                            _ => QueueStatus::Error,
                        });
                    }
                    Err(_) => return Ok(QueueStatus::Error),
                }
            }
            Some(exit) => exit,
        };

        match exit {
            None => Ok(QueueStatus::Running),
            Some(status) if !status.success() => {
                warn!(job_id, code = ?status.code(), "local job exited with failure");
                Ok(QueueStatus::Error)
            }
            Some(_) => {
                // Exit code 0: the output file is final, so a missing
                // marker now means failure rather than "still writing".
                let content = tokio::fs::read_to_string(&output_path)
                    .await
                    .unwrap_or_default();
                Ok(match probe.scan(&content) {
                    OutputVerdict::Success => QueueStatus::Success,
                    _ => QueueStatus::Error,
                })
            }
        }
    }

    async fn get_queue_list(&self, _forced: bool) -> Result<Vec<String>, QueueError> {
        // No batch scheduler; synthesize a listing from the process table.
        Ok(self
            .processes
            .iter()
            .map(|e| format!("{} local", e.key()))
            .collect())
    }

    async fn copy_remote_to_local_cache(&self, _s: &StructureHandle) -> Result<(), QueueError> {
        // Outputs are already local.
        Ok(())
    }
}
