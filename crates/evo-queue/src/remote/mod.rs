//! Remote queue backends: shared plumbing over a per-scheduler adapter.
mod adapter;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use evo_core::{
    CompletionProbe, OutputVerdict, QueueError, QueueInterface, QueueStatus, StructureHandle,
};
use evo_domain::JobState;

use crate::pool::{ConnectionHandle, ConnectionPool, PoolError};
use crate::snapshot::SnapshotCache;
use crate::transport::TransportError;

pub use adapter::{LoadLeveler, Lsf, Pbs, QueueCode, SchedulerAdapter, Sge, Slurm};

pub type PbsQueue = RemoteQueue<Pbs>;
pub type SgeQueue = RemoteQueue<Sge>;
pub type LsfQueue = RemoteQueue<Lsf>;
pub type SlurmQueue = RemoteQueue<Slurm>;
pub type LoadLevelerQueue = RemoteQueue<LoadLeveler>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteQueueConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Base directory on the remote host; each structure gets a
    /// subdirectory named after its tag.
    pub remote_base_dir: String,
    /// Local working-directory root (pre-flight checked for writability).
    pub local_base_dir: std::path::PathBuf,
    /// Empty strings fall back to the adapter defaults.
    pub submit_command: String,
    pub status_command: String,
    pub cancel_command: String,
    /// Queue-snapshot refresh interval.
    pub refresh_interval_ms: u64,
    /// Remove the remote working directory when a job is stopped.
    pub clean_remote_on_stop: bool,
}

impl Default for RemoteQueueConfig {
    fn default() -> Self {
        RemoteQueueConfig {
            host: String::new(),
            user: String::new(),
            port: 22,
            remote_base_dir: String::new(),
            local_base_dir: std::path::PathBuf::from("."),
            submit_command: String::new(),
            status_command: String::new(),
            cancel_command: String::new(),
            refresh_interval_ms: 1000,
            clean_remote_on_stop: false,
        }
    }
}

pub struct RemoteQueue<A: SchedulerAdapter> {
    adapter: A,
    config: RemoteQueueConfig,
    pool: Arc<ConnectionPool>,
    snapshot: SnapshotCache,
}

fn comm(e: TransportError) -> QueueError {
    QueueError::Communication(e.to_string())
}

fn pool_err(e: PoolError) -> QueueError {
    match e {
        PoolError::Closed => QueueError::Communication("connection pool closed".into()),
        PoolError::Factory(msg) => QueueError::Configuration(msg),
    }
}

impl<A: SchedulerAdapter> RemoteQueue<A> {
    pub fn new(adapter: A, mut config: RemoteQueueConfig, pool: Arc<ConnectionPool>) -> Self {
        if config.submit_command.is_empty() {
            config.submit_command = adapter.default_submit_command().to_string();
        }
        if config.status_command.is_empty() {
            config.status_command = adapter.default_status_command().to_string();
        }
        if config.cancel_command.is_empty() {
            config.cancel_command = adapter.default_cancel_command().to_string();
        }
        let snapshot = SnapshotCache::new(Duration::from_millis(config.refresh_interval_ms));
        RemoteQueue {
            adapter,
            config,
            pool,
            snapshot,
        }
    }

    pub fn config(&self) -> &RemoteQueueConfig {
        &self.config
    }

    fn remote_dir_for(&self, tag: &str) -> String {
        format!("{}/{}", self.config.remote_base_dir.trim_end_matches('/'), tag)
    }

    async fn connection(&self) -> Result<ConnectionHandle, QueueError> {
        self.pool.acquire().await.map_err(pool_err)
    }

    /// Grep the remote output file for probe markers. Exit code 0 means
    /// found, 1 not found, anything else a communication problem.
    async fn remote_scan(
        &self,
        conn: &mut ConnectionHandle,
        remote_dir: &str,
        probe: &CompletionProbe,
    ) -> Result<OutputVerdict, QueueError> {
        let path = format!("{}/{}", remote_dir, probe.filename);
        for (markers, verdict) in [
            (&probe.failure_markers, OutputVerdict::Failure),
            (&probe.completion_markers, OutputVerdict::Success),
        ] {
            for marker in markers.iter() {
                let command = format!("grep '{}' \"{}\"", marker.replace('\'', "'\\''"), path);
                let out = conn.execute(&command).await.map_err(comm)?;
                match out.exit_code {
                    0 => return Ok(verdict),
                    1 => continue,
                    code => {
                        return Err(QueueError::Communication(format!(
                            "grep exited with {} for {}: {}",
                            code, path, out.stderr
                        )))
                    }
                }
            }
        }
        Ok(OutputVerdict::Inconclusive)
    }
}

#[async_trait]
impl<A: SchedulerAdapter> QueueInterface for RemoteQueue<A> {
    fn name(&self) -> &str {
        self.adapter.name()
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn is_ready_to_search(&self) -> Result<(), QueueError> {
        if self.config.host.is_empty() {
            return Err(QueueError::Configuration(format!(
                "hostname of the {} server is not set",
                self.adapter.name()
            )));
        }
        if self.config.user.is_empty() {
            return Err(QueueError::Configuration(
                "remote username is not set".into(),
            ));
        }
        if self.config.remote_base_dir.is_empty() {
            return Err(QueueError::Configuration(
                "remote working directory is not set".into(),
            ));
        }
        for (what, value) in [
            ("submit", &self.config.submit_command),
            ("status", &self.config.status_command),
            ("cancel", &self.config.cancel_command),
        ] {
            if value.is_empty() {
                return Err(QueueError::Configuration(format!(
                    "{} command is not set",
                    what
                )));
            }
        }
        std::fs::create_dir_all(&self.config.local_base_dir).map_err(|e| {
            QueueError::Configuration(format!(
                "cannot create local working directory {}: {}",
                self.config.local_base_dir.display(),
                e
            ))
        })?;
        Ok(())
    }

    async fn write_input_files(
        &self,
        s: &StructureHandle,
        files: &IndexMap<String, String>,
    ) -> Result<(), QueueError> {
        let (local_dir, tag) = {
            let st = s.read().await;
            (st.local_dir.clone(), st.tag())
        };
        tokio::fs::create_dir_all(&local_dir).await?;
        for (name, content) in files {
            tokio::fs::write(local_dir.join(name), content).await?;
        }

        let remote_dir = self.remote_dir_for(&tag);
        let mut conn = self.connection().await?;
        conn.mkdir_p(&remote_dir).await.map_err(comm)?;
        for name in files.keys() {
            let remote_path = format!("{}/{}", remote_dir, name);
            conn.upload(&local_dir.join(name), &remote_path)
                .await
                .map_err(comm)?;
        }
        drop(conn);

        s.write().await.remote_dir = Some(remote_dir);
        Ok(())
    }

    async fn start_job(&self, s: &StructureHandle) -> Result<u64, QueueError> {
        let (tag, remote_dir) = {
            let st = s.read().await;
            (st.tag(), st.remote_dir.clone())
        };
        let remote_dir = remote_dir.unwrap_or_else(|| self.remote_dir_for(&tag));
        let command = format!(
            "cd \"{}\" && {}",
            remote_dir,
            self.adapter.submit_invocation(&self.config.submit_command)
        );
        let mut conn = self.connection().await?;
        let out = conn.execute(&command).await.map_err(comm)?;
        drop(conn);
        if out.exit_code != 0 {
            return Err(QueueError::Submission(format!(
                "`{}` exited with {}: {}",
                command, out.exit_code, out.stderr
            )));
        }
        self.adapter.parse_job_id(&out.stdout).ok_or_else(|| {
            QueueError::Submission(format!(
                "cannot parse job id from submit output: {:?}",
                out.stdout
            ))
        })
    }

    async fn stop_job(&self, s: &StructureHandle) -> Result<(), QueueError> {
        let (job_id, tag, remote_dir) = {
            let st = s.read().await;
            (st.job_id, st.tag(), st.remote_dir.clone())
        };
        let mut conn = self.connection().await?;
        if job_id != 0 {
            let command = format!("{} {}", self.config.cancel_command, job_id);
            match conn.execute(&command).await {
                Ok(out) if out.exit_code != 0 => {
                    // Most likely the job already left the queue.
                    debug!(job_id, stderr = %out.stderr, "cancel command reported failure");
                }
                Ok(_) => {}
                Err(e) => {
                    drop(conn);
                    return Err(comm(e));
                }
            }
        }
        if self.config.clean_remote_on_stop {
            let dir = remote_dir.unwrap_or_else(|| self.remote_dir_for(&tag));
            if let Err(e) = conn.remove_dir_all(&dir).await {
                warn!(%dir, error = %e, "failed to clean remote directory");
            }
        }
        Ok(())
    }

    async fn get_status(
        &self,
        s: &StructureHandle,
        probe: &CompletionProbe,
    ) -> Result<QueueStatus, QueueError> {
        let (job_id, state, tag, remote_dir) = {
            let st = s.read().await;
            (st.job_id, st.state, st.tag(), st.remote_dir.clone())
        };
        // A cached communication failure surfaces here for every poller
        // within the refresh interval.
        let lines = self.get_queue_list(false).await?;

        if job_id == 0 && state != JobState::Submitted {
            return Ok(QueueStatus::Error);
        }
        let code = self.adapter.classify(&lines, job_id);
        let remote_dir = remote_dir.unwrap_or_else(|| self.remote_dir_for(&tag));
        let output_path = format!("{}/{}", remote_dir, probe.filename);

        if state == JobState::Submitted {
            return match code {
                QueueCode::Unlisted => {
                    let mut conn = self.connection().await?;
                    let exists = conn.exists(&output_path).await.map_err(comm)?;
                    if exists {
                        // Finished before the queue listing ever saw it.
                        Ok(QueueStatus::Running)
                    } else {
                        Ok(QueueStatus::Unknown)
                    }
                }
                QueueCode::Queued => Ok(QueueStatus::Queued),
                _ => Ok(QueueStatus::Running),
            };
        }

        match code {
            QueueCode::Running => Ok(QueueStatus::Running),
            QueueCode::Queued => Ok(QueueStatus::Queued),
            QueueCode::Unknown => Ok(QueueStatus::Unknown),
            QueueCode::Unlisted => {
                // The job left the queue. Did it write output?
                let mut conn = self.connection().await?;
                let exists = conn.exists(&output_path).await.map_err(comm)?;
                if !exists {
                    // Vanished without output; restart is the only option.
                    debug!(%tag, job_id, "job missing from queue with no output");
                    return Ok(QueueStatus::Error);
                }
                match self.remote_scan(&mut conn, &remote_dir, probe).await? {
                    OutputVerdict::Success => Ok(QueueStatus::Success),
                    _ => Ok(QueueStatus::Error),
                }
            }
        }
    }

    async fn get_queue_list(&self, forced: bool) -> Result<Vec<String>, QueueError> {
        self.snapshot
            .get(forced, || async {
                let mut conn = self.connection().await?;
                let command = self
                    .adapter
                    .status_invocation(&self.config.status_command, &self.config.user);
                let out = conn.execute(&command).await.map_err(comm)?;
                // Like grep, many status commands exit 1 for "no jobs".
                if out.exit_code != 0 && out.exit_code != 1 {
                    return Err(QueueError::Communication(format!(
                        "`{}` exited with {}: {}",
                        command, out.exit_code, out.stderr
                    )));
                }
                Ok(out
                    .stdout
                    .lines()
                    .map(|l| l.to_string())
                    .filter(|l| !l.trim().is_empty())
                    .collect())
            })
            .await
    }

    async fn copy_remote_to_local_cache(&self, s: &StructureHandle) -> Result<(), QueueError> {
        let (local_dir, tag, remote_dir) = {
            let st = s.read().await;
            (st.local_dir.clone(), st.tag(), st.remote_dir.clone())
        };
        let remote_dir = remote_dir.unwrap_or_else(|| self.remote_dir_for(&tag));
        tokio::fs::create_dir_all(&local_dir).await?;

        let mut conn = self.connection().await?;
        let names = conn.list_dir(&remote_dir).await.map_err(comm)?;
        for name in names {
            let remote_path = format!("{}/{}", remote_dir, name);
            let local_path = local_dir.join(&name);
            conn.download(&remote_path, &local_path).await.map_err(comm)?;

            let expected = conn.file_size(&remote_path).await.map_err(comm)?;
            let got = file_len(&local_path).await?;
            if got != expected {
                return Err(QueueError::PartialTransfer {
                    file: name,
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }
}

async fn file_len(path: &Path) -> Result<u64, QueueError> {
    Ok(tokio::fs::metadata(path).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ExecOutput, SessionFactory, Transport};
    use evo_domain::{Composition, Structure};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport that serves scripted responses and records commands.
    struct ScriptedTransport {
        shared: Arc<ScriptState>,
    }

    #[derive(Default)]
    struct ScriptState {
        exec: Mutex<VecDeque<Result<ExecOutput, String>>>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptState {
        fn push_ok(&self, stdout: &str, exit_code: i32) {
            self.exec.lock().unwrap().push_back(Ok(ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code,
            }));
        }

        fn push_err(&self, msg: &str) {
            self.exec.lock().unwrap().push_back(Err(msg.to_string()));
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
            self.shared.commands.lock().unwrap().push(command.to_string());
            match self.shared.exec.lock().unwrap().pop_front() {
                Some(Ok(out)) => Ok(out),
                Some(Err(msg)) => Err(TransportError::Exec(msg)),
                None => Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                }),
            }
        }

        async fn upload(&mut self, _local: &Path, _remote: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn download(&mut self, _remote: &str, _local: &Path) -> Result<(), TransportError> {
            Ok(())
        }

        async fn exists(&mut self, _remote: &str) -> Result<bool, TransportError> {
            Ok(false)
        }

        async fn mkdir_p(&mut self, _remote: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn remove_dir_all(&mut self, _remote: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn list_dir(&mut self, _remote: &str) -> Result<Vec<String>, TransportError> {
            Ok(Vec::new())
        }

        async fn file_size(&mut self, _remote: &str) -> Result<u64, TransportError> {
            Ok(0)
        }
    }

    struct ScriptedFactory {
        shared: Arc<ScriptState>,
    }

    #[async_trait]
    impl SessionFactory for ScriptedFactory {
        async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
            Ok(Box::new(ScriptedTransport {
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    fn queue_with_script(
        script: Arc<ScriptState>,
    ) -> (SlurmQueue, Arc<StructureHandle>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(2, Box::new(ScriptedFactory { shared: script }));
        let config = RemoteQueueConfig {
            host: "cluster.example.org".into(),
            user: "alice".into(),
            remote_base_dir: "/scratch/alice/search".into(),
            local_base_dir: tmp.path().to_path_buf(),
            refresh_interval_ms: 0,
            ..Default::default()
        };
        let queue = RemoteQueue::new(Slurm, config, pool);
        let s = Structure::new(
            2,
            5,
            Composition::from_pairs(&[("Si", 2)]),
            vec!["Si".into(), "Si".into()],
            vec![[0.0; 3], [1.3, 1.3, 1.3]],
            None,
            tmp.path().join("2x5"),
        )
        .unwrap();
        (queue, StructureHandle::new(s), tmp)
    }

    #[tokio::test]
    async fn start_job_parses_slurm_job_id() {
        let script = Arc::new(ScriptState::default());
        script.push_ok("Submitted batch job 7741\n", 0);
        let (queue, handle, _tmp) = queue_with_script(script.clone());

        let job_id = queue.start_job(&handle).await.unwrap();
        assert_eq!(job_id, 7741);
        let commands = script.commands();
        assert!(commands[0].contains("cd \"/scratch/alice/search/2x5\""));
        assert!(commands[0].contains("sbatch job.slurm"));
    }

    #[tokio::test]
    async fn start_job_submit_failure_is_submission_error() {
        let script = Arc::new(ScriptState::default());
        script.push_ok("", 1);
        let (queue, handle, _tmp) = queue_with_script(script);
        match queue.start_job(&handle).await {
            Err(QueueError::Submission(_)) => {}
            other => panic!("expected submission error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn transport_failure_during_status_is_communication_error() {
        let script = Arc::new(ScriptState::default());
        script.push_err("connection reset");
        let (queue, handle, _tmp) = queue_with_script(script);
        {
            let mut s = handle.write().await;
            s.job_id = 7741;
            s.state = JobState::Running;
        }
        let probe = CompletionProbe::new("xtal.out").with_completion_marker("Final");
        match queue.get_status(&handle, &probe).await {
            Err(QueueError::Communication(_)) => {}
            other => panic!("expected communication error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn running_job_is_classified_from_listing() {
        let script = Arc::new(ScriptState::default());
        script.push_ok("JOBID PARTITION NAME USER ST TIME\n7741 debug 2x5-1 alice R 0:05\n", 0);
        let (queue, handle, _tmp) = queue_with_script(script);
        {
            let mut s = handle.write().await;
            s.job_id = 7741;
            s.state = JobState::Submitted;
        }
        let probe = CompletionProbe::new("xtal.out").with_completion_marker("Final");
        let status = queue.get_status(&handle, &probe).await.unwrap();
        assert_eq!(status, QueueStatus::Running);
    }

    #[tokio::test]
    async fn stop_job_with_no_job_id_is_a_no_op() {
        let script = Arc::new(ScriptState::default());
        let (queue, handle, _tmp) = queue_with_script(script.clone());
        queue.stop_job(&handle).await.unwrap();
        assert!(script.commands().is_empty());
    }
}
