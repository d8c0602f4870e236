//! Opaque remote-execution capability.
//!
//! The scheduler never speaks a wire protocol itself: every remote
//! operation goes through a `Transport`, and the default implementation
//! shells out to user-configurable commands (`ssh`-style execution
//! prefix, `scp`-style copy templates). With an empty prefix all
//! operations run against the local machine, which is what tests and
//! single-host setups use.
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("remote execution failed: {0}")]
    Exec(String),
    #[error("file transfer failed: {0}")]
    Transfer(String),
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A live remote session. Methods take `&mut self`: a session is owned by
/// exactly one caller at a time (enforced by the connection pool).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&mut self, command: &str) -> Result<ExecOutput, TransportError>;
    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError>;
    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError>;
    async fn exists(&mut self, remote: &str) -> Result<bool, TransportError>;
    async fn mkdir_p(&mut self, remote: &str) -> Result<(), TransportError>;
    async fn remove_dir_all(&mut self, remote: &str) -> Result<(), TransportError>;
    /// Plain filenames (not paths) of regular files in `remote`.
    async fn list_dir(&mut self, remote: &str) -> Result<Vec<String>, TransportError>;
    async fn file_size(&mut self, remote: &str) -> Result<u64, TransportError>;
}

/// Builds sessions for the connection pool. Called lazily: on first use
/// and whenever a discarded session must be replaced.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Shell-command transport configuration. `exec_prefix` is prepended to
/// every command (e.g. `["ssh", "-p", "22", "user@host"]`); empty means
/// local execution through `sh -c`. Copy templates use `{local}` and
/// `{remote}` placeholders; when absent, files are copied through the
/// local filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellTransportConfig {
    pub exec_prefix: Vec<String>,
    pub upload_template: Option<String>,
    pub download_template: Option<String>,
}

/// Transport that shells out for every operation.
#[derive(Debug, Clone)]
pub struct ShellTransport {
    config: ShellTransportConfig,
}

impl ShellTransport {
    pub fn new(config: ShellTransportConfig) -> Self {
        ShellTransport { config }
    }

    /// Local transport: all "remote" operations run on this machine.
    pub fn local() -> Self {
        ShellTransport {
            config: ShellTransportConfig::default(),
        }
    }

    async fn run(&self, command: &str) -> Result<ExecOutput, TransportError> {
        let mut cmd = if self.config.exec_prefix.is_empty() {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(command);
            c
        } else {
            let mut c = tokio::process::Command::new(&self.config.exec_prefix[0]);
            c.args(&self.config.exec_prefix[1..]).arg(command);
            c
        };
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = cmd
            .output()
            .await
            .map_err(|e| TransportError::Exec(e.to_string()))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_copy(&self, template: &str, local: &Path, remote: &str) -> Result<(), TransportError> {
        let command = template
            .replace("{local}", &local.display().to_string())
            .replace("{remote}", remote);
        let out = self.run(&command).await?;
        if out.exit_code != 0 {
            return Err(TransportError::Transfer(format!(
                "`{}` exited with {}: {}",
                command, out.exit_code, out.stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ShellTransport {
    async fn execute(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        self.run(command).await
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        match &self.config.upload_template {
            Some(template) => self.run_copy(&template.clone(), local, remote).await,
            None => {
                if let Some(parent) = Path::new(remote).parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| TransportError::Transfer(e.to_string()))?;
                }
                tokio::fs::copy(local, remote)
                    .await
                    .map(|_| ())
                    .map_err(|e| TransportError::Transfer(e.to_string()))
            }
        }
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<(), TransportError> {
        match &self.config.download_template {
            Some(template) => self.run_copy(&template.clone(), local, remote).await,
            None => {
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| TransportError::Transfer(e.to_string()))?;
                }
                tokio::fs::copy(remote, local)
                    .await
                    .map(|_| ())
                    .map_err(|e| TransportError::Transfer(e.to_string()))
            }
        }
    }

    async fn exists(&mut self, remote: &str) -> Result<bool, TransportError> {
        let out = self.run(&format!("test -e \"{}\"", remote)).await?;
        Ok(out.exit_code == 0)
    }

    async fn mkdir_p(&mut self, remote: &str) -> Result<(), TransportError> {
        let out = self.run(&format!("mkdir -p \"{}\"", remote)).await?;
        if out.exit_code != 0 {
            return Err(TransportError::Exec(format!(
                "mkdir -p {} failed: {}",
                remote, out.stderr
            )));
        }
        Ok(())
    }

    async fn remove_dir_all(&mut self, remote: &str) -> Result<(), TransportError> {
        let out = self.run(&format!("rm -rf \"{}\"", remote)).await?;
        if out.exit_code != 0 {
            return Err(TransportError::Exec(format!(
                "rm -rf {} failed: {}",
                remote, out.stderr
            )));
        }
        Ok(())
    }

    async fn list_dir(&mut self, remote: &str) -> Result<Vec<String>, TransportError> {
        let out = self
            .run(&format!("ls -1p \"{}\" | grep -v '/$'", remote))
            .await?;
        // grep exits 1 when the directory is empty
        if out.exit_code != 0 && out.exit_code != 1 {
            return Err(TransportError::Exec(format!(
                "listing {} failed: {}",
                remote, out.stderr
            )));
        }
        Ok(out
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn file_size(&mut self, remote: &str) -> Result<u64, TransportError> {
        let out = self.run(&format!("wc -c < \"{}\"", remote)).await?;
        if out.exit_code != 0 {
            return Err(TransportError::Exec(format!(
                "sizing {} failed: {}",
                remote, out.stderr
            )));
        }
        out.stdout
            .trim()
            .parse::<u64>()
            .map_err(|e| TransportError::Exec(format!("unparsable size for {}: {}", remote, e)))
    }
}

/// Factory producing `ShellTransport` sessions.
pub struct ShellSessionFactory {
    config: ShellTransportConfig,
}

impl ShellSessionFactory {
    pub fn new(config: ShellTransportConfig) -> Self {
        ShellSessionFactory { config }
    }

    pub fn local() -> Self {
        ShellSessionFactory {
            config: ShellTransportConfig::default(),
        }
    }
}

#[async_trait]
impl SessionFactory for ShellSessionFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(ShellTransport::new(self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_execute_captures_output_and_exit_code() {
        let mut t = ShellTransport::local();
        let out = t.execute("echo hello && exit 3").await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn local_file_operations_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let remote = dir.path().join("sub/file.txt");
        let remote_str = remote.display().to_string();
        let mut t = ShellTransport::local();

        assert!(!t.exists(&remote_str).await.unwrap());
        let local = dir.path().join("input.txt");
        tokio::fs::write(&local, "payload").await.unwrap();
        t.upload(&local, &remote_str).await.unwrap();
        assert!(t.exists(&remote_str).await.unwrap());
        assert_eq!(t.file_size(&remote_str).await.unwrap(), 7);

        let sub = dir.path().join("sub").display().to_string();
        let listed = t.list_dir(&sub).await.unwrap();
        assert_eq!(listed, vec!["file.txt".to_string()]);

        let back = dir.path().join("back.txt");
        t.download(&remote_str, &back).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&back).await.unwrap(), "payload");
    }
}
