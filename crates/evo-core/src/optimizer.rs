//! Optimizer contract: adapters to external (or in-process) programs that
//! relax and evaluate a structure.
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use evo_domain::{RecordMode, Structure};

use crate::errors::OptimizerError;
use crate::queue::CompletionProbe;

/// Verdict of a completion-marker scan.
///
/// `Inconclusive` means the check could not decide: the output file is
/// absent or carries no marker yet, which happens routinely while the
/// remote process is still writing. The scheduler polls again rather than
/// declaring an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputVerdict {
    Success,
    Failure,
    Inconclusive,
}

/// How the Local queue runs this program: command line plus stdio
/// redirection filenames relative to the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRunSpec {
    pub command: String,
    pub args: Vec<String>,
    pub stdin_file: Option<String>,
    pub stdout_file: Option<String>,
    pub stderr_file: Option<String>,
}

impl LocalRunSpec {
    pub fn new(command: impl Into<String>) -> Self {
        LocalRunSpec {
            command: command.into(),
            args: Vec::new(),
            stdin_file: None,
            stdout_file: None,
            stderr_file: None,
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn stdin(mut self, f: impl Into<String>) -> Self {
        self.stdin_file = Some(f.into());
        self
    }

    pub fn stdout(mut self, f: impl Into<String>) -> Self {
        self.stdout_file = Some(f.into());
        self
    }

    pub fn stderr(mut self, f: impl Into<String>) -> Self {
        self.stderr_file = Some(f.into());
        self
    }
}

/// Adapter to one external program (or an in-process evaluator).
#[async_trait]
pub trait Optimizer: Send + Sync {
    /// Short identifier, e.g. "VASP", "GULP".
    fn name(&self) -> &str;

    /// Number of optimization steps in the relaxation pipeline.
    fn num_opt_steps(&self) -> usize;

    /// Filenames of all required templates.
    fn template_names(&self) -> Vec<String>;

    /// Render every required template for the structure's current opt
    /// step. Any unresolved `%keyword%` placeholder is a hard error and
    /// no partial result is returned.
    fn interpreted_templates(
        &self,
        s: &Structure,
    ) -> Result<IndexMap<String, String>, OptimizerError>;

    /// Completion-detection rule for this program's output.
    fn completion_probe(&self) -> CompletionProbe;

    /// Command used when running under the Local queue. `None` for
    /// programs that only run remotely or in-process.
    fn local_run_spec(&self) -> Option<LocalRunSpec> {
        None
    }

    /// Scan the locally cached output for completion markers. Repeated
    /// calls against an unchanged file return the same verdict.
    async fn check_for_successful_output(
        &self,
        s: &Structure,
    ) -> Result<OutputVerdict, OptimizerError>;

    /// Parse final energy/enthalpy from `filename` (relative to the
    /// structure's local directory) and update the optimization history
    /// according to `mode`.
    async fn read(
        &self,
        s: &mut Structure,
        filename: &str,
        mode: RecordMode,
    ) -> Result<(), OptimizerError>;
}

/// In-process evaluation outcome, produced by `InProcessRunner::evaluate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    pub energy: f64,
    pub enthalpy: Option<f64>,
    /// Body written to the completion output file; must contain the
    /// optimizer's completion marker on success.
    pub output_body: String,
}

/// CPU-bound in-process evaluation, used by the Internal queue variant.
/// Runs on a blocking thread; must not touch the filesystem.
pub trait InProcessRunner: Send + Sync {
    fn evaluate(&self, s: &Structure) -> Result<EvalOutcome, String>;
}
