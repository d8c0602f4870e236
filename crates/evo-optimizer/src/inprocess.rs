//! In-process optimizer: evaluation happens inside this process via an
//! injected energy model, paired with the Internal queue variant. The
//! runner writes a small report file so the regular completion-marker
//! flow applies unchanged.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;

use evo_core::optimizer::{EvalOutcome, InProcessRunner};
use evo_core::{CompletionProbe, Optimizer, OptimizerError, OutputVerdict};
use evo_domain::{OptRecord, RecordMode, Structure};

use crate::reader::{KeywordEnergyReader, OutputReader};

pub const OUTPUT_FILENAME: &str = "eval.out";
pub const COMPLETION_MARKER: &str = "evaluation converged";
pub const FAILURE_MARKER: &str = "evaluation failed";
const ENERGY_KEY: &str = "Final energy";

/// Energy evaluation collaborator. The actual physics lives outside the
/// scheduler core.
pub trait EnergyModel: Send + Sync {
    fn energy(&self, s: &Structure) -> Result<f64, String>;
}

pub struct InProcessOptimizer {
    model: Arc<dyn EnergyModel>,
    reader: KeywordEnergyReader,
}

impl InProcessOptimizer {
    pub fn new(model: Arc<dyn EnergyModel>) -> Self {
        InProcessOptimizer {
            model,
            reader: KeywordEnergyReader::new(ENERGY_KEY),
        }
    }
}

#[async_trait]
impl Optimizer for InProcessOptimizer {
    fn name(&self) -> &str {
        "InProcess"
    }

    fn num_opt_steps(&self) -> usize {
        1
    }

    fn template_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn interpreted_templates(
        &self,
        _s: &Structure,
    ) -> Result<IndexMap<String, String>, OptimizerError> {
        // No input files: the evaluation reads the structure directly.
        Ok(IndexMap::new())
    }

    fn completion_probe(&self) -> CompletionProbe {
        CompletionProbe::new(OUTPUT_FILENAME)
            .with_completion_marker(COMPLETION_MARKER)
            .with_failure_marker(FAILURE_MARKER)
    }

    async fn check_for_successful_output(
        &self,
        s: &Structure,
    ) -> Result<OutputVerdict, OptimizerError> {
        let path = s.local_dir.join(OUTPUT_FILENAME);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(self.completion_probe().scan(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OutputVerdict::Inconclusive),
            Err(e) => Err(OptimizerError::Io(e.to_string())),
        }
    }

    async fn read(
        &self,
        s: &mut Structure,
        filename: &str,
        mode: RecordMode,
    ) -> Result<(), OptimizerError> {
        let path = s.local_dir.join(filename);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OptimizerError::Io(format!("{}: {}", path.display(), e)))?;
        let parsed = self.reader.parse(&content)?;
        s.record_opt_result(
            OptRecord {
                step: s.current_opt_step,
                energy: parsed.energy,
                enthalpy: parsed.enthalpy,
                recorded_at: Utc::now(),
            },
            mode,
        );
        Ok(())
    }
}

impl InProcessRunner for InProcessOptimizer {
    fn evaluate(&self, s: &Structure) -> Result<EvalOutcome, String> {
        match self.model.energy(s) {
            Ok(energy) => Ok(EvalOutcome {
                energy,
                enthalpy: None,
                output_body: format!("{COMPLETION_MARKER}\n{ENERGY_KEY} = {energy}\n"),
            }),
            Err(message) => Err(message),
        }
    }
}
