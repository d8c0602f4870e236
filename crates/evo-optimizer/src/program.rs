//! Data-driven external-program adapters.
//!
//! Each supported program is a `ProgramSpec` carrying its template set,
//! completion-detection rule and local run command; `ProgramOptimizer`
//! turns a spec into an `Optimizer`. Template bodies are user-supplied
//! (the constructors only declare the required filenames), and the queue
//! script template (`job.pbs`, `job.slurm`, ...) is added by the caller
//! for the queue in use.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use evo_core::{CompletionProbe, LocalRunSpec, Optimizer, OptimizerError, OutputVerdict};
use evo_domain::{OptRecord, RecordMode, Structure};

use crate::reader::OutputReader;
use crate::template::{interpret, substitution_map, TemplateSet};

/// Freeform values exposed to templates as `%user1%`..`%user4%`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStrings {
    pub user1: String,
    pub user2: String,
    pub user3: String,
    pub user4: String,
}

#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub name: String,
    pub templates: TemplateSet,
    pub completion_filename: String,
    pub completion_markers: Vec<String>,
    pub failure_markers: Vec<String>,
    /// Files worth retrieving for parsing, completion file first.
    pub output_filenames: Vec<String>,
    pub local_run: Option<LocalRunSpec>,
    pub user: UserStrings,
    pub description: String,
}

impl ProgramSpec {
    pub fn new(name: impl Into<String>, completion_filename: impl Into<String>) -> Self {
        let completion_filename = completion_filename.into();
        ProgramSpec {
            name: name.into(),
            templates: TemplateSet::new(),
            completion_filename: completion_filename.clone(),
            completion_markers: Vec::new(),
            failure_markers: Vec::new(),
            output_filenames: vec![completion_filename],
            local_run: None,
            user: UserStrings::default(),
            description: String::new(),
        }
    }

    pub fn with_template(mut self, filename: impl Into<String>, body: impl Into<String>) -> Self {
        self.templates.insert_single(filename, body);
        self
    }

    pub fn with_template_steps(
        mut self,
        filename: impl Into<String>,
        bodies: Vec<String>,
    ) -> Self {
        self.templates.insert(filename, bodies);
        self
    }

    pub fn with_completion_marker(mut self, marker: impl Into<String>) -> Self {
        self.completion_markers.push(marker.into());
        self
    }

    pub fn with_failure_marker(mut self, marker: impl Into<String>) -> Self {
        self.failure_markers.push(marker.into());
        self
    }

    pub fn with_local_run(mut self, spec: LocalRunSpec) -> Self {
        self.local_run = Some(spec);
        self
    }

    pub fn with_user_strings(mut self, user: UserStrings) -> Self {
        self.user = user;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn probe(&self) -> CompletionProbe {
        CompletionProbe {
            filename: self.completion_filename.clone(),
            completion_markers: self.completion_markers.clone(),
            failure_markers: self.failure_markers.clone(),
        }
    }

    // Named variants, with each program's conventional filenames and
    // completion markers.

    pub fn vasp() -> Self {
        ProgramSpec::new("VASP", "OUTCAR")
            .with_template("INCAR", "")
            .with_template("POSCAR", "")
            .with_template("KPOINTS", "")
            .with_template("POTCAR", "")
            .with_completion_marker("General timing and accounting informations for this job:")
    }

    pub fn gulp() -> Self {
        ProgramSpec::new("GULP", "xtal.got")
            .with_template("xtal.gin", "")
            .with_completion_marker("**** Optimisation achieved ****")
            .with_failure_marker("**** ERROR")
            .with_failure_marker("Conditions for a minimum have not been satisfied")
            .with_local_run(
                LocalRunSpec::new("gulp")
                    .stdin("xtal.gin")
                    .stdout("xtal.got"),
            )
    }

    pub fn castep() -> Self {
        ProgramSpec::new("CASTEP", "xtal.castep")
            .with_template("xtal.param", "")
            .with_template("xtal.cell", "")
            .with_completion_marker("Geometry optimization completed successfully.")
            .with_local_run(LocalRunSpec::new("castep").arg("xtal"))
    }

    pub fn pwscf() -> Self {
        ProgramSpec::new("PWscf", "xtal.out")
            .with_template("xtal.in", "")
            .with_completion_marker("Final")
    }

    pub fn siesta() -> Self {
        ProgramSpec::new("SIESTA", "xtal.out")
            .with_template("xtal.fdf", "")
            .with_completion_marker("siesta: Final energy (eV):")
            .with_local_run(
                LocalRunSpec::new("siesta")
                    .stdin("xtal.fdf")
                    .stdout("xtal.out"),
            )
    }

    pub fn gamess() -> Self {
        ProgramSpec::new("GAMESS", "job.gamout")
            .with_template("job.inp", "")
            .with_completion_marker("***** EQUILIBRIUM GEOMETRY LOCATED *****")
    }

    pub fn mopac() -> Self {
        ProgramSpec::new("MOPAC", "job.out")
            .with_template("job.mop", "")
            .with_completion_marker("          FINAL HEAT OF FORMATION =")
            .with_local_run(LocalRunSpec::new("mopac").arg("job"))
    }

    pub fn adf() -> Self {
        ProgramSpec::new("ADF", "job.adfout")
            .with_template("job.adfin", "")
            .with_completion_marker("GEOMETRY CONVERGED")
            .with_local_run(
                LocalRunSpec::new("adf")
                    .stdin("job.adfin")
                    .stdout("job.adfout")
                    .stderr("job.adferr"),
            )
    }

    pub fn gaussian() -> Self {
        ProgramSpec::new("Gaussian", "job.out")
            .with_template("job.com", "")
            .with_completion_marker("Optimization completed.")
            .with_local_run(
                LocalRunSpec::new("g09")
                    .stdin("job.com")
                    .stdout("job.out"),
            )
    }

    /// Fully user-configured program; templates, markers and run command
    /// are set by the caller.
    pub fn generic() -> Self {
        ProgramSpec::new("Generic", "job.out")
    }
}

pub struct ProgramOptimizer {
    spec: ProgramSpec,
    reader: Arc<dyn OutputReader>,
}

impl ProgramOptimizer {
    pub fn new(spec: ProgramSpec, reader: Arc<dyn OutputReader>) -> Self {
        ProgramOptimizer { spec, reader }
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }
}

#[async_trait]
impl Optimizer for ProgramOptimizer {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn num_opt_steps(&self) -> usize {
        self.spec.templates.num_opt_steps().max(1)
    }

    fn template_names(&self) -> Vec<String> {
        self.spec.templates.filenames()
    }

    fn interpreted_templates(
        &self,
        s: &Structure,
    ) -> Result<IndexMap<String, String>, OptimizerError> {
        let keywords = substitution_map(s, &self.spec.user, &self.spec.description)?;
        let mut rendered = IndexMap::new();
        for filename in self.spec.templates.filenames() {
            let body = self.spec.templates.get(&filename, s.current_opt_step)?;
            rendered.insert(filename.clone(), interpret(body, &keywords, &filename)?);
        }
        Ok(rendered)
    }

    fn completion_probe(&self) -> CompletionProbe {
        self.spec.probe()
    }

    fn local_run_spec(&self) -> Option<LocalRunSpec> {
        self.spec.local_run.clone()
    }

    async fn check_for_successful_output(
        &self,
        s: &Structure,
    ) -> Result<OutputVerdict, OptimizerError> {
        let path = s.local_dir.join(&self.spec.completion_filename);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(self.spec.probe().scan(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Not retrieved yet; the job may still be writing.
                Ok(OutputVerdict::Inconclusive)
            }
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
        tracing::debug!(
            program = %self.spec.name,
            structure = %s.tag(),
            energy = parsed.energy,
            "parsed optimization output"
        );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::KeywordEnergyReader;
    use evo_domain::Composition;
    use std::path::PathBuf;

    fn structure(dir: PathBuf) -> Structure {
        Structure::new(
            1,
            3,
            Composition::from_pairs(&[("Si", 2)]),
            vec!["Si".into(), "Si".into()],
            vec![[0.0; 3], [1.35, 1.35, 1.35]],
            None,
            dir,
        )
        .unwrap()
    }

    fn optimizer(spec: ProgramSpec) -> ProgramOptimizer {
        ProgramOptimizer::new(spec, Arc::new(KeywordEnergyReader::new("Final energy")))
    }

    #[test]
    fn named_variants_declare_their_files() {
        assert_eq!(
            ProgramSpec::vasp().templates.filenames(),
            vec!["INCAR", "POSCAR", "KPOINTS", "POTCAR"]
        );
        assert_eq!(ProgramSpec::gulp().completion_filename, "xtal.got");
        assert_eq!(
            ProgramSpec::gaussian().completion_markers,
            vec!["Optimization completed.".to_string()]
        );
        assert!(ProgramSpec::mopac().local_run.is_some());
    }

    #[test]
    fn interpreted_templates_render_all_files() {
        let spec = ProgramSpec::generic()
            .with_template("job.in", "structure %gen%x%id%\n%coords%")
            .with_template("job.sh", "run < job.in > job.out\n");
        let opt = optimizer(spec);
        let s = structure(PathBuf::from("/work/1x3"));
        let files = opt.interpreted_templates(&s).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files["job.in"].starts_with("structure 1x3\n"));
        assert!(files["job.in"].contains("Si"));
    }

    #[test]
    fn missing_substitution_fails_without_partial_result() {
        let spec = ProgramSpec::generic().with_template("job.in", "value %nope%\n");
        let opt = optimizer(spec);
        let s = structure(PathBuf::from("/work/1x3"));
        assert!(matches!(
            opt.interpreted_templates(&s),
            Err(OptimizerError::UnresolvedKeyword { .. })
        ));
    }

    #[tokio::test]
    async fn check_is_inconclusive_until_marker_appears_then_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("1x3");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let spec = ProgramSpec::generic().with_completion_marker("all converged");
        let opt = optimizer(spec);
        let s = structure(dir.clone());

        // No file at all yet.
        assert_eq!(
            opt.check_for_successful_output(&s).await.unwrap(),
            OutputVerdict::Inconclusive
        );
        // File exists but the marker has not been written yet.
        tokio::fs::write(dir.join("job.out"), "starting up\n").await.unwrap();
        assert_eq!(
            opt.check_for_successful_output(&s).await.unwrap(),
            OutputVerdict::Inconclusive
        );
        // Marker arrives; repeated checks agree.
        tokio::fs::write(dir.join("job.out"), "starting up\nall converged\n")
            .await
            .unwrap();
        assert_eq!(
            opt.check_for_successful_output(&s).await.unwrap(),
            OutputVerdict::Success
        );
        assert_eq!(
            opt.check_for_successful_output(&s).await.unwrap(),
            OutputVerdict::Success
        );
    }

    #[tokio::test]
    async fn read_records_exactly_one_history_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("1x3");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("job.out"), "Final energy = -7.25\n")
            .await
            .unwrap();

        let opt = optimizer(ProgramSpec::generic().with_completion_marker("x"));
        let mut s = structure(dir);
        opt.read(&mut s, "job.out", RecordMode::FirstEvaluation)
            .await
            .unwrap();
        assert_eq!(s.history.len(), 1);
        assert_eq!(s.current_energy(), Some(-7.25));

        // A resubmitted first evaluation replaces, not duplicates.
        opt.read(&mut s, "job.out", RecordMode::FirstEvaluation)
            .await
            .unwrap();
        assert_eq!(s.history.len(), 1);
    }
}
