use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{DomainError, JobState};

/// Chemical composition as symbol -> atom count. BTreeMap keeps the
/// formula and the content hash deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Composition(BTreeMap<String, u32>);

impl Composition {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn from_pairs(pairs: &[(&str, u32)]) -> Self {
        Self(pairs.iter().map(|(s, n)| (s.to_string(), *n)).collect())
    }

    pub fn insert(&mut self, symbol: &str, count: u32) {
        self.0.insert(symbol.to_string(), count);
    }

    pub fn num_species(&self) -> usize {
        self.0.len()
    }

    pub fn num_atoms(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.0.iter()
    }

    /// Hill-style formula string, e.g. `O4 Ti2`.
    pub fn formula(&self) -> String {
        self.0
            .iter()
            .map(|(s, n)| format!("{}{}", s, n))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 3x3 lattice matrix in Angstrom, row vectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cell(pub [[f64; 3]; 3]);

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.0 {
            writeln!(f, "{:.8} {:.8} {:.8}", row[0], row[1], row[2])?;
        }
        Ok(())
    }
}

/// One entry of a structure's optimization history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptRecord {
    pub step: usize,
    pub energy: f64,
    pub enthalpy: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// How a parsed result enters the history.
///
/// `FirstEvaluation` replaces any stale record for the same step (e.g. from
/// a failed run that was resubmitted); `Continuation` appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    FirstEvaluation,
    Continuation,
}

/// A candidate configuration tracked through the job lifecycle.
///
/// The population manager owns structures; the scheduler only reads and
/// mutates the job-state fields below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Structure {
    pub id: Uuid,
    pub generation: u32,
    pub id_number: u32,
    pub composition: Composition,
    /// Per-atom element symbols, parallel to `coords`.
    pub symbols: Vec<String>,
    pub coords: Vec<[f64; 3]>,
    pub cell: Option<Cell>,
    /// Local working directory for this structure's job files.
    pub local_dir: PathBuf,
    /// Remote working directory (remote queue variants only).
    pub remote_dir: Option<String>,
    /// Current optimization step, 1-based.
    pub current_opt_step: usize,
    /// Scheduler-assigned job identifier; 0 = no job.
    pub job_id: u64,
    pub state: JobState,
    /// Set when an `Error` state is final (failure budget spent or a
    /// configuration error); the scheduler takes no further action.
    pub error_terminal: bool,
    /// Calculation failures at the current step.
    pub fail_count: u32,
    /// Consecutive communication failures in the current excursion.
    pub comm_failures: u32,
    /// State to restore after a CommunicationError excursion resolves.
    pub resume_state: Option<JobState>,
    /// Earliest instant the next communication retry may run.
    pub next_comm_retry: Option<DateTime<Utc>>,
    opt_timer_started: Option<DateTime<Utc>>,
    opt_elapsed_secs: f64,
    pub history: Vec<OptRecord>,
}

impl Structure {
    pub fn new(
        generation: u32,
        id_number: u32,
        composition: Composition,
        symbols: Vec<String>,
        coords: Vec<[f64; 3]>,
        cell: Option<Cell>,
        local_dir: PathBuf,
    ) -> Result<Self, DomainError> {
        if symbols.len() != coords.len() {
            return Err(DomainError::ValidationError(format!(
                "symbol/coordinate count mismatch: {} vs {}",
                symbols.len(),
                coords.len()
            )));
        }
        Ok(Structure {
            id: Uuid::new_v4(),
            generation,
            id_number,
            composition,
            symbols,
            coords,
            cell,
            local_dir,
            remote_dir: None,
            current_opt_step: 1,
            job_id: 0,
            state: JobState::Unoptimized,
            error_terminal: false,
            fail_count: 0,
            comm_failures: 0,
            resume_state: None,
            next_comm_retry: None,
            opt_timer_started: None,
            opt_elapsed_secs: 0.0,
            history: Vec::new(),
        })
    }

    /// Human-readable tag, `<generation>x<id>`.
    pub fn tag(&self) -> String {
        format!("{}x{}", self.generation, self.id_number)
    }

    /// Job name used on remote schedulers; includes the opt step so a
    /// resubmitted step is distinguishable in queue listings.
    pub fn job_name(&self) -> String {
        format!("{}-{}", self.tag(), self.current_opt_step)
    }

    /// Content hash over composition, coordinates and cell. Stable across
    /// job-state changes; used by collaborators for duplicate detection.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.composition.formula().as_bytes());
        for (sym, xyz) in self.symbols.iter().zip(&self.coords) {
            hasher.update(sym.as_bytes());
            for v in xyz {
                hasher.update(v.to_bits().to_le_bytes());
            }
        }
        if let Some(cell) = &self.cell {
            for row in &cell.0 {
                for v in row {
                    hasher.update(v.to_bits().to_le_bytes());
                }
            }
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn start_opt_timer(&mut self) {
        self.opt_timer_started = Some(Utc::now());
    }

    pub fn stop_opt_timer(&mut self) {
        if let Some(started) = self.opt_timer_started.take() {
            let delta = Utc::now().signed_duration_since(started);
            self.opt_elapsed_secs += delta.num_milliseconds() as f64 / 1000.0;
        }
    }

    /// Accumulated wall-clock seconds spent in external optimization.
    pub fn optimization_elapsed_secs(&self) -> f64 {
        match self.opt_timer_started {
            Some(started) => {
                let delta = Utc::now().signed_duration_since(started);
                self.opt_elapsed_secs + delta.num_milliseconds() as f64 / 1000.0
            }
            None => self.opt_elapsed_secs,
        }
    }

    /// Record a parsed optimization result.
    ///
    /// `FirstEvaluation` removes any existing records for the same step
    /// before appending, so a resubmitted step never duplicates history;
    /// `Continuation` appends unconditionally.
    pub fn record_opt_result(&mut self, record: OptRecord, mode: RecordMode) {
        if mode == RecordMode::FirstEvaluation {
            self.history.retain(|r| r.step != record.step);
        }
        self.history.push(record);
    }

    /// Latest recorded energy, if any.
    pub fn current_energy(&self) -> Option<f64> {
        self.history.last().map(|r| r.energy)
    }

    /// Latest recorded enthalpy, if any.
    pub fn current_enthalpy(&self) -> Option<f64> {
        self.history.last().and_then(|r| r.enthalpy)
    }

    /// True once the scheduler has nothing left to do for this structure.
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal() || (self.state == JobState::Error && self.error_terminal)
    }

    pub fn add_failure(&mut self) {
        self.fail_count += 1;
    }

    pub fn reset_failures(&mut self) {
        self.fail_count = 0;
    }
}
