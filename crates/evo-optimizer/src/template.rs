//! Template storage and `%keyword%` interpretation.
//!
//! Templates are plain text with embedded `%keyword%` placeholders. An
//! unresolved placeholder is a hard error: a half-substituted input file
//! must never reach a compute cluster.
use indexmap::IndexMap;

use evo_core::OptimizerError;
use evo_domain::{element, Structure};

use crate::program::UserStrings;

/// Ordered map of template filename -> one body per optimization step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateSet {
    files: IndexMap<String, Vec<String>>,
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filename with one body per optimization step.
    pub fn insert(&mut self, filename: impl Into<String>, step_bodies: Vec<String>) {
        self.files.insert(filename.into(), step_bodies);
    }

    /// Register a single-step template.
    pub fn insert_single(&mut self, filename: impl Into<String>, body: impl Into<String>) {
        self.files.insert(filename.into(), vec![body.into()]);
    }

    /// Append one more optimization step to an existing filename.
    pub fn append_step(
        &mut self,
        filename: &str,
        body: impl Into<String>,
    ) -> Result<(), OptimizerError> {
        match self.files.get_mut(filename) {
            Some(bodies) => {
                bodies.push(body.into());
                Ok(())
            }
            None => Err(OptimizerError::MissingTemplate(filename.to_string())),
        }
    }

    pub fn filenames(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of optimization steps: the longest per-file step list.
    pub fn num_opt_steps(&self) -> usize {
        self.files.values().map(|v| v.len()).max().unwrap_or(0)
    }

    /// Template body for `filename` at 1-based `step`. Files with fewer
    /// steps than the set's maximum reuse their last body.
    pub fn get(&self, filename: &str, step: usize) -> Result<&str, OptimizerError> {
        let bodies = self
            .files
            .get(filename)
            .ok_or_else(|| OptimizerError::MissingTemplate(filename.to_string()))?;
        let max = self.num_opt_steps();
        if step == 0 || step > max {
            return Err(OptimizerError::OptStepOutOfRange { step, max });
        }
        let index = step.min(bodies.len()).saturating_sub(1);
        bodies
            .get(index)
            .map(|s| s.as_str())
            .ok_or_else(|| OptimizerError::MissingTemplate(filename.to_string()))
    }
}

/// Interpret one template body against a keyword map. `%` signs must come
/// in pairs delimiting a keyword.
pub fn interpret(
    template: &str,
    keywords: &IndexMap<String, String>,
    filename: &str,
) -> Result<String, OptimizerError> {
    let parts: Vec<&str> = template.split('%').collect();
    if parts.len() % 2 == 0 {
        return Err(OptimizerError::Parse(format!(
            "unbalanced '%' in template {filename}"
        )));
    }
    let mut out = String::with_capacity(template.len());
    for (i, part) in parts.iter().enumerate() {
        if i % 2 == 0 {
            out.push_str(part);
        } else {
            match keywords.get(*part) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(OptimizerError::UnresolvedKeyword {
                        keyword: part.to_string(),
                        filename: filename.to_string(),
                    })
                }
            }
        }
    }
    Ok(out)
}

/// Build the keyword map for one structure.
///
/// `cellMatrix` and `rempath` are only present when the structure has a
/// cell or a remote directory; a template referencing them otherwise
/// fails with an unresolved-keyword error, which is intended.
pub fn substitution_map(
    s: &Structure,
    user: &UserStrings,
    description: &str,
) -> Result<IndexMap<String, String>, OptimizerError> {
    let mut map = IndexMap::new();
    map.insert("description".to_string(), description.to_string());
    map.insert("user1".to_string(), user.user1.clone());
    map.insert("user2".to_string(), user.user2.clone());
    map.insert("user3".to_string(), user.user3.clone());
    map.insert("user4".to_string(), user.user4.clone());

    let mut coords = String::new();
    let mut coords_id = String::new();
    for (symbol, xyz) in s.symbols.iter().zip(&s.coords) {
        let z = element::atomic_number(symbol)
            .map_err(|e| OptimizerError::Parse(e.to_string()))?;
        coords.push_str(&format!(
            "{} {:.8} {:.8} {:.8}\n",
            symbol, xyz[0], xyz[1], xyz[2]
        ));
        coords_id.push_str(&format!(
            "{} {} {:.8} {:.8} {:.8}\n",
            symbol, z, xyz[0], xyz[1], xyz[2]
        ));
    }
    map.insert("coords".to_string(), coords);
    map.insert("coordsId".to_string(), coords_id);

    map.insert("numAtoms".to_string(), s.composition.num_atoms().to_string());
    map.insert(
        "numSpecies".to_string(),
        s.composition.num_species().to_string(),
    );
    map.insert("composition".to_string(), s.composition.formula());
    if let Some(cell) = &s.cell {
        map.insert("cellMatrix".to_string(), cell.to_string());
    }
    map.insert("filename".to_string(), s.local_dir.display().to_string());
    if let Some(rempath) = &s.remote_dir {
        map.insert("rempath".to_string(), rempath.clone());
    }
    map.insert("gen".to_string(), s.generation.to_string());
    map.insert("id".to_string(), s.id_number.to_string());
    map.insert("optStep".to_string(), s.current_opt_step.to_string());
    map.insert("jobName".to_string(), s.job_name());
    Ok(map)
}
