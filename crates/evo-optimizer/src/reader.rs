//! Output reading seam.
//!
//! Full file-format parsing (VASP OUTCAR, GULP .got, ...) belongs to the
//! format-reader collaborators; the scheduler core only needs final
//! energies. `KeywordEnergyReader` covers the common "last line carrying
//! a key, last float on the line" convention of quantum-chemistry codes.
use evo_core::OptimizerError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedOutput {
    pub energy: f64,
    pub enthalpy: Option<f64>,
}

pub trait OutputReader: Send + Sync {
    fn parse(&self, content: &str) -> Result<ParsedOutput, OptimizerError>;
}

/// Scans for the last line containing `energy_key` and takes the last
/// numeric token on it; same for the optional enthalpy key.
#[derive(Debug, Clone)]
pub struct KeywordEnergyReader {
    pub energy_key: String,
    pub enthalpy_key: Option<String>,
}

impl KeywordEnergyReader {
    pub fn new(energy_key: impl Into<String>) -> Self {
        KeywordEnergyReader {
            energy_key: energy_key.into(),
            enthalpy_key: None,
        }
    }

    pub fn with_enthalpy_key(mut self, key: impl Into<String>) -> Self {
        self.enthalpy_key = Some(key.into());
        self
    }

    fn last_value_for(content: &str, key: &str) -> Option<f64> {
        content
            .lines()
            .filter(|line| line.contains(key))
            .last()
            .and_then(|line| {
                line.split_whitespace()
                    .rev()
                    .find_map(|token| token.parse::<f64>().ok())
            })
    }
}

impl OutputReader for KeywordEnergyReader {
    fn parse(&self, content: &str) -> Result<ParsedOutput, OptimizerError> {
        let energy = Self::last_value_for(content, &self.energy_key).ok_or_else(|| {
            OptimizerError::Parse(format!(
                "no line matching {:?} with a numeric value",
                self.energy_key
            ))
        })?;
        let enthalpy = self
            .enthalpy_key
            .as_ref()
            .and_then(|key| Self::last_value_for(content, key));
        Ok(ParsedOutput { energy, enthalpy })
    }
}
