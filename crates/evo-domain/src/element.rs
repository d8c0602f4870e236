//! Minimal element table used for template substitutions that need atomic
//! numbers. Covers H through Rn; exotic species fail with `UnknownElement`.
use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::DomainError;

static SYMBOLS: &[&str] = &[
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn",
];

static BY_SYMBOL: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    SYMBOLS
        .iter()
        .enumerate()
        .map(|(i, s)| (*s, i as u32 + 1))
        .collect()
});

/// Atomic number for an element symbol.
pub fn atomic_number(symbol: &str) -> Result<u32, DomainError> {
    BY_SYMBOL
        .get(symbol)
        .copied()
        .ok_or_else(|| DomainError::UnknownElement(symbol.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_symbols_resolve() {
        assert_eq!(atomic_number("H").unwrap(), 1);
        assert_eq!(atomic_number("Ti").unwrap(), 22);
        assert_eq!(atomic_number("O").unwrap(), 8);
    }

    #[test]
    fn unknown_symbol_is_an_error() {
        assert_eq!(
            atomic_number("Xx"),
            Err(DomainError::UnknownElement("Xx".into()))
        );
    }
}
