//! Kernel configs
//!
//! A [`KernelConfig`] is the set of preprocessor definitions that realizes
//! one [`Specialization`] inside a template. It is ordered so that two
//! configs with the same pairs compare and hash equal regardless of how
//! they were built.

use std::collections::BTreeMap;
use std::fmt;

use super::specialization::{IndexWidth, Specialization, TensorClass};
use crate::error::{ForgeError, ForgeResult};

/// Macro carrying the index integer type
pub const INDEX_TYPE_MACRO: &str = "INDEX_TYPE";

/// Value of an operand macro for a contiguous operand
const CONTIGUOUS_DIMS: &str = "-2";
/// Value of an operand macro for a generic strided operand
const GENERIC_DIMS: &str = "-1";

/// Macro describing operand `i`: `DIMSA`, `DIMSB`, ...
pub fn operand_macro(i: usize) -> String {
    debug_assert!(i < 26, "operand index {} out of range", i);
    format!("DIMS{}", (b'A' + i as u8) as char)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelConfig {
    macros: BTreeMap<String, String>,
}

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specialization(spec: &Specialization) -> Self {
        let mut config =
            KernelConfig::new().with_macro(INDEX_TYPE_MACRO, spec.index_width().c_type());
        for (i, class) in spec.classes().iter().enumerate() {
            let value = match class {
                TensorClass::FullyContiguous => CONTIGUOUS_DIMS,
                TensorClass::Generic => GENERIC_DIMS,
            };
            config = config.with_macro(&operand_macro(i), value);
        }
        config
    }

    /// Recover the descriptor a config was built from
    pub fn to_specialization(&self) -> ForgeResult<Specialization> {
        let index = match self.get(INDEX_TYPE_MACRO) {
            Some("uint32_t") => IndexWidth::U32,
            Some("uint64_t") => IndexWidth::U64,
            Some(other) => {
                return Err(ForgeError::InvalidConfiguration(format!(
                    "unsupported {} '{}'",
                    INDEX_TYPE_MACRO, other
                )))
            }
            None => {
                return Err(ForgeError::InvalidConfiguration(format!(
                    "kernel config has no {}",
                    INDEX_TYPE_MACRO
                )))
            }
        };

        let mut classes = Vec::new();
        while let Some(value) = self.get(&operand_macro(classes.len())) {
            let class = match value {
                CONTIGUOUS_DIMS => TensorClass::FullyContiguous,
                GENERIC_DIMS => TensorClass::Generic,
                other => {
                    return Err(ForgeError::InvalidConfiguration(format!(
                        "unsupported {} '{}'",
                        operand_macro(classes.len()),
                        other
                    )))
                }
            };
            classes.push(class);
        }
        // Every macro must have been consumed
        if self.macros.len() != classes.len() + 1 {
            return Err(ForgeError::InvalidConfiguration(format!(
                "kernel config {} has gaps or unknown macros",
                self
            )));
        }
        Ok(Specialization::new(index, classes))
    }

    pub fn with_macro(mut self, name: &str, value: &str) -> Self {
        self.macros.insert(name.to_string(), value.to_string());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.macros.get(name).map(String::as_str)
    }

    pub fn macro_names(&self) -> impl Iterator<Item = &str> {
        self.macros.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    /// `#define` lines in name order
    pub fn defines(&self) -> String {
        self.macros
            .iter()
            .map(|(name, value)| format!("#define {} {}\n", name, value))
            .collect()
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .macros
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}
