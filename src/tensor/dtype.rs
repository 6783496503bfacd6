//! Element types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::KernelArg;

/// Element type of a device tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I32,
}

impl DType {
    pub const ALL: [DType; 3] = [DType::F32, DType::F64, DType::I32];

    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 => 8,
        }
    }

    /// Suffix used in kernel entry names
    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
        }
    }

    /// Smallest finite value, the identity of a max-reduction
    pub fn lowest(&self) -> f64 {
        match self {
            DType::F32 => f32::MIN as f64,
            DType::F64 => f64::MIN,
            DType::I32 => i32::MIN as f64,
        }
    }

    /// Largest finite value, the identity of a min-reduction
    pub fn highest(&self) -> f64 {
        match self {
            DType::F32 => f32::MAX as f64,
            DType::F64 => f64::MAX,
            DType::I32 => i32::MAX as f64,
        }
    }

    /// `value` as a by-value kernel parameter of this type
    pub fn scalar_arg(&self, value: f64) -> KernelArg {
        match self {
            DType::F32 => KernelArg::F32(value as f32),
            DType::F64 => KernelArg::F64(value),
            DType::I32 => KernelArg::I32(value as i32),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
