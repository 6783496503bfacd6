//! Specialization descriptors
//!
//! A [`Specialization`] classifies the operands of one kernel call by index
//! width and per-operand contiguity. Each distinct descriptor becomes one
//! compiled kernel variant.

use std::fmt;

use crate::error::{ForgeError, ForgeResult};
use crate::tensor::{DType, DeviceTensor, TensorLayout};

/// Offsets and element counts must stay below this for 32-bit indexing
pub const U32_INDEX_LIMIT: u64 = 1 << 32;

/// Integer type used for index arithmetic inside the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexWidth {
    U32,
    U64,
}

impl IndexWidth {
    pub fn c_type(&self) -> &'static str {
        match self {
            IndexWidth::U32 => "uint32_t",
            IndexWidth::U64 => "uint64_t",
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            IndexWidth::U32 => 4,
            IndexWidth::U64 => 8,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            IndexWidth::U32 => "u32",
            IndexWidth::U64 => "u64",
        }
    }
}

/// How an operand's elements are addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum TensorClass {
    /// Dense row-major; the linear index is the offset
    FullyContiguous,
    /// Arbitrary strides, resolved dimension by dimension
    Generic,
}

impl TensorClass {
    pub const ALL: [TensorClass; 2] = [TensorClass::FullyContiguous, TensorClass::Generic];

    fn tag(&self) -> char {
        match self {
            TensorClass::FullyContiguous => 'c',
            TensorClass::Generic => 'g',
        }
    }

    fn of(layout: &TensorLayout) -> Self {
        if layout.is_contiguous() {
            TensorClass::FullyContiguous
        } else {
            TensorClass::Generic
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Specialization {
    index: IndexWidth,
    classes: Vec<TensorClass>,
}

impl Specialization {
    pub fn new(index: IndexWidth, classes: Vec<TensorClass>) -> Self {
        Specialization { index, classes }
    }

    /// Descriptor for operands given as layouts with their element size.
    ///
    /// 32-bit indexing only when every operand has fewer than 2^32 elements
    /// and a maximum byte offset below 2^32. Otherwise 64-bit, and all
    /// operands share one class: contiguous if all are, generic if not.
    pub fn for_layouts(operands: &[(&TensorLayout, usize)]) -> Self {
        let fits_u32 = operands.iter().all(|(layout, elem_size)| {
            (layout.numel() as u64) < U32_INDEX_LIMIT
                && (layout.max_byte_offset(*elem_size) as u64) < U32_INDEX_LIMIT
        });
        if fits_u32 {
            let classes = operands
                .iter()
                .map(|(layout, _)| TensorClass::of(layout))
                .collect();
            return Specialization::new(IndexWidth::U32, classes);
        }
        let class = if operands.iter().all(|(layout, _)| layout.is_contiguous()) {
            TensorClass::FullyContiguous
        } else {
            TensorClass::Generic
        };
        Specialization::new(IndexWidth::U64, vec![class; operands.len()])
    }

    /// Descriptor for device tensors; they must share one dtype
    pub fn for_operands(operands: &[&DeviceTensor]) -> ForgeResult<Self> {
        let dtype: Option<DType> = operands.first().map(|t| t.dtype());
        if let Some(dtype) = dtype {
            if let Some(other) = operands.iter().find(|t| t.dtype() != dtype) {
                return Err(ForgeError::InvalidTensor(format!(
                    "mixed operand dtypes {} and {}",
                    dtype,
                    other.dtype()
                )));
            }
        }
        let layouts: Vec<(&TensorLayout, usize)> = operands
            .iter()
            .map(|t| (t.layout(), t.dtype().size()))
            .collect();
        Ok(Self::for_layouts(&layouts))
    }

    pub fn index_width(&self) -> IndexWidth {
        self.index
    }

    pub fn classes(&self) -> &[TensorClass] {
        &self.classes
    }

    pub fn arity(&self) -> usize {
        self.classes.len()
    }

    /// Suffix appended to entry names, e.g. `_u32_cg`
    pub fn suffix(&self) -> String {
        let mut suffix = format!("_{}", self.index.tag());
        if !self.classes.is_empty() {
            suffix.push('_');
            suffix.extend(self.classes.iter().map(TensorClass::tag));
        }
        suffix
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix()[1..])
    }
}

/// Entry point name of `base` compiled for `spec`
pub fn mangled_name(base: &str, spec: &Specialization) -> String {
    format!("{}{}", base, spec.suffix())
}

/// Every descriptor an operation of `arity` operands can produce: the two
/// 64-bit classes plus each contiguity combination under 32-bit indexing,
/// `2 + 2^arity` in total. With no operands the classes coincide, leaving
/// one descriptor per index width.
pub fn all_specializations(arity: usize) -> Vec<Specialization> {
    let all_classes = TensorClass::ALL;
    let wide_classes = if arity == 0 { &all_classes[..1] } else { &all_classes[..] };
    let mut all = Vec::with_capacity(wide_classes.len() + (1usize << arity));
    for &class in wide_classes {
        all.push(Specialization::new(IndexWidth::U64, vec![class; arity]));
    }
    for mask in 0..(1usize << arity) {
        let classes = (0..arity)
            .map(|i| {
                if mask & (1 << i) == 0 {
                    TensorClass::FullyContiguous
                } else {
                    TensorClass::Generic
                }
            })
            .collect();
        all.push(Specialization::new(IndexWidth::U32, classes));
    }
    all
}
