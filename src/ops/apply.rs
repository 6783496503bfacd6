//! Elementwise apply
//!
//! One grid-stride launch over every element of 1 to 3 same-shaped
//! operands. Operand 0 is written; the others are read.

use crate::backend::{KernelArg, LaunchConfig};
use crate::error::{ForgeError, ForgeResult};
use crate::kernels::{apply_entry, CompiledKernel, TemplateKind};
use crate::tensor::DeviceTensor;

use super::{check_operands, index_arg, Dispatch};

pub const APPLY_BLOCK_SIZE: u32 = 256;

/// Geometry for `elements` items, `None` when there is nothing to do
pub fn plan_apply(elements: usize, multiprocessors: u32) -> Option<LaunchConfig> {
    if elements == 0 {
        return None;
    }
    let grid = elements
        .div_ceil(APPLY_BLOCK_SIZE as usize)
        .min(4 * multiprocessors as usize)
        .max(1);
    Some(LaunchConfig::linear(grid as u32, APPLY_BLOCK_SIZE, 0))
}

/// Run `kernel` over `operands`, passing `scalars` after them
pub fn launch_apply(
    dispatch: &Dispatch<'_>,
    kernel: &CompiledKernel,
    operands: &[&DeviceTensor],
    scalars: &[f64],
) -> ForgeResult<()> {
    let first = match operands.first() {
        Some(first) => *first,
        None => {
            return Err(ForgeError::InvalidTensor(
                "elementwise apply needs at least one operand".to_string(),
            ))
        }
    };
    if let Some(t) = operands.iter().find(|t| t.sizes() != first.sizes()) {
        return Err(ForgeError::InvalidTensor(format!(
            "operand shapes differ: {:?} vs {:?}",
            first.sizes(),
            t.sizes()
        )));
    }
    check_operands(dispatch, kernel, TemplateKind::Apply, operands)?;
    let template = dispatch.library.template(kernel.template())?;
    if scalars.len() != template.scalars() {
        return Err(ForgeError::InvalidTensor(format!(
            "template '{}' takes {} scalar(s), got {}",
            template.name(),
            template.scalars(),
            scalars.len()
        )));
    }

    let config = match plan_apply(first.numel(), dispatch.ctx.multiprocessor_count()) {
        Some(config) => config,
        None => return Ok(()),
    };

    let width = kernel.specialization().index_width();
    let dtype = first.dtype();
    let mut args: Vec<KernelArg> = Vec::with_capacity(2 * operands.len() + 1 + scalars.len());
    for t in operands {
        args.push(t.storage().ptr().into());
        args.push(t.layout().encode_info(width)?.into());
    }
    args.push(index_arg(width, first.numel())?);
    args.extend(scalars.iter().map(|&s| dtype.scalar_arg(s)));

    let entry = apply_entry(kernel.template(), dtype);
    dispatch.launch(kernel, &entry, &config, &args)
}
