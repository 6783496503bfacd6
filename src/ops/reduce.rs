//! Whole-tensor reduction dispatch
//!
//! Small inputs reduce in one block. Larger inputs take two passes: pass A
//! has each block write a partial result into the device scratch buffer,
//! pass B folds the partials into the output with one block of exactly
//! as many threads as pass A had blocks. Both passes are queued under the
//! device's scratch guard.

use crate::backend::{DeviceId, LaunchConfig};
use crate::error::{ForgeError, ForgeResult};
use crate::kernels::{reduce_entry, CompiledKernel, TemplateKind};
use crate::tensor::{DType, DeviceTensor};

use super::{check_operands, index_arg, Dispatch};

/// Inputs with more elements than this take the two-pass path
pub const TWO_PASS_THRESHOLD: usize = 2048;

/// Threads per block of the single pass and pass A
pub const REDUCE_BLOCK_SIZE: u32 = 1024;

/// Blocks per multiprocessor in pass A
const BLOCKS_PER_MULTIPROCESSOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducePass {
    SinglePass,
    /// Partial reduce into scratch
    TwoPassA,
    /// Finalize scratch into the output
    TwoPassB,
}

impl ReducePass {
    /// Pass component of the entry name
    pub fn entry_tag(&self) -> &'static str {
        match self {
            ReducePass::SinglePass => "single",
            ReducePass::TwoPassA => "pass1",
            ReducePass::TwoPassB => "pass2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceLaunch {
    pub pass: ReducePass,
    pub config: LaunchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducePlan {
    pub elements: usize,
    pub launches: Vec<ReduceLaunch>,
}

impl ReducePlan {
    pub fn is_two_pass(&self) -> bool {
        self.launches.len() == 2
    }

    /// Blocks writing partials in pass A, 0 for a single pass
    pub fn partials(&self) -> u32 {
        self.launches
            .iter()
            .find(|l| l.pass == ReducePass::TwoPassA)
            .map(|l| l.config.grid_dim.0)
            .unwrap_or(0)
    }
}

/// Choose the launches for reducing `elements` items of `elem_size` bytes.
///
/// Pass A uses `min(ceil(elements / block), scratch elements,
/// 4 × multiprocessors)` blocks, also capped at the block size since pass B
/// runs one thread per partial. Fails with `ScratchUnavailable` when the
/// two-pass path is needed and the scratch buffer cannot hold a partial.
pub fn plan_reduce(
    elements: usize,
    elem_size: usize,
    scratch_bytes: usize,
    multiprocessors: u32,
    device: DeviceId,
) -> ForgeResult<ReducePlan> {
    let block = REDUCE_BLOCK_SIZE as usize;
    if elements <= TWO_PASS_THRESHOLD {
        return Ok(ReducePlan {
            elements,
            launches: vec![ReduceLaunch {
                pass: ReducePass::SinglePass,
                config: LaunchConfig::linear(1, REDUCE_BLOCK_SIZE, (block * elem_size) as u32),
            }],
        });
    }

    let scratch_elements = scratch_bytes / elem_size.max(1);
    if scratch_elements == 0 {
        return Err(ForgeError::ScratchUnavailable { device });
    }
    let grid = elements
        .div_ceil(block)
        .min(scratch_elements)
        .min(BLOCKS_PER_MULTIPROCESSOR * multiprocessors as usize)
        .min(block)
        .max(1);

    Ok(ReducePlan {
        elements,
        launches: vec![
            ReduceLaunch {
                pass: ReducePass::TwoPassA,
                config: LaunchConfig::linear(
                    grid as u32,
                    REDUCE_BLOCK_SIZE,
                    (block * elem_size) as u32,
                ),
            },
            ReduceLaunch {
                pass: ReducePass::TwoPassB,
                config: LaunchConfig::linear(1, grid as u32, (grid * elem_size) as u32),
            },
        ],
    })
}

/// Where the accumulator of a reduction starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitPolicy {
    /// The caller's value
    #[default]
    Given,
    /// Lowest value of the element type
    MinValue,
    /// Highest value of the element type
    MaxValue,
}

impl InitPolicy {
    pub fn resolve(&self, given: f64, dtype: DType) -> f64 {
        match self {
            InitPolicy::Given => given,
            InitPolicy::MinValue => dtype.lowest(),
            InitPolicy::MaxValue => dtype.highest(),
        }
    }
}

/// Reduce all of `input` to a rank-0 tensor allocated on the dispatch
/// device. A rank-0 input is returned as is, without launching anything.
pub fn launch_reduce(
    dispatch: &Dispatch<'_>,
    kernel: &CompiledKernel,
    input: &DeviceTensor,
    init_value: f64,
    policy: InitPolicy,
) -> ForgeResult<DeviceTensor> {
    if input.rank() == 0 {
        return Ok(input.clone());
    }
    check_operands(dispatch, kernel, TemplateKind::Reduce, &[input])?;

    let ctx = dispatch.ctx;
    let dtype = input.dtype();
    let plan = plan_reduce(
        input.numel(),
        dtype.size(),
        ctx.scratch().bytes,
        ctx.multiprocessor_count(),
        ctx.device(),
    )?;

    let width = kernel.specialization().index_width();
    let info = input.layout().encode_info(width)?;
    let n = index_arg(width, input.numel())?;
    let init = dtype.scalar_arg(policy.resolve(init_value, dtype));
    let output = DeviceTensor::empty(ctx.allocator(), dtype, &[])?;

    tracing::debug!(
        "Reducing {} elements with {} ({} launch(es))",
        plan.elements,
        kernel.template(),
        plan.launches.len()
    );
    // Pass A and pass B reach the stream back to back
    let guard = plan.is_two_pass().then(|| ctx.lock_scratch()).transpose()?;
    let scratch = guard.as_ref().map(|g| g.space()).unwrap_or_default();
    for launch in &plan.launches {
        let args = match launch.pass {
            ReducePass::SinglePass => vec![
                output.storage().ptr().into(),
                input.storage().ptr().into(),
                info.clone().into(),
                n.clone(),
                init.clone(),
            ],
            ReducePass::TwoPassA => vec![
                scratch.ptr.into(),
                input.storage().ptr().into(),
                info.clone().into(),
                n.clone(),
                init.clone(),
            ],
            ReducePass::TwoPassB => vec![
                output.storage().ptr().into(),
                scratch.ptr.into(),
                index_arg(width, plan.partials() as usize)?,
                init.clone(),
            ],
        };
        let entry = reduce_entry(kernel.template(), launch.pass.entry_tag(), dtype);
        dispatch.launch(kernel, &entry, &launch.config, &args)?;
    }
    Ok(output)
}
