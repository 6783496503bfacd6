//! Tensor operations
//!
//! Launch planning and argument marshalling for the built-in templates.
//! Both kinds of operation go through a [`Dispatch`], which resolves an
//! entry point of a compiled kernel in one device context and queues it.

pub mod apply;
pub mod reduce;

pub use apply::{launch_apply, plan_apply, APPLY_BLOCK_SIZE};
pub use reduce::{
    launch_reduce, plan_reduce, InitPolicy, ReduceLaunch, ReducePass, ReducePlan,
    REDUCE_BLOCK_SIZE, TWO_PASS_THRESHOLD,
};

use crate::backend::{KernelArg, LaunchConfig};
use crate::context::DeviceContext;
use crate::error::{ForgeError, ForgeResult};
use crate::kernels::{CompiledKernel, IndexWidth, KernelLibrary, LoadedKernelCache, TemplateKind};
use crate::tensor::DeviceTensor;

/// Everything needed to put a compiled kernel on one device
#[derive(Debug, Clone, Copy)]
pub struct Dispatch<'a> {
    pub ctx: &'a DeviceContext,
    pub library: &'a KernelLibrary,
    pub loaded: &'a LoadedKernelCache,
}

impl<'a> Dispatch<'a> {
    pub fn new(
        ctx: &'a DeviceContext,
        library: &'a KernelLibrary,
        loaded: &'a LoadedKernelCache,
    ) -> Self {
        Dispatch { ctx, library, loaded }
    }

    /// Load `entry` of `kernel` into the context and queue it
    pub fn launch(
        &self,
        kernel: &CompiledKernel,
        entry: &str,
        config: &LaunchConfig,
        args: &[KernelArg],
    ) -> ForgeResult<()> {
        let loaded = self.library.load_entry(self.loaded, self.ctx, kernel, entry)?;
        tracing::trace!(
            "Launching {} on device {}: grid {:?}, block {:?}",
            loaded.entry(),
            self.ctx.device(),
            config.grid_dim,
            config.block_dim
        );
        self.ctx.launch(loaded.function(), config, args)
    }
}

/// An index-typed kernel parameter
pub(crate) fn index_arg(width: IndexWidth, value: usize) -> ForgeResult<KernelArg> {
    match width {
        IndexWidth::U32 => u32::try_from(value).map(KernelArg::U32).map_err(|_| {
            ForgeError::InvalidTensor(format!("{} does not fit 32-bit indexing", value))
        }),
        IndexWidth::U64 => Ok(KernelArg::U64(value as u64)),
    }
}

/// Operands must live on the dispatch device and match what `kernel` was
/// specialized for
pub(crate) fn check_operands(
    dispatch: &Dispatch<'_>,
    kernel: &CompiledKernel,
    kind: TemplateKind,
    operands: &[&DeviceTensor],
) -> ForgeResult<()> {
    let template = dispatch.library.template(kernel.template())?;
    if template.kind() != kind {
        return Err(ForgeError::InvalidConfiguration(format!(
            "template '{}' is a {:?} template, not {:?}",
            template.name(),
            template.kind(),
            kind
        )));
    }
    if let Some(t) = operands.iter().find(|t| t.device() != dispatch.ctx.device()) {
        return Err(ForgeError::InvalidTensor(format!(
            "operand on device {} dispatched to device {}",
            t.device(),
            dispatch.ctx.device()
        )));
    }
    let needed = crate::kernels::Specialization::for_operands(operands)?;
    if &needed != kernel.specialization() {
        return Err(ForgeError::InvalidTensor(format!(
            "kernel '{}' compiled for {} but operands need {}",
            kernel.template(),
            kernel.specialization(),
            needed
        )));
    }
    Ok(())
}
