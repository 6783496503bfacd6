//! Runtime façade
//!
//! [`TensorRuntime`] is the call surface consumed by the operation and
//! serving layers: allocation, context lookup, specialization and
//! compilation, reduction and elementwise dispatch, strided iteration and
//! lifecycle.

use std::sync::Arc;

use crate::backend::{DeviceDriver, DeviceId, KernelCompiler};
use crate::config::RuntimeConfig;
use crate::context::{DeviceContext, MultiDeviceContext};
use crate::error::{ForgeError, ForgeResult};
use crate::kernels::{CompiledKernel, DiskCache, KernelLibrary};
use crate::memory::{allocate_with_cleanup, DeviceMemory};
use crate::ops::{self, Dispatch, InitPolicy};
use crate::residency::Resident;
use crate::tensor::{DType, DeviceTensor, StridedCursor, TensorLayout};

#[derive(Debug)]
pub struct TensorRuntime {
    config: RuntimeConfig,
    contexts: MultiDeviceContext,
    library: KernelLibrary,
}

impl TensorRuntime {
    /// Contexts for every configured device, then the kernel library.
    /// Pre-warms every template when the config asks for it.
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        compiler: Arc<dyn KernelCompiler>,
        config: RuntimeConfig,
    ) -> ForgeResult<Self> {
        let contexts = MultiDeviceContext::new(driver, &config)?;
        let mut library = KernelLibrary::new(compiler);
        if let Some(dir) = &config.kernel_cache_dir {
            library = library.with_disk_cache(DiskCache::new(dir)?);
        }
        let runtime = TensorRuntime {
            config,
            contexts,
            library,
        };
        if runtime.config.prewarm {
            runtime.prewarm()?;
        }
        tracing::info!(
            "Tensor runtime ready on devices {:?}",
            runtime.contexts.device_ids()
        );
        Ok(runtime)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn contexts(&self) -> &MultiDeviceContext {
        &self.contexts
    }

    pub fn library(&self) -> &KernelLibrary {
        &self.library
    }

    pub fn context_for(&self, device: DeviceId) -> ForgeResult<&DeviceContext> {
        self.contexts.for_device(device)
    }

    pub fn allocate(&self, device: DeviceId, bytes: usize) -> ForgeResult<DeviceMemory> {
        self.context_for(device)?.allocate(bytes)
    }

    /// Like [`allocate`](Self::allocate), but on out-of-memory runs
    /// `cleanup` and retries once
    pub fn allocate_with_cleanup<F>(
        &self,
        device: DeviceId,
        bytes: usize,
        cleanup: F,
    ) -> ForgeResult<DeviceMemory>
    where
        F: FnOnce(),
    {
        allocate_with_cleanup(self.context_for(device)?.allocator(), bytes, cleanup)
    }

    pub fn free(&self, memory: DeviceMemory) -> ForgeResult<()> {
        memory.free()
    }

    /// Uninitialized contiguous tensor on `device`
    pub fn empty(
        &self,
        device: DeviceId,
        dtype: DType,
        sizes: &[usize],
    ) -> ForgeResult<DeviceTensor> {
        DeviceTensor::empty(self.context_for(device)?.allocator(), dtype, sizes)
    }

    pub fn specialize_and_compile(
        &self,
        template: &str,
        operands: &[&DeviceTensor],
    ) -> ForgeResult<Arc<CompiledKernel>> {
        self.library.specialize_and_compile(template, operands)
    }

    fn dispatch(&self, device: DeviceId) -> ForgeResult<Dispatch<'_>> {
        Ok(Dispatch::new(
            self.context_for(device)?,
            &self.library,
            self.contexts.kernel_cache(),
        ))
    }

    /// Reduce `input` with an already compiled reduction kernel
    pub fn launch_reduce(
        &self,
        kernel: &CompiledKernel,
        input: &DeviceTensor,
        init_value: f64,
        policy: InitPolicy,
    ) -> ForgeResult<DeviceTensor> {
        ops::launch_reduce(&self.dispatch(input.device())?, kernel, input, init_value, policy)
    }

    /// Specialize, compile and launch `template` over `input`
    pub fn reduce(
        &self,
        template: &str,
        input: &DeviceTensor,
        init_value: f64,
        policy: InitPolicy,
    ) -> ForgeResult<DeviceTensor> {
        if input.rank() == 0 {
            return Ok(input.clone());
        }
        let kernel = self.specialize_and_compile(template, &[input])?;
        self.launch_reduce(&kernel, input, init_value, policy)
    }

    pub fn launch_apply(
        &self,
        kernel: &CompiledKernel,
        operands: &[&DeviceTensor],
        scalars: &[f64],
    ) -> ForgeResult<()> {
        let device = operands
            .first()
            .map(|t| t.device())
            .ok_or_else(|| ForgeError::InvalidTensor("no operands".to_string()))?;
        ops::launch_apply(&self.dispatch(device)?, kernel, operands, scalars)
    }

    /// Specialize, compile and launch `template` elementwise
    pub fn apply(
        &self,
        template: &str,
        operands: &[&DeviceTensor],
        scalars: &[f64],
    ) -> ForgeResult<()> {
        let kernel = self.specialize_and_compile(template, operands)?;
        self.launch_apply(&kernel, operands, scalars)
    }

    /// Cursor over the contiguous runs of `layout`
    pub fn iterate(&self, layout: &TensorLayout) -> StridedCursor {
        layout.cursor()
    }

    pub fn synchronize(&self, device: DeviceId) -> ForgeResult<()> {
        self.contexts.synchronize(device)
    }

    pub fn synchronize_all(&self) -> ForgeResult<()> {
        self.contexts.synchronize_all()
    }

    /// Compile every registered template for its whole specialization
    /// space and load all entries into every context. Returns the number
    /// of entries loaded.
    pub fn prewarm(&self) -> ForgeResult<usize> {
        let names: Vec<String> = crate::kernels::KernelRegistry::global()
            .names()
            .map(str::to_string)
            .collect();
        let mut loaded = 0;
        for name in &names {
            let entries = self.library.template(name)?.entries().to_vec();
            for kernel in self.library.prewarm(name)? {
                for ctx in self.contexts.contexts() {
                    for entry in &entries {
                        self.library
                            .load_entry(self.contexts.kernel_cache(), ctx, &kernel, entry)?;
                        loaded += 1;
                    }
                }
            }
        }
        tracing::info!("Prewarmed {} kernel entries", loaded);
        Ok(loaded)
    }

    /// Holder for a heavy object built by `builder`, evicted after the
    /// configured idle time
    pub fn resident<T, F>(&self, name: &str, builder: F) -> Resident<T>
    where
        F: Fn() -> ForgeResult<T> + Send + Sync + 'static,
    {
        Resident::new(name, self.config.resident_idle_timeout(), builder)
    }

    /// Loaded kernels first, then every device context
    pub fn dispose(&self) -> ForgeResult<()> {
        self.contexts.dispose()
    }
}
