//! Loaded-kernel cache
//!
//! The same binary may be loaded into several device contexts; each load
//! yields a distinct module. Modules are keyed by `(context, binary)` and
//! functions by `(context, binary, entry)`, so nothing is shared across
//! contexts and each triple is resolved exactly once.
//!
//! A module whose load finishes after [`LoadedKernelCache::dispose`] has
//! started is unloaded by the loading thread, which then gets `Disposed`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::backend::{DeviceDriver, DeviceId, FunctionHandle, ModuleHandle};
use crate::context::{ContextKey, DeviceContext};
use crate::error::{ForgeError, ForgeResult};

/// An entry point resolved inside a module loaded into one context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedKernel {
    context: ContextKey,
    device: DeviceId,
    module: ModuleHandle,
    function: FunctionHandle,
    entry: String,
}

impl LoadedKernel {
    pub fn context(&self) -> ContextKey {
        self.context
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn module(&self) -> ModuleHandle {
        self.module
    }

    pub fn function(&self) -> FunctionHandle {
        self.function
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }
}

type ModuleKey = (ContextKey, Vec<u8>);
type FunctionKey = (ContextKey, Vec<u8>, String);

#[derive(Debug, Default)]
struct ModuleSlot {
    module: OnceCell<ModuleHandle>,
    unloaded: AtomicBool,
}

impl ModuleSlot {
    /// The loaded module, handed out for unloading at most once
    fn claim(&self) -> Option<ModuleHandle> {
        let module = *self.module.get()?;
        (!self.unloaded.swap(true, Ordering::AcqRel)).then_some(module)
    }
}

pub struct LoadedKernelCache {
    driver: Arc<dyn DeviceDriver>,
    modules: Mutex<HashMap<ModuleKey, Arc<ModuleSlot>>>,
    functions: Mutex<HashMap<FunctionKey, Arc<OnceCell<Arc<LoadedKernel>>>>>,
    disposed: AtomicBool,
}

impl LoadedKernelCache {
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        LoadedKernelCache {
            driver,
            modules: Mutex::new(HashMap::new()),
            functions: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// `entry` from `binary` loaded into `ctx`, loading on first use
    pub fn get_or_load(
        &self,
        ctx: &DeviceContext,
        binary: &[u8],
        entry: &str,
    ) -> ForgeResult<Arc<LoadedKernel>> {
        if self.disposed.load(Ordering::Acquire) || ctx.is_disposed() {
            return Err(ForgeError::Disposed);
        }
        let key = (ctx.key(), binary.to_vec(), entry.to_string());
        let slot = {
            let mut functions = self.functions.lock()?;
            Arc::clone(functions.entry(key).or_default())
        };
        let kernel = slot.get_or_try_init(|| {
            let module = self.module_for(ctx, binary)?;
            let function = self.driver.get_function(module, entry)?;
            tracing::debug!("Loaded kernel '{}' into {}", entry, ctx.key());
            Ok::<_, ForgeError>(Arc::new(LoadedKernel {
                context: ctx.key(),
                device: ctx.device(),
                module,
                function,
                entry: entry.to_string(),
            }))
        })?;
        Ok(Arc::clone(kernel))
    }

    fn module_for(&self, ctx: &DeviceContext, binary: &[u8]) -> ForgeResult<ModuleHandle> {
        let key = (ctx.key(), binary.to_vec());
        let slot = {
            let mut modules = self.modules.lock()?;
            Arc::clone(modules.entry(key.clone()).or_default())
        };
        let module = *slot.module.get_or_try_init(|| {
            tracing::debug!(
                "Loading {}-byte module on device {} ({})",
                binary.len(),
                ctx.device(),
                ctx.key()
            );
            self.driver.load_module(ctx.device(), binary)
        })?;

        // Disposal may have drained the map while the load was running
        let stale = {
            let mut modules = self.modules.lock()?;
            let disposed = self.is_disposed();
            let listed = modules
                .get(&key)
                .is_some_and(|live| Arc::ptr_eq(live, &slot));
            if listed && disposed {
                modules.remove(&key);
            }
            !listed || disposed
        };
        if stale {
            if let Some(module) = slot.claim() {
                tracing::debug!("Unloading module {:?} loaded during disposal", module);
                if let Err(e) = self.driver.unload_module(module) {
                    tracing::warn!("Unloading module {:?} failed: {}", module, e);
                }
            }
            return Err(ForgeError::Disposed);
        }
        Ok(module)
    }

    /// Number of resolved entry points
    pub fn len(&self) -> usize {
        self.functions
            .lock()
            .map(|f| f.values().filter(|slot| slot.get().is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of loaded modules
    pub fn module_count(&self) -> usize {
        self.modules
            .lock()
            .map(|m| m.values().filter(|slot| slot.module.get().is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Unload every module. Idempotent; later loads fail with `Disposed`.
    pub fn dispose(&self) -> ForgeResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let modules: Vec<ModuleHandle> = {
            let mut modules = self.modules.lock()?;
            modules.drain().filter_map(|(_, slot)| slot.claim()).collect()
        };
        self.functions.lock()?.clear();

        let mut first_err = None;
        for module in &modules {
            if let Err(e) = self.driver.unload_module(*module) {
                tracing::warn!("Unloading module {:?} failed: {}", module, e);
                first_err.get_or_insert(ForgeError::from(e));
            }
        }
        tracing::info!("Unloaded {} kernel modules", modules.len());
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for LoadedKernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedKernelCache")
            .field("driver", &self.driver.name())
            .field("kernels", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
