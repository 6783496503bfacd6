//! Per-device context
//!
//! Owns one device's allocator, BLAS handle pool and reduction scratch
//! buffer. Disposal runs in a fixed order: synchronize, drain handles, free
//! scratch, release the allocator.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{
    DeviceDriver, DeviceId, DevicePtr, DeviceProperties, FunctionHandle, KernelArg, LaunchConfig,
};
use crate::error::{ForgeError, ForgeResult};
use crate::memory::{create_allocator, AllocatorKind, DeviceAllocator, DeviceMemory};

use super::handle_pool::{blas_handle_pool, BlasHandle, HandlePool, PooledHandle};

/// Scratch bytes reserved per multiprocessor
pub const SCRATCH_BYTES_PER_MULTIPROCESSOR: usize = 4;

static NEXT_CONTEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`DeviceContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(u64);

impl ContextKey {
    fn next() -> Self {
        ContextKey(NEXT_CONTEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Location and size of a device's reduction scratch buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScratchSpace {
    pub ptr: DevicePtr,
    pub bytes: usize,
}

impl ScratchSpace {
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

/// Exclusive use of a device's scratch buffer.
///
/// Launches that write partials and the launches that read them back are
/// queued while one guard is held, so no other reduction on the device can
/// interleave with them.
pub struct ScratchGuard<'a> {
    memory: MutexGuard<'a, Option<DeviceMemory>>,
}

impl ScratchGuard<'_> {
    /// Empty once the context is disposed
    pub fn space(&self) -> ScratchSpace {
        self.memory
            .as_ref()
            .map(|memory| ScratchSpace {
                ptr: memory.ptr(),
                bytes: memory.size(),
            })
            .unwrap_or_default()
    }
}

pub struct DeviceContext {
    key: ContextKey,
    device: DeviceId,
    properties: DeviceProperties,
    driver: Arc<dyn DeviceDriver>,
    allocator: Arc<dyn DeviceAllocator>,
    handles: HandlePool<BlasHandle>,
    scratch: Mutex<Option<DeviceMemory>>,
    scratch_space: ScratchSpace,
    disposed: AtomicBool,
}

impl DeviceContext {
    /// Reserve the arena, then the scratch buffer, for `device`
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        device: DeviceId,
        allocator: AllocatorKind,
        arena_fraction: f64,
        handle_capacity: usize,
    ) -> ForgeResult<Self> {
        let allocator = create_allocator(allocator, Arc::clone(&driver), device, arena_fraction)?;
        Self::with_allocator(driver, device, allocator, handle_capacity)
    }

    /// Build around an existing allocator for `device`
    pub fn with_allocator(
        driver: Arc<dyn DeviceDriver>,
        device: DeviceId,
        allocator: Arc<dyn DeviceAllocator>,
        handle_capacity: usize,
    ) -> ForgeResult<Self> {
        if allocator.device() != device {
            return Err(ForgeError::InvalidConfiguration(format!(
                "allocator for device {} handed to context for device {}",
                allocator.device(),
                device
            )));
        }
        let properties = driver.properties(device)?;
        let scratch_bytes =
            SCRATCH_BYTES_PER_MULTIPROCESSOR * properties.multiprocessor_count as usize;
        let scratch = if scratch_bytes > 0 {
            Some(DeviceMemory::allocate(&allocator, scratch_bytes)?)
        } else {
            tracing::warn!("Device {} reports no multiprocessors, no scratch space", device);
            None
        };
        let scratch_space = ScratchSpace {
            ptr: scratch.as_ref().map(|s| s.ptr()).unwrap_or(DevicePtr::NULL),
            bytes: scratch_bytes,
        };
        let handles = blas_handle_pool(Arc::clone(&driver), device, handle_capacity);
        let key = ContextKey::next();

        tracing::info!(
            "Created {} for device {} ({}, {} multiprocessors, {} scratch bytes)",
            key,
            device,
            properties.name,
            properties.multiprocessor_count,
            scratch_bytes
        );

        Ok(DeviceContext {
            key,
            device,
            properties,
            driver,
            allocator,
            handles,
            scratch: Mutex::new(scratch),
            scratch_space,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    pub fn multiprocessor_count(&self) -> u32 {
        self.properties.multiprocessor_count
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }

    /// Reduction scratch; empty once disposed. Use
    /// [`lock_scratch`](Self::lock_scratch) before launching into it.
    pub fn scratch(&self) -> ScratchSpace {
        if self.is_disposed() {
            return ScratchSpace {
                ptr: DevicePtr::NULL,
                bytes: 0,
            };
        }
        self.scratch_space
    }

    /// Block other users of the scratch buffer until the guard drops.
    /// Disposal waits for the guard too.
    pub fn lock_scratch(&self) -> ForgeResult<ScratchGuard<'_>> {
        self.ensure_live()?;
        Ok(ScratchGuard {
            memory: self.scratch.lock()?,
        })
    }

    pub fn allocate(&self, bytes: usize) -> ForgeResult<DeviceMemory> {
        self.ensure_live()?;
        DeviceMemory::allocate(&self.allocator, bytes)
    }

    pub fn acquire_handle(&self) -> ForgeResult<PooledHandle<'_, BlasHandle>> {
        self.ensure_live()?;
        self.handles.acquire()
    }

    pub fn handle_pool(&self) -> &HandlePool<BlasHandle> {
        &self.handles
    }

    pub fn synchronize(&self) -> ForgeResult<()> {
        self.ensure_live()?;
        self.driver.synchronize(self.device)?;
        Ok(())
    }

    /// Queue `function` on this device
    pub fn launch(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        args: &[KernelArg],
    ) -> ForgeResult<()> {
        self.ensure_live()?;
        self.driver.launch(self.device, function, config, args)?;
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> ForgeResult<()> {
        if self.is_disposed() {
            Err(ForgeError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Tear down in order. Idempotent; every step runs even if an earlier
    /// one failed, and the first error is returned.
    pub fn dispose(&self) -> ForgeResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut first_err: Option<ForgeError> = None;

        if let Err(e) = self.driver.synchronize(self.device) {
            first_err.get_or_insert(e.into());
        }
        match self.handles.drain() {
            Ok(count) => {
                tracing::debug!("Destroyed {} BLAS handles on device {}", count, self.device)
            }
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
        let scratch = match self.scratch.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(scratch) = scratch {
            if let Err(e) = scratch.free() {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.allocator.release() {
            first_err.get_or_insert(e);
        }

        tracing::info!("Disposed {} for device {}", self.key, self.device);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!("Disposing context for device {} failed: {}", self.device, e);
        }
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("key", &self.key)
            .field("device", &self.device)
            .field("scratch", &self.scratch_space)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
