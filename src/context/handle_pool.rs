//! Pool of reusable heavy handles
//!
//! Handles are constructed on a miss and pushed back on release, never
//! destroyed until the pool is drained. The free list is bounded only by
//! the peak number of concurrently checked-out handles.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{DeviceDriver, DeviceId, RawBlasHandle};
use crate::error::{ForgeError, ForgeResult};

type Factory<H> = Box<dyn Fn() -> ForgeResult<H> + Send + Sync>;
type Destructor<H> = Box<dyn Fn(H) -> ForgeResult<()> + Send + Sync>;

pub struct HandlePool<H> {
    factory: Factory<H>,
    destructor: Destructor<H>,
    free: Mutex<Vec<H>>,
    created: AtomicUsize,
    checked_out: AtomicUsize,
    drained: AtomicBool,
}

impl<H: Send> HandlePool<H> {
    /// `capacity_hint` pre-sizes the free list; it is not a limit.
    pub fn new<F, D>(capacity_hint: usize, factory: F, destructor: D) -> Self
    where
        F: Fn() -> ForgeResult<H> + Send + Sync + 'static,
        D: Fn(H) -> ForgeResult<()> + Send + Sync + 'static,
    {
        HandlePool {
            factory: Box::new(factory),
            destructor: Box::new(destructor),
            free: Mutex::new(Vec::with_capacity(capacity_hint)),
            created: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
        }
    }

    /// Check out a handle, constructing one if the free list is empty
    pub fn acquire(&self) -> ForgeResult<PooledHandle<'_, H>> {
        if self.drained.load(Ordering::Acquire) {
            return Err(ForgeError::Disposed);
        }
        let recycled = self.free.lock()?.pop();
        let handle = match recycled {
            Some(handle) => handle,
            None => {
                // Construct outside the lock; other threads keep recycling.
                let handle = (self.factory)()?;
                let total = self.created.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!("Handle pool grew to {} handles", total);
                handle
            }
        };
        self.checked_out.fetch_add(1, Ordering::Relaxed);
        Ok(PooledHandle {
            pool: self,
            handle: Some(handle),
        })
    }

    fn release(&self, handle: H) {
        self.checked_out.fetch_sub(1, Ordering::Relaxed);
        if self.drained.load(Ordering::Acquire) {
            if let Err(e) = (self.destructor)(handle) {
                tracing::warn!("Failed to destroy handle returned after drain: {}", e);
            }
            return;
        }
        match self.free.lock() {
            Ok(mut free) => free.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Destroy every idle handle and refuse further checkouts.
    ///
    /// Handles still checked out are destroyed when they come back.
    pub fn drain(&self) -> ForgeResult<usize> {
        self.drained.store(true, Ordering::Release);
        let idle: Vec<H> = std::mem::take(&mut *self.free.lock()?);
        let outstanding = self.checked_out.load(Ordering::Relaxed);
        if outstanding > 0 {
            tracing::warn!("Draining handle pool with {} handles checked out", outstanding);
        }
        let count = idle.len();
        let mut first_err = None;
        for handle in idle {
            if let Err(e) = (self.destructor)(handle) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Handles constructed over the pool's lifetime
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn idle(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::Relaxed)
    }
}

impl<H> fmt::Debug for HandlePool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlePool")
            .field("created", &self.created.load(Ordering::Relaxed))
            .field("checked_out", &self.checked_out.load(Ordering::Relaxed))
            .field("drained", &self.drained.load(Ordering::Relaxed))
            .finish()
    }
}

/// Scoped checkout; the handle goes back to the pool on drop, including
/// during unwinding.
pub struct PooledHandle<'a, H: Send> {
    pool: &'a HandlePool<H>,
    handle: Option<H>,
}

impl<H: Send> Deref for PooledHandle<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        // Only taken in drop
        self.handle.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<H: Send> Drop for PooledHandle<'_, H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

/// BLAS library handle bound to one device's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasHandle {
    device: DeviceId,
    raw: RawBlasHandle,
}

impl BlasHandle {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn raw(&self) -> RawBlasHandle {
        self.raw
    }
}

/// Handle pool creating and destroying BLAS handles through `driver`
pub fn blas_handle_pool(
    driver: Arc<dyn DeviceDriver>,
    device: DeviceId,
    capacity_hint: usize,
) -> HandlePool<BlasHandle> {
    let destroy_driver = Arc::clone(&driver);
    HandlePool::new(
        capacity_hint,
        move || {
            let raw = driver.create_blas_handle(device)?;
            Ok(BlasHandle { device, raw })
        },
        move |handle: BlasHandle| {
            destroy_driver.destroy_blas_handle(handle.device, handle.raw)?;
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimDriver;
    use std::sync::atomic::AtomicU32;

    fn counting_pool() -> (Arc<AtomicU32>, Arc<AtomicU32>, HandlePool<u32>) {
        let made = Arc::new(AtomicU32::new(0));
        let destroyed = Arc::new(AtomicU32::new(0));
        let m = made.clone();
        let d = destroyed.clone();
        let pool = HandlePool::new(
            2,
            move || Ok(m.fetch_add(1, Ordering::SeqCst)),
            move |_| {
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        (made, destroyed, pool)
    }

    #[test]
    fn test_construct_on_miss_recycle_on_release() {
        let (made, _destroyed, pool) = counting_pool();
        {
            let a = pool.acquire().unwrap();
            let b = pool.acquire().unwrap();
            assert_ne!(*a, *b);
            assert_eq!(pool.checked_out(), 2);
        }
        assert_eq!(pool.idle(), 2);
        let _c = pool.acquire().unwrap();
        let _d = pool.acquire().unwrap();
        assert_eq!(made.load(Ordering::SeqCst), 2);
        assert_eq!(pool.created(), 2);
    }

    #[test]
    fn test_release_on_panic() {
        let (_made, _destroyed, pool) = counting_pool();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _h = pool.acquire().unwrap();
            panic!("failure while using handle");
        }));
        assert!(result.is_err());
        assert_eq!(pool.checked_out(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_drain_destroys_idle_and_late_returns() {
        let (_made, destroyed, pool) = counting_pool();
        let held = pool.acquire().unwrap();
        drop(pool.acquire().unwrap());
        assert_eq!(pool.drain().unwrap(), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        drop(held);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
        assert!(matches!(pool.acquire(), Err(ForgeError::Disposed)));
    }

    #[test]
    fn test_blas_pool_uses_driver() {
        let driver = Arc::new(SimDriver::uniform(1, 1 << 20));
        let pool = blas_handle_pool(driver.clone(), 0, 4);
        {
            let h = pool.acquire().unwrap();
            assert_eq!(h.device(), 0);
            assert_eq!(driver.live_blas_handles(), 1);
        }
        pool.drain().unwrap();
        assert_eq!(driver.live_blas_handles(), 0);
        assert_eq!(driver.counters().blas_destroyed, 1);
    }
}
