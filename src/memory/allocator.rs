//! Allocator trait and the RAII device memory handle

use std::fmt;
use std::sync::Arc;

use crate::backend::{DeviceId, DevicePtr};
use crate::error::ForgeResult;

/// Allocation granularity; every block starts and ends on this boundary
pub const ALLOCATION_ALIGNMENT: usize = 256;

/// Size actually reserved for a request of `bytes`, `None` if padding
/// overflows.
///
/// Zero-byte requests still reserve one alignment unit so every handle owns
/// a distinct address.
pub fn padded_size(bytes: usize) -> Option<usize> {
    bytes.max(1).checked_next_multiple_of(ALLOCATION_ALIGNMENT)
}

/// Per-device allocation strategy
pub trait DeviceAllocator: Send + Sync + fmt::Debug {
    fn device(&self) -> DeviceId;

    /// Reserve `bytes` (padded to [`ALLOCATION_ALIGNMENT`])
    fn allocate_raw(&self, bytes: usize) -> ForgeResult<DevicePtr>;

    /// Return a block obtained from `allocate_raw`
    fn free_raw(&self, ptr: DevicePtr) -> ForgeResult<()>;

    /// Live bytes over capacity, in `[0, 1]`
    fn allocated_ratio(&self) -> f64;

    fn live_bytes(&self) -> usize;

    fn capacity(&self) -> usize;

    /// Give all device memory back to the driver
    fn release(&self) -> ForgeResult<()>;
}

/// Owned block of device memory, freed on drop
pub struct DeviceMemory {
    ptr: DevicePtr,
    size: usize,
    allocator: Arc<dyn DeviceAllocator>,
    freed: bool,
}

impl DeviceMemory {
    pub fn allocate(allocator: &Arc<dyn DeviceAllocator>, bytes: usize) -> ForgeResult<Self> {
        let ptr = allocator.allocate_raw(bytes)?;
        Ok(DeviceMemory {
            ptr,
            size: bytes,
            allocator: Arc::clone(allocator),
            freed: false,
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Requested size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn device(&self) -> DeviceId {
        self.allocator.device()
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }

    /// Free now and surface any error instead of logging it on drop
    pub fn free(mut self) -> ForgeResult<()> {
        self.freed = true;
        self.allocator.free_raw(self.ptr)
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if !self.freed {
            if let Err(e) = self.allocator.free_raw(self.ptr) {
                tracing::warn!(
                    "Failed to free {} bytes at {} on device {}: {}",
                    self.size,
                    self.ptr,
                    self.allocator.device(),
                    e
                );
            }
        }
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("device", &self.allocator.device())
            .finish()
    }
}

/// Allocate, and on out-of-memory run `cleanup` once and retry once.
///
/// `cleanup` is where a consumer drops cached tensors; the allocator itself
/// never retries.
pub fn allocate_with_cleanup<F>(
    allocator: &Arc<dyn DeviceAllocator>,
    bytes: usize,
    cleanup: F,
) -> ForgeResult<DeviceMemory>
where
    F: FnOnce(),
{
    match DeviceMemory::allocate(allocator, bytes) {
        Err(e) if e.is_out_of_memory() => {
            tracing::debug!(
                "Allocation of {} bytes on device {} failed, running cleanup: {}",
                bytes,
                allocator.device(),
                e
            );
            cleanup();
            DeviceMemory::allocate(allocator, bytes)
        }
        other => other,
    }
}
