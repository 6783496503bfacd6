//! Non-pooling allocator
//!
//! Every allocate and free goes straight to the driver after synchronizing
//! the device. Slow, but trivially correct: results produced with the pool
//! allocator are validated against this one in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::{BackendError, DeviceDriver, DeviceId, DevicePtr};
use crate::error::{ForgeError, ForgeResult};

use super::allocator::{padded_size, DeviceAllocator};

#[derive(Debug)]
pub struct DirectAllocator {
    driver: Arc<dyn DeviceDriver>,
    device: DeviceId,
    total_memory: usize,
    live: Mutex<HashMap<u64, usize>>,
}

impl DirectAllocator {
    pub fn new(driver: Arc<dyn DeviceDriver>, device: DeviceId) -> ForgeResult<Self> {
        let total_memory = driver.memory_info(device)?.total;
        Ok(DirectAllocator {
            driver,
            device,
            total_memory,
            live: Mutex::new(HashMap::new()),
        })
    }

    pub fn live_blocks(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    fn out_of_memory(&self, requested: usize) -> ForgeError {
        let available = self
            .driver
            .memory_info(self.device)
            .map(|info| info.free)
            .unwrap_or(0);
        ForgeError::OutOfMemory {
            device: self.device,
            requested,
            available,
        }
    }
}

impl DeviceAllocator for DirectAllocator {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn allocate_raw(&self, bytes: usize) -> ForgeResult<DevicePtr> {
        let size = match padded_size(bytes) {
            Some(size) if size <= self.total_memory => size,
            oversized => return Err(self.out_of_memory(oversized.unwrap_or(bytes))),
        };
        self.driver.synchronize(self.device)?;
        let ptr = self
            .driver
            .malloc(self.device, size)
            .map_err(|e| match e {
                BackendError::MemoryAllocationFailed(reason) => {
                    tracing::debug!("Direct malloc of {} bytes failed: {}", size, reason);
                    self.out_of_memory(size)
                }
                other => other.into(),
            })?;
        self.live.lock()?.insert(ptr.addr(), size);
        tracing::trace!("Direct allocated {} bytes at {} on device {}", size, ptr, self.device);
        Ok(ptr)
    }

    fn free_raw(&self, ptr: DevicePtr) -> ForgeResult<()> {
        if self.live.lock()?.remove(&ptr.addr()).is_none() {
            tracing::warn!("Invalid free of {} on device {}", ptr, self.device);
            return Err(ForgeError::InvalidFree {
                device: self.device,
                addr: ptr,
            });
        }
        self.driver.synchronize(self.device)?;
        self.driver.free(self.device, ptr)?;
        Ok(())
    }

    fn allocated_ratio(&self) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        self.live_bytes() as f64 / self.total_memory as f64
    }

    fn live_bytes(&self) -> usize {
        self.live
            .lock()
            .map(|live| live.values().sum())
            .unwrap_or(0)
    }

    fn capacity(&self) -> usize {
        self.total_memory
    }

    fn release(&self) -> ForgeResult<()> {
        let blocks: Vec<u64> = self.live.lock()?.drain().map(|(addr, _)| addr).collect();
        if blocks.is_empty() {
            return Ok(());
        }
        tracing::warn!(
            "Releasing {} live direct allocations on device {}",
            blocks.len(),
            self.device
        );
        self.driver.synchronize(self.device)?;
        for addr in blocks {
            self.driver.free(self.device, DevicePtr(addr))?;
        }
        Ok(())
    }
}
