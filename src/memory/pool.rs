//! First-fit pool allocator over a single device arena
//!
//! One large block is reserved from the driver when the pool is created and
//! subdivided on the host. Allocation and free never touch the device, so
//! they never synchronize.
//!
//! Free space is not tracked explicitly: the used-block map is scanned in
//! address order and the first gap large enough is taken. Freed blocks are
//! reusable immediately without coalescing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::backend::{DeviceDriver, DeviceId, DevicePtr};
use crate::error::{ForgeError, ForgeResult};

use super::allocator::{padded_size, DeviceAllocator, ALLOCATION_ALIGNMENT};

#[derive(Debug, Default)]
struct PoolState {
    /// Block start address -> padded size, non-overlapping
    used: BTreeMap<u64, usize>,
    live_bytes: usize,
    released: bool,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub live_bytes: usize,
    pub live_blocks: usize,
    pub free_gaps: usize,
    pub largest_free_gap: usize,
}

/// Pooling allocator for one device
#[derive(Debug)]
pub struct PoolAllocator {
    driver: Arc<dyn DeviceDriver>,
    device: DeviceId,
    arena_start: u64,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl PoolAllocator {
    /// Reserve `fraction` of the device's currently free memory
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        device: DeviceId,
        fraction: f64,
    ) -> ForgeResult<Self> {
        let info = driver.memory_info(device)?;
        let capacity = (info.free as f64 * fraction) as usize;
        Self::with_capacity(driver, device, capacity)
    }

    /// Reserve exactly `capacity` bytes, rounded down to the alignment
    pub fn with_capacity(
        driver: Arc<dyn DeviceDriver>,
        device: DeviceId,
        capacity: usize,
    ) -> ForgeResult<Self> {
        let capacity = capacity / ALLOCATION_ALIGNMENT * ALLOCATION_ALIGNMENT;
        if capacity == 0 {
            return Err(ForgeError::OutOfMemory {
                device,
                requested: ALLOCATION_ALIGNMENT,
                available: 0,
            });
        }
        let start = driver.malloc(device, capacity)?;
        tracing::info!(
            "Pool arena on device {}: {} MB ({} bytes) at {}",
            device,
            capacity / 1024 / 1024,
            capacity,
            start
        );
        Ok(PoolAllocator {
            driver,
            device,
            arena_start: start.addr(),
            capacity,
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn arena_start(&self) -> DevicePtr {
        DevicePtr(self.arena_start)
    }

    fn arena_end(&self) -> u64 {
        self.arena_start + self.capacity as u64
    }

    /// First address at or after the arena start with `size` free bytes
    fn find_gap(&self, used: &BTreeMap<u64, usize>, size: usize) -> Option<u64> {
        let fits = |start: u64, limit: u64| {
            start
                .checked_add(size as u64)
                .is_some_and(|end| end <= limit)
        };
        let mut cursor = self.arena_start;
        for (&addr, &len) in used {
            if fits(cursor, addr) {
                return Some(cursor);
            }
            cursor = addr + len as u64;
        }
        fits(cursor, self.arena_end()).then_some(cursor)
    }

    /// Free gaps between live blocks, in address order
    fn gaps(&self, used: &BTreeMap<u64, usize>) -> Vec<usize> {
        let mut gaps = Vec::new();
        let mut cursor = self.arena_start;
        for (&addr, &len) in used {
            if addr > cursor {
                gaps.push((addr - cursor) as usize);
            }
            cursor = addr + len as u64;
        }
        if self.arena_end() > cursor {
            gaps.push((self.arena_end() - cursor) as usize);
        }
        gaps
    }

    /// Number of disjoint free regions
    pub fn fragment_count(&self) -> usize {
        self.stats().free_gaps
    }

    /// Largest request that would currently succeed
    pub fn largest_free_gap(&self) -> usize {
        self.stats().largest_free_gap
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let gaps = if state.released {
            Vec::new()
        } else {
            self.gaps(&state.used)
        };
        PoolStats {
            capacity: self.capacity,
            live_bytes: state.live_bytes,
            live_blocks: state.used.len(),
            free_gaps: gaps.len(),
            largest_free_gap: gaps.iter().copied().max().unwrap_or(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // The map is only mutated after every check has passed, so a panic
        // while holding the lock cannot leave it half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceAllocator for PoolAllocator {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn allocate_raw(&self, bytes: usize) -> ForgeResult<DevicePtr> {
        let mut state = self.lock();
        if state.released {
            return Err(ForgeError::AllocatorReleased(self.device));
        }
        let out_of_memory = |requested: usize| ForgeError::OutOfMemory {
            device: self.device,
            requested,
            available: self.capacity - state.live_bytes,
        };
        let size = match padded_size(bytes) {
            Some(size) if size <= self.capacity => size,
            oversized => return Err(out_of_memory(oversized.unwrap_or(bytes))),
        };
        let addr = self
            .find_gap(&state.used, size)
            .ok_or_else(|| out_of_memory(size))?;
        state.used.insert(addr, size);
        state.live_bytes += size;
        tracing::trace!(
            "Pool allocated {} bytes at 0x{:x} on device {} ({} live blocks)",
            size,
            addr,
            self.device,
            state.used.len()
        );
        Ok(DevicePtr(addr))
    }

    fn free_raw(&self, ptr: DevicePtr) -> ForgeResult<()> {
        let mut state = self.lock();
        if state.released {
            return Err(ForgeError::AllocatorReleased(self.device));
        }
        match state.used.remove(&ptr.addr()) {
            Some(size) => {
                state.live_bytes -= size;
                tracing::trace!("Pool freed {} bytes at {} on device {}", size, ptr, self.device);
                Ok(())
            }
            None => {
                tracing::warn!("Invalid free of {} on device {}", ptr, self.device);
                Err(ForgeError::InvalidFree {
                    device: self.device,
                    addr: ptr,
                })
            }
        }
    }

    fn allocated_ratio(&self) -> f64 {
        self.lock().live_bytes as f64 / self.capacity as f64
    }

    fn live_bytes(&self) -> usize {
        self.lock().live_bytes
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self) -> ForgeResult<()> {
        let mut state = self.lock();
        if state.released {
            return Ok(());
        }
        if !state.used.is_empty() {
            tracing::warn!(
                "Releasing arena on device {} with {} live blocks ({} bytes)",
                self.device,
                state.used.len(),
                state.live_bytes
            );
        }
        self.driver.free(self.device, DevicePtr(self.arena_start))?;
        state.released = true;
        state.used.clear();
        state.live_bytes = 0;
        tracing::debug!("Released pool arena on device {}", self.device);
        Ok(())
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Failed to release arena on device {}: {}", self.device, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimDriver;

    fn pool(capacity: usize) -> (Arc<SimDriver>, PoolAllocator) {
        let driver = Arc::new(SimDriver::uniform(1, 1 << 30));
        let pool = PoolAllocator::with_capacity(driver.clone(), 0, capacity).unwrap();
        (driver, pool)
    }

    #[test]
    fn test_first_fit_reuses_earliest_gap() {
        let (_driver, pool) = pool(4096);
        let a = pool.allocate_raw(256).unwrap();
        let b = pool.allocate_raw(512).unwrap();
        let c = pool.allocate_raw(256).unwrap();
        assert_eq!(a, pool.arena_start());
        assert_eq!(b, a.offset(256));
        assert_eq!(c, a.offset(768));

        pool.free_raw(b).unwrap();
        // Fits in the 512-byte hole left by `b`
        let d = pool.allocate_raw(300).unwrap();
        assert_eq!(d, b);
        // No hole left, goes after `c`
        let e = pool.allocate_raw(256).unwrap();
        assert_eq!(e, c.offset(256));
    }

    #[test]
    fn test_zero_byte_request_takes_one_unit() {
        let (_driver, pool) = pool(1024);
        let a = pool.allocate_raw(0).unwrap();
        let b = pool.allocate_raw(0).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.live_bytes(), 512);
    }

    #[test]
    fn test_out_of_memory_leaves_map_unchanged() {
        let (_driver, pool) = pool(1024);
        pool.allocate_raw(512).unwrap();
        let before = pool.stats();
        let err = pool.allocate_raw(1024).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::OutOfMemory {
                requested: 1024,
                available: 512,
                ..
            }
        ));
        assert_eq!(pool.stats(), before);
    }

    #[test]
    fn test_huge_requests_fail_without_touching_map() {
        let (_driver, pool) = pool(4096);
        pool.allocate_raw(256).unwrap();
        let before = pool.stats();
        for bytes in [usize::MAX, usize::MAX - 1, usize::MAX - 255, 4097] {
            let err = pool.allocate_raw(bytes).unwrap_err();
            assert!(err.is_out_of_memory(), "{} bytes gave {:?}", bytes, err);
            assert_eq!(pool.stats(), before);
        }
        // The pool is still usable afterwards
        let next = pool.allocate_raw(256).unwrap();
        assert_eq!(next, pool.arena_start().offset(256));
        assert_eq!(pool.stats().live_blocks, 2);
    }

    #[test]
    fn test_invalid_free_rejected() {
        let (_driver, pool) = pool(1024);
        let a = pool.allocate_raw(10).unwrap();
        pool.free_raw(a).unwrap();
        assert!(matches!(
            pool.free_raw(a),
            Err(ForgeError::InvalidFree { .. })
        ));
        assert!(matches!(
            pool.free_raw(a.offset(1)),
            Err(ForgeError::InvalidFree { .. })
        ));
    }

    #[test]
    fn test_allocated_ratio_tracks_live_bytes() {
        let (_driver, pool) = pool(2048);
        assert_eq!(pool.allocated_ratio(), 0.0);
        let a = pool.allocate_raw(1024).unwrap();
        assert!((pool.allocated_ratio() - 0.5).abs() < 1e-12);
        pool.free_raw(a).unwrap();
        assert_eq!(pool.allocated_ratio(), 0.0);
    }

    #[test]
    fn test_stats_gaps() {
        let (_driver, pool) = pool(2048);
        let a = pool.allocate_raw(256).unwrap();
        let _b = pool.allocate_raw(256).unwrap();
        assert_eq!(pool.fragment_count(), 1);
        assert_eq!(pool.largest_free_gap(), 1536);
        pool.free_raw(a).unwrap();
        assert_eq!(pool.fragment_count(), 2);
        assert_eq!(pool.stats().live_blocks, 1);
    }

    #[test]
    fn test_new_reserves_fraction_of_free_memory() {
        let driver = Arc::new(SimDriver::uniform(1, 1 << 20));
        let pool = PoolAllocator::new(driver.clone(), 0, 0.5).unwrap();
        assert_eq!(pool.capacity(), 1 << 19);
        assert_eq!(driver.live_allocations(0), 1);
    }

    #[test]
    fn test_release_returns_arena_and_blocks_further_use() {
        let (driver, pool) = pool(1024);
        pool.allocate_raw(256).unwrap();
        pool.release().unwrap();
        assert_eq!(driver.live_allocations(0), 0);
        assert!(matches!(
            pool.allocate_raw(1),
            Err(ForgeError::AllocatorReleased(0))
        ));
        // Second release is a no-op
        pool.release().unwrap();
    }
}
