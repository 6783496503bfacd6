//! Device memory management
//!
//! Every device gets one [`DeviceAllocator`]. The default is the
//! [`PoolAllocator`], which reserves a single large arena up front and
//! subdivides it on the host; [`DirectAllocator`] calls the driver for every
//! request and serves as the correctness baseline.

pub mod allocator;
pub mod direct;
pub mod pool;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::{DeviceDriver, DeviceId};
use crate::error::{ForgeError, ForgeResult};

pub use allocator::{
    allocate_with_cleanup, padded_size, DeviceAllocator, DeviceMemory, ALLOCATION_ALIGNMENT,
};
pub use direct::DirectAllocator;
pub use pool::{PoolAllocator, PoolStats};

/// Allocation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    #[default]
    Pool,
    Direct,
}

impl FromStr for AllocatorKind {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pool" | "pooled" => Ok(AllocatorKind::Pool),
            "direct" => Ok(AllocatorKind::Direct),
            other => Err(ForgeError::InvalidConfiguration(format!(
                "unknown allocator '{}', expected 'pool' or 'direct'",
                other
            ))),
        }
    }
}

/// Build the allocator for `device`
pub fn create_allocator(
    kind: AllocatorKind,
    driver: Arc<dyn DeviceDriver>,
    device: DeviceId,
    arena_fraction: f64,
) -> ForgeResult<Arc<dyn DeviceAllocator>> {
    Ok(match kind {
        AllocatorKind::Pool => Arc::new(PoolAllocator::new(driver, device, arena_fraction)?),
        AllocatorKind::Direct => Arc::new(DirectAllocator::new(driver, device)?),
    })
}
