//! Runtime configuration
//!
//! [`RuntimeConfig`] selects the managed devices, the allocator strategy and
//! the kernel cache behaviour. It can be built in code, parsed from JSON or
//! read from `TFORGE_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::DeviceId;
use crate::error::{ForgeError, ForgeResult};
use crate::memory::AllocatorKind;

/// Default share of free device memory reserved for the pool arena
pub const DEFAULT_ARENA_FRACTION: f64 = 0.9;

/// Configuration for a [`TensorRuntime`](crate::runtime::TensorRuntime)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Device ids to manage, in order
    pub devices: Vec<DeviceId>,

    /// Fraction of free device memory reserved by the pool allocator
    pub arena_fraction: f64,

    /// Allocation strategy
    pub allocator: AllocatorKind,

    /// Expected number of concurrently checked-out BLAS handles per device
    pub handle_pool_capacity: usize,

    /// Directory for compiled kernel binaries that survive restarts
    pub kernel_cache_dir: Option<PathBuf>,

    /// Compile every registered template for every specialization at startup
    pub prewarm: bool,

    /// Idle time after which resident objects may be evicted
    pub resident_idle_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            devices: vec![0],
            arena_fraction: DEFAULT_ARENA_FRACTION,
            allocator: AllocatorKind::Pool,
            handle_pool_capacity: 4,
            kernel_cache_dir: None,
            prewarm: false,
            resident_idle_secs: 300,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(mut self, devices: Vec<DeviceId>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_arena_fraction(mut self, arena_fraction: f64) -> Self {
        self.arena_fraction = arena_fraction;
        self
    }

    pub fn with_allocator(mut self, allocator: AllocatorKind) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_handle_pool_capacity(mut self, capacity: usize) -> Self {
        self.handle_pool_capacity = capacity;
        self
    }

    pub fn with_kernel_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kernel_cache_dir = Some(dir.into());
        self
    }

    pub fn with_prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = prewarm;
        self
    }

    pub fn with_resident_idle_secs(mut self, secs: u64) -> Self {
        self.resident_idle_secs = secs;
        self
    }

    pub fn resident_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.resident_idle_secs)
    }

    /// Reject configurations no runtime can be built from
    pub fn validate(&self) -> ForgeResult<()> {
        if self.devices.is_empty() {
            return Err(ForgeError::InvalidConfiguration(
                "at least one device id is required".to_string(),
            ));
        }
        let mut seen = self.devices.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.devices.len() {
            return Err(ForgeError::InvalidConfiguration(format!(
                "duplicate device ids in {:?}",
                self.devices
            )));
        }
        if !(self.arena_fraction > 0.0 && self.arena_fraction <= 1.0) {
            return Err(ForgeError::InvalidConfiguration(format!(
                "arena fraction must be in (0, 1], got {}",
                self.arena_fraction
            )));
        }
        Ok(())
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> ForgeResult<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> ForgeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Defaults overridden by `TFORGE_*` environment variables.
    ///
    /// - `TFORGE_DEVICES`: comma-separated device ids ("0,1,3")
    /// - `TFORGE_ARENA_FRACTION`: float in (0, 1]
    /// - `TFORGE_ALLOCATOR`: "pool" or "direct"
    /// - `TFORGE_KERNEL_CACHE_DIR`: directory path
    /// - `TFORGE_PREWARM`: "1"/"true" to pre-compile at startup
    pub fn from_env() -> ForgeResult<Self> {
        let mut config = RuntimeConfig::default();

        if let Ok(devices) = env::var("TFORGE_DEVICES") {
            config.devices = devices
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<DeviceId>().map_err(|_| {
                        ForgeError::InvalidConfiguration(format!(
                            "TFORGE_DEVICES: '{}' is not a device id",
                            s
                        ))
                    })
                })
                .collect::<ForgeResult<Vec<_>>>()?;
        }

        if let Ok(fraction) = env::var("TFORGE_ARENA_FRACTION") {
            config.arena_fraction = fraction.trim().parse::<f64>().map_err(|_| {
                ForgeError::InvalidConfiguration(format!(
                    "TFORGE_ARENA_FRACTION: '{}' is not a number",
                    fraction
                ))
            })?;
        }

        if let Ok(allocator) = env::var("TFORGE_ALLOCATOR") {
            config.allocator = allocator.parse()?;
        }

        if let Ok(dir) = env::var("TFORGE_KERNEL_CACHE_DIR") {
            if !dir.is_empty() {
                config.kernel_cache_dir = Some(PathBuf::from(dir));
            }
        }

        if let Ok(prewarm) = env::var("TFORGE_PREWARM") {
            config.prewarm = prewarm != "0" && prewarm.to_lowercase() != "false";
        }

        config.validate()?;
        Ok(config)
    }
}
