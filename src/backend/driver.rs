//! Device driver abstraction
//!
//! Everything above this module talks to GPUs through [`DeviceDriver`] and
//! [`KernelCompiler`]. The HIP implementation lives in `hip_backend` (feature
//! `rocm`); [`SimDriver`](super::SimDriver) simulates devices on the host.

use std::fmt;

use super::error::BackendResult;

/// Ordinal of a device as seen by the driver
pub type DeviceId = u32;

/// Raw device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn addr(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one
    pub fn offset(self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Loaded code object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Entry point inside a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub u64);

/// Driver-side BLAS library handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawBlasHandle(pub u64);

/// Device properties queried once per context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    pub total_memory: usize,
    pub multiprocessor_count: u32,
    pub max_threads_per_block: u32,
    pub shared_mem_per_block: usize,
    pub warp_size: u32,
}

/// Free and total device memory in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

/// Kernel launch geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    /// One-dimensional launch of `grid` blocks of `block` threads
    pub fn linear(grid: u32, block: u32, shared_mem_bytes: u32) -> Self {
        LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (block, 1, 1),
            shared_mem_bytes,
        }
    }

    pub fn grid_size(&self) -> u64 {
        self.grid_dim.0 as u64 * self.grid_dim.1 as u64 * self.grid_dim.2 as u64
    }

    pub fn block_size(&self) -> u64 {
        self.block_dim.0 as u64 * self.block_dim.1 as u64 * self.block_dim.2 as u64
    }
}

/// A single kernel parameter, passed by value
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    U32(u32),
    U64(u64),
    I32(i32),
    F32(f32),
    F64(f64),
    /// Plain-old-data struct passed by value (e.g. an encoded tensor info)
    Bytes(Vec<u8>),
}

impl KernelArg {
    /// Raw bytes of the parameter as the kernel sees them
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            KernelArg::Ptr(p) => p.0.to_ne_bytes().to_vec(),
            KernelArg::U32(v) => v.to_ne_bytes().to_vec(),
            KernelArg::U64(v) => v.to_ne_bytes().to_vec(),
            KernelArg::I32(v) => v.to_ne_bytes().to_vec(),
            KernelArg::F32(v) => v.to_ne_bytes().to_vec(),
            KernelArg::F64(v) => v.to_ne_bytes().to_vec(),
            KernelArg::Bytes(b) => b.clone(),
        }
    }
}

impl From<DevicePtr> for KernelArg {
    fn from(ptr: DevicePtr) -> Self {
        KernelArg::Ptr(ptr)
    }
}

impl From<Vec<u8>> for KernelArg {
    fn from(bytes: Vec<u8>) -> Self {
        KernelArg::Bytes(bytes)
    }
}

/// Stateful device API.
///
/// The current device is thread-local, matching HIP/CUDA semantics:
/// `set_device` only affects the calling thread.
pub trait DeviceDriver: Send + Sync + fmt::Debug {
    /// Short backend name for logs
    fn name(&self) -> &str;

    fn device_count(&self) -> BackendResult<u32>;

    fn properties(&self, device: DeviceId) -> BackendResult<DeviceProperties>;

    fn memory_info(&self, device: DeviceId) -> BackendResult<MemoryInfo>;

    fn current_device(&self) -> BackendResult<DeviceId>;

    fn set_device(&self, device: DeviceId) -> BackendResult<()>;

    fn malloc(&self, device: DeviceId, bytes: usize) -> BackendResult<DevicePtr>;

    fn free(&self, device: DeviceId, ptr: DevicePtr) -> BackendResult<()>;

    /// Block until all work queued on `device` has completed
    fn synchronize(&self, device: DeviceId) -> BackendResult<()>;

    /// Let `device` address memory owned by `peer`
    fn enable_peer_access(&self, device: DeviceId, peer: DeviceId) -> BackendResult<()>;

    fn create_blas_handle(&self, device: DeviceId) -> BackendResult<RawBlasHandle>;

    fn destroy_blas_handle(&self, device: DeviceId, handle: RawBlasHandle) -> BackendResult<()>;

    fn load_module(&self, device: DeviceId, image: &[u8]) -> BackendResult<ModuleHandle>;

    fn get_function(&self, module: ModuleHandle, name: &str) -> BackendResult<FunctionHandle>;

    fn unload_module(&self, module: ModuleHandle) -> BackendResult<()>;

    /// Queue a kernel on the device's stream. Returns without waiting.
    fn launch(
        &self,
        device: DeviceId,
        function: FunctionHandle,
        config: &LaunchConfig,
        args: &[KernelArg],
    ) -> BackendResult<()>;
}

/// Runtime compiler turning rendered kernel source into a loadable binary
pub trait KernelCompiler: Send + Sync + fmt::Debug {
    fn compile(&self, name: &str, source: &str) -> BackendResult<Vec<u8>>;
}
