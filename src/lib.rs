//! tensorforge - GPU tensor-compute substrate
//!
//! The runtime underneath elementwise and reduction operations on AMD GPUs:
//! per-device memory pools, multi-GPU contexts with peer-access
//! negotiation, kernel specialization and compilation caches, and strided
//! iteration with single/two-pass reduction dispatch.
//!
//! All device access goes through [`backend::DeviceDriver`]. Build with the
//! `rocm` feature for the HIP driver; [`backend::SimDriver`] runs everything
//! on the host.

#![allow(clippy::too_many_arguments)] // Kernel launches need many args
#![allow(clippy::type_complexity)] // Cache maps keyed by tuples
#![allow(clippy::missing_safety_doc)] // FFI bindings documented at module level

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod memory;
pub mod ops;
pub mod residency;
pub mod runtime;
pub mod tensor;

pub use backend::{DeviceDriver, DeviceId, DevicePtr, KernelCompiler, SimDriver};
pub use config::RuntimeConfig;
pub use context::{DeviceContext, MultiDeviceContext, PeerAccessMatrix};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use kernels::{KernelConfig, KernelLibrary, Specialization};
pub use memory::{AllocatorKind, DeviceAllocator, DeviceMemory, DirectAllocator, PoolAllocator};
pub use ops::InitPolicy;
pub use residency::Resident;
pub use runtime::TensorRuntime;
pub use tensor::{DType, DeviceTensor, StridedCursor, TensorLayout};
