//! Device driver layer
//!
//! [`DeviceDriver`] and [`KernelCompiler`] are the only way the rest of the
//! crate reaches a GPU. [`SimDriver`] is always available; the HIP driver is
//! compiled with the `rocm` feature.

pub mod driver;
pub mod error;
#[cfg(feature = "rocm")]
pub mod hip_backend;
pub mod sim;

pub use driver::{
    DeviceDriver, DeviceId, DevicePtr, DeviceProperties, FunctionHandle, KernelArg,
    KernelCompiler, LaunchConfig, MemoryInfo, ModuleHandle, RawBlasHandle,
};
pub use error::{BackendError, BackendResult};
#[cfg(feature = "rocm")]
pub use hip_backend::{HipDriver, Hiprtc};
pub use sim::{LaunchRecord, SimCounters, SimDeviceSpec, SimDriver};
