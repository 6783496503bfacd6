//! Device contexts
//!
//! A [`DeviceContext`] owns everything bound to one GPU: the allocator, a
//! pool of BLAS handles and the reduction scratch buffer.
//! [`MultiDeviceContext`] owns all of them, the peer-access matrix and the
//! loaded-kernel cache, and routes device-scoped requests by id.

pub mod device_context;
pub mod handle_pool;
pub mod multi_device;

pub use device_context::{
    ContextKey, DeviceContext, ScratchGuard, ScratchSpace, SCRATCH_BYTES_PER_MULTIPROCESSOR,
};
pub use handle_pool::{blas_handle_pool, BlasHandle, HandlePool, PooledHandle};
pub use multi_device::{MultiDeviceContext, PeerAccessMatrix};
