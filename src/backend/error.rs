//! Device driver error types

use thiserror::Error;

use super::driver::DeviceId;

/// Errors reported by a [`DeviceDriver`](super::DeviceDriver) or a
/// [`KernelCompiler`](super::KernelCompiler).
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Driver initialization failed: {0}")]
    InitializationFailed(String),
    #[error("Device {0} not found")]
    DeviceNotFound(DeviceId),
    #[error("Device memory allocation failed: {0}")]
    MemoryAllocationFailed(String),
    #[error("Device memory query failed: {0}")]
    MemoryQueryFailed(String),
    #[error("Kernel module loading failed: {0}")]
    KernelLoadFailed(String),
    #[error("Kernel launch failed: {0}")]
    KernelLaunchFailed(String),
    #[error("Compilation of '{name}' failed: {log}")]
    CompilationFailed { name: String, log: String },
    #[error("Peer access {device} -> {peer} failed: {reason}")]
    PeerAccessFailed {
        device: DeviceId,
        peer: DeviceId,
        reason: String,
    },
    #[error("Device error: {0}")]
    DeviceError(String),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for BackendError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BackendError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Backend result type
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    /// Check if this error is recoverable (temporary condition)
    ///
    /// Allocation and copy failures may succeed once memory is released;
    /// compilation failures are deterministic and never are.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::DeviceError(_)
                | BackendError::MemoryAllocationFailed(_)
                | BackendError::MemoryQueryFailed(_)
                | BackendError::KernelLaunchFailed(_)
        )
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}
