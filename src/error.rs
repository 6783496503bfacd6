//! Unified error handling for tensorforge
//!
//! Every fallible operation above the driver layer returns [`ForgeError`].
//! Errors are grouped by [`ErrorCategory`] so callers can decide whether to
//! retry (resource exhaustion), fix their input (user errors) or treat the
//! failure as fatal (configuration, compilation, internal).

use std::fmt;

use crate::backend::{BackendError, DeviceId, DevicePtr};

/// Unified error type for tensorforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Resource Exhaustion ==========
    /// The device arena has no gap large enough for the request
    #[error("Out of device memory on device {device}: requested {requested} bytes, {available} bytes free")]
    OutOfMemory {
        device: DeviceId,
        requested: usize,
        available: usize,
    },

    // ========== Configuration Errors ==========
    /// A kernel config does not match the macros its template declares
    #[error("Kernel config mismatch for template '{template}': missing {missing:?}, unexpected {extra:?}")]
    KernelConfigMismatch {
        template: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    /// Two-pass reduction requested on a device without scratch space
    #[error("No reduction scratch space on device {device}")]
    ScratchUnavailable { device: DeviceId },

    /// Invalid runtime configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration file or string could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    // ========== Compilation Errors ==========
    /// A rendered kernel failed to compile. The rendered source is kept.
    #[error("Compilation of kernel '{entry}' (template '{template}') failed: {log}")]
    Compilation {
        template: String,
        entry: String,
        rendered: String,
        log: String,
    },

    // ========== User Errors ==========
    /// Device id not managed by this context
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// No template registered under this name
    #[error("Unknown kernel template: {0}")]
    UnknownTemplate(String),

    /// Template does not define this entry point
    #[error("Kernel template '{template}' has no entry '{entry}'")]
    UnknownEntry { template: String, entry: String },

    /// Tensor shape, stride or dtype unusable for the requested operation
    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),

    /// Free of an address the allocator does not own
    #[error("Invalid free of {addr} on device {device}")]
    InvalidFree { device: DeviceId, addr: DevicePtr },

    // ========== Backend Errors ==========
    /// Driver or compiler failure
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // ========== Internal Errors ==========
    /// The allocator's arena has already been released
    #[error("Allocator for device {0} has been released")]
    AllocatorReleased(DeviceId),

    /// The context has already been disposed
    #[error("Context has been disposed")]
    Disposed,

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock poisoned (indicates a bug or concurrent access issue)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::OutOfMemory { .. } => ErrorCategory::ResourceExhaustion,

            ForgeError::KernelConfigMismatch { .. }
            | ForgeError::ScratchUnavailable { .. }
            | ForgeError::InvalidConfiguration(_)
            | ForgeError::ConfigParse(_) => ErrorCategory::Configuration,

            ForgeError::Compilation { .. } => ErrorCategory::Compilation,

            ForgeError::UnknownDevice(_)
            | ForgeError::UnknownTemplate(_)
            | ForgeError::UnknownEntry { .. }
            | ForgeError::InvalidTensor(_)
            | ForgeError::InvalidFree { .. } => ErrorCategory::User,

            ForgeError::Backend(BackendError::CompilationFailed { .. }) => {
                ErrorCategory::Compilation
            }
            ForgeError::Backend(_) => ErrorCategory::Backend,

            ForgeError::AllocatorReleased(_)
            | ForgeError::Disposed
            | ForgeError::Io(_)
            | ForgeError::LockPoisoned(_)
            | ForgeError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable (temporary condition)
    ///
    /// Out-of-memory may succeed after the caller releases tensors; transient
    /// driver failures may succeed on retry. Everything else is deterministic.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ForgeError::OutOfMemory { .. } => true,
            ForgeError::Backend(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// True for arena exhaustion
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, ForgeError::OutOfMemory { .. })
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }
}

/// Error category for handling decisions
///
/// - Configuration: template/config mismatch or missing resources, never retried
/// - ResourceExhaustion: retry after releasing memory
/// - Compilation: deterministic, fix the template
/// - Backend: driver failure, may be transient
/// - User: invalid input
/// - Internal: indicates a bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    ResourceExhaustion,
    Compilation,
    Backend,
    User,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::ResourceExhaustion => write!(f, "ResourceExhaustion"),
            ErrorCategory::Compilation => write!(f, "Compilation"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

/// Result type using [`ForgeError`]
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ForgeError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::Internal(format!($fmt, $($arg)*))
    };
}

/// Create an invalid-tensor error with context
#[macro_export]
macro_rules! tensor_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidTensor($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidTensor(format!($fmt, $($arg)*))
    };
}
