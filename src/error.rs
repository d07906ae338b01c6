//! Error types for the GPU resource and transfer layer.

use thiserror::Error;

/// Errors that can occur in the GPU resource and transfer layer.
///
/// Every fallible public operation in this crate returns `Result<T, GpuError>`;
/// nothing panics across the public boundary. Destructors never propagate
/// errors: failures during teardown are logged and discarded.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Failed to initialize the device layer (instance, device, allocator).
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    /// An invalid parameter was provided (null range, zero size, out-of-range
    /// offset or count).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Malformed resource creation parameters.
    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),
    /// The device allocator is exhausted.
    #[error("out of GPU memory")]
    OutOfMemory,
    /// A device-side operation (copy, map, submit) failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),
    /// A wait exceeded its deadline. Distinct from a device error so callers
    /// can retry or escalate.
    #[error("wait timed out")]
    Timeout,
}

impl GpuError {
    /// Whether this error is a timeout rather than a genuine failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuError::OutOfMemory;
        assert_eq!(err.to_string(), "out of GPU memory");

        let err = GpuError::InvalidParameter("zero size".to_string());
        assert_eq!(err.to_string(), "invalid parameter: zero size");

        let err = GpuError::Timeout;
        assert_eq!(err.to_string(), "wait timed out");
    }

    #[test]
    fn test_is_timeout() {
        assert!(GpuError::Timeout.is_timeout());
        assert!(!GpuError::OutOfMemory.is_timeout());
    }
}
