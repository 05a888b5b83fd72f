//! Error types for sandbox operations

use std::io;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while launching and supervising sandboxed processes
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Kernel refused {0}")]
    KernelRefused(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Handshake peer lost: {0}")]
    PeerLost(String),

    #[error("Accounting unavailable: {0}")]
    AccountingUnavailable(String),

    #[error("Child aborted before exec")]
    ChildAborted,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SandboxError::ChildAborted;
        assert_eq!(err.to_string(), "Child aborted before exec");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = SandboxError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_kernel_refused_carries_operation() {
        let err = SandboxError::KernelRefused("clone3: EPERM".to_string());
        assert!(err.to_string().contains("clone3"));
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}
