//! Error types for the frame/buffer layer.
//!
//! Recoverable stream conditions (drops, resets) are handled locally by the
//! protocol engines and never surface here; these errors cover structural
//! misuse of the containers and allocation failures.

use std::time::Duration;

use thiserror::Error;

/// Result alias for the stream fabric.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors raised by buffers, frames, pools and the stream fabric.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// An offset or length exceeded its container.
    #[error("boundary violation: requested {requested}, limit {limit}")]
    Boundary {
        /// Offset or length that was requested
        requested: usize,
        /// Largest legal value for the operation
        limit: usize,
    },

    /// A buffer or frame could not be created.
    #[error("allocation of {requested} bytes failed")]
    Allocation {
        /// Number of bytes that could not be provided
        requested: usize,
    },

    /// A deadline expired on allocation or queue admission.
    #[error("timeout after {elapsed:?}")]
    Timeout {
        /// How long the operation waited
        elapsed: Duration,
    },

    /// A frame request was made on a master with no attached slave.
    #[error("frame request without an attached slave")]
    NoSlave,

    /// The slave is a pure sink and cannot satisfy allocation requests.
    #[error("slave does not supply buffers")]
    NoPool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = StreamError::Boundary { requested: 12, limit: 8 };
        assert_eq!(err.to_string(), "boundary violation: requested 12, limit 8");

        let err = StreamError::Allocation { requested: 4096 };
        assert!(err.to_string().contains("4096"));
    }
}
