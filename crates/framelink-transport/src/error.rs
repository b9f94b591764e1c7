//! Shim error type.

use thiserror::Error;

/// Errors raised while acquiring or driving an external collaborator.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A backing file or device could not be acquired.
    #[error("cannot open {path}: {source}")]
    Open {
        /// Path that failed to open
        path: String,
        /// Underlying system error
        source: std::io::Error,
    },

    /// A socket could not be connected or bound.
    #[error("network failure at {host}:{port}: {source}")]
    Network {
        /// Target host
        host: String,
        /// Target port
        port: u16,
        /// Underlying system error
        source: std::io::Error,
    },

    /// The kernel driver speaks an incompatible interface version.
    #[error("unsupported driver version {0:#x}, need 0x06")]
    DriverVersion(i32),

    /// The driver rejected a control operation.
    #[error("driver {operation} failed")]
    Driver {
        /// Control operation that failed
        operation: &'static str,
    },

    /// An I/O error on an already-open collaborator.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
