//! Custom error types for the readout pipeline.
//!
//! This module defines the primary error type, `RebError`, for the whole crate.
//! Using the `thiserror` crate, it provides one place where every failure of the
//! acquisition, broadcast and persistence paths is named.
//!
//! ## Error Hierarchy
//!
//! `RebError` groups failures by where they are detected:
//!
//! - **`Configuration`**: Invalid geometry, stripe mask or settings. Always raised
//!   synchronously before any stripe buffer is touched.
//! - **`ConfigLoad`**: Wraps `figment` errors raised while reading the TOML file or the
//!   `REB_` environment overrides.
//! - **`Transport` / `TransportMismatch`**: Problems reported by the pixel transport.
//!   The acquisition pass logs these and still publishes the frame; they only surface
//!   as values through `AcquisitionOutcome`.
//! - **`Register`**: The register link refused a read or write. Surfaced to the caller,
//!   the operation is aborted.
//! - **`Persistence` / `Io`**: A FITS file could not be produced. Collected per stripe
//!   so one failing file never aborts its siblings.
//! - **`ThreadSpawn`**: The OS refused to start a publisher or writer thread. Fatal and
//!   always reported.
//! - **`Broadcast`**: ZMQ socket creation, option or bind failures.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, RebError>;

#[derive(Error, Debug)]
pub enum RebError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport returned {received} samples, expected {expected}")]
    TransportMismatch { expected: usize, received: usize },

    #[error("Register {operation} failed at 0x{address:06x}: {message}")]
    Register {
        operation: &'static str,
        address: u32,
        message: String,
    },

    #[error("Failed to write {path}: {message}")]
    Persistence { path: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Broadcast socket error: {0}")]
    Broadcast(#[from] zmq::Error),

    #[error("Broadcast protocol violation: {0}")]
    Protocol(String),
}

impl RebError {
    /// Whether the failure leaves the device usable for the next request.
    ///
    /// Thread spawn and configuration-load failures indicate the process is in no state
    /// to keep acquiring; everything else only affects the request that raised it.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            RebError::ThreadSpawn { .. } | RebError::ConfigLoad(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_error_formats_address_as_hex() {
        let err = RebError::Register {
            operation: "read",
            address: 0x400007,
            message: "timeout".into(),
        };
        assert_eq!(
            err.to_string(),
            "Register read failed at 0x400007: timeout"
        );
    }

    #[test]
    fn thread_spawn_is_not_recoverable() {
        let err = RebError::ThreadSpawn {
            name: "reb-publisher-0".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "no threads left"),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("reb-publisher-0"));
    }

    #[test]
    fn transport_mismatch_is_recoverable() {
        let err = RebError::TransportMismatch {
            expected: 64,
            received: 60,
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("expected 64"));
    }
}
