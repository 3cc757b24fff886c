//! Crate-wide error taxonomy for domain-level (non-I/O) failures.

use thiserror::Error;

/// Errors raised while constructing or mutating the core domain types.
/// Transport, RPC, and protocol errors live in their owning crates
/// (`kps-rpc`, `kps-mining`) — this enum only covers invariants the
/// domain types themselves enforce.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid hex length for {field}: expected {expected} hex chars, got {actual}")]
    InvalidHexLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("odd-length hex string for {field}")]
    OddLengthHex { field: &'static str },

    #[error("invalid hex digit in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },

    #[error("vardiff bounds invalid: minDiff ({min}) must be < maxDiff ({max})")]
    InvalidVarDiffBounds { min: f64, max: f64 },
}
