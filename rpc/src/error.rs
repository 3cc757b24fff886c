//! Error taxonomy for calls against the upstream node, matching the
//! transport / auth / upstream-logical split the rest of the server uses to
//! decide what's retryable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcClientError {
    /// Connection refused, DNS failure, timeout, or any other failure below
    /// the HTTP layer. Safe to retry.
    #[error("transport error calling {method}: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    /// The daemon rejected our credentials (HTTP 401/403). Never retried —
    /// retrying a bad password just wastes a round trip.
    #[error("authentication rejected by upstream (method {method})")]
    Auth { method: String },

    /// The daemon replied with a non-2xx status that isn't an auth failure.
    #[error("upstream returned HTTP {status} for {method}: {body}")]
    Http {
        method: String,
        status: u16,
        body: String,
    },

    /// The HTTP response body wasn't valid JSON-RPC, even after the
    /// `nan`-literal fixup.
    #[error("malformed JSON-RPC response for {method}: {source}")]
    MalformedResponse {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    /// The daemon answered with a JSON-RPC `error` object. This is a logical
    /// rejection (bad params, stale template, etc), never retried.
    #[error("upstream rejected {method}: [{code}] {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// The response parsed as JSON-RPC but a field didn't have the shape we
    /// expected (bad hex, wrong length, ...).
    #[error("malformed field {field} in {method} response: {reason}")]
    InvalidField {
        method: String,
        field: &'static str,
        reason: String,
    },
}

impl RpcClientError {
    /// Whether this failure is purely transport-level and therefore safe to
    /// retry against the same or a failover endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcClientError::Transport { .. })
    }
}
