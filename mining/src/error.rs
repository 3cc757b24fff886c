//! Error types for the stratum server side of the pipeline (the Job Manager,
//! client sessions, and the listener). Share-level rejections are not
//! errors — they're `ShareOutcome::Invalid` values, handled as data.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed stratum line: {0}")]
    Protocol(String),

    #[error("upstream RPC error: {0}")]
    Rpc(#[from] kps_rpc::RpcClientError),

    #[error("client channel closed")]
    ChannelClosed,
}
