//! Shared domain types for the KawPoW solo-mining stratum server.
//!
//! This crate holds the data model described in the system's component
//! design: block templates, immutable jobs, per-client session state, and
//! the share type that flows between the client handler and the validator.
//! It carries no I/O and no KawPoW primitive — those live in `kps-rpc` and
//! `kps-consensus` respectively.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod error;
pub mod job;
pub mod share;
pub mod template;
pub mod vardiff;

pub use client::{Client, ClientState};
pub use error::CoreError;
pub use job::{Job, JobIdAllocator};
pub use share::{Share, ShareOutcome, StratumErrorCode};
pub use template::{BlockTemplate, TemplateTransaction};
pub use vardiff::VarDiffConfig;

/// 32-byte hash, used for previous-block hashes, header hashes, and mix
/// hashes alike. Wire encoding is big-endian hex per the KawPoW Stratum
/// profile.
pub type Hash = [u8; 32];

/// Current wall-clock time in whole milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}
