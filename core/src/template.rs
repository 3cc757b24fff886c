//! Block templates acquired from the upstream node.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::Hash;

/// A block template as returned by the upstream `getblocktemplate` call,
/// normalized into the fields the Job Manager needs to assemble a `Job`.
///
/// One `BlockTemplate` backs exactly one `Job`; it is discarded once that
/// job is superseded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub height: u64,
    pub previous_block_hash: Hash,
    /// Compact difficulty bits (`nBits`), as returned by the daemon.
    pub bits: u32,
    pub curtime: u32,
    pub mintime: u32,
    pub coinbase_value: u64,
    /// Raw transaction hex, in the order the daemon wants them included.
    pub transactions: Vec<TemplateTransaction>,
    /// SegWit witness commitment to embed in the coinbase output, if any.
    pub witness_commitment: Option<Vec<u8>>,
    /// The verbatim upstream JSON, kept around so uncommon fields
    /// (`coinbaseaux`, `capabilities`, …) survive without a second round
    /// trip if a later step needs them.
    #[serde(skip)]
    pub raw: Option<serde_json::Value>,
    /// When this template was received, for latency logging only.
    #[serde(skip, default = "Instant::now")]
    pub received_at: Instant,
}

/// One transaction from a block template, as already serialized by the
/// daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateTransaction {
    pub data: Vec<u8>,
    pub txid: Hash,
}

impl BlockTemplate {
    /// Whether `other` represents a new block relative to `self` (i.e. the
    /// chain tip advanced).
    pub fn is_new_block(&self, other: &BlockTemplate) -> bool {
        self.previous_block_hash != other.previous_block_hash
    }
}
