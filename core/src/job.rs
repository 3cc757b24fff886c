//! Immutable mining jobs and the allocator that mints their IDs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use num_bigint::BigUint;

use crate::Hash;

/// Allocates monotonically increasing 32-bit job IDs, wrapping on overflow.
/// Reset on process restart (it is not persisted — the spec only requires
/// monotonicity within one process lifetime).
#[derive(Debug, Default)]
pub struct JobIdAllocator {
    next: AtomicU32,
}

impl JobIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }

    /// Allocate the next ID, formatted as 8 lowercase hex characters.
    pub fn next_id(&self) -> String {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{:08x}", id)
    }
}

/// An immutable mining job derived from one `BlockTemplate`.
///
/// Everything here is fixed at construction time except `submit_set`, which
/// is the one piece of per-job mutable, contended state (guarded by its own
/// mutex rather than requiring callers to lock the whole job).
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub height: u64,
    /// KawPoW epoch seed hash for this job's height.
    pub seed_hash: Hash,
    /// 32-byte header hash the miner must echo back in `mining.submit`.
    pub header_hash: Hash,
    /// The network's compact-bits target, as a 256-bit big-endian value.
    pub network_target: Hash,
    /// Convenience `BigUint` view of `network_target`, derived once at
    /// construction for fast share/block comparisons.
    pub network_target_num: BigUint,
    pub previous_block_hash: Hash,
    pub coinbase_tx: Vec<u8>,
    /// Raw serialized non-coinbase transactions, in block order, kept so an
    /// accepted share's block can be fully reassembled for `submitblock`.
    pub other_tx_data: Vec<Vec<u8>>,
    pub merkle_root: Hash,
    /// Raw compact bits this job's target was derived from, needed to
    /// reconstruct the accepted block's header.
    pub bits: u32,
    pub version: u32,
    pub curtime: u32,
    pub assembled_at: Instant,
    /// `true` if this job represents a new block (vs. a same-block refresh);
    /// mirrored into `mining.notify`'s `cleanJobs` flag.
    pub is_new_block: bool,
    submit_set: Mutex<HashSet<(String, String)>>,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        height: u64,
        seed_hash: Hash,
        header_hash: Hash,
        network_target: Hash,
        previous_block_hash: Hash,
        coinbase_tx: Vec<u8>,
        other_tx_data: Vec<Vec<u8>>,
        merkle_root: Hash,
        bits: u32,
        version: u32,
        curtime: u32,
        is_new_block: bool,
    ) -> Self {
        let network_target_num = BigUint::from_bytes_be(&network_target);
        Self {
            id,
            height,
            seed_hash,
            header_hash,
            network_target,
            network_target_num,
            previous_block_hash,
            coinbase_tx,
            other_tx_data,
            merkle_root,
            bits,
            version,
            curtime,
            assembled_at: Instant::now(),
            is_new_block,
            submit_set: Mutex::new(HashSet::new()),
        }
    }

    /// Atomically record a `(nonce_hex, extra_nonce1_hex)` submission
    /// against this job. Returns `true` if this is the first time the pair
    /// has been seen, `false` if it is a duplicate.
    pub fn record_submission(&self, nonce_hex: &str, extra_nonce1_hex: &str) -> bool {
        let mut set = self.submit_set.lock().expect("submit_set mutex poisoned");
        set.insert((nonce_hex.to_string(), extra_nonce1_hex.to_string()))
    }

    /// Number of distinct submissions recorded against this job so far.
    pub fn submission_count(&self) -> usize {
        self.submit_set.lock().expect("submit_set mutex poisoned").len()
    }

    /// Whether this header hash is identical to another job's — used to
    /// suppress refresh events that would otherwise be a no-op for miners.
    pub fn has_same_header_hash(&self, other: &Job) -> bool {
        self.header_hash == other.header_hash
    }
}
