//! KawPoW epoch/seed derivation, and the opaque verification boundary.
//!
//! The KawPoW hash itself — the memory-hard ProgPoW/Ethash-family
//! primitive — is treated as an opaque function per the system's scope:
//! `verify(header_hash, nonce, height, mix_hash) -> (result_hash, ok)`.
//! This module owns the part of the algorithm that the job assembler and
//! share validator actually need to reason about (epoch boundaries, seed
//! hashes) and defines the trait boundary a real verifier plugs into.

use sha3::{Digest, Keccak256};
use thiserror::Error;

use kps_core::Hash;

/// Number of blocks per KawPoW epoch; the seed hash changes once per epoch.
pub const EPOCH_LENGTH: u64 = 7_500;

#[derive(Debug, Error)]
pub enum KawpowError {
    #[error("verifier backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Epoch number containing `height`.
pub fn epoch_of(height: u64) -> u64 {
    height / EPOCH_LENGTH
}

/// Derive the epoch seed hash: keccak-256 applied iteratively `epoch` times
/// starting from the zero hash, per the KawPoW/Ethash seed-hash
/// construction.
pub fn seed_hash(epoch: u64) -> Hash {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        let mut hasher = Keccak256::new();
        hasher.update(seed);
        seed.copy_from_slice(&hasher.finalize());
    }
    seed
}

/// The three-valued result of running the opaque KawPoW primitive against
/// a candidate header/nonce/mix-hash.
#[derive(Debug, Clone)]
pub struct KawpowResult {
    pub result_hash: Hash,
    pub ok: bool,
}

/// The opaque KawPoW verification boundary. A production deployment backs
/// this with the real dataset-hashing primitive (e.g. an FFI binding to a
/// native KawPoW/ProgPoW implementation); this crate only defines the
/// interface the rest of the server programs against, plus a deterministic
/// stand-in used by tests.
pub trait KawpowVerifier: Send + Sync {
    /// `header_hash` and `mix_hash` are both 32 bytes, big-endian. `nonce`
    /// is the full 64-bit value reconstructed from the miner's submission.
    fn verify(
        &self,
        header_hash: &Hash,
        nonce: u64,
        height: u64,
        mix_hash: &Hash,
    ) -> Result<KawpowResult, KawpowError>;
}

/// Deterministic stand-in verifier: `result_hash = keccak256(header_hash ||
/// nonce || mix_hash || seed_hash(epoch))`, always reporting `ok = true`.
/// This is **not** KawPoW — it exists so the job manager, stratum server,
/// and share validator have something to link and exercise in tests
/// without a native KawPoW backend. Swap in a real verifier for production
/// mining.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceVerifier;

impl KawpowVerifier for ReferenceVerifier {
    fn verify(
        &self,
        header_hash: &Hash,
        nonce: u64,
        height: u64,
        mix_hash: &Hash,
    ) -> Result<KawpowResult, KawpowError> {
        let seed = seed_hash(epoch_of(height));
        let mut hasher = Keccak256::new();
        hasher.update(header_hash);
        hasher.update(nonce.to_be_bytes());
        hasher.update(mix_hash);
        hasher.update(seed);
        let mut result_hash = [0u8; 32];
        result_hash.copy_from_slice(&hasher.finalize());
        Ok(KawpowResult {
            result_hash,
            ok: true,
        })
    }
}
