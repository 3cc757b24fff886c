//! Coinbase construction and merkle root assembly for a block template.
//!
//! Unlike a Bitcoin-style pool, this server hands each client a fully
//! assembled header per job (nonce-space partitioning happens via the
//! `extraNonce1` prefix baked into the submitted nonce, not via a
//! miner-supplied `extranonce2` spliced into the coinbase). Coinbase and
//! merkle root are therefore computed once per job, not once per share.

use sha3::{Digest, Keccak256};

use kps_core::Hash;

/// BIP34-style minimal-push serialization of a block height for the
/// coinbase scriptSig.
pub fn serialize_script_height(height: u64) -> Vec<u8> {
    if height == 0 {
        return vec![0x00];
    }
    let mut value = height;
    let mut bytes = Vec::new();
    while value > 0 {
        bytes.push((value & 0xff) as u8);
        value >>= 8;
    }
    // If the high bit of the last byte is set, push a zero padding byte so
    // the value isn't misread as negative by a minimal-push decoder.
    if bytes.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        bytes.push(0x00);
    }
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

/// Standard P2PKH output script for a 20-byte pubkey hash.
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(0x76); // OP_DUP
    script.push(0xa9); // OP_HASH160
    script.push(0x14); // push 20 bytes
    script.extend_from_slice(pubkey_hash);
    script.push(0x88); // OP_EQUALVERIFY
    script.push(0xac); // OP_CHECKSIG
    script
}

/// Build the coinbase transaction paying `reward` to `payout_script`,
/// embedding `height` per BIP34 and a short opaque tag (e.g. pool
/// identifier) in the scriptSig.
pub fn build_coinbase(height: u64, reward: u64, payout_script: &[u8], tag: &[u8]) -> Vec<u8> {
    let mut tx = Vec::new();
    tx.extend_from_slice(&1u32.to_le_bytes()); // version
    tx.push(1); // one input
    tx.extend_from_slice(&[0u8; 32]); // null prevout hash
    tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // null prevout index

    let height_script = serialize_script_height(height);
    let script_sig_len = height_script.len() + tag.len();
    tx.push(script_sig_len as u8);
    tx.extend_from_slice(&height_script);
    tx.extend_from_slice(tag);

    tx.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence
    tx.push(1); // one output
    tx.extend_from_slice(&reward.to_le_bytes());
    tx.push(payout_script.len() as u8);
    tx.extend_from_slice(payout_script);
    tx.extend_from_slice(&0u32.to_le_bytes()); // locktime
    tx
}

pub fn txid(tx_bytes: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(tx_bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn pair_hash(a: &Hash, b: &Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Compute the merkle root over `coinbase_txid` followed by `other_txids`,
/// in block order. Odd levels duplicate the trailing hash.
pub fn merkle_root(coinbase_txid: Hash, other_txids: &[Hash]) -> Hash {
    let mut level = Vec::with_capacity(other_txids.len() + 1);
    level.push(coinbase_txid);
    level.extend_from_slice(other_txids);

    if level.len() == 1 {
        return level[0];
    }

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            next.push(pair_hash(&pair[0], &pair[1]));
        }
        level = next;
    }
    level[0]
}

/// The header hash a job's KawPoW verification runs against: keccak256 over
/// the fixed-size pre-nonce header fields. The nonce and mix hash are
/// supplied separately at submission time by [`KawpowVerifier::verify`].
pub fn header_hash(
    version: u32,
    previous_block_hash: &Hash,
    merkle_root: &Hash,
    bits: u32,
    curtime: u32,
) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(version.to_le_bytes());
    hasher.update(previous_block_hash);
    hasher.update(merkle_root);
    hasher.update(bits.to_le_bytes());
    hasher.update(curtime.to_le_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}
