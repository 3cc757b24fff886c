//! The ordered, short-circuit `mining.submit` validation procedure: shape,
//! job binding, nonce-prefix binding, duplicate check, KawPoW verification,
//! difficulty check, then the block check.

use byteorder::{LittleEndian, WriteBytesExt};
use std::sync::Arc;

use kps_consensus::difficulty_from_hash;
use kps_core::{Client, Job, ShareOutcome, StratumErrorCode};

use crate::job_manager::JobManager;

pub struct SubmitParams {
    pub worker_name: String,
    pub job_id: String,
    pub nonce_hex: String,
    pub header_hash_hex: String,
    pub mix_hash_hex: String,
}

pub fn validate_share(job_manager: &JobManager, client: &Client, params: &SubmitParams) -> ShareOutcome {
    let Some(nonce) = parse_nonce(&params.nonce_hex) else {
        return ShareOutcome::Invalid(StratumErrorCode::Other);
    };
    let Some(claimed_header_hash) = parse_hash32(&params.header_hash_hex) else {
        return ShareOutcome::Invalid(StratumErrorCode::Other);
    };
    let Some(mix_hash) = parse_hash32(&params.mix_hash_hex) else {
        return ShareOutcome::Invalid(StratumErrorCode::Other);
    };

    let Some(job) = job_manager.find_job(&params.job_id) else {
        return ShareOutcome::Invalid(StratumErrorCode::JobNotFound);
    };

    if claimed_header_hash != job.header_hash {
        return ShareOutcome::Invalid(StratumErrorCode::Other);
    }

    if !nonce_bound_to_client(&params.nonce_hex, &client.extra_nonce1) {
        return ShareOutcome::Invalid(StratumErrorCode::Other);
    }

    if !job.record_submission(&params.nonce_hex, &client.extra_nonce1) {
        return ShareOutcome::Invalid(StratumErrorCode::DuplicateShare);
    }

    let result = match job_manager
        .verifier()
        .verify(&job.header_hash, nonce, job.height, &mix_hash)
    {
        Ok(result) if result.ok => result,
        _ => return ShareOutcome::Invalid(StratumErrorCode::Other),
    };

    let share_diff = difficulty_from_hash(&result.result_hash);
    if share_diff < client.diff {
        return ShareOutcome::Invalid(StratumErrorCode::LowDifficultyShare);
    }

    if result.result_hash_meets(&job) {
        ShareOutcome::ValidBlock {
            block_hex: hex::encode(serialize_block(&job, nonce, &mix_hash)),
            block_hash_hex: hex::encode(result.result_hash),
        }
    } else {
        ShareOutcome::ValidShare
    }
}

trait MeetsNetworkTarget {
    fn result_hash_meets(&self, job: &Job) -> bool;
}

impl MeetsNetworkTarget for kps_consensus::KawpowResult {
    fn result_hash_meets(&self, job: &Job) -> bool {
        kps_consensus::hash_meets_target(&self.result_hash, &job.network_target)
    }
}

fn parse_nonce(hex_str: &str) -> Option<u64> {
    if hex_str.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex_str, 16).ok()
}

fn parse_hash32(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

fn nonce_bound_to_client(nonce_hex: &str, extra_nonce1: &str) -> bool {
    nonce_hex.to_ascii_lowercase().starts_with(&extra_nonce1.to_ascii_lowercase())
}

/// Reassemble the full block for `submitblock`: header fields, nonce and
/// mix hash, then the coinbase and the job's other transactions.
fn serialize_block(job: &Arc<Job>, nonce: u64, mix_hash: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(job.version).unwrap();
    out.extend_from_slice(&job.previous_block_hash);
    out.extend_from_slice(&job.merkle_root);
    out.write_u32::<LittleEndian>(job.curtime).unwrap();
    out.write_u32::<LittleEndian>(job.bits).unwrap();
    out.write_u64::<LittleEndian>(nonce).unwrap();
    out.extend_from_slice(mix_hash);

    write_varint(&mut out, 1 + job.other_tx_data.len() as u64);
    out.extend_from_slice(&job.coinbase_tx);
    for tx in &job.other_tx_data {
        out.extend_from_slice(tx);
    }
    out
}

fn write_varint(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.write_u16::<LittleEndian>(n as u16).unwrap();
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.write_u32::<LittleEndian>(n as u32).unwrap();
    } else {
        out.push(0xff);
        out.write_u64::<LittleEndian>(n).unwrap();
    }
}
