//! Compact-bits / target / difficulty conversions.
//!
//! The upstream node (not this server) runs its own difficulty-adjustment
//! algorithm and simply hands us `bits` in each block template; this module
//! only converts that compact representation to the big-endian 256-bit
//! target the Share Validator and VarDiff code compare hashes against.

use num_bigint::BigUint;
use num_traits::Zero;

use kps_core::Hash;

/// `diff1` target, per KawPoW/RavenCoin convention: the target at
/// difficulty 1.0.
pub fn diff1_target() -> BigUint {
    // 0x00000000ffff0000000000000000000000000000000000000000000000000
    BigUint::from_bytes_be(&{
        let mut t = [0u8; 32];
        t[4] = 0xff;
        t[5] = 0xff;
        t
    })
}

/// Convert compact difficulty bits (`nBits`) to a big-endian 256-bit target.
pub fn bits_to_target(bits: u32) -> Hash {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x00ff_ffff;
    let mantissa_bytes = mantissa.to_be_bytes(); // [0, m2, m1, m0]

    let mut target = [0u8; 32];
    if exponent <= 3 {
        let shift = 8 * (3 - exponent);
        let value = mantissa >> shift;
        target[29..32].copy_from_slice(&value.to_be_bytes()[1..]);
    } else {
        let start = 32usize.saturating_sub(exponent);
        if start < 32 {
            let n = (32 - start).min(3);
            target[start..start + n].copy_from_slice(&mantissa_bytes[4 - n..]);
        }
    }
    target
}

/// Convert a big-endian 256-bit target back to compact bits.
pub fn target_to_bits(target: &Hash) -> u32 {
    let first_nonzero = target.iter().position(|&b| b != 0);
    let Some(start) = first_nonzero else {
        return 0;
    };
    let exponent = (32 - start) as u32;
    let mut mantissa_bytes = [0u8; 4];
    let n = (32 - start).min(3);
    mantissa_bytes[4 - n..].copy_from_slice(&target[start..start + n]);
    let mantissa = u32::from_be_bytes(mantissa_bytes);
    (exponent << 24) | (mantissa & 0x00ff_ffff)
}

/// Convert a client difficulty into its 256-bit target: `target = diff1 /
/// diff`, clamped so a zero or negative difficulty never divides by zero.
pub fn target_from_difficulty(diff: f64) -> Hash {
    if diff <= 0.0 {
        return [0xff; 32];
    }
    let d1 = diff1_target();
    // Scale to preserve precision: multiply diff1 by 1e9, divide by
    // round(diff * 1e9), i.e. target = diff1 / diff computed in integer math.
    let scale = 1_000_000_000u64;
    let scaled_diff = (diff * scale as f64).round() as u64;
    if scaled_diff == 0 {
        return [0xff; 32];
    }
    let target = (d1 * BigUint::from(scale)) / BigUint::from(scaled_diff);
    biguint_to_hash(&target)
}

/// Compute the share difficulty implied by a result hash: `diff1 /
/// result_hash`. Returns `f64::INFINITY` for an (unreachable in practice)
/// all-zero hash.
pub fn difficulty_from_hash(result_hash: &Hash) -> f64 {
    let value = BigUint::from_bytes_be(result_hash);
    if value.is_zero() {
        return f64::INFINITY;
    }
    let d1 = diff1_target();
    // f64 division via the ratio of the two BigUints' leading digits is
    // overkill here; both fit comfortably in f64 after a lossy but
    // sufficiently precise conversion for share accounting purposes.
    biguint_to_f64(&d1) / biguint_to_f64(&value)
}

fn biguint_to_hash(value: &BigUint) -> Hash {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; 32];
    if bytes.len() >= 32 {
        out.copy_from_slice(&bytes[bytes.len() - 32..]);
    } else {
        out[32 - bytes.len()..].copy_from_slice(&bytes);
    }
    out
}

fn biguint_to_f64(value: &BigUint) -> f64 {
    value.to_string().parse().unwrap_or(f64::MAX)
}

/// `true` if `hash` (big-endian) is numerically less than or equal to
/// `target` (big-endian) — the block/share acceptance comparison.
pub fn hash_meets_target(hash: &Hash, target: &Hash) -> bool {
    BigUint::from_bytes_be(hash) <= BigUint::from_bytes_be(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_to_target_matches_known_value() {
        // nBits 0x1d00ffff is the well-known Bitcoin genesis difficulty-1 bits.
        let target = bits_to_target(0x1d00ffff);
        let mut expected = [0u8; 32];
        expected[4] = 0xff;
        expected[5] = 0xff;
        assert_eq!(target, expected);
    }

    #[test]
    fn bits_target_roundtrip() {
        for bits in [0x1d00ffffu32, 0x1e00ffff, 0x1c7fffff, 0x207fffff] {
            let target = bits_to_target(bits);
            let back = target_to_bits(&target);
            assert_eq!(bits, back, "roundtrip failed for {:#x}", bits);
        }
    }

    #[test]
    fn higher_diff_target_is_smaller() {
        let t1 = target_from_difficulty(1.0);
        let t1000 = target_from_difficulty(1000.0);
        assert!(BigUint::from_bytes_be(&t1000) < BigUint::from_bytes_be(&t1));
    }

    #[test]
    fn difficulty_one_hash_has_difficulty_one() {
        let t1 = target_from_difficulty(1.0);
        let diff = difficulty_from_hash(&t1);
        assert!((diff - 1.0).abs() < 0.01);
    }

    #[test]
    fn hash_meets_target_ordering() {
        let low = [0u8; 32];
        let mut high = [0u8; 32];
        high[31] = 1;
        assert!(hash_meets_target(&low, &high));
        assert!(!hash_meets_target(&high, &low));
    }
}
