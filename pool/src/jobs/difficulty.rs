/// Difficulty and header math
///
/// Difficulties are `DIFF1 / n` in f64 where `n` is a 256-bit target or hash read
/// big-endian. Share weights convert difficulty into expected hashes so they can
/// be summed as integers.

use anyhow::{anyhow, Result};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use std::sync::OnceLock;

/// Last height hashed with RandomHash v1
pub const RH2_FORK_HEIGHT: u64 = 378_000;

static DIFF1: OnceLock<BigUint> = OnceLock::new();

/// `0x00000000ffff0000...0000`
pub fn diff1() -> &'static BigUint {
    DIFF1.get_or_init(|| BigUint::from(0xffffu32) << 208u32)
}

fn as_f64(n: &BigUint) -> f64 {
    n.to_f64().unwrap_or(f64::INFINITY)
}

fn round9(x: f64) -> f64 {
    (x * 1e9).round() / 1e9
}

/// Job difficulty for a full target, rounded to 9 decimals.
pub fn target_difficulty(target: &BigUint) -> f64 {
    if target.is_zero() {
        return f64::INFINITY;
    }
    round9(as_f64(diff1()) / as_f64(target))
}

/// Difficulty achieved by a hash.
pub fn hash_difficulty(hash: &BigUint) -> f64 {
    if hash.is_zero() {
        return f64::INFINITY;
    }
    as_f64(diff1()) / as_f64(hash)
}

/// `round(2^32 * difficulty)`
pub fn share_weight(difficulty: f64) -> i64 {
    (4_294_967_296.0 * difficulty).round() as i64
}

pub fn parse_target(hex_str: &str) -> Result<BigUint> {
    let bytes = hex::decode(hex_str).map_err(|e| anyhow!("Invalid target hex {}: {}", hex_str, e))?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// Expands a PascalCoin compact target.
pub fn target_from_compact(compact: u32) -> BigUint {
    let nbits = (compact >> 24).clamp(8, 231);
    let offset = ((compact & 0x00ff_ffff) ^ 0x00ff_ffff) | 0x0100_0000;
    BigUint::from(offset) << (256 - nbits - 25)
}

/// Reverses the byte order of every 4-byte word.
pub fn swap32(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks(4)
        .flat_map(|word| word.iter().rev().copied())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    RandomHash,
    RandomHash2,
}

impl HashAlgorithm {
    pub fn for_height(height: u64) -> Self {
        if height <= RH2_FORK_HEIGHT {
            HashAlgorithm::RandomHash
        } else {
            HashAlgorithm::RandomHash2
        }
    }

    /// Method name on the mining port
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::RandomHash => "rh",
            HashAlgorithm::RandomHash2 => "rh2",
        }
    }
}
