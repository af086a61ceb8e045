/// Mining shares module
///
/// Share outcomes produced by the job manager and their persistence in redis.

pub mod storage;
pub mod recorder;

pub use storage::{Keys, RedisStorage, StoreOp};
pub use recorder::ShareRecorder;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a share is rejected. `code()` is the number reported to the miner.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ShareError {
    #[error("incorrect size of extranonce2")]
    ExtraNonce2Size,
    #[error("job not found")]
    JobNotFound,
    #[error("incorrect size of ntime")]
    NTimeSize,
    #[error("ntime out of range")]
    NTimeOutOfRange,
    #[error("incorrect size of nonce")]
    NonceSize,
    #[error("malformed {0}")]
    Malformed(&'static str),
    #[error("duplicate share")]
    Duplicate,
    #[error("low difficulty share of {0}")]
    LowDifficulty(f64),
    #[error("low difficulty share")]
    HashUnavailable,
}

impl ShareError {
    pub fn code(&self) -> i32 {
        match self {
            ShareError::ExtraNonce2Size
            | ShareError::NTimeSize
            | ShareError::NTimeOutOfRange
            | ShareError::NonceSize
            | ShareError::Malformed(_) => 20,
            ShareError::JobNotFound => 21,
            ShareError::Duplicate => 22,
            ShareError::LowDifficulty(_) | ShareError::HashUnavailable => 23,
        }
    }
}

/// Block solution forwarded to the daemon with `miner-submit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundBlock {
    pub height: u64,
    /// extranonce1 + extranonce2 (hex)
    pub payload: String,
    pub timestamp: u32,
    pub nonce: u32,
}

/// One event per submitted share, accepted or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareEvent {
    pub job: String,
    pub ip: String,
    pub port: u16,
    /// `address.payment_id`
    pub worker: String,
    pub worker_name: String,
    pub worker_pass: String,
    pub height: u64,
    /// Difficulty credited for this share
    pub difficulty: f64,
    pub share_diff: f64,
    pub block_diff: f64,
    pub block_hash: Option<String>,
    pub error: Option<String>,
    pub block: Option<FoundBlock>,
}

impl ShareEvent {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}
