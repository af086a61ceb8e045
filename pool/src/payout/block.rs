/// Block records kept in `blocks:candidates` and `blocks:matured`
///
/// Members are JSON with an explicit status. Colon-joined records written by
/// older pool versions are still understood: five fields is a fresh candidate,
/// seven fields a block whose balances were already locked.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::rewards::Credit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Candidate,
    Pending,
    Orphaned,
    Unlocked,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockStatus::Orphaned | BlockStatus::Unlocked)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u64,
    pub status: BlockStatus,
    /// Finder, `address.payment_id`
    pub worker: String,
    pub hash: String,
    /// Discovery time (unix seconds)
    pub time: i64,
    /// `round(2^32 * network difficulty)`
    pub difficulty: i64,
    /// Total round weight
    pub shares: i64,
    #[serde(default)]
    pub reward: i64,
    /// Per-worker amounts locked at the pending transition
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credits: BTreeMap<String, Credit>,
}

impl BlockRecord {
    pub fn candidate(height: u64, worker: &str, hash: &str, time: i64, difficulty: i64, shares: i64) -> Self {
        Self {
            height,
            status: BlockStatus::Candidate,
            worker: worker.to_string(),
            hash: hash.to_string(),
            time,
            difficulty,
            shares,
            reward: 0,
            credits: BTreeMap::new(),
        }
    }

    pub fn to_member(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| anyhow!("Failed to serialize block {}: {}", self.height, e))
    }

    /// Parses a sorted-set member scored by `height`.
    pub fn parse(member: &str, height: u64) -> Result<Self> {
        if member.starts_with('{') {
            return serde_json::from_str(member).map_err(|e| anyhow!("Invalid block record at {}: {}", height, e));
        }
        Self::parse_legacy(member, height)
    }

    fn parse_legacy(member: &str, height: u64) -> Result<Self> {
        let parts: Vec<&str> = member.split(':').collect();
        let field = |i: usize| -> Result<i64> {
            parts[i]
                .parse::<i64>()
                .map_err(|_| anyhow!("Invalid field {} in legacy block record at {}", i, height))
        };

        let status = match parts.len() {
            5 => BlockStatus::Candidate,
            7 => BlockStatus::Pending,
            n => return Err(anyhow!("Legacy block record at {} has {} fields", height, n)),
        };
        let mut record = Self::candidate(height, parts[0], parts[1], field(2)?, field(3)?, field(4)?);
        record.status = status;
        if status == BlockStatus::Pending {
            record.reward = field(5)?;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_record() {
        let mut record = BlockRecord::candidate(400100, "77-44.0", "00ab", 1_700_000_000, 42, 1000);
        record.credits.insert("77-44.0".into(), Credit { amount: 5, pasa: 4, percent: 1.0 });
        let member = record.to_member().unwrap();
        assert!(member.contains(r#""status":"candidate""#));
        assert_eq!(BlockRecord::parse(&member, 400100).unwrap(), record);
    }

    #[test]
    fn test_credits_omitted_when_empty() {
        let record = BlockRecord::candidate(1, "w", "h", 0, 0, 0);
        assert!(!record.to_member().unwrap().contains("credits"));
    }

    #[test]
    fn test_legacy_candidate() {
        let record = BlockRecord::parse("77-44.0:00AB:1700000000:4294967296:8589934592", 400100).unwrap();
        assert_eq!(record.status, BlockStatus::Candidate);
        assert_eq!(record.worker, "77-44.0");
        assert_eq!(record.hash, "00AB");
        assert_eq!(record.difficulty, 4_294_967_296);
        assert_eq!(record.shares, 8_589_934_592);
        assert!(record.credits.is_empty());
    }

    #[test]
    fn test_legacy_pending() {
        let record = BlockRecord::parse("77-44.0:00AB:1700000000:1:2:495000:0", 9).unwrap();
        assert_eq!(record.status, BlockStatus::Pending);
        assert_eq!(record.reward, 495_000);
        assert_eq!(record.height, 9);
    }

    #[test]
    fn test_legacy_malformed() {
        assert!(BlockRecord::parse("a:b:c", 1).is_err());
        assert!(BlockRecord::parse("w:h:notatime:1:2", 1).is_err());
        assert!(BlockRecord::parse("{not json", 1).is_err());
    }

    #[test]
    fn test_terminal() {
        assert!(BlockStatus::Unlocked.is_terminal());
        assert!(BlockStatus::Orphaned.is_terminal());
        assert!(!BlockStatus::Pending.is_terminal());
    }
}
