/// Share Recorder - folds share events into round and worker counters
///
/// One MULTI per share. A share that finds a block also closes the round in
/// that same MULTI: `shares:roundCurrent` is renamed to `shares:round<height>`.
/// The candidate record carrying the frozen round total is added afterwards
/// for the block unlocker.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::storage::{Keys, RedisStorage, StoreOp};
use super::{FoundBlock, ShareEvent};
use crate::jobs::difficulty::share_weight;
use crate::payout::block::BlockRecord;

const SECONDS_PER_DAY: i64 = 86_400;
const CANDIDATE_ATTEMPTS: u32 = 3;
const CANDIDATE_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct ShareRecorder {
    storage: Arc<RedisStorage>,
    /// Worker key TTL in seconds
    retention: i64,
    submit_block: mpsc::Sender<FoundBlock>,
}

impl ShareRecorder {
    pub fn new(storage: Arc<RedisStorage>, cleanup_interval_days: u64, submit_block: mpsc::Sender<FoundBlock>) -> Self {
        Self {
            storage,
            retention: SECONDS_PER_DAY * cleanup_interval_days as i64,
            submit_block,
        }
    }

    /// Consume share events until every sender is gone
    pub fn start(self, mut events: mpsc::Receiver<ShareEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = self.record(&event).await {
                    tracing::error!("Failed to record share from {}: {}", event.worker, e);
                }
            }
            tracing::info!("Share recorder stopped");
        });
    }

    pub async fn record(&self, event: &ShareEvent) -> Result<()> {
        if let Some(block) = &event.block {
            if self.submit_block.send(block.clone()).await.is_err() {
                tracing::error!("Block {} not forwarded: submitter is gone", block.height);
            }
        }

        let now = Utc::now();
        let ops = share_ops(
            self.storage.keys(),
            event,
            now.timestamp(),
            now.timestamp_millis(),
            self.retention,
        );
        self.storage.apply_atomic(&ops).await?;

        if event.block.is_some() {
            self.close_round(event, now.timestamp()).await?;
        }
        Ok(())
    }

    async fn close_round(&self, event: &ShareEvent, now: i64) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.add_candidate(event, now).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < CANDIDATE_ATTEMPTS => {
                    tracing::warn!("Candidate {} not stored (attempt {}): {}", event.height, attempt, e);
                    attempt += 1;
                    tokio::time::sleep(CANDIDATE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn add_candidate(&self, event: &ShareEvent, now: i64) -> Result<()> {
        let height = event.height;
        let round = self.storage.round_shares(height).await?;
        let record = candidate_record(event, &round, now);
        let member = record.to_member()?;
        self.storage
            .apply_atomic(&[StoreOp::zadd(self.storage.keys().candidates(), height as i64, member)])
            .await?;
        tracing::info!(
            "🧱 Block candidate {} from {}: {} workers, round weight {}",
            height,
            event.worker,
            round.len(),
            record.shares
        );
        Ok(())
    }
}

/// Candidate for a block share over its closed round.
pub fn candidate_record(event: &ShareEvent, round: &HashMap<String, i64>, now: i64) -> BlockRecord {
    BlockRecord::candidate(
        event.height,
        &event.worker,
        event.block_hash.as_deref().unwrap_or_default(),
        now,
        share_weight(event.block_diff),
        round.values().sum(),
    )
}

/// Commands recording one share.
pub fn share_ops(keys: &Keys, event: &ShareEvent, now: i64, now_millis: i64, retention: i64) -> Vec<StoreOp> {
    let worker_key = keys.worker(&event.worker);
    let named = (!event.worker_name.is_empty()).then(|| keys.unique_worker(&event.worker, &event.worker_name));
    let mut ops = Vec::with_capacity(12);

    if event.is_valid() {
        let weight = share_weight(event.difficulty);
        ops.push(StoreOp::hincrby(keys.round_current(), event.worker.clone(), weight));
        for key in std::iter::once(&worker_key).chain(named.as_ref()) {
            ops.push(StoreOp::hincrby(key.clone(), "validShares", 1));
            ops.push(StoreOp::hincrby(key.clone(), "hashes", weight));
        }
        ops.push(StoreOp::zadd(
            keys.hashrate(),
            now,
            format!("{}:{}:{}", weight, event.worker, now_millis),
        ));
    } else {
        for key in std::iter::once(&worker_key).chain(named.as_ref()) {
            ops.push(StoreOp::hincrby(key.clone(), "invalidShares", 1));
        }
    }

    for key in std::iter::once(&worker_key).chain(named.as_ref()) {
        ops.push(StoreOp::hset(key.clone(), "lastShare", now));
        ops.push(StoreOp::Expire { key: key.clone(), seconds: retention });
    }
    ops.push(StoreOp::Expire { key: keys.payments(&event.worker), seconds: retention });

    if event.block.is_some() {
        ops.push(StoreOp::hset(keys.stats(), "lastBlockFound", now_millis));
        ops.push(StoreOp::rename_nx(keys.round_current(), keys.round(event.height)));
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shares::storage::memory::MemoryStore;

    fn event(worker_name: &str, error: Option<&str>, block: bool) -> ShareEvent {
        ShareEvent {
            job: "1a".into(),
            ip: "10.0.0.1".into(),
            port: 3333,
            worker: "77-44.0".into(),
            worker_name: worker_name.into(),
            worker_pass: "x".into(),
            height: 400_100,
            difficulty: 2.0,
            share_diff: 2.5,
            block_diff: 1000.0,
            block_hash: error.is_none().then(|| "00ab".to_string()),
            error: error.map(str::to_string),
            block: block.then(|| FoundBlock { height: 400_100, payload: "aa".into(), timestamp: 1, nonce: 2 }),
        }
    }

    #[test]
    fn test_valid_share_ops() {
        let keys = Keys::new("pascal");
        let mut store = MemoryStore::default();
        store.apply(&share_ops(&keys, &event("rig1", None, false), 1_700_000_000, 1_700_000_000_123, 86_400 * 15));
        store.apply(&share_ops(&keys, &event("rig1", None, false), 1_700_000_001, 1_700_000_001_123, 86_400 * 15));

        let weight = 2 * 4_294_967_296_i64;
        assert_eq!(store.hget_i64("pascal:shares:roundCurrent", "77-44.0"), 2 * weight);
        assert_eq!(store.hget_i64("pascal:workers:77-44.0", "validShares"), 2);
        assert_eq!(store.hget_i64("pascal:workers:77-44.0", "hashes"), 2 * weight);
        assert_eq!(store.hget_i64("pascal:unique_workers:77-44.0:rig1", "validShares"), 2);
        assert_eq!(store.hget_i64("pascal:workers:77-44.0", "lastShare"), 1_700_000_001);
        assert_eq!(store.expiries["pascal:payments:77-44.0"], 1_296_000);
        assert_eq!(
            store.members("pascal:hashrate"),
            vec![
                format!("{}:77-44.0:1700000000123", weight),
                format!("{}:77-44.0:1700000001123", weight)
            ]
        );
        assert!(store.hashes.get("pascal:stats").is_none());
    }

    #[test]
    fn test_invalid_share_ops() {
        let keys = Keys::new("pascal");
        let mut store = MemoryStore::default();
        store.apply(&share_ops(&keys, &event("", Some("duplicate share"), false), 10, 10_000, 60));

        assert_eq!(store.hget_i64("pascal:workers:77-44.0", "invalidShares"), 1);
        assert_eq!(store.hget_i64("pascal:workers:77-44.0", "validShares"), 0);
        assert_eq!(store.hget_i64("pascal:shares:roundCurrent", "77-44.0"), 0);
        assert!(store.members("pascal:hashrate").is_empty());
        assert!(store.hashes.keys().all(|k| !k.contains("unique_workers")));
    }

    #[test]
    fn test_block_share_marks_stats() {
        let keys = Keys::new("pascal");
        let ops = share_ops(&keys, &event("", None, true), 10, 10_123, 60);
        assert!(ops.contains(&StoreOp::hset("pascal:stats", "lastBlockFound", 10_123)));
        assert_eq!(
            ops.last(),
            Some(&StoreOp::rename_nx("pascal:shares:roundCurrent", "pascal:shares:round400100"))
        );
    }

    #[test]
    fn test_block_share_closes_round() {
        let keys = Keys::new("pascal");
        let mut store = MemoryStore::default();
        for worker in ["a.0", "b.0", "a.0"] {
            let mut e = event("", None, false);
            e.worker = worker.into();
            store.apply(&share_ops(&keys, &e, 1, 1, 60));
        }
        let finder = event("", None, true);
        store.apply(&share_ops(&keys, &finder, 2, 2_000, 60));
        assert!(!store.hashes.contains_key("pascal:shares:roundCurrent"));

        let round: HashMap<String, i64> = store.hashes["pascal:shares:round400100"]
            .iter()
            .map(|(worker, weight)| (worker.clone(), weight.parse().unwrap()))
            .collect();
        let record = candidate_record(&finder, &round, 2);
        assert_eq!(round.len(), 3);
        assert_eq!(record.shares, 4 * share_weight(2.0));
        assert_eq!(record.height, 400_100);

        // a late duplicate block keeps the first round and the next share opens a fresh one
        store.apply(&share_ops(&keys, &finder, 3, 3_000, 60));
        assert_eq!(store.hget_i64("pascal:shares:roundCurrent", "77-44.0"), share_weight(2.0));
        assert_eq!(store.hget_i64("pascal:shares:round400100", "77-44.0"), share_weight(2.0));
    }

    #[test]
    fn test_round_weight_sums_to_total() {
        let keys = Keys::new("pascal");
        let mut store = MemoryStore::default();
        let mut expected = 0;
        for (worker, diff) in [("a.0", 1.5), ("b.0", 0.25), ("a.0", 3.0), ("c.0", 1e-9)] {
            let mut e = event("", None, false);
            e.worker = worker.into();
            e.difficulty = diff;
            expected += share_weight(diff);
            store.apply(&share_ops(&keys, &e, 1, 1, 1));
        }
        let total: i64 = store.hashes["pascal:shares:roundCurrent"].values().map(|v| v.parse::<i64>().unwrap()).sum();
        assert_eq!(total, expected);
    }
}
