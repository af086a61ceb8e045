/// Block Unlocker - candidate block state machine
///
/// Each cycle asks the daemon about every candidate and moves it along
/// `candidate → pending → orphaned | unlocked`:
/// - pending: the reward split is computed once, stored in the record and
///   added to the workers' `lockedBalance`
/// - orphaned: the stored split is removed from `lockedBalance`
/// - unlocked: the stored split moves from `lockedBalance` to `balance`, the
///   PASA split is added to `pasaBalance` and the round is deleted
///
/// Every transition is one atomic write. A failed daemon call skips the whole
/// cycle. Terminal records live in `blocks:matured` and are never revisited.

use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::block::{BlockRecord, BlockStatus};
use super::rewards::{after_pool_fee, split_rewards, BlockReward, Credit};
use crate::blockchain::rpc_client::{ChainBlock, DaemonApi};
use crate::config::Config;
use crate::jobs::difficulty::{target_difficulty, target_from_compact};
use crate::metrics::prometheus as metrics;
use crate::shares::storage::{Keys, RedisStorage, StoreOp};

/// Confirmations before a block counts as mature
pub const MIN_MATURATION: u64 = 2;

#[derive(Debug, Clone)]
pub struct UnlockerConfig {
    pub interval: Duration,
    pub depth: u64,
    pub concurrency: usize,
    pub pool_fee: f64,
    pub dev_fee_units: i64,
}

impl From<&Config> for UnlockerConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            interval: Duration::from_secs(cfg.block_unlocker.interval.max(1)),
            depth: cfg.block_unlocker.depth,
            concurrency: cfg.block_unlocker.concurrency.max(1),
            pool_fee: cfg.fees.pool_fee,
            dev_fee_units: cfg.fees.dev_fee_units(),
        }
    }
}

/// A member of `blocks:candidates` and its parsed record
#[derive(Debug, Clone)]
pub struct Candidate {
    pub member: String,
    pub record: BlockRecord,
}

/// What the daemon says about a candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainState {
    pub mature: bool,
    pub orphaned: bool,
    pub unlocked: bool,
    pub reward: BlockReward,
}

impl ChainState {
    pub fn from_block(block: &ChainBlock, record: &BlockRecord, depth: u64, dev_fee_units: i64) -> Self {
        Self {
            mature: block.maturation >= MIN_MATURATION,
            orphaned: !block.pow.eq_ignore_ascii_case(&record.hash),
            unlocked: block.maturation >= depth,
            reward: BlockReward::from_chain(block.reward, block.fee, dev_fee_units),
        }
    }
}

/// Input for one candidate
#[derive(Debug, Clone)]
pub struct Assessment {
    pub candidate: Candidate,
    pub state: ChainState,
    /// Round weights at this height
    pub round: HashMap<String, i64>,
}

/// Three transactions, applied in order
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SettlementPlan {
    pub pending: Vec<StoreOp>,
    pub orphan: Vec<StoreOp>,
    pub unlock: Vec<StoreOp>,
    pub pending_blocks: usize,
    pub orphaned_blocks: usize,
    pub unlocked_blocks: usize,
}

fn add_to(totals: &mut BTreeMap<String, i64>, worker: &str, amount: i64) {
    *totals.entry(worker.to_string()).or_insert(0) += amount;
}

fn balance_ops(keys: &Keys, totals: &BTreeMap<String, i64>, field: &str, sign: i64) -> Vec<StoreOp> {
    totals
        .iter()
        .filter(|(_, amount)| **amount > 0)
        .map(|(worker, amount)| StoreOp::hincrby(keys.worker(worker), field, sign * amount))
        .collect()
}

/// Plans the pending, orphan and unlock transactions for one cycle.
pub fn plan_cycle(
    keys: &Keys,
    assessments: &[Assessment],
    pool_fee: f64,
    dev_fee_units: i64,
) -> anyhow::Result<SettlementPlan> {
    let mut plan = SettlementPlan::default();
    let mut locked = BTreeMap::new();
    let mut released = BTreeMap::new();
    let mut unlocked = BTreeMap::new();
    let mut unlocked_pasa = BTreeMap::new();
    let mut pending_released = BTreeMap::new();

    for Assessment { candidate, state, round } in assessments {
        let record = &candidate.record;
        if record.status.is_terminal() {
            tracing::warn!("Block {} is {:?} but still listed as candidate", record.height, record.status);
            continue;
        }
        if !state.mature {
            continue;
        }

        let split = |reward: BlockReward| -> BTreeMap<String, Credit> {
            split_rewards(
                after_pool_fee(reward.reward, pool_fee),
                after_pool_fee(reward.pasa_reward, pool_fee),
                round,
                record.shares,
            )
        };

        let (member, pending) = match record.status {
            BlockStatus::Candidate => {
                let mut pending = record.clone();
                pending.status = BlockStatus::Pending;
                pending.reward = state.reward.reward;
                pending.credits = split(state.reward);
                let member = pending.to_member()?;

                plan.pending.push(StoreOp::zrem(keys.candidates(), candidate.member.clone()));
                plan.pending.push(StoreOp::zadd(keys.candidates(), record.height as i64, member.clone()));
                for (worker, credit) in &pending.credits {
                    add_to(&mut locked, worker, credit.amount);
                }
                plan.pending_blocks += 1;
                tracing::info!("⏳ Pending block {} with reward {}", record.height, state.reward.reward);
                (member, pending)
            }
            _ => {
                let mut pending = record.clone();
                if pending.credits.is_empty() {
                    // locked by an older version without a stored split
                    pending.credits = split(BlockReward { reward: record.reward, ..state.reward });
                }
                (candidate.member.clone(), pending)
            }
        };

        if state.orphaned {
            let mut orphaned = pending.clone();
            orphaned.status = BlockStatus::Orphaned;
            orphaned.reward = 0;
            plan.orphan.push(StoreOp::zrem(keys.candidates(), member));
            plan.orphan.push(StoreOp::zadd(keys.matured(), record.height as i64, orphaned.to_member()?));
            for (worker, credit) in &pending.credits {
                add_to(&mut released, worker, credit.amount);
            }
            plan.orphaned_blocks += 1;
            tracing::info!("💀 Orphaned block {} with reward {}", record.height, pending.reward);
        } else if state.unlocked {
            let mut done = pending.clone();
            done.status = BlockStatus::Unlocked;
            plan.unlock.push(StoreOp::Del { key: keys.round(record.height) });
            plan.unlock.push(StoreOp::zrem(keys.candidates(), member));
            plan.unlock.push(StoreOp::zadd(keys.matured(), record.height as i64, done.to_member()?));
            for (worker, credit) in &pending.credits {
                add_to(&mut unlocked, worker, credit.amount);
                add_to(&mut pending_released, worker, credit.amount);
                add_to(&mut unlocked_pasa, worker, credit.pasa);
            }
            if dev_fee_units > 0 {
                plan.unlock.push(StoreOp::hincrby(keys.stats(), "devFee", dev_fee_units));
            }
            plan.unlocked_blocks += 1;
            tracing::info!("🔓 Unlocked block {} with reward {}", record.height, pending.reward);
        }
    }

    plan.pending.extend(balance_ops(keys, &locked, "lockedBalance", 1));
    plan.orphan.extend(balance_ops(keys, &released, "lockedBalance", -1));
    plan.unlock.extend(balance_ops(keys, &unlocked, "balance", 1));
    plan.unlock.extend(balance_ops(keys, &pending_released, "lockedBalance", -1));
    plan.unlock.extend(balance_ops(keys, &unlocked_pasa, "pasaBalance", 1));
    Ok(plan)
}

/// `getblock` for every height, at most `concurrency` in flight. The first
/// failure fails the whole batch.
pub async fn fetch_blocks(
    daemon: Arc<dyn DaemonApi>,
    heights: Vec<u64>,
    concurrency: usize,
) -> Result<Vec<ChainBlock>> {
    futures::stream::iter(heights)
        .map(move |height| {
            let daemon = daemon.clone();
            async move {
                daemon.get_block(height).await.map_err(|e| {
                    tracing::error!("getblock {} failed: {}", height, e);
                    e
                })
            }
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

/// Difficulty of the newest block in a `getblocks` result
pub fn network_difficulty(blocks: &[ChainBlock]) -> Option<(u64, f64)> {
    let tip = blocks.iter().max_by_key(|b| b.block)?;
    Some((tip.block, target_difficulty(&target_from_compact(tip.target))))
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct UnlockSummary {
    pub candidates: usize,
    pub pending: usize,
    pub orphaned: usize,
    pub unlocked: usize,
}

pub struct BlockUnlocker {
    storage: Arc<RedisStorage>,
    daemon: Arc<dyn DaemonApi>,
    config: UnlockerConfig,
}

impl BlockUnlocker {
    pub fn new(storage: Arc<RedisStorage>, daemon: Arc<dyn DaemonApi>, config: UnlockerConfig) -> Self {
        Self { storage, daemon, config }
    }

    /// Start background unlock loop
    pub fn start(self) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.report_network().await {
                    tracing::debug!("Network difficulty unavailable: {}", e);
                }
                match self.run_cycle().await {
                    Ok(summary) if summary.candidates > 0 => tracing::info!(
                        "🧱 Unlocker: {} candidates, {} pending, {} orphaned, {} unlocked",
                        summary.candidates,
                        summary.pending,
                        summary.orphaned,
                        summary.unlocked
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Block unlocker cycle skipped: {}", e),
                }
            }
        });
    }

    /// Publishes the chain tip's difficulty from `getblocks`.
    pub async fn report_network(&self) -> Result<()> {
        let blocks = self.daemon.get_last_blocks(1).await?;
        if let Some((height, difficulty)) = network_difficulty(&blocks) {
            metrics::set_network_difficulty(difficulty);
            tracing::debug!("Network difficulty {} at height {}", difficulty, height);
        }
        Ok(())
    }

    async fn load_candidates(&self) -> Result<Vec<Candidate>> {
        let members = self.storage.zrange_scored(&self.storage.keys().candidates()).await?;
        let mut candidates = Vec::with_capacity(members.len());
        for (member, height) in members {
            match BlockRecord::parse(&member, height) {
                Ok(record) => candidates.push(Candidate { member, record }),
                Err(e) => tracing::error!("Skipping block candidate: {}", e),
            }
        }
        Ok(candidates)
    }

    pub async fn run_cycle(&self) -> Result<UnlockSummary> {
        let candidates = self.load_candidates().await?;
        if candidates.is_empty() {
            tracing::debug!("No block candidates in redis");
            return Ok(UnlockSummary::default());
        }

        let heights = candidates.iter().map(|c| c.record.height).collect();
        let blocks = fetch_blocks(self.daemon.clone(), heights, self.config.concurrency).await?;
        let states: Vec<ChainState> = candidates
            .iter()
            .zip(&blocks)
            .map(|(c, block)| ChainState::from_block(block, &c.record, self.config.depth, self.config.dev_fee_units))
            .collect();

        let mut assessments = Vec::with_capacity(candidates.len());
        for (candidate, state) in candidates.into_iter().zip(states) {
            let round = if state.mature {
                self.storage.round_shares(candidate.record.height).await?
            } else {
                HashMap::new()
            };
            assessments.push(Assessment { candidate, state, round });
        }

        let plan = plan_cycle(
            self.storage.keys(),
            &assessments,
            self.config.pool_fee,
            self.config.dev_fee_units,
        )?;

        self.storage.apply_atomic(&plan.pending).await?;
        self.storage.apply_atomic(&plan.orphan).await?;
        metrics::inc_blocks_orphaned(plan.orphaned_blocks as u64);
        self.storage.apply_atomic(&plan.unlock).await?;
        metrics::inc_blocks_unlocked(plan.unlocked_blocks as u64);

        Ok(UnlockSummary {
            candidates: assessments.len(),
            pending: plan.pending_blocks,
            orphaned: plan.orphaned_blocks,
            unlocked: plan.unlocked_blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shares::storage::memory::MemoryStore;

    const W1: &str = "77-44.0";
    const W2: &str = "1000-20.abc";

    fn keys() -> Keys {
        Keys::new("pascal")
    }

    fn round() -> HashMap<String, i64> {
        HashMap::from([(W1.to_string(), 3), (W2.to_string(), 7)])
    }

    fn state(maturation: u64, orphaned: bool) -> ChainState {
        ChainState {
            mature: maturation >= MIN_MATURATION,
            orphaned,
            unlocked: maturation >= 100,
            reward: BlockReward { reward: 500_012, pasa_reward: 500_000 },
        }
    }

    fn seed(store: &mut MemoryStore, height: u64) {
        let record = BlockRecord::candidate(height, W1, "00AB", 1_700_000_000, 1, 10);
        store.apply(&[StoreOp::zadd("pascal:blocks:candidates", height as i64, record.to_member().unwrap())]);
        for (w, s) in round() {
            store.apply(&[StoreOp::hincrby(format!("pascal:shares:round{}", height), w, s)]);
        }
    }

    /// Runs one cycle against the in-memory store
    fn cycle(store: &mut MemoryStore, states: &HashMap<u64, ChainState>) -> SettlementPlan {
        let assessments: Vec<Assessment> = store
            .zsets
            .get("pascal:blocks:candidates")
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(member, height)| {
                let height = height as u64;
                let round: HashMap<String, i64> = store
                    .hashes
                    .get(&format!("pascal:shares:round{}", height))
                    .map(|h| h.iter().map(|(w, v)| (w.clone(), v.parse().unwrap())).collect())
                    .unwrap_or_default();
                Assessment {
                    candidate: Candidate { record: BlockRecord::parse(&member, height).unwrap(), member },
                    state: states[&height],
                    round,
                }
            })
            .collect();
        let plan = plan_cycle(&keys(), &assessments, 1.0, 500).unwrap();
        store.apply(&plan.pending);
        store.apply(&plan.orphan);
        store.apply(&plan.unlock);
        plan
    }

    fn locked(store: &MemoryStore, worker: &str) -> i64 {
        store.hget_i64(&format!("pascal:workers:{}", worker), "lockedBalance")
    }

    fn balance(store: &MemoryStore, worker: &str, field: &str) -> i64 {
        store.hget_i64(&format!("pascal:workers:{}", worker), field)
    }

    #[test]
    fn test_immature_block_untouched() {
        let mut store = MemoryStore::default();
        seed(&mut store, 10);
        let plan = cycle(&mut store, &HashMap::from([(10, state(1, false))]));
        assert_eq!(plan, SettlementPlan::default());
        assert_eq!(locked(&store, W1), 0);
    }

    #[test]
    fn test_pending_locks_split() {
        let mut store = MemoryStore::default();
        seed(&mut store, 10);
        let plan = cycle(&mut store, &HashMap::from([(10, state(5, false))]));
        assert_eq!(plan.pending_blocks, 1);

        // 500012 after 1% fee = 495011; 30% and 70%
        assert_eq!(locked(&store, W1), 148_503);
        assert_eq!(locked(&store, W2), 346_507);
        assert!(locked(&store, W1) + locked(&store, W2) <= 495_011);

        let members = store.members("pascal:blocks:candidates");
        let record = BlockRecord::parse(&members[0], 10).unwrap();
        assert_eq!(record.status, BlockStatus::Pending);
        assert_eq!(record.reward, 500_012);
        assert_eq!(record.credits[W1].pasa, 148_500);

        // second cycle at the same depth changes nothing
        let again = cycle(&mut store, &HashMap::from([(10, state(6, false))]));
        assert!(again.pending.is_empty() && again.orphan.is_empty() && again.unlock.is_empty());
        assert_eq!(locked(&store, W1), 148_503);
    }

    #[test]
    fn test_orphan_reverses_lock() {
        let mut store = MemoryStore::default();
        seed(&mut store, 10);
        cycle(&mut store, &HashMap::from([(10, state(5, false))]));
        assert!(locked(&store, W2) > 0);

        let plan = cycle(&mut store, &HashMap::from([(10, state(20, true))]));
        assert_eq!(plan.orphaned_blocks, 1);
        assert_eq!(locked(&store, W1), 0);
        assert_eq!(locked(&store, W2), 0);
        assert_eq!(balance(&store, W1, "balance"), 0);
        assert!(store.members("pascal:blocks:candidates").is_empty());

        let matured = store.members("pascal:blocks:matured");
        let record = BlockRecord::parse(&matured[0], 10).unwrap();
        assert_eq!(record.status, BlockStatus::Orphaned);
        assert_eq!(record.reward, 0);
        // round is kept for orphans
        assert!(store.hashes.contains_key("pascal:shares:round10"));
    }

    #[test]
    fn test_unlock_moves_locked_to_balance() {
        let mut store = MemoryStore::default();
        seed(&mut store, 10);
        cycle(&mut store, &HashMap::from([(10, state(5, false))]));
        let plan = cycle(&mut store, &HashMap::from([(10, state(100, false))]));
        assert_eq!(plan.unlocked_blocks, 1);

        assert_eq!(locked(&store, W1), 0);
        assert_eq!(balance(&store, W1, "balance"), 148_503);
        assert_eq!(balance(&store, W2, "balance"), 346_507);
        assert_eq!(balance(&store, W1, "pasaBalance"), 148_500);
        assert_eq!(balance(&store, W2, "pasaBalance"), 346_500);
        assert_eq!(store.hget_i64("pascal:stats", "devFee"), 500);
        assert!(!store.hashes.contains_key("pascal:shares:round10"));

        let record = BlockRecord::parse(&store.members("pascal:blocks:matured")[0], 10).unwrap();
        assert_eq!(record.status, BlockStatus::Unlocked);

        // terminal blocks are not revisited
        let again = cycle(&mut store, &HashMap::new());
        assert_eq!(again, SettlementPlan::default());
        assert_eq!(balance(&store, W1, "balance"), 148_503);
    }

    #[test]
    fn test_straight_to_unlock_in_one_cycle() {
        let mut store = MemoryStore::default();
        seed(&mut store, 10);
        let plan = cycle(&mut store, &HashMap::from([(10, state(150, false))]));
        assert_eq!((plan.pending_blocks, plan.unlocked_blocks), (1, 1));
        assert_eq!(locked(&store, W1), 0);
        assert_eq!(balance(&store, W1, "balance"), 148_503);
    }

    #[test]
    fn test_legacy_pending_record() {
        let mut store = MemoryStore::default();
        store.apply(&[StoreOp::zadd("pascal:blocks:candidates", 10, "77-44.0:00ab:1700000000:1:10:500012:0")]);
        for (w, s) in round() {
            store.apply(&[StoreOp::hincrby("pascal:shares:round10", w, s)]);
        }
        // balances locked by the older version
        store.apply(&[
            StoreOp::hincrby("pascal:workers:77-44.0", "lockedBalance", 148_503),
            StoreOp::hincrby("pascal:workers:1000-20.abc", "lockedBalance", 346_507),
        ]);

        let plan = cycle(&mut store, &HashMap::from([(10, state(100, false))]));
        assert_eq!((plan.pending_blocks, plan.unlocked_blocks), (0, 1));
        assert_eq!(locked(&store, W1), 0);
        assert_eq!(locked(&store, W2), 0);
        assert_eq!(balance(&store, W2, "balance"), 346_507);
    }

    struct FakeChain {
        missing: Option<u64>,
    }

    fn chain_block(height: u64, target: u32) -> ChainBlock {
        ChainBlock {
            block: height,
            pow: format!("{:04x}", height),
            reward: rust_decimal::Decimal::from(50),
            fee: rust_decimal::Decimal::ZERO,
            maturation: 3,
            target,
            hashratekhs: 0,
            timestamp: 0,
        }
    }

    #[async_trait::async_trait]
    impl DaemonApi for FakeChain {
        async fn get_block(&self, height: u64) -> Result<ChainBlock> {
            if self.missing == Some(height) {
                return Err(anyhow::anyhow!("block {} not found", height));
            }
            Ok(chain_block(height, 0))
        }
        async fn get_last_blocks(&self, _last: u64) -> Result<Vec<ChainBlock>> {
            Ok(vec![chain_block(9, 0x2a00_0000), chain_block(10, 0x2b00_0000)])
        }
        async fn get_block_count(&self) -> Result<u64> {
            Ok(11)
        }
        async fn get_wallet_accounts(&self, _max: u64) -> Result<Vec<crate::blockchain::rpc_client::WalletAccount>> {
            Ok(Vec::new())
        }
        async fn get_wallet_coins(&self) -> Result<rust_decimal::Decimal> {
            Ok(rust_decimal::Decimal::ZERO)
        }
        async fn send_to(&self, _t: &crate::blockchain::rpc_client::Transfer) -> Result<crate::blockchain::rpc_client::Operation> {
            Err(anyhow::anyhow!("wallet not available"))
        }
        async fn change_key(&self, _a: u64, _k: &str) -> Result<crate::blockchain::rpc_client::Operation> {
            Err(anyhow::anyhow!("wallet not available"))
        }
        async fn unlock(&self, _p: &str) -> Result<bool> {
            Ok(false)
        }
        async fn lock(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_fetch_blocks_keeps_order() {
        let daemon: Arc<dyn DaemonApi> = Arc::new(FakeChain { missing: None });
        let heights: Vec<u64> = (1..=25).collect();
        let blocks = tokio::spawn(fetch_blocks(daemon, heights.clone(), 4)).await.unwrap().unwrap();
        assert_eq!(blocks.iter().map(|b| b.block).collect::<Vec<_>>(), heights);
    }

    #[tokio::test]
    async fn test_fetch_blocks_fails_fast() {
        let daemon: Arc<dyn DaemonApi> = Arc::new(FakeChain { missing: Some(7) });
        let result = tokio::spawn(fetch_blocks(daemon, (1..=10).collect(), 3)).await.unwrap();
        assert!(result.unwrap_err().to_string().contains("block 7"));
    }

    #[tokio::test]
    async fn test_network_difficulty_from_tip() {
        let daemon = FakeChain { missing: None };
        let blocks = daemon.get_last_blocks(1).await.unwrap();
        let (height, difficulty) = network_difficulty(&blocks).unwrap();
        assert_eq!(height, 10);
        assert_eq!(difficulty, target_difficulty(&target_from_compact(0x2b00_0000)));
        assert!(difficulty > 0.0);
        assert!(network_difficulty(&[]).is_none());
    }

    #[tokio::test]
    async fn test_cycle_runs_on_spawned_task() {
        let storage = Arc::new(RedisStorage::new("redis://127.0.0.1:1", "pascal-test").unwrap());
        let daemon: Arc<dyn DaemonApi> = Arc::new(FakeChain { missing: None });
        let unlocker = BlockUnlocker::new(storage, daemon, UnlockerConfig::from(&Config::default()));
        let handle = tokio::spawn(async move {
            unlocker.report_network().await.unwrap();
            unlocker.run_cycle().await
        });
        // nothing listens on port 1
        handle.abort();
        match handle.await {
            Ok(result) => assert!(result.is_err()),
            Err(e) => assert!(e.is_cancelled()),
        }
    }

    #[test]
    fn test_chain_state_from_block() {
        use rust_decimal_macros::dec;
        let record = BlockRecord::candidate(10, W1, "00ab", 0, 1, 10);
        let block = ChainBlock {
            block: 10,
            pow: "00AB".into(),
            reward: dec!(50),
            fee: dec!(0.0012),
            maturation: 2,
            target: 0,
            hashratekhs: 0,
            timestamp: 0,
        };
        let state = ChainState::from_block(&block, &record, 100, 0);
        assert!(state.mature && !state.orphaned && !state.unlocked);
        assert_eq!(state.reward.reward, 500_012);

        let other = ChainBlock { pow: "FFFF".into(), maturation: 1, ..block };
        let state = ChainState::from_block(&other, &record, 100, 0);
        assert!(!state.mature && state.orphaned);
    }
}
