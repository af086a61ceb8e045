/// Payment Processor - PASC payouts and PASA assignment
///
/// Each cycle, with the wallet unlocked:
/// 1. sweep matured mining accounts into the main account and collect the
///    empty ones
/// 2. assign empty accounts to workers whose `pasaBalance` reached the
///    threshold (`changekey` to the worker's public key)
/// 3. send PASC to workers over their payout level
/// 4. forward the accumulated dev fee
///
/// Every transfer is preceded by an intent in `payments:outbox` that is
/// removed in the same transaction that debits the balance. A worker with a
/// leftover intent is not paid again until an operator settles it.

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::blockchain::rpc_client::{from_units, DaemonApi, RpcError, Transfer, WalletAccount};
use crate::config::{Config, KnownAccount, COIN};
use crate::login::{pasa_address, validate_login};
use crate::metrics::prometheus as metrics;
use crate::notifications::{notification_op, Notification, NotificationKind};
use crate::shares::storage::{Keys, RedisStorage, StoreOp};

/// Minor units held back from each payout for the network fee
pub const TRANSFER_FEE: i64 = 1;

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub interval: Duration,
    pub wallet_password: String,
    pub min_payment: i64,
    pub max_payment: Option<i64>,
    pub default_payment: i64,
    pub pasa_threshold: i64,
    pub pasa_donations: Option<String>,
    pub dev_account: u64,
    /// Hex payload attached to dev fee transfers
    pub dev_payload: String,
    pub sweep_margin: u64,
    pub sweep_concurrency: usize,
    pub max_wallet_accounts: u64,
    pub notify_defaults: Vec<String>,
    /// Exchange accounts that need a payment id
    pub known_accounts: Vec<KnownAccount>,
}

impl From<&Config> for PaymentSettings {
    fn from(cfg: &Config) -> Self {
        let p = &cfg.payments;
        Self {
            interval: Duration::from_secs(p.interval.max(1)),
            wallet_password: cfg.daemon.password.clone(),
            min_payment: p.min_payment_units(),
            max_payment: p.max_payment_units(),
            default_payment: p.default_payment_units(),
            pasa_threshold: p.pasa_threshold_units(),
            pasa_donations: p.pasa_donations.clone().filter(|k| !k.is_empty()),
            dev_account: p.dev_account,
            dev_payload: hex::encode(format!("Devfee from {}", cfg.pool_server.pool_id)),
            sweep_margin: p.sweep_margin,
            sweep_concurrency: p.sweep_concurrency.max(1),
            max_wallet_accounts: p.max_wallet_accounts,
            notify_defaults: p.notify_defaults.clone(),
            known_accounts: cfg.known_accounts.clone(),
        }
    }
}

/// Payout-relevant fields of one `workers:<id>` hash
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerBalance {
    pub worker: String,
    pub balance: i64,
    pub pasa_balance: i64,
    /// Payout level clamped to the pool limits
    pub min_payout: i64,
    pub public_key: Option<String>,
    pub notify: Option<String>,
}

impl WorkerBalance {
    pub fn from_fields(worker: &str, fields: &HashMap<String, String>, settings: &PaymentSettings) -> Self {
        let int = |name: &str| fields.get(name).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);

        let level = fields
            .get("minPayoutLevel")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|coins| *coins > 0.0)
            .map(|coins| (coins * COIN as f64).round() as i64)
            .unwrap_or(settings.default_payment);
        let mut min_payout = level.max(settings.min_payment);
        if let Some(max) = settings.max_payment {
            min_payout = min_payout.min(max);
        }

        Self {
            worker: worker.to_string(),
            balance: int("balance"),
            pasa_balance: int("pasaBalance"),
            min_payout,
            public_key: fields.get("publicKey").filter(|k| !k.is_empty()).cloned(),
            notify: fields.get("notify").cloned(),
        }
    }
}

/// Accounts found in the wallet this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub main: u64,
    pub empty: VecDeque<u64>,
    pub transfers: Vec<Transfer>,
}

/// Classifies wallet accounts; `None` when the wallet has none.
pub fn plan_sweep(accounts: &[WalletAccount], height: u64, margin: u64) -> Option<SweepPlan> {
    let main = accounts.first()?.account;
    let mut plan = SweepPlan { main, empty: VecDeque::new(), transfers: Vec::new() };

    for account in accounts.iter().filter(|a| a.account != main) {
        let mined_height = account.account / 5;
        // still maturing, or touched by an operation in this block
        if mined_height + margin >= height || account.updated_b == height {
            continue;
        }
        if account.balance.is_zero() {
            plan.empty.push_back(account.account);
        } else {
            plan.transfers.push(Transfer {
                sender: account.account,
                target: main,
                amount: account.balance,
                fee: Decimal::ZERO,
                payload: String::new(),
            });
        }
    }
    Some(plan)
}

/// `(worker, balance)` for every worker at or over its payout level
pub fn select_payees(workers: &[WorkerBalance]) -> Vec<(String, i64)> {
    workers
        .iter()
        .filter(|w| w.balance > TRANSFER_FEE && w.balance >= w.min_payout)
        .map(|w| (w.worker.clone(), w.balance))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PasaEntry {
    pub worker: String,
    pub public_key: String,
    /// Assigned to the donation key instead of the worker's
    pub donate: bool,
}

/// One entry per whole threshold of `pasaBalance`, shuffled.
pub fn pasa_queue<R: Rng + ?Sized>(
    workers: &[WorkerBalance],
    threshold: i64,
    donation_key: Option<&str>,
    rng: &mut R,
) -> Vec<PasaEntry> {
    if threshold <= 0 {
        return Vec::new();
    }
    let mut queue = Vec::new();
    for worker in workers {
        let count = worker.pasa_balance / threshold;
        if count <= 0 {
            continue;
        }
        let (public_key, donate) = match (&worker.public_key, donation_key) {
            (Some(key), _) => (key.clone(), false),
            (None, Some(donation)) => (donation.to_string(), true),
            (None, None) => continue,
        };
        for _ in 0..count {
            queue.push(PasaEntry { worker: worker.worker.clone(), public_key: public_key.clone(), donate });
        }
    }
    queue.shuffle(rng);
    queue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    Pasc,
    Pasa,
}

/// Transfer about to be made, kept until its balance debit lands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub worker: String,
    pub amount: i64,
    pub kind: PaymentKind,
    pub time: i64,
}

impl PaymentIntent {
    pub fn new(worker: &str, amount: i64, kind: PaymentKind, time: i64) -> Self {
        Self { id: Uuid::new_v4().to_string(), worker: worker.to_string(), amount, kind, time }
    }

    pub fn record_op(&self, keys: &Keys) -> Result<StoreOp> {
        let value = serde_json::to_string(self).map_err(|e| anyhow!("Failed to serialize intent: {}", e))?;
        Ok(StoreOp::hset(keys.outbox(), self.id.clone(), value))
    }

    pub fn clear_op(&self, keys: &Keys) -> StoreOp {
        StoreOp::HDel { key: keys.outbox(), field: self.id.clone() }
    }
}

/// Workers with an unsettled intent in the outbox
pub fn blocked_workers(outbox: &HashMap<String, String>) -> HashSet<String> {
    outbox
        .iter()
        .filter_map(|(id, raw)| match serde_json::from_str::<PaymentIntent>(raw) {
            Ok(intent) => Some(intent.worker),
            Err(e) => {
                tracing::error!("Unreadable payment intent {}: {}", id, e);
                None
            }
        })
        .collect()
}

/// Balance debit and payment records after a PASC transfer
pub fn pasc_payment_ops(keys: &Keys, intent: &PaymentIntent, ophash: &str, now: i64) -> Vec<StoreOp> {
    let worker = &intent.worker;
    let sent = intent.amount - TRANSFER_FEE;
    vec![
        StoreOp::hincrby(keys.worker(worker), "balance", -intent.amount),
        StoreOp::hincrby(keys.worker(worker), "paid", sent),
        StoreOp::zadd(keys.payments_all(), now, format!("{}:{}:{}:{}", ophash, sent, TRANSFER_FEE, worker)),
        StoreOp::zadd(keys.payments(worker), now, format!("{}:{}:{}", ophash, sent, TRANSFER_FEE)),
        intent.clear_op(keys),
    ]
}

/// Balance debit and payment records after a PASA key change
pub fn pasa_payment_ops(
    keys: &Keys,
    intent: &PaymentIntent,
    account: u64,
    donate: bool,
    ophash: &str,
    now: i64,
) -> Vec<StoreOp> {
    let worker = &intent.worker;
    let address = pasa_address(account);
    let mut ops = vec![
        StoreOp::hincrby(keys.worker(worker), "pasaBalance", -intent.amount),
        StoreOp::zadd(keys.pasa_payments_all(), now, format!("{}:0:{}:{}", ophash, address, worker)),
    ];
    if donate {
        ops.push(StoreOp::zadd(keys.pasa_donations(), now, format!("{}:0:{}", ophash, address)));
    } else {
        ops.push(StoreOp::hincrby(keys.worker(worker), "pasaPaid", 1));
        ops.push(StoreOp::zadd(keys.pasa_payments(worker), now, format!("{}:0:{}", ophash, address)));
    }
    ops.push(intent.clear_op(keys));
    ops
}

/// Sends every sweep transfer, at most `concurrency` in flight. Any failure
/// fails the sweep.
pub async fn sweep_accounts(daemon: Arc<dyn DaemonApi>, transfers: Vec<Transfer>, concurrency: usize) -> Result<usize> {
    let swept: Vec<()> = futures::stream::iter(transfers)
        .map(move |transfer| {
            let daemon = daemon.clone();
            async move {
                daemon.send_to(&transfer).await.map_err(|e| {
                    anyhow!("Failed to sweep {} from {} to {}: {}", transfer.amount, transfer.sender, transfer.target, e)
                })?;
                tracing::info!("🧹 Swept {} from {} to {}", transfer.amount, transfer.sender, transfer.target);
                Ok::<_, anyhow::Error>(())
            }
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;
    Ok(swept.len())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PaymentSummary {
    pub swept: usize,
    pub pasa_sent: usize,
    pub pasa_failed: usize,
    pub pasc_sent: usize,
    pub pasc_failed: usize,
    /// Minor units debited from worker balances
    pub pasc_total: i64,
    pub dev_fee: i64,
}

pub struct PaymentProcessor {
    storage: Arc<RedisStorage>,
    daemon: Arc<dyn DaemonApi>,
    settings: PaymentSettings,
}

impl PaymentProcessor {
    pub fn new(storage: Arc<RedisStorage>, daemon: Arc<dyn DaemonApi>, settings: PaymentSettings) -> Self {
        Self { storage, daemon, settings }
    }

    /// Start background payment loop; the next cycle is scheduled after the
    /// previous one finishes.
    pub fn start(self) {
        tokio::spawn(async move {
            loop {
                match self.run_cycle().await {
                    Ok(s) => tracing::info!(
                        "💰 Payments: {} PASC sent ({} failed, {} paid), {} PASA sent ({} failed), {} swept",
                        s.pasc_sent,
                        s.pasc_failed,
                        from_units(s.pasc_total),
                        s.pasa_sent,
                        s.pasa_failed,
                        s.swept
                    ),
                    Err(e) => tracing::warn!("Payment cycle stopped: {}", e),
                }
                tokio::time::sleep(self.settings.interval).await;
            }
        });
    }

    pub async fn run_cycle(&self) -> Result<PaymentSummary> {
        tracing::info!("Unlocking wallet");
        match self.daemon.unlock(&self.settings.wallet_password).await {
            Ok(true) => {}
            Ok(false) => return Err(anyhow!("Wallet refused to unlock")),
            Err(e) => return Err(anyhow!("Failed to unlock wallet: {}", e)),
        }

        let result = self.settle().await;

        tracing::info!("Locking wallet");
        if let Err(e) = self.daemon.lock().await {
            tracing::error!("Failed to lock wallet: {}", e);
        }
        result
    }

    async fn settle(&self) -> Result<PaymentSummary> {
        let keys = self.storage.keys();
        let mut summary = PaymentSummary::default();

        let height = self.daemon.get_block_count().await?;
        let accounts = self.daemon.get_wallet_accounts(self.settings.max_wallet_accounts).await?;
        let sweep = plan_sweep(&accounts, height, self.settings.sweep_margin)
            .ok_or_else(|| anyhow!("Wallet has no PASA"))?;
        match self.daemon.get_wallet_coins().await {
            Ok(coins) => tracing::debug!("Wallet holds {} PASC in {} accounts", coins, accounts.len()),
            Err(e) => tracing::debug!("getwalletcoins failed: {}", e),
        }

        summary.swept = self.sweep(&sweep).await?;
        let mut empty = sweep.empty.clone();
        metrics::set_empty_pasa(empty.len());

        let blocked = blocked_workers(&self.storage.hgetall(&keys.outbox()).await?);
        let workers: Vec<WorkerBalance> = self
            .load_workers()
            .await?
            .into_iter()
            .filter(|w| {
                let is_blocked = blocked.contains(&w.worker);
                if is_blocked {
                    tracing::error!("🚨 {} has an unsettled payment intent, skipping until it is cleared", w.worker);
                }
                !is_blocked
            })
            .collect();
        let dev_fee = self.storage.hget_i64(&keys.stats(), "devFee").await?;

        let payees = select_payees(&workers);
        let queue = {
            let mut rng = rand::thread_rng();
            pasa_queue(
                &workers,
                self.settings.pasa_threshold,
                self.settings.pasa_donations.as_deref(),
                &mut rng,
            )
        };
        if payees.is_empty() && queue.is_empty() {
            tracing::info!("No workers' balances reached the minimum payment threshold");
            return Ok(summary);
        }
        let notify: HashMap<&str, Option<&str>> =
            workers.iter().map(|w| (w.worker.as_str(), w.notify.as_deref())).collect();

        for entry in &queue {
            let Some(account) = empty.pop_front() else {
                tracing::warn!("Not enough PASA to pay out to {}", entry.worker);
                metrics::inc_pasa_payment_errors();
                summary.pasa_failed += 1;
                continue;
            };
            let preference = notify.get(entry.worker.as_str()).copied().flatten();
            match self.pay_pasa(entry, account, preference).await {
                Ok(()) => summary.pasa_sent += 1,
                Err(e) => {
                    tracing::error!("Error transferring PASA {} to {}: {}", account, entry.worker, e);
                    summary.pasa_failed += 1;
                }
            }
        }
        metrics::set_empty_pasa(empty.len());
        if !queue.is_empty() {
            tracing::info!("PASA: {} successfully sent, {} failed", summary.pasa_sent, summary.pasa_failed);
        }

        for (worker, amount) in &payees {
            let preference = notify.get(worker.as_str()).copied().flatten();
            match self.pay_pasc(sweep.main, worker, *amount, preference).await {
                Ok(true) => {
                    summary.pasc_sent += 1;
                    summary.pasc_total += amount;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Error making payment to {} (balance may be locked): {}", worker, e);
                    summary.pasc_failed += 1;
                    tracing::error!("Error transferring some PASC. Stopping payments.");
                    return Ok(summary);
                }
            }
        }

        if dev_fee > TRANSFER_FEE {
            summary.dev_fee = self.pay_dev_fee(sweep.main, dev_fee).await;
        }
        Ok(summary)
    }

    async fn sweep(&self, plan: &SweepPlan) -> Result<usize> {
        sweep_accounts(self.daemon.clone(), plan.transfers.clone(), self.settings.sweep_concurrency).await
    }

    async fn load_workers(&self) -> Result<Vec<WorkerBalance>> {
        let keys = self.storage.keys();
        let mut workers = Vec::new();
        for key in self.storage.scan_keys(&keys.workers_pattern()).await? {
            let Some(worker) = keys.worker_from_key(&key) else {
                continue;
            };
            let fields = self.storage.hgetall(&key).await?;
            workers.push(WorkerBalance::from_fields(worker, &fields, &self.settings));
        }
        Ok(workers)
    }

    /// Drops an intent whose transfer the daemon rejected. Transport failures
    /// leave it in place since the transfer may have gone through.
    async fn discard_intent(&self, intent: &PaymentIntent, error: &anyhow::Error) {
        if error.downcast_ref::<RpcError>().is_none() {
            tracing::error!(
                "🚨 Payment intent {} for {} kept: transfer outcome unknown ({})",
                intent.id,
                intent.worker,
                error
            );
            return;
        }
        if let Err(e) = self.storage.apply_atomic(&[intent.clear_op(self.storage.keys())]).await {
            tracing::error!("Failed to clear payment intent {}: {}", intent.id, e);
        }
    }

    fn super_critical(&self, what: &str, intent: &PaymentIntent, error: &anyhow::Error) {
        metrics::inc_super_critical();
        tracing::error!(
            "🚨 SUPER CRITICAL: {} sent to {} but the balance update failed, a double payout is likely: {}",
            what,
            intent.worker,
            error
        );
    }

    fn notification(
        &self,
        worker: &str,
        kind: NotificationKind,
        variables: BTreeMap<String, String>,
        preference: Option<&str>,
        now: i64,
    ) -> Option<StoreOp> {
        let notification = Notification { worker: worker.to_string(), kind, variables, time: now };
        match notification_op(self.storage.keys(), &notification, preference, &self.settings.notify_defaults) {
            Ok(op) => op,
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        }
    }

    async fn pay_pasa(&self, entry: &PasaEntry, account: u64, preference: Option<&str>) -> Result<()> {
        let keys = self.storage.keys();
        let now = Utc::now().timestamp();
        let intent = PaymentIntent::new(&entry.worker, self.settings.pasa_threshold, PaymentKind::Pasa, now);
        self.storage.apply_atomic(&[intent.record_op(keys)?]).await?;

        let op = match self.daemon.change_key(account, &entry.public_key).await {
            Ok(op) => op,
            Err(e) => {
                metrics::inc_pasa_payment_errors();
                self.discard_intent(&intent, &e).await;
                return Err(e);
            }
        };
        let account = if op.account != 0 { op.account } else { account };
        tracing::info!("🎁 Sent PASA {} to {}", pasa_address(account), entry.worker);

        let mut ops = pasa_payment_ops(keys, &intent, account, entry.donate, &op.ophash, now);
        if !entry.donate {
            let variables = BTreeMap::from([
                ("ACCOUNT".to_string(), account.to_string()),
                ("PUBLIC_KEY".to_string(), entry.public_key.clone()),
            ]);
            ops.extend(self.notification(&entry.worker, NotificationKind::PaymentPasa, variables, preference, now));
        }
        if let Err(e) = self.storage.apply_atomic(&ops).await {
            self.super_critical("PASA", &intent, &e);
        }
        metrics::inc_pasa_payments();
        Ok(())
    }

    /// `Ok(false)` when the worker identity is not a payable address.
    async fn pay_pasc(&self, main: u64, worker: &str, amount: i64, preference: Option<&str>) -> Result<bool> {
        let login = match validate_login(worker, &self.settings.known_accounts) {
            Ok(login) => login,
            Err(e) => {
                tracing::error!("Invalid payment address {}: {}", worker, e);
                return Ok(false);
            }
        };
        let Ok(target) = login.account().parse::<u64>() else {
            tracing::error!("Invalid payment address {}", worker);
            return Ok(false);
        };
        let payload = if login.payment_id == "0" {
            String::new()
        } else {
            hex::encode(login.payment_id.as_bytes())
        };

        let keys = self.storage.keys();
        let now = Utc::now().timestamp();
        let intent = PaymentIntent::new(worker, amount, PaymentKind::Pasc, now);
        self.storage.apply_atomic(&[intent.record_op(keys)?]).await?;

        let sent = from_units(amount - TRANSFER_FEE);
        let transfer = Transfer {
            sender: main,
            target,
            amount: sent,
            fee: from_units(TRANSFER_FEE),
            payload,
        };
        let op = match self.daemon.send_to(&transfer).await {
            Ok(op) => op,
            Err(e) => {
                metrics::inc_pasc_payment_errors();
                self.discard_intent(&intent, &e).await;
                return Err(e);
            }
        };
        tracing::info!("💸 Sent payment of {} to {}.{}", sent, login.address, login.payment_id);

        let mut ops = pasc_payment_ops(keys, &intent, &op.ophash, now);
        let variables = BTreeMap::from([
            ("ACCOUNT".to_string(), login.address.clone()),
            ("PAYMENT_ID".to_string(), login.payment_id.clone()),
            ("AMOUNT".to_string(), format!("{:.4}", sent)),
        ]);
        ops.extend(self.notification(worker, NotificationKind::PaymentPasc, variables, preference, now));
        if let Err(e) = self.storage.apply_atomic(&ops).await {
            self.super_critical("PASC", &intent, &e);
        }
        metrics::inc_pasc_payments();
        Ok(true)
    }

    /// Returns the units taken from `stats.devFee`.
    async fn pay_dev_fee(&self, main: u64, dev_fee: i64) -> i64 {
        let amount = from_units(dev_fee - TRANSFER_FEE);
        let transfer = Transfer {
            sender: main,
            target: self.settings.dev_account,
            amount,
            fee: from_units(TRANSFER_FEE),
            payload: self.settings.dev_payload.clone(),
        };
        if let Err(e) = self.daemon.send_to(&transfer).await {
            tracing::error!("Error making devfee payment of {} PASC: {}", amount, e);
            return 0;
        }
        let keys = self.storage.keys();
        if let Err(e) = self.storage.apply_atomic(&[StoreOp::hincrby(keys.stats(), "devFee", -dev_fee)]).await {
            metrics::inc_super_critical();
            tracing::error!("🚨 SUPER CRITICAL: dev fee of {} sent but not deducted: {}", amount, e);
        }
        tracing::info!("Devfee payment made: {} PASC", amount);
        dev_fee
    }
}
