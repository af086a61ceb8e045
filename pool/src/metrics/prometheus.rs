use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use prometheus::core::Collector;
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMITS: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static HASH_CHECKS: OnceLock<IntCounter> = OnceLock::new();
static HASH_CHECK_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static NODE_RECONNECTS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static REDIS_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static BLOCKS_UNLOCKED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_ORPHANED: OnceLock<IntCounter> = OnceLock::new();

static PASC_PAYMENTS: OnceLock<IntCounter> = OnceLock::new();
static PASC_PAYMENT_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static PASA_PAYMENTS: OnceLock<IntCounter> = OnceLock::new();
static PASA_PAYMENT_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static SUPER_CRITICAL: OnceLock<IntCounter> = OnceLock::new();

static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static NODE_CONNECTED: OnceLock<IntGauge> = OnceLock::new();
static EMPTY_PASA: OnceLock<IntGauge> = OnceLock::new();
static NETWORK_DIFFICULTY: OnceLock<Gauge> = OnceLock::new();

fn counter(cell: &'static OnceLock<IntCounter>, name: &str, help: &str) -> &'static IntCounter {
    cell.get_or_init(|| IntCounter::new(name, help).expect("static metric definition"))
}

fn gauge(cell: &'static OnceLock<IntGauge>, name: &str, help: &str) -> &'static IntGauge {
    cell.get_or_init(|| IntGauge::new(name, help).expect("static metric definition"))
}

fn network_difficulty() -> &'static Gauge {
    NETWORK_DIFFICULTY.get_or_init(|| {
        Gauge::new("network_difficulty", "Difficulty of the chain tip from getblocks").expect("static metric definition")
    })
}

fn accepted() -> &'static IntCounter {
    counter(&ACCEPTED, "shares_accepted_total", "Total accepted shares")
}

fn rejected() -> &'static IntCounterVec {
    REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_rejected_total", "Total rejected shares by reason code"),
            &["code"],
        )
        .expect("static metric definition")
    })
}

fn blocks_found() -> &'static IntCounter {
    counter(&BLOCKS_FOUND, "blocks_found_total", "Total shares that solved a block")
}

fn block_submits() -> &'static IntCounter {
    counter(&BLOCK_SUBMITS, "block_submits_total", "Total miner-submit writes to the daemon")
}

fn blocks_accepted() -> &'static IntCounter {
    counter(&BLOCKS_ACCEPTED, "blocks_accepted_total", "Total blocks the daemon confirmed as accepted")
}

fn job_broadcasts() -> &'static IntCounter {
    counter(&JOB_BROADCASTS, "job_broadcasts_total", "Total jobs created from daemon templates")
}

fn hash_checks() -> &'static IntCounter {
    counter(&HASH_CHECKS, "hash_checks_total", "Total checkhash requests sent to the daemon")
}

fn hash_check_errors() -> &'static IntCounter {
    counter(&HASH_CHECK_ERRORS, "hash_check_errors_total", "Total checkhash requests that failed or timed out")
}

fn node_reconnects() -> &'static IntCounter {
    counter(&NODE_RECONNECTS, "node_reconnects_total", "Total mining port reconnect attempts")
}

fn rpc_requests() -> &'static IntCounter {
    counter(&RPC_REQUESTS, "rpc_requests_total", "Total JSON-RPC requests to the daemon")
}

fn rpc_errors() -> &'static IntCounter {
    counter(&RPC_ERRORS, "rpc_errors_total", "Total JSON-RPC errors")
}

fn redis_errors() -> &'static IntCounter {
    counter(&REDIS_ERRORS, "redis_errors_total", "Total redis errors")
}

fn blocks_unlocked() -> &'static IntCounter {
    counter(&BLOCKS_UNLOCKED, "blocks_unlocked_total", "Total blocks credited to worker balances")
}

fn blocks_orphaned() -> &'static IntCounter {
    counter(&BLOCKS_ORPHANED, "blocks_orphaned_total", "Total candidate blocks found orphaned")
}

fn pasc_payments() -> &'static IntCounter {
    counter(&PASC_PAYMENTS, "pasc_payments_total", "Total PASC payouts sent")
}

fn pasc_payment_errors() -> &'static IntCounter {
    counter(&PASC_PAYMENT_ERRORS, "pasc_payment_errors_total", "Total PASC payouts that failed")
}

fn pasa_payments() -> &'static IntCounter {
    counter(&PASA_PAYMENTS, "pasa_payments_total", "Total PASA accounts assigned")
}

fn pasa_payment_errors() -> &'static IntCounter {
    counter(&PASA_PAYMENT_ERRORS, "pasa_payment_errors_total", "Total PASA assignments that failed")
}

fn super_critical() -> &'static IntCounter {
    counter(
        &SUPER_CRITICAL,
        "payment_super_critical_total",
        "Transfers that succeeded on chain but failed to debit the store",
    )
}

fn template_height() -> &'static IntGauge {
    gauge(&TEMPLATE_HEIGHT, "block_template_height", "Height of the current job template")
}

fn node_connected() -> &'static IntGauge {
    gauge(&NODE_CONNECTED, "node_channel_connected", "1 when the mining port connection is up")
}

fn empty_pasa() -> &'static IntGauge {
    gauge(&EMPTY_PASA, "pasa_empty_accounts", "Empty PASA accounts available after the last sweep")
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected(code: i32) {
    rejected().with_label_values(&[&code.to_string()]).inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submits() {
    block_submits().inc();
}

pub fn inc_blocks_accepted() {
    blocks_accepted().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_hash_checks() {
    hash_checks().inc();
}

pub fn inc_hash_check_errors() {
    hash_check_errors().inc();
}

pub fn inc_node_reconnects() {
    node_reconnects().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_redis_errors() {
    redis_errors().inc();
}

pub fn inc_blocks_unlocked(count: u64) {
    blocks_unlocked().inc_by(count);
}

pub fn inc_blocks_orphaned(count: u64) {
    blocks_orphaned().inc_by(count);
}

pub fn inc_pasc_payments() {
    pasc_payments().inc();
}

pub fn inc_pasc_payment_errors() {
    pasc_payment_errors().inc();
}

pub fn inc_pasa_payments() {
    pasa_payments().inc();
}

pub fn inc_pasa_payment_errors() {
    pasa_payment_errors().inc();
}

pub fn inc_super_critical() {
    super_critical().inc();
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

pub fn set_node_connected(up: bool) {
    node_connected().set(if up { 1 } else { 0 });
}

pub fn set_empty_pasa(count: usize) {
    empty_pasa().set(count as i64);
}

pub fn set_network_difficulty(difficulty: f64) {
    network_difficulty().set(difficulty);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(block_submits().collect());
    mfs.extend(blocks_accepted().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(hash_checks().collect());
    mfs.extend(hash_check_errors().collect());
    mfs.extend(node_reconnects().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(redis_errors().collect());
    mfs.extend(blocks_unlocked().collect());
    mfs.extend(blocks_orphaned().collect());
    mfs.extend(pasc_payments().collect());
    mfs.extend(pasc_payment_errors().collect());
    mfs.extend(pasa_payments().collect());
    mfs.extend(pasa_payment_errors().collect());
    mfs.extend(super_critical().collect());
    mfs.extend(template_height().collect());
    mfs.extend(node_connected().collect());
    mfs.extend(empty_pasa().collect());
    mfs.extend(network_difficulty().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        inc_accepted();
        inc_rejected(23);
        set_template_height(378_001);

        let text = render();
        assert!(text.contains("shares_accepted_total"));
        assert!(text.contains("shares_rejected_total{code=\"23\"}"));
        assert!(text.contains("block_template_height"));
    }
}
