use serde::Deserialize;
use std::path::Path;

/// Minor units per PASC (1 unit = 0.0001 PASC).
pub const COIN: i64 = 10_000;

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    /// JSON-RPC port
    pub port: u16,
    /// Persistent mining port (miner-notify / checkhash / miner-submit)
    pub mining_port: u16,
    /// Wallet password for `unlock`
    pub password: String,
    pub rpc_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4003,
            mining_port: 4009,
            password: String::new(),
            rpc_timeout_secs: 30,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub prefix: String,
    /// Days of inactivity before worker stats expire
    pub cleanup_interval: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            prefix: "pascal".to_string(),
            cleanup_interval: 15,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PoolServerConfig {
    pub enabled: bool,
    pub pool_id: String,
    pub extranonce2_size: usize,
    pub allow_timestamp_variance: bool,
    pub submit_duplicate_block_height: bool,
    pub job_rebroadcast_timeout: u64,
    pub hash_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
}

impl Default for PoolServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_id: "pascalpool".to_string(),
            extranonce2_size: 8,
            allow_timestamp_variance: true,
            submit_duplicate_block_height: false,
            job_rebroadcast_timeout: 55,
            hash_timeout_secs: 10,
            reconnect_delay_secs: 10,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BlockUnlockerConfig {
    pub enabled: bool,
    pub interval: u64,
    pub depth: u64,
    pub concurrency: usize,
}

impl Default for BlockUnlockerConfig {
    fn default() -> Self {
        Self { enabled: true, interval: 30, depth: 100, concurrency: 10 }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PaymentsConfig {
    pub enabled: bool,
    pub interval: u64,
    /// Payout levels in PASC
    pub min_payment: f64,
    pub max_payment: Option<f64>,
    pub default_payment: f64,
    /// PASC credited per PASA assignment
    pub pasa_threshold: f64,
    /// Public key that receives PASA for workers without one
    pub pasa_donations: Option<String>,
    pub dev_account: u64,
    pub sweep_margin: u64,
    pub sweep_concurrency: usize,
    pub max_wallet_accounts: u64,
    /// Notifications sent when a worker has no `notify` preference stored
    pub notify_defaults: Vec<String>,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 600,
            min_payment: 1.0,
            max_payment: None,
            default_payment: 5.0,
            pasa_threshold: 10.0,
            pasa_donations: None,
            dev_account: 1_309_452,
            sweep_margin: 100,
            sweep_concurrency: 10,
            max_wallet_accounts: 100_000,
            notify_defaults: vec!["payment_pasc".to_string(), "payment_pasa".to_string()],
        }
    }
}

impl PaymentsConfig {
    pub fn min_payment_units(&self) -> i64 {
        to_units(self.min_payment)
    }

    pub fn max_payment_units(&self) -> Option<i64> {
        self.max_payment.map(to_units)
    }

    pub fn default_payment_units(&self) -> i64 {
        to_units(self.default_payment)
    }

    pub fn pasa_threshold_units(&self) -> i64 {
        to_units(self.pasa_threshold)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct FeeConfig {
    /// Percent of each block kept by the pool
    pub pool_fee: f64,
    /// PASC per block routed to the developer account
    pub dev_fee: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self { pool_fee: 1.0, dev_fee: 0.0 }
    }
}

impl FeeConfig {
    pub fn dev_fee_units(&self) -> i64 {
        to_units(self.dev_fee)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: true, listen: "0.0.0.0:9100".to_string() }
    }
}

/// Exchange account that requires a payment id
#[derive(Deserialize, Clone, Debug)]
pub struct KnownAccount {
    pub account: String,
    pub name: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub redis: RedisConfig,
    pub pool_server: PoolServerConfig,
    pub block_unlocker: BlockUnlockerConfig,
    pub payments: PaymentsConfig,
    pub fees: FeeConfig,
    pub api: ApiConfig,
    pub known_accounts: Vec<KnownAccount>,
}

fn to_units(coins: f64) -> i64 {
    (coins * COIN as f64).round() as i64
}

impl Config {
    /// Defaults, then `pool_config.json` (or `path`), then `PASC_POOL_*` env overrides.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.unwrap_or_else(|| Path::new("pool_config.json"));
        let mut cfg = match std::fs::read_to_string(path) {
            Ok(txt) => match serde_json::from_str::<Config>(&txt) {
                Ok(file_cfg) => {
                    tracing::info!("Loaded config from {}", path.display());
                    file_cfg
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}. Using defaults", path.display(), e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        };
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        if let Ok(h) = std::env::var("PASC_POOL_DAEMON_HOST") { self.daemon.host = h; }
        if let Ok(p) = std::env::var("PASC_POOL_DAEMON_PORT") {
            self.daemon.port = p.parse().unwrap_or(self.daemon.port);
        }
        if let Ok(p) = std::env::var("PASC_POOL_MINING_PORT") {
            self.daemon.mining_port = p.parse().unwrap_or(self.daemon.mining_port);
        }
        if let Ok(p) = std::env::var("PASC_POOL_WALLET_PASSWORD") { self.daemon.password = p; }
        if let Ok(r) = std::env::var("PASC_POOL_REDIS_URL") {
            self.redis.url = r;
        } else if let Ok(r) = std::env::var("REDIS_URL") {
            self.redis.url = r;
        }
        if let Ok(p) = std::env::var("PASC_POOL_REDIS_PREFIX") { self.redis.prefix = p; }
        if let Ok(id) = std::env::var("PASC_POOL_ID") { self.pool_server.pool_id = id; }
        if let Ok(f) = std::env::var("PASC_POOL_FEE") {
            self.fees.pool_fee = f.parse().unwrap_or(self.fees.pool_fee);
        }
        if let Ok(i) = std::env::var("PASC_POOL_PAYMENT_INTERVAL") {
            self.payments.interval = i.parse().unwrap_or(self.payments.interval);
        }
        if let Ok(i) = std::env::var("PASC_POOL_UNLOCKER_INTERVAL") {
            self.block_unlocker.interval = i.parse().unwrap_or(self.block_unlocker.interval);
        }
        if let Ok(l) = std::env::var("PASC_POOL_API_LISTEN") { self.api.listen = l; }
    }

    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}/json_rpc", self.daemon.host, self.daemon.port)
    }

    pub fn mining_addr(&self) -> String {
        format!("{}:{}", self.daemon.host, self.daemon.mining_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"daemon": {"host": "10.0.0.2"}, "payments": {"min_payment": 2.5, "max_payment": 100}}"#,
        )
        .unwrap();

        assert_eq!(cfg.daemon.host, "10.0.0.2");
        assert_eq!(cfg.daemon.mining_port, 4009);
        assert_eq!(cfg.payments.min_payment_units(), 25_000);
        assert_eq!(cfg.payments.max_payment_units(), Some(1_000_000));
        assert_eq!(cfg.redis.prefix, "pascal");
        assert_eq!(cfg.block_unlocker.concurrency, 10);
    }

    #[test]
    fn test_urls() {
        let cfg = Config::default();
        assert_eq!(cfg.rpc_url(), "http://127.0.0.1:4003/json_rpc");
        assert_eq!(cfg.mining_addr(), "127.0.0.1:4009");
    }
}
