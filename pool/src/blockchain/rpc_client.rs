/// Daemon JSON-RPC client
///
/// POSTs `{jsonrpc, id, method, params?}` to `http://host:port/json_rpc` with a
/// circuit breaker in front of the transport. Wallet and chain calls used by
/// block and payment settlement are exposed through the `DaemonApi` trait.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Buf, Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::COIN;
use crate::metrics::prometheus as metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("daemon error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn unreachable() -> Self {
        Self { code: -1, message: "Cannot connect to daemon".to_string() }
    }
}

/// Block as reported by `getblock` / `getblocks`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChainBlock {
    pub block: u64,
    #[serde(default)]
    pub pow: String,
    #[serde(default)]
    pub reward: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    #[serde(default)]
    pub maturation: u64,
    #[serde(default)]
    pub target: u32,
    #[serde(default)]
    pub hashratekhs: u64,
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WalletAccount {
    pub account: u64,
    #[serde(default)]
    pub balance: Decimal,
    /// Block of the last operation touching this account
    #[serde(default)]
    pub updated_b: u64,
    #[serde(default)]
    pub enc_pubkey: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Operation {
    #[serde(default)]
    pub ophash: String,
    #[serde(default)]
    pub account: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub sender: u64,
    pub target: u64,
    pub amount: Decimal,
    pub fee: Decimal,
    /// Hex payload, empty for none
    pub payload: String,
}

impl Transfer {
    fn params(&self) -> Value {
        json!({
            "sender": self.sender,
            "target": self.target,
            "amount": format!("{:.4}", self.amount),
            "fee": format!("{:.4}", self.fee),
            "payload": self.payload,
            "payload_method": "none",
        })
    }
}

/// PASC amount to integer minor units, truncating past 4 decimals.
pub fn to_units(amount: Decimal) -> i64 {
    (amount * Decimal::from(COIN)).trunc().to_i64().unwrap_or(0)
}

pub fn from_units(units: i64) -> Decimal {
    Decimal::new(units, 4)
}

/// Chain and wallet calls the settlement loops depend on.
#[async_trait]
pub trait DaemonApi: Send + Sync {
    async fn get_block(&self, height: u64) -> Result<ChainBlock>;
    async fn get_last_blocks(&self, last: u64) -> Result<Vec<ChainBlock>>;
    async fn get_block_count(&self) -> Result<u64>;
    async fn get_wallet_accounts(&self, max: u64) -> Result<Vec<WalletAccount>>;
    async fn get_wallet_coins(&self) -> Result<Decimal>;
    async fn send_to(&self, transfer: &Transfer) -> Result<Operation>;
    async fn change_key(&self, account: u64, new_b58_pubkey: &str) -> Result<Operation>;
    async fn unlock(&self, password: &str) -> Result<bool>;
    async fn lock(&self) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    failures: u32,
    last_failure: Option<Instant>,
    is_open: bool,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            failures: 0,
            last_failure: None,
            is_open: false,
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        self.last_failure = Some(Instant::now());

        if self.failures >= self.max_failures && !self.is_open {
            self.is_open = true;
            tracing::error!(
                "🔌 Circuit Breaker TRIPPED after {} failures! Pausing RPC for {}s",
                self.failures,
                self.reset_timeout.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            tracing::info!("✅ Circuit Breaker: Reset (successful call)");
        }
    }

    fn check(&mut self) -> Result<()> {
        if self.is_open {
            if let Some(last_fail) = self.last_failure {
                if last_fail.elapsed() > self.reset_timeout {
                    tracing::info!("🔌 Circuit Breaker: Resetting (half-open state)");
                    self.is_open = false;
                    self.failures = 0;
                } else {
                    return Err(anyhow!("RPC Circuit Breaker is OPEN"));
                }
            }
        }
        Ok(())
    }
}

pub struct DaemonRpcClient {
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
    client: Client<HttpConnector, Full<Bytes>>,
    circuit_breaker: Arc<RwLock<CircuitBreaker>>,
}

impl DaemonRpcClient {
    pub fn new(url: &str, timeout: Duration) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        tracing::info!("Daemon RPC client initialized: {}", url);

        Self {
            url: url.to_string(),
            timeout,
            next_id: AtomicU64::new(0),
            client,
            circuit_breaker: Arc::new(RwLock::new(CircuitBreaker::new())),
        }
    }

    pub fn request_body(id: u64, method: &str, params: Value) -> RpcRequest {
        let empty = match &params {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        };
        RpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params: if empty { None } else { Some(params) },
        }
    }

    /// Make RPC call to the daemon
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();
        let res = self.call_inner(method, params).await;
        if let Err(e) = &res {
            metrics::inc_rpc_errors();
            tracing::debug!("RPC {} failed: {}", method, e);
        }
        res
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value> {
        self.circuit_breaker.write().await.check()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = Self::request_body(id, method, params);
        let body = Full::new(Bytes::from(serde_json::to_vec(&payload)?));

        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(body)?;

        let response = match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_connect() => {
                self.circuit_breaker.write().await.record_failure();
                tracing::warn!("RPC {} connection failed: {}", method, e);
                return Err(RpcError::unreachable().into());
            }
            // request may have reached the daemon
            Ok(Err(e)) => {
                self.circuit_breaker.write().await.record_failure();
                tracing::warn!("RPC {} transport failed after connect: {}", method, e);
                return Err(anyhow!("RPC {} transport error: {}", method, e));
            }
            Err(_) => {
                self.circuit_breaker.write().await.record_failure();
                return Err(anyhow!("RPC {} timed out after {:?}", method, self.timeout));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.circuit_breaker.write().await.record_failure();
            return Err(anyhow!("RPC HTTP error: {}", status));
        }

        let body_bytes = response.into_body().collect().await?.to_bytes();
        let rpc_response: RpcResponse = serde_json::from_reader(body_bytes.reader())
            .map_err(|e| anyhow!("Failed to parse {} response: {}", method, e))?;

        self.circuit_breaker.write().await.record_success();

        // application errors do not trip the breaker
        if let Some(error) = rpc_response.error {
            return Err(error.into());
        }
        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    async fn call_typed<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| anyhow!("Unexpected {} result: {}", method, e))
    }
}

#[async_trait]
impl DaemonApi for DaemonRpcClient {
    async fn get_block(&self, height: u64) -> Result<ChainBlock> {
        self.call_typed("getblock", json!({ "block": height })).await
    }

    async fn get_last_blocks(&self, last: u64) -> Result<Vec<ChainBlock>> {
        self.call_typed("getblocks", json!({ "last": last })).await
    }

    async fn get_block_count(&self) -> Result<u64> {
        self.call_typed("getblockcount", Value::Null).await
    }

    async fn get_wallet_accounts(&self, max: u64) -> Result<Vec<WalletAccount>> {
        self.call_typed("getwalletaccounts", json!({ "max": max })).await
    }

    async fn get_wallet_coins(&self) -> Result<Decimal> {
        self.call_typed("getwalletcoins", Value::Null).await
    }

    async fn send_to(&self, transfer: &Transfer) -> Result<Operation> {
        self.call_typed("sendto", transfer.params()).await
    }

    async fn change_key(&self, account: u64, new_b58_pubkey: &str) -> Result<Operation> {
        self.call_typed(
            "changekey",
            json!({ "account": account, "new_b58_pubkey": new_b58_pubkey, "fee": 0 }),
        )
        .await
    }

    async fn unlock(&self, password: &str) -> Result<bool> {
        self.call_typed("unlock", json!({ "pwd": password })).await
    }

    async fn lock(&self) -> Result<bool> {
        self.call_typed("lock", Value::Null).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_circuit_breaker() {
        let mut breaker = CircuitBreaker::new();
        assert!(!breaker.is_open);

        for _ in 0..4 {
            breaker.record_failure();
            assert!(!breaker.is_open);
        }

        breaker.record_failure();
        assert!(breaker.is_open);
        assert!(breaker.check().is_err());
    }

    #[tokio::test]
    async fn test_refused_connection_is_rpc_error() {
        // nothing listens on port 1
        let client = DaemonRpcClient::new("http://127.0.0.1:1/json_rpc", Duration::from_secs(5));
        let err = client.call("getblockcount", Value::Null).await.unwrap_err();
        assert_eq!(err.downcast_ref::<RpcError>(), Some(&RpcError::unreachable()));
    }

    #[tokio::test]
    async fn test_dropped_after_send_is_not_rpc_error() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            drop(socket);
        });

        let client = DaemonRpcClient::new(&format!("http://{}/json_rpc", addr), Duration::from_secs(5));
        let err = client.call("sendto", json!({"sender": 1})).await.unwrap_err();
        assert!(err.downcast_ref::<RpcError>().is_none(), "unexpected {}", err);
    }

    #[test]
    fn test_params_omitted_when_empty() {
        let req = DaemonRpcClient::request_body(3, "getblockcount", Value::Null);
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"jsonrpc": "2.0", "id": 3, "method": "getblockcount"})
        );
        let req = DaemonRpcClient::request_body(4, "lock", json!({}));
        assert!(req.params.is_none());
        let req = DaemonRpcClient::request_body(5, "getblock", json!({"block": 10}));
        assert_eq!(req.params, Some(json!({"block": 10})));
    }

    #[test]
    fn test_error_response() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"id":1,"error":{"code":1004,"message":"Wallet is password protected"}}"#)
                .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, 1004);
        assert_eq!(RpcError::unreachable().code, -1);
        assert_eq!(RpcError::unreachable().to_string(), "daemon error -1: Cannot connect to daemon");
    }

    #[test]
    fn test_chain_block_amounts() {
        let block: ChainBlock = serde_json::from_value(json!({
            "block": 400100, "pow": "00AB", "reward": 50.0, "fee": 0.0012, "maturation": 7
        }))
        .unwrap();
        assert_eq!(to_units(block.reward), 500_000);
        assert_eq!(to_units(block.fee), 12);
        assert_eq!(block.maturation, 7);
    }

    #[test]
    fn test_units() {
        assert_eq!(to_units(dec!(4.99999)), 49_999);
        assert_eq!(from_units(49_999).to_string(), "4.9999");
        assert_eq!(format!("{:.4}", from_units(10_000)), "1.0000");
    }

    #[test]
    fn test_transfer_params() {
        let transfer = Transfer {
            sender: 1000,
            target: 77,
            amount: from_units(49_999),
            fee: from_units(1),
            payload: "cafe".to_string(),
        };
        assert_eq!(
            transfer.params(),
            json!({
                "sender": 1000, "target": 77, "amount": "4.9999", "fee": "0.0001",
                "payload": "cafe", "payload_method": "none"
            })
        );
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let client = DaemonRpcClient::new("http://127.0.0.1:1/json_rpc", Duration::from_secs(2));
        let err = client.get_block_count().await.unwrap_err();
        assert_eq!(err.downcast_ref::<RpcError>(), Some(&RpcError::unreachable()));
    }
}
