// PascalCoin pool backend
//
// Components: job manager (node channel, share recording, block submission),
// block unlocker, payment processor, health/metrics API

use axum::{extract::State, http::{header, StatusCode}, response::IntoResponse, routing::get, Json};
use clap::{Parser, ValueEnum};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use pascal_pool::blockchain::{DaemonApi, DaemonRpcClient, HashVerifier, NodeChannel, NodeEvent};
use pascal_pool::config::Config;
use pascal_pool::jobs::{JobManager, JobManagerConfig};
use pascal_pool::metrics::prometheus as metrics;
use pascal_pool::payout::{BlockUnlocker, PaymentProcessor, PaymentSettings, UnlockerConfig};
use pascal_pool::shares::{FoundBlock, RedisStorage, ShareEvent, ShareRecorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Module {
    JobManager,
    Unlocker,
    Payments,
}

#[derive(Parser, Debug)]
#[command(name = "pascal-pool", about = "PascalCoin mining pool backend")]
struct Cli {
    /// Config file (defaults to pool_config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Components to run; all when omitted
    #[arg(short, long, value_enum)]
    module: Vec<Module>,
}

impl Cli {
    fn runs(&self, module: Module) -> bool {
        self.module.is_empty() || self.module.contains(&module)
    }
}

#[derive(Clone)]
struct ApiState {
    storage: Arc<RedisStorage>,
    node: Option<Arc<NodeChannel>>,
}

async fn api_health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let redis_ok = state.storage.ping().await.is_ok();
    let node = state.node.as_ref().map(|n| n.is_connected());
    let ok = redis_ok && node.unwrap_or(true);
    Json(json!({"status": if ok { "ok" } else { "degraded" }, "redis": redis_ok, "node": node}))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Node channel, job manager, share recorder and block submitter
fn start_job_manager(cfg: &Config, storage: Arc<RedisStorage>) -> Arc<NodeChannel> {
    let server = &cfg.pool_server;
    let channel = NodeChannel::new(
        &cfg.mining_addr(),
        Duration::from_secs(server.reconnect_delay_secs),
        server.submit_duplicate_block_height,
    );

    let (share_tx, share_rx) = mpsc::channel::<ShareEvent>(1024);
    let (block_tx, mut block_rx) = mpsc::channel::<FoundBlock>(16);

    let verifier: Arc<dyn HashVerifier> = channel.clone();
    let jobs = JobManager::new(JobManagerConfig::from(server), verifier, share_tx);
    ShareRecorder::new(storage, cfg.redis.cleanup_interval, block_tx).start(share_rx);

    {
        let channel = channel.clone();
        tokio::spawn(async move {
            while let Some(block) = block_rx.recv().await {
                match channel.submit_block(&block).await {
                    Ok(true) => {}
                    Ok(false) => tracing::info!("Block at height {} already submitted", block.height),
                    Err(e) => tracing::error!("❌ Failed to submit block at height {}: {}", block.height, e),
                }
            }
        });
    }

    {
        let jobs = jobs.clone();
        let mut node_events = channel.subscribe();
        tokio::spawn(async move {
            loop {
                match node_events.recv().await {
                    Ok(NodeEvent::MinerNotify(template)) => {
                        if let Err(e) = jobs.process_template(template).await {
                            tracing::error!("Failed to create job from template: {}", e);
                        }
                    }
                    Ok(NodeEvent::BlockAccepted { height, payload }) => {
                        tracing::info!(
                            "🎉 Daemon accepted block at height {:?} (payload {})",
                            height,
                            payload.unwrap_or_default()
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Node event consumer lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    jobs.start_rebroadcast(Duration::from_secs(server.job_rebroadcast_timeout));
    channel.clone().start();
    channel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref());
    tracing::info!("🚀 PascalCoin pool {} starting", cfg.pool_server.pool_id);

    let storage = Arc::new(RedisStorage::new(&cfg.redis.url, &cfg.redis.prefix)?);
    if let Err(e) = storage.ping().await {
        tracing::warn!("Redis not reachable yet: {}", e);
    }
    let daemon: Arc<dyn DaemonApi> = Arc::new(DaemonRpcClient::new(
        &cfg.rpc_url(),
        Duration::from_secs(cfg.daemon.rpc_timeout_secs),
    ));

    let node = if cli.runs(Module::JobManager) && cfg.pool_server.enabled {
        Some(start_job_manager(&cfg, storage.clone()))
    } else {
        None
    };

    if cli.runs(Module::Unlocker) && cfg.block_unlocker.enabled {
        tracing::info!("🔓 Block unlocker every {}s", cfg.block_unlocker.interval);
        BlockUnlocker::new(storage.clone(), daemon.clone(), UnlockerConfig::from(&cfg)).start();
    }

    if cli.runs(Module::Payments) && cfg.payments.enabled {
        tracing::info!("💰 Payments every {}s", cfg.payments.interval);
        PaymentProcessor::new(storage.clone(), daemon.clone(), PaymentSettings::from(&cfg)).start();
    }

    let shutdown_signal = async {
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to register SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("SIGINT, shutting down");
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Ctrl+C, shutting down");
        }
    };

    if cfg.api.enabled {
        let api = axum::Router::new()
            .route("/health", get(api_health))
            .route("/metrics", get(api_metrics))
            .with_state(ApiState { storage, node });
        let listener = tokio::net::TcpListener::bind(&cfg.api.listen)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", cfg.api.listen, e))?;
        tracing::info!("📡 Health and metrics listening on {}", cfg.api.listen);
        axum::serve(listener, api)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("API server failed: {}", e))?;
    } else {
        shutdown_signal.await;
    }

    tracing::info!("🏁 Pool shut down cleanly");
    Ok(())
}
