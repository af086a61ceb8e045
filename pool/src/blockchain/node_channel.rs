/// Node Channel - Persistent connection to the daemon mining port
///
/// Multiplexes `checkhash` requests (correlated by id) with inbound
/// `miner-notify` pushes and block-accepted confirmations. Reconnects after a
/// fixed delay; requests in flight when the connection drops fail with
/// `NodeError::ConnectionLost`. One channel per daemon connection.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{error, info, warn};

use super::template::BlockTemplate;
use crate::jobs::difficulty::HashAlgorithm;
use crate::metrics::prometheus as metrics;
use crate::shares::FoundBlock;

/// Heights remembered for duplicate submission suppression
const SUBMITTED_HISTORY: usize = 10;

/// Longest unterminated message kept while waiting for a delimiter
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("not connected to daemon mining port")]
    NotConnected,
    #[error("daemon connection lost")]
    ConnectionLost,
    #[error("daemon error: {0}")]
    Daemon(String),
    #[error("mining port I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Hash verification seam used by the job manager.
#[async_trait]
pub trait HashVerifier: Send + Sync {
    async fn check_hash(&self, algo: HashAlgorithm, header_hex: String) -> Result<String, NodeError>;
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    MinerNotify(BlockTemplate),
    BlockAccepted { height: Option<u64>, payload: Option<String> },
}

/// Splits the raw byte stream into messages. `\0`, `\r` and `\n` all end a
/// message; an unterminated tail waits for the next read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        for byte in self.buf.iter_mut() {
            if *byte == 0x00 || *byte == 0x0d {
                *byte = 0x0a;
            }
        }

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == 0x0a) {
            let line = self.buf.split_to(pos);
            self.buf.advance(1);
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                frames.push(text.to_string());
            }
        }
        if self.buf.len() > MAX_FRAME_BYTES {
            error!("Dropping {} bytes from mining port without a delimiter", self.buf.len());
            self.buf.clear();
        }
        frames
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeMessage {
    Notify(Value),
    HashResult { id: Option<u64>, hash: String },
    BlockAccepted { height: Option<u64>, payload: Option<String> },
    Error { id: Option<u64>, error: Value },
    Unknown(Value),
}

pub fn classify(msg: Value) -> NodeMessage {
    if msg.get("method").and_then(Value::as_str) == Some("miner-notify") {
        return NodeMessage::Notify(msg.get("params").cloned().unwrap_or(Value::Null));
    }
    let id = msg.get("id").and_then(Value::as_u64);
    if let Some(result) = msg.get("result").and_then(Value::as_object) {
        if result.contains_key("digest") {
            let hash = result.get("hash").and_then(Value::as_str).unwrap_or_default().to_string();
            return NodeMessage::HashResult { id, hash };
        }
        return NodeMessage::BlockAccepted {
            height: result.get("block").and_then(Value::as_u64),
            payload: result.get("payload").and_then(Value::as_str).map(str::to_string),
        };
    }
    match msg.get("error") {
        Some(error) if !error.is_null() => NodeMessage::Error { id, error: error.clone() },
        _ => NodeMessage::Unknown(msg),
    }
}

type Pending = HashMap<u64, oneshot::Sender<Result<String, NodeError>>>;

pub struct NodeChannel {
    addr: String,
    reconnect_delay: Duration,
    submit_duplicate_heights: bool,
    next_id: AtomicU64,
    connected: AtomicBool,
    pending: Mutex<Pending>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    submitted: Mutex<VecDeque<u64>>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeChannel {
    pub fn new(addr: &str, reconnect_delay: Duration, submit_duplicate_heights: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            addr: addr.to_string(),
            reconnect_delay,
            submit_duplicate_heights,
            next_id: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            submitted: Mutex::new(VecDeque::with_capacity(SUBMITTED_HISTORY + 1)),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            self.run_loop().await;
        });
    }

    async fn run_loop(self: Arc<Self>) {
        info!("Miner interface starting, daemon mining port {}", self.addr);
        loop {
            match self.connect_and_session().await {
                Ok(()) => error!("Miner connection closed!"),
                Err(e) => error!("Miner connection error: {}", e),
            }
            self.on_disconnect().await;
            warn!("Waiting {} seconds to reconnect...", self.reconnect_delay.as_secs());
            tokio::time::sleep(self.reconnect_delay).await;
            metrics::inc_node_reconnects();
        }
    }

    async fn connect_and_session(&self) -> anyhow::Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
            warn!("Failed to enable keepalive on mining port: {}", e);
        }
        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);
        metrics::set_node_connected(true);
        info!("Miner interface connected!");

        let mut decoder = FrameDecoder::default();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            for frame in decoder.push(&buf[..n]) {
                self.handle_frame(&frame).await;
            }
        }
    }

    async fn on_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        metrics::set_node_connected(false);
        *self.writer.lock().await = None;

        // dropping the senders fails every waiting checkhash
        let abandoned = {
            let mut pending = self.pending.lock().await;
            let n = pending.len();
            pending.clear();
            n
        };
        if abandoned > 0 {
            warn!("Dropped {} pending hash checks on disconnect", abandoned);
        }
    }

    async fn handle_frame(&self, frame: &str) {
        let msg: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => {
                error!("Parse error from daemon ({}): {}", e, frame);
                return;
            }
        };

        match classify(msg) {
            NodeMessage::Notify(params) => match BlockTemplate::from_notify(&params) {
                Ok(template) => {
                    info!("Miner-notify received at height {}", template.height);
                    let _ = self.events.send(NodeEvent::MinerNotify(template));
                }
                Err(e) => warn!("Ignoring miner-notify: {}", e),
            },
            NodeMessage::HashResult { id, hash } => {
                let waiter = match id {
                    Some(id) => self.pending.lock().await.remove(&id),
                    None => None,
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(hash));
                    }
                    None => warn!("Hash result for unknown request {:?}", id),
                }
            }
            NodeMessage::BlockAccepted { height, payload } => {
                info!(
                    "✅ Block accepted at height {} with payload {}",
                    height.map(|h| h.to_string()).unwrap_or_else(|| "?".to_string()),
                    payload.as_deref().unwrap_or("")
                );
                metrics::inc_blocks_accepted();
                let _ = self.events.send(NodeEvent::BlockAccepted { height, payload });
            }
            NodeMessage::Error { id, error } => {
                warn!("Daemon error: {}", error);
                if let Some(id) = id {
                    if let Some(tx) = self.pending.lock().await.remove(&id) {
                        let _ = tx.send(Err(NodeError::Daemon(error.to_string())));
                    }
                }
            }
            NodeMessage::Unknown(msg) => error!("Unknown message from daemon: {}", msg),
        }
    }

    async fn write_line(&self, line: String) -> Result<(), NodeError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NodeError::NotConnected)?;
        writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Asks the daemon to hash `header_hex`; resolves with the hash hex.
    pub async fn checkhash(&self, algo: HashAlgorithm, header_hex: &str) -> Result<String, NodeError> {
        if !self.is_connected() {
            return Err(NodeError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            // callers that timed out leave closed senders behind
            pending.retain(|_, waiter| !waiter.is_closed());
            pending.insert(id, tx);
        }

        let line = format!("{}\n", json!({"id": id, "method": algo.as_str(), "params": [header_hex]}));
        if let Err(e) = self.write_line(line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| NodeError::ConnectionLost)?
    }

    /// Sends a block with `miner-submit`. Returns false when the height was
    /// already submitted recently.
    pub async fn submit_block(&self, block: &FoundBlock) -> Result<bool, NodeError> {
        {
            let mut submitted = self.submitted.lock().await;
            if !self.submit_duplicate_heights && submitted.contains(&block.height) {
                warn!("Block already found at height {}, ignoring...", block.height);
                return Ok(false);
            }
            submitted.push_back(block.height);
            while submitted.len() > SUBMITTED_HISTORY {
                submitted.pop_front();
            }
        }

        let line = format!("{}\n", json!({"id": block.height, "method": "miner-submit", "params": [block]}));
        self.write_line(line).await?;
        metrics::inc_block_submits();
        info!("📤 Submitted block at height {} to daemon", block.height);
        Ok(true)
    }
}

#[async_trait]
impl HashVerifier for NodeChannel {
    async fn check_hash(&self, algo: HashAlgorithm, header_hex: String) -> Result<String, NodeError> {
        self.checkhash(algo, &header_hex).await
    }
}
