/// Job Manager - Work units and share validation
///
/// Turns daemon templates into jobs, keeps the last few valid for late
/// submissions, and validates shares by asking the node channel for the header
/// hash. Every submission yields one `ShareEvent` on the share channel.

pub mod difficulty;

use anyhow::Result;
use chrono::Utc;
use num_bigint::BigUint;
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::blockchain::node_channel::HashVerifier;
use crate::blockchain::template::BlockTemplate;
use crate::config::PoolServerConfig;
use crate::login::WorkerLogin;
use crate::metrics::prometheus as metrics;
use crate::shares::{FoundBlock, ShareError, ShareEvent};
use difficulty::{hash_difficulty, parse_target, swap32, target_difficulty, HashAlgorithm};

/// Jobs kept valid for late submissions, current included
pub const MAX_VALID_JOBS: usize = 4;
/// Seconds into the future a lenient ntime may run
pub const NTIME_FUTURE_WINDOW: i64 = 180;
const EXTRANONCE1_CHARS: usize = 26;

/// Hex job ids; restarts at 1 on every multiple of 0xffff.
#[derive(Debug, Default)]
pub struct JobCounter {
    counter: u32,
}

impl JobCounter {
    pub fn next(&mut self) -> String {
        self.counter += 1;
        if self.counter % 0xffff == 0 {
            self.counter = 1;
        }
        self.current()
    }

    pub fn current(&self) -> String {
        format!("{:x}", self.counter)
    }
}

/// Per-subscriber extranonce1 seeds
#[derive(Debug, Clone)]
pub struct ExtraNonceCounter {
    pool_id: String,
}

impl ExtraNonceCounter {
    pub fn new(pool_id: &str) -> Self {
        Self { pool_id: pool_id.to_string() }
    }

    /// hex(`pool_id/random`) right-padded with '0' to 26 characters
    pub fn next(&self) -> String {
        let seed: u32 = rand::random();
        let raw = format!("{}/{}", self.pool_id, seed);
        hex::encode(format!("{:0<width$}", raw, width = EXTRANONCE1_CHARS))
    }
}

#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub template: Arc<BlockTemplate>,
    pub target: BigUint,
    pub difficulty: f64,
    submits: HashSet<String>,
}

impl Job {
    pub fn new(id: String, template: Arc<BlockTemplate>) -> Result<Self> {
        let target = parse_target(&template.target_pow)?;
        let difficulty = target_difficulty(&target);
        Ok(Self { id, template, target, difficulty, submits: HashSet::new() })
    }

    /// Returns false when the fingerprint was already seen for this job.
    pub fn register_submit(&mut self, extranonce1: &str, extranonce2: &str, ntime: &str, nonce: &str) -> bool {
        self.submits.insert(format!("{}{}{}{}", extranonce1, extranonce2, ntime, nonce))
    }

    /// `mining.notify` params for the session layer
    pub fn notify_params(&self) -> Value {
        json!([
            self.id,
            "0".repeat(64),
            self.template.part1,
            self.template.part3,
            [],
            "00000000",
            "10000000",
            format!("{:08x}", self.template.timestamp),
            true
        ])
    }

    fn notice(&self) -> JobNotice {
        JobNotice {
            job_id: self.id.clone(),
            height: self.template.height,
            difficulty: self.difficulty,
            params: self.notify_params(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobNotice {
    pub job_id: String,
    pub height: u64,
    pub difficulty: f64,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    /// Template for a new height
    NewBlock(JobNotice),
    /// Same height, refreshed timestamp or target
    UpdatedBlock(JobNotice),
}

#[derive(Debug, Clone)]
pub struct ShareSubmission {
    pub job_id: String,
    /// Difficulty currently assigned to the miner
    pub difficulty: f64,
    /// Difficulty before the last vardiff retarget
    pub previous_difficulty: Option<f64>,
    pub extranonce1: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareAccepted {
    pub height: u64,
    /// Difficulty credited, possibly the pre-retarget one
    pub difficulty: f64,
    pub share_diff: f64,
    pub block_diff: f64,
    pub block_hash: String,
    pub block: Option<FoundBlock>,
}

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub pool_id: String,
    pub extranonce2_size: usize,
    pub allow_timestamp_variance: bool,
    pub hash_timeout: Duration,
}

impl From<&PoolServerConfig> for JobManagerConfig {
    fn from(cfg: &PoolServerConfig) -> Self {
        Self {
            pool_id: cfg.pool_id.clone(),
            extranonce2_size: cfg.extranonce2_size,
            allow_timestamp_variance: cfg.allow_timestamp_variance,
            hash_timeout: Duration::from_secs(cfg.hash_timeout_secs),
        }
    }
}

struct JobBook {
    counter: JobCounter,
    /// Oldest first; the back is the current job
    valid: VecDeque<Job>,
    last_job_at: Instant,
}

pub struct JobManager {
    config: JobManagerConfig,
    verifier: Arc<dyn HashVerifier>,
    extranonce: ExtraNonceCounter,
    book: RwLock<JobBook>,
    job_events: broadcast::Sender<JobEvent>,
    share_events: mpsc::Sender<ShareEvent>,
}

impl JobManager {
    pub fn new(
        config: JobManagerConfig,
        verifier: Arc<dyn HashVerifier>,
        share_events: mpsc::Sender<ShareEvent>,
    ) -> Arc<Self> {
        let (job_events, _) = broadcast::channel(16);
        Arc::new(Self {
            extranonce: ExtraNonceCounter::new(&config.pool_id),
            config,
            verifier,
            book: RwLock::new(JobBook {
                counter: JobCounter::default(),
                valid: VecDeque::with_capacity(MAX_VALID_JOBS + 1),
                last_job_at: Instant::now(),
            }),
            job_events,
            share_events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.job_events.subscribe()
    }

    pub fn next_extranonce1(&self) -> String {
        self.extranonce.next()
    }

    pub fn extranonce2_size(&self) -> usize {
        self.config.extranonce2_size
    }

    pub async fn current_job(&self) -> Option<JobNotice> {
        self.book.read().await.valid.back().map(Job::notice)
    }

    /// Creates a job from a daemon template and announces it.
    pub async fn process_template(&self, template: BlockTemplate) -> Result<JobEvent> {
        let template = Arc::new(template);
        let event = {
            let mut book = self.book.write().await;
            let id = book.counter.next();
            let job = Job::new(id, template.clone())?;
            let notice = job.notice();
            let new_block = book
                .valid
                .back()
                .map_or(true, |current| current.template.height != template.height);

            book.valid.push_back(job);
            while book.valid.len() > MAX_VALID_JOBS {
                book.valid.pop_front();
            }
            book.last_job_at = Instant::now();

            if new_block {
                JobEvent::NewBlock(notice)
            } else {
                JobEvent::UpdatedBlock(notice)
            }
        };

        match &event {
            JobEvent::NewBlock(n) => {
                tracing::info!("⛏️ New block to mine at height {} (job {}, diff {})", n.height, n.job_id, n.difficulty);
            }
            JobEvent::UpdatedBlock(n) => {
                tracing::debug!("Updated job {} for height {}", n.job_id, n.height);
            }
        }
        metrics::inc_job_broadcasts();
        metrics::set_template_height(template.height);
        let _ = self.job_events.send(event.clone());
        Ok(event)
    }

    /// Re-issues the current template as a fresh job.
    pub async fn update_current_job(&self) -> Result<Option<JobEvent>> {
        let template = match self.book.read().await.valid.back() {
            Some(job) => (*job.template).clone(),
            None => return Ok(None),
        };
        self.process_template(template).await.map(Some)
    }

    /// Rebroadcasts work when no template arrived within `timeout`.
    pub fn start_rebroadcast(self: Arc<Self>, timeout: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let idle = self.book.read().await.last_job_at.elapsed();
                if idle < timeout {
                    continue;
                }
                match self.update_current_job().await {
                    Ok(Some(_)) => tracing::warn!(
                        "No new blocks for {} seconds, rebroadcasting work",
                        timeout.as_secs()
                    ),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Rebroadcast failed: {}", e),
                }
            }
        });
    }

    /// Validates a share and emits its `ShareEvent`.
    pub async fn validate_share(
        &self,
        share: &ShareSubmission,
        worker: &WorkerLogin,
    ) -> Result<ShareAccepted, ShareError> {
        let outcome = self.check_share(share).await;

        let event = match &outcome {
            Ok(accepted) => {
                metrics::inc_accepted();
                if accepted.block.is_some() {
                    metrics::inc_blocks_found();
                }
                ShareEvent {
                    job: share.job_id.clone(),
                    ip: share.ip.clone(),
                    port: share.port,
                    worker: worker.address_pid(),
                    worker_name: worker.worker_id.clone(),
                    worker_pass: worker.password.clone(),
                    height: accepted.height,
                    difficulty: accepted.difficulty,
                    share_diff: accepted.share_diff,
                    block_diff: accepted.block_diff,
                    block_hash: Some(accepted.block_hash.clone()),
                    error: None,
                    block: accepted.block.clone(),
                }
            }
            Err(e) => {
                metrics::inc_rejected(e.code());
                tracing::debug!("Rejected share from {} ({}): {}", worker.address_pid(), share.ip, e);
                ShareEvent {
                    job: share.job_id.clone(),
                    ip: share.ip.clone(),
                    port: share.port,
                    worker: worker.address_pid(),
                    worker_name: worker.worker_id.clone(),
                    worker_pass: worker.password.clone(),
                    height: 0,
                    difficulty: share.difficulty,
                    share_diff: share.difficulty,
                    block_diff: 0.0,
                    block_hash: None,
                    error: Some(e.to_string()),
                    block: None,
                }
            }
        };

        if self.share_events.send(event).await.is_err() {
            tracing::warn!("Share event dropped: recorder is gone");
        }
        outcome
    }

    async fn check_share(&self, share: &ShareSubmission) -> Result<ShareAccepted, ShareError> {
        if share.extranonce2.len() != self.config.extranonce2_size * 2 {
            return Err(ShareError::ExtraNonce2Size);
        }

        let now = Utc::now().timestamp();
        let (template, target, block_diff, header) = {
            let mut book = self.book.write().await;
            let job = book
                .valid
                .iter_mut()
                .find(|job| job.id == share.job_id)
                .ok_or(ShareError::JobNotFound)?;

            if share.ntime.len() != 8 {
                return Err(ShareError::NTimeSize);
            }
            let ntime = u32::from_str_radix(&share.ntime, 16).map_err(|_| ShareError::Malformed("ntime"))?;
            check_ntime(ntime, job.template.timestamp, now, self.config.allow_timestamp_variance)?;

            if share.nonce.len() != 16 && share.nonce.len() != 8 {
                return Err(ShareError::NonceSize);
            }
            let header = assemble_header(
                &job.template,
                &share.extranonce1,
                &share.extranonce2,
                &share.ntime,
                &share.nonce,
            )?;

            if !job.register_submit(&share.extranonce1, &share.extranonce2, &share.ntime, &share.nonce) {
                return Err(ShareError::Duplicate);
            }
            (job.template.clone(), job.target.clone(), job.difficulty, header)
        };

        let algo = HashAlgorithm::for_height(template.height);
        metrics::inc_hash_checks();
        let verified = tokio::time::timeout(
            self.config.hash_timeout,
            self.verifier.check_hash(algo, hex::encode(&header)),
        )
        .await;
        let hash_hex = match verified {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                metrics::inc_hash_check_errors();
                tracing::warn!("checkhash failed for job {}: {}", share.job_id, e);
                return Err(ShareError::HashUnavailable);
            }
            Err(_) => {
                metrics::inc_hash_check_errors();
                tracing::warn!("checkhash timed out after {:?} for job {}", self.config.hash_timeout, share.job_id);
                return Err(ShareError::HashUnavailable);
            }
        };
        let hash_bytes = hex::decode(&hash_hex).map_err(|_| ShareError::HashUnavailable)?;
        let hash = BigUint::from_bytes_be(&hash_bytes);
        let share_diff = hash_difficulty(&hash);

        let mut difficulty = share.difficulty;
        let block = if target >= hash {
            let ntime = u32::from_str_radix(&share.ntime, 16).map_err(|_| ShareError::Malformed("ntime"))?;
            let nonce_word = &share.nonce[share.nonce.len() - 8..];
            let nonce = u32::from_str_radix(nonce_word, 16).map_err(|_| ShareError::Malformed("nonce"))?;
            Some(FoundBlock {
                height: template.height,
                payload: format!("{}{}", share.extranonce1, share.extranonce2),
                timestamp: ntime,
                nonce,
            })
        } else {
            if share_diff / difficulty < 0.99 {
                match share.previous_difficulty {
                    Some(previous) if previous > 0.0 && share_diff >= previous => difficulty = previous,
                    _ => return Err(ShareError::LowDifficulty(share_diff)),
                }
            }
            None
        };

        if let Some(found) = &block {
            tracing::info!("🎉 Block found at height {} by job {} (hash {})", found.height, share.job_id, hash_hex);
        }

        Ok(ShareAccepted {
            height: template.height,
            difficulty,
            share_diff,
            block_diff,
            block_hash: hash_hex,
            block,
        })
    }
}

fn check_ntime(ntime: u32, template_time: u32, now: i64, lenient: bool) -> Result<(), ShareError> {
    let in_window = if lenient {
        ntime >= template_time && i64::from(ntime) <= now + NTIME_FUTURE_WINDOW
    } else {
        ntime == template_time
    };
    if in_window {
        Ok(())
    } else {
        Err(ShareError::NTimeOutOfRange)
    }
}

/// part1 | extranonce1+extranonce2 | part3 | swap32(ntime) | swap32(nonce word)
pub fn assemble_header(
    template: &BlockTemplate,
    extranonce1: &str,
    extranonce2: &str,
    ntime: &str,
    nonce: &str,
) -> Result<Vec<u8>, ShareError> {
    let mut header = hex::decode(&template.part1).map_err(|_| ShareError::Malformed("template"))?;
    let payload = hex::decode(format!("{}{}", extranonce1, extranonce2))
        .map_err(|_| ShareError::Malformed("extranonce"))?;
    header.extend_from_slice(&payload);
    header.extend(hex::decode(&template.part3).map_err(|_| ShareError::Malformed("template"))?);
    header.extend(swap32(&hex::decode(ntime).map_err(|_| ShareError::Malformed("ntime"))?));

    let nonce = hex::decode(nonce).map_err(|_| ShareError::Malformed("nonce"))?;
    // 8-byte nonces carry the header nonce in their last word
    let word = if nonce.len() == 8 { &nonce[4..] } else { &nonce[..] };
    header.extend(swap32(word));
    Ok(header)
}
