//! Polls the upstream node for block templates and turns them into `Job`s.
//!
//! One job is live at a time (`current`), plus the immediately preceding
//! job of the same height (`previous`) so shares racing a same-block
//! refresh still validate. A new block evicts both in favor of the fresh
//! pair. Callers wake on `new_job_notified()` rather than polling this
//! struct directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use kps_consensus::kawpow::{epoch_of, seed_hash};
use kps_consensus::{bits_to_target, build_coinbase, header_hash, merkle_root, txid, KawpowVerifier};
use kps_core::{BlockTemplate, Job, JobIdAllocator};
use kps_rpc::{BlockTemplateRequest, RpcClient};

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// How often to poll `getblocktemplate`.
    pub poll_interval: Duration,
    /// Force a same-block job refresh (new curtime/transactions) at least
    /// this often even without a new block.
    pub refresh_interval: Duration,
    pub payout_script: Vec<u8>,
    /// Short opaque tag embedded in the coinbase scriptSig alongside the
    /// BIP34 height push.
    pub pool_tag: Vec<u8>,
}

pub struct JobManager {
    rpc: Arc<RpcClient>,
    verifier: Arc<dyn KawpowVerifier>,
    config: JobManagerConfig,
    id_alloc: JobIdAllocator,
    current: RwLock<Option<Arc<Job>>>,
    previous: RwLock<Option<Arc<Job>>>,
    last_template: RwLock<Option<BlockTemplate>>,
    last_assembled_at: RwLock<Option<Instant>>,
    new_job: Notify,
    rpc_connected: AtomicBool,
}

impl JobManager {
    pub fn new(rpc: Arc<RpcClient>, verifier: Arc<dyn KawpowVerifier>, config: JobManagerConfig) -> Self {
        Self {
            rpc,
            verifier,
            config,
            id_alloc: JobIdAllocator::new(),
            current: RwLock::new(None),
            previous: RwLock::new(None),
            last_template: RwLock::new(None),
            last_assembled_at: RwLock::new(None),
            new_job: Notify::new(),
            rpc_connected: AtomicBool::new(true),
        }
    }

    pub fn verifier(&self) -> &Arc<dyn KawpowVerifier> {
        &self.verifier
    }

    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.current.read().expect("current job lock poisoned").clone()
    }

    #[cfg(test)]
    pub(crate) fn publish_for_test(&self, job: Job) {
        *self.current.write().expect("current job lock poisoned") = Some(Arc::new(job));
    }

    /// Look up a job by ID among the two retained jobs.
    pub fn find_job(&self, job_id: &str) -> Option<Arc<Job>> {
        if let Some(job) = self.current_job() {
            if job.id == job_id {
                return Some(job);
            }
        }
        let previous = self.previous.read().expect("previous job lock poisoned").clone();
        previous.filter(|job| job.id == job_id)
    }

    pub fn is_rpc_connected(&self) -> bool {
        self.rpc_connected.load(Ordering::Relaxed)
    }

    /// Resolves once a new job has been published. Callers should re-check
    /// `current_job()` after waking, since multiple publishes can coalesce
    /// into a single notification.
    pub async fn new_job_notified(&self) {
        self.new_job.notified().await;
    }

    /// Drive the poll loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("job manager stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Force an immediate poll tick outside the timer cadence, e.g. right
    /// after a submitted block to get miners off the stale job without
    /// waiting for the next scheduled tick.
    pub async fn poll_now(&self) {
        self.poll_once().await;
    }

    async fn poll_once(&self) {
        let template = match self.rpc.get_block_template(&BlockTemplateRequest::default()).await {
            Ok(response) => {
                if !self.rpc_connected.swap(true, Ordering::Relaxed) {
                    info!("upstream RPC reconnected");
                }
                match response.into_template(serde_json::Value::Null) {
                    Ok(template) => template,
                    Err(err) => {
                        warn!("malformed block template: {err}");
                        return;
                    }
                }
            }
            Err(err) => {
                if self.rpc_connected.swap(false, Ordering::Relaxed) {
                    warn!("upstream RPC disconnected: {err}");
                }
                return;
            }
        };

        let previous_template = self.last_template.read().expect("template lock poisoned").clone();
        let is_new_block = previous_template
            .as_ref()
            .map(|prev| prev.is_new_block(&template))
            .unwrap_or(true);

        let last_assembled = *self.last_assembled_at.read().expect("assembled-at lock poisoned");
        let due_for_refresh = last_assembled
            .map(|at| at.elapsed() >= self.config.refresh_interval)
            .unwrap_or(true);

        if !is_new_block && !due_for_refresh {
            return;
        }

        let job = self.assemble_job(&template, is_new_block);

        if !is_new_block {
            if let Some(current) = self.current_job() {
                if job.has_same_header_hash(&current) {
                    debug!(job_id = %current.id, "suppressing refresh with identical header hash");
                    return;
                }
            }
        }

        info!(
            job_id = %job.id,
            height = job.height,
            new_block = is_new_block,
            "published job"
        );

        {
            let mut current = self.current.write().expect("current job lock poisoned");
            let mut previous = self.previous.write().expect("previous job lock poisoned");
            if is_new_block {
                *previous = None;
            } else {
                *previous = current.clone();
            }
            *current = Some(Arc::new(job));
        }
        *self.last_template.write().expect("template lock poisoned") = Some(template);
        *self.last_assembled_at.write().expect("assembled-at lock poisoned") = Some(Instant::now());
        self.new_job.notify_waiters();
    }

    pub(crate) fn assemble_job(&self, template: &BlockTemplate, is_new_block: bool) -> Job {
        let coinbase_tx = build_coinbase(
            template.height,
            template.coinbase_value,
            &self.config.payout_script,
            &self.config.pool_tag,
        );
        let coinbase_txid = txid(&coinbase_tx);
        let other_txids: Vec<_> = template.transactions.iter().map(|tx| tx.txid).collect();
        let merkle = merkle_root(coinbase_txid, &other_txids);

        let version = 1u32;
        let header = header_hash(version, &template.previous_block_hash, &merkle, template.bits, template.curtime);
        let network_target = bits_to_target(template.bits);
        let epoch = epoch_of(template.height);
        let other_tx_data = template.transactions.iter().map(|tx| tx.data.clone()).collect();

        Job::new(
            self.id_alloc.next_id(),
            template.height,
            seed_hash(epoch),
            header,
            network_target,
            template.previous_block_hash,
            coinbase_tx,
            other_tx_data,
            merkle,
            template.bits,
            version,
            template.curtime,
            is_new_block,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kps_consensus::ReferenceVerifier;
    use kps_rpc::RpcConfig;

    fn manager() -> JobManager {
        let rpc = Arc::new(RpcClient::new(RpcConfig::default()));
        JobManager::new(
            rpc,
            Arc::new(ReferenceVerifier),
            JobManagerConfig {
                poll_interval: Duration::from_secs(1),
                refresh_interval: Duration::from_secs(60),
                payout_script: vec![0; 25],
                pool_tag: b"kps".to_vec(),
            },
        )
    }

    #[test]
    fn assembles_deterministic_job_from_template() {
        let mgr = manager();
        let template = BlockTemplate {
            height: 42,
            previous_block_hash: [7; 32],
            bits: 0x1e00ffff,
            curtime: 1_700_000_000,
            mintime: 1_699_999_000,
            coinbase_value: 5_000_000_000,
            transactions: vec![],
            witness_commitment: None,
            raw: None,
            received_at: Instant::now(),
        };
        let job_a = mgr.assemble_job(&template, true);
        let job_b = mgr.assemble_job(&template, true);
        assert_eq!(job_a.header_hash, job_b.header_hash);
        assert_eq!(job_a.merkle_root, job_b.merkle_root);
        assert_ne!(job_a.id, job_b.id, "job IDs still advance even for identical templates");
    }

    #[test]
    fn find_job_checks_current_then_previous() {
        let mgr = manager();
        let template = BlockTemplate {
            height: 1,
            previous_block_hash: [1; 32],
            bits: 0x1e00ffff,
            curtime: 1,
            mintime: 0,
            coinbase_value: 0,
            transactions: vec![],
            witness_commitment: None,
            raw: None,
            received_at: Instant::now(),
        };
        let job = Arc::new(mgr.assemble_job(&template, true));
        *mgr.previous.write().unwrap() = Some(job.clone());
        assert!(mgr.find_job(&job.id).is_some());
        assert!(mgr.find_job("ffffffff").is_none());
    }
}
