//! TCP listener: accepts connections, mints a unique `extraNonce1` for each,
//! and spawns the per-client session task.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use kps_core::VarDiffConfig;
use kps_rpc::RpcClient;

use crate::job_manager::JobManager;
use crate::session::{self, SessionConfig};

/// How long to wait for connected clients to disconnect on their own after
/// a shutdown notice before the server aborts their session tasks outright.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub idle_timeout: Duration,
    pub vardiff: VarDiffConfig,
    pub extra_nonce2_size: usize,
    pub port_diff: Option<f64>,
}

/// Listens on `config.bind_addr` and spawns one task per accepted
/// connection. The shared `extra_nonce1` set is the only state touched
/// across client tasks besides the job manager itself.
pub struct StratumServer {
    config: ServerConfig,
    job_manager: Arc<JobManager>,
    rpc: Arc<RpcClient>,
    assigned_extra_nonce1: RwLock<HashSet<String>>,
    clients: Mutex<JoinSet<()>>,
}

impl StratumServer {
    pub fn new(config: ServerConfig, job_manager: Arc<JobManager>, rpc: Arc<RpcClient>) -> Self {
        Self {
            config,
            job_manager,
            rpc,
            assigned_extra_nonce1: RwLock::new(HashSet::new()),
            clients: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "stratum server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, remote_addr)) => self.spawn_client(socket, remote_addr, shutdown.clone()).await,
                        Err(err) => error!("accept failed: {err}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stratum server stopping");
                        self.disconnect_all().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Disconnect every connected client with a shutdown reason, waiting up
    /// to `SHUTDOWN_GRACE` for sessions to close their sockets on their own
    /// before hard-aborting whatever remains.
    async fn disconnect_all(&self) {
        let mut clients = self.clients.lock().await;
        if clients.is_empty() {
            return;
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while clients.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace period elapsed; aborting remaining client sessions");
            clients.abort_all();
            while clients.join_next().await.is_some() {}
        }
    }

    async fn spawn_client(
        self: &Arc<Self>,
        socket: tokio::net::TcpStream,
        remote_addr: SocketAddr,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let extra_nonce1 = self.mint_extra_nonce1();
        info!(%remote_addr, extra_nonce1 = %extra_nonce1, "client connected");

        let server = Arc::clone(self);
        let job_manager = Arc::clone(&self.job_manager);
        let rpc = Arc::clone(&self.rpc);
        let session_config = SessionConfig {
            idle_timeout: self.config.idle_timeout,
            vardiff: self.config.vardiff.clone(),
            extra_nonce2_size: self.config.extra_nonce2_size,
            port_diff: self.config.port_diff,
        };
        let extra_nonce1_for_cleanup = extra_nonce1.clone();

        self.clients.lock().await.spawn(async move {
            session::run(socket, remote_addr, extra_nonce1, job_manager, rpc, session_config, shutdown).await;
            server.release_extra_nonce1(&extra_nonce1_for_cleanup);
            info!(%remote_addr, "client disconnected");
        });
    }

    /// Mint a 4-byte `extraNonce1`, unique among currently connected clients,
    /// formatted as 8 lowercase hex characters.
    fn mint_extra_nonce1(&self) -> String {
        let mut assigned = self.assigned_extra_nonce1.write().expect("extra_nonce1 set lock poisoned");
        loop {
            let mut bytes = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut bytes);
            let candidate = hex::encode(bytes);
            if assigned.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    fn release_extra_nonce1(&self, extra_nonce1: &str) {
        self.assigned_extra_nonce1
            .write()
            .expect("extra_nonce1 set lock poisoned")
            .remove(extra_nonce1);
    }

    pub fn connected_clients(&self) -> usize {
        self.assigned_extra_nonce1.read().expect("extra_nonce1 set lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kps_consensus::ReferenceVerifier;
    use kps_rpc::RpcConfig;
    use std::time::Duration as StdDuration;

    fn server() -> StratumServer {
        let rpc = Arc::new(RpcClient::new(RpcConfig::default()));
        let job_manager = Arc::new(JobManager::new(
            Arc::clone(&rpc),
            Arc::new(ReferenceVerifier),
            crate::job_manager::JobManagerConfig {
                poll_interval: StdDuration::from_secs(1),
                refresh_interval: StdDuration::from_secs(60),
                payout_script: vec![0; 25],
                pool_tag: b"kps".to_vec(),
            },
        ));
        StratumServer::new(
            ServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                idle_timeout: StdDuration::from_secs(600),
                vardiff: VarDiffConfig::default(),
                extra_nonce2_size: 4,
                port_diff: None,
            },
            job_manager,
            rpc,
        )
    }

    #[test]
    fn minted_extra_nonce1_values_are_unique_and_tracked() {
        let srv = server();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let id = srv.mint_extra_nonce1();
            assert_eq!(id.len(), 8);
            assert!(seen.insert(id));
        }
        assert_eq!(srv.connected_clients(), 64);
    }

    #[test]
    fn released_extra_nonce1_can_be_reassigned() {
        let srv = server();
        let id = srv.mint_extra_nonce1();
        srv.release_extra_nonce1(&id);
        assert_eq!(srv.connected_clients(), 0);
    }
}
