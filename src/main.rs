//! KawPoW solo-mining Stratum server entry point.
//!
//! Loads configuration, waits for the upstream node to become reachable,
//! then runs the Job Manager and Stratum listener side by side until
//! `Ctrl+C` or a fatal startup error.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kps_consensus::{p2pkh_script, ReferenceVerifier};
use kps_mining::job_manager::{JobManager, JobManagerConfig};
use kps_mining::server::{ServerConfig, StratumServer};
use kps_rpc::RpcClient;

use config::AppConfig;

#[derive(Parser)]
#[clap(name = "kps-stratum")]
#[clap(about = "Solo-mining Stratum v1 server for a KawPoW-based coin")]
struct Cli {
    /// Path to a TOML configuration file.
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Network label, propagated through to address-format checks only.
    #[clap(long, default_value = "mainnet")]
    network: String,

    /// Override `host:port.number` from the config file.
    #[clap(long, value_name = "HOST:PORT")]
    stratum_bind: Option<String>,

    /// Override `rpc.host`.
    #[clap(long)]
    rpc_host: Option<String>,

    /// Override `rpc.port`.
    #[clap(long)]
    rpc_port: Option<u16>,

    /// Force debug-level logging regardless of the config file.
    #[clap(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Decode a base58check P2PKH address into its 20-byte pubkey hash. Address
/// *format* validation is explicitly out of scope beyond what building a
/// coinbase output requires, so this only checks the decoded length.
fn payout_script(address: &str) -> Result<Vec<u8>, String> {
    let decoded = kps_util::base58_to_bytes(address).map_err(|e| e.to_string())?;
    if decoded.len() != 25 {
        return Err(format!("expected a 25-byte base58check address, got {} bytes", decoded.len()));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&decoded[1..21]);
    Ok(p2pkh_script(&hash))
}

async fn wait_for_upstream(rpc: &RpcClient, attempts: u32, delay: Duration) -> Result<(), ()> {
    for attempt in 1..=attempts.max(1) {
        match rpc.get_blockchain_info().await {
            Ok(_) => return Ok(()),
            Err(err) => {
                error!(attempt, max = attempts, "upstream not ready yet: {err}");
                tokio::time::sleep(delay).await;
            }
        }
    }
    Err(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut app_config = match AppConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(bind) = &cli.stratum_bind {
        if let Some((host, port)) = bind.rsplit_once(':') {
            app_config.host = host.to_string();
            if let Ok(port) = port.parse() {
                app_config.port.number = port;
            }
        }
    }
    if let Some(rpc_host) = cli.rpc_host {
        app_config.rpc.host = rpc_host;
    }
    if let Some(rpc_port) = cli.rpc_port {
        app_config.rpc.port = rpc_port;
    }
    app_config.debug = app_config.debug || cli.debug;

    init_logging(app_config.debug);
    info!(network = %cli.network, "starting kawpow stratum server");

    let payout_script = match payout_script(&app_config.coinbase_address) {
        Ok(script) => script,
        Err(err) => {
            error!("invalid coinbaseAddress: {err}");
            return ExitCode::FAILURE;
        }
    };

    let stratum_bind = match app_config.stratum_bind() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid stratum bind address: {err}");
            return ExitCode::FAILURE;
        }
    };

    let rpc = Arc::new(RpcClient::new(app_config.rpc_config()));
    if wait_for_upstream(
        &rpc,
        app_config.startup_retry_attempts,
        Duration::from_millis(app_config.startup_retry_delay_ms),
    )
    .await
    .is_err()
    {
        error!("upstream node never became reachable; giving up");
        return ExitCode::FAILURE;
    }
    info!("upstream node reachable");

    let job_manager = Arc::new(JobManager::new(
        Arc::clone(&rpc),
        Arc::new(ReferenceVerifier),
        JobManagerConfig {
            poll_interval: Duration::from_millis(app_config.block_poll_interval_ms),
            refresh_interval: Duration::from_secs(app_config.job_update_interval),
            payout_script,
            pool_tag: app_config.block_brand.clone().into_bytes(),
        },
    ));

    let server = Arc::new(StratumServer::new(
        ServerConfig {
            bind_addr: stratum_bind,
            idle_timeout: Duration::from_secs(app_config.idle_timeout_secs),
            vardiff: app_config.vardiff_config(),
            extra_nonce2_size: 4,
            port_diff: app_config.port.diff,
        },
        Arc::clone(&job_manager),
        Arc::clone(&rpc),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut job_manager_task = tokio::spawn(Arc::clone(&job_manager).run(shutdown_rx.clone()));
    let mut server_task = tokio::spawn(Arc::clone(&server).run(shutdown_rx));

    let fatal = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            false
        }
        result = &mut server_task => {
            error!("stratum listener exited unexpectedly: {result:?}");
            true
        }
        result = &mut job_manager_task => {
            error!("job manager exited unexpectedly: {result:?}");
            true
        }
    };

    let _ = shutdown_tx.send(true);
    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
    if !job_manager_task.is_finished() {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut job_manager_task).await.is_err() {
            error!("job manager did not stop within the shutdown timeout; aborting");
            job_manager_task.abort();
        }
    }
    if !server_task.is_finished() {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server_task).await.is_err() {
            error!("stratum listener did not stop within the shutdown timeout; aborting");
            server_task.abort();
        }
    }
    info!("shutdown complete");

    if fatal {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
