//! Per-connection client task: one task per miner, sequential, no locking
//! on its own `Client` state (only the job manager and subscription set are
//! shared).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

use kps_core::{now_ms, Client, ClientState, ShareOutcome, StratumErrorCode, VarDiffConfig};
use kps_rpc::RpcClient;

use crate::job_manager::JobManager;
use crate::protocol::{StratumNotification, StratumRequest, StratumResponse};
use crate::share_validator::{self, SubmitParams};
use crate::vardiff;

const MAX_LINE_LENGTH: usize = 8 * 1024;
const MAX_PROTOCOL_VIOLATIONS: u8 = 3;

pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub vardiff: VarDiffConfig,
    pub extra_nonce2_size: usize,
    pub port_diff: Option<f64>,
}

/// Drive one client connection until it disconnects or is closed for
/// misbehavior. Returns the client's `extra_nonce1` so the caller can
/// release it from the shared subscription set.
pub async fn run(
    socket: tokio::net::TcpStream,
    remote_addr: std::net::SocketAddr,
    extra_nonce1: String,
    job_manager: Arc<JobManager>,
    rpc: Arc<RpcClient>,
    config: SessionConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let (read_half, write_half) = socket.into_split();
    let mut writer = BufWriter::new(write_half);

    let mut codec = LinesCodec::new();
    codec.set_max_length(MAX_LINE_LENGTH);
    let mut lines = FramedRead::new(read_half, codec);

    let initial_diff = config.vardiff.initial_diff(config.port_diff);
    let mut client = Client::new(extra_nonce1.clone(), remote_addr, initial_diff, config.port_diff);

    loop {
        tokio::select! {
            line = futures::StreamExt::next(&mut lines) => {
                match line {
                    Some(Ok(line)) => {
                        if !handle_line(&line, &mut client, &job_manager, &rpc, &config, &mut writer).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(%remote_addr, "line read error: {err}");
                        break;
                    }
                    None => {
                        info!(%remote_addr, "connection closed by peer");
                        break;
                    }
                }
            }
            _ = job_manager.new_job_notified() => {
                if client.is_ready() {
                    if let Err(err) = send_current_job(&job_manager, &client, &mut writer).await {
                        warn!(%remote_addr, "failed to push job: {err}");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(config.idle_timeout) => {
                if client.last_activity.elapsed() >= config.idle_timeout {
                    info!(%remote_addr, "closing idle connection");
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    let _ = send_line(&mut writer, &StratumNotification::show_message("server shutting down").to_line()).await;
                    info!(%remote_addr, "disconnecting client for shutdown");
                    break;
                }
            }
        }
    }
    client.state = ClientState::Closed;
}

async fn handle_line(
    line: &str,
    client: &mut Client,
    job_manager: &Arc<JobManager>,
    rpc: &Arc<RpcClient>,
    config: &SessionConfig,
    writer: &mut BufWriter<OwnedWriteHalf>,
) -> bool {
    client.touch();

    let request: StratumRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(err) => {
            client.consecutive_protocol_violations += 1;
            debug!("malformed stratum line: {err}");
            let _ = send_line(writer, &StratumResponse::protocol_error(Value::Null, "malformed request").to_line()).await;
            return client.consecutive_protocol_violations < MAX_PROTOCOL_VIOLATIONS;
        }
    };
    client.consecutive_protocol_violations = 0;

    match request.method.as_str() {
        "mining.subscribe" => handle_subscribe(&request, client, config, writer).await,
        "mining.authorize" => handle_authorize(&request, client, job_manager, config, writer).await,
        "mining.submit" => handle_submit(&request, client, job_manager, rpc, config, writer).await,
        "mining.extranonce.subscribe" => {
            send_line(writer, &StratumResponse::success(request.id, json!(true)).to_line()).await
        }
        "client.get_version" | "client.show_message" => {
            send_line(writer, &StratumResponse::success(request.id, json!(true)).to_line()).await
        }
        other => {
            warn!("unsupported method: {other}");
            send_line(writer, &StratumResponse::error(request.id, StratumErrorCode::Other).to_line()).await
        }
    }
}

async fn handle_subscribe(
    request: &StratumRequest,
    client: &mut Client,
    config: &SessionConfig,
    writer: &mut BufWriter<OwnedWriteHalf>,
) -> bool {
    if client.state != ClientState::Connect {
        return send_line(writer, &StratumResponse::error(request.id.clone(), StratumErrorCode::Other).to_line()).await;
    }
    client.state = ClientState::Subscribed;

    let result = json!([
        [["mining.set_difficulty", client.extra_nonce1], ["mining.notify", client.extra_nonce1]],
        client.extra_nonce1,
        config.extra_nonce2_size,
    ]);
    send_line(writer, &StratumResponse::success(request.id.clone(), result).to_line()).await
}

async fn handle_authorize(
    request: &StratumRequest,
    client: &mut Client,
    job_manager: &Arc<JobManager>,
    _config: &SessionConfig,
    writer: &mut BufWriter<OwnedWriteHalf>,
) -> bool {
    if client.state != ClientState::Subscribed {
        return send_line(writer, &StratumResponse::error(request.id.clone(), StratumErrorCode::UnauthorizedWorker).to_line()).await;
    }
    let Some(worker_name) = request.params.first().and_then(|v| v.as_str()) else {
        return send_line(writer, &StratumResponse::protocol_error(request.id.clone(), "missing worker name").to_line()).await;
    };
    client.worker_name = Some(worker_name.to_string());
    client.password = request.params.get(1).and_then(|v| v.as_str()).map(str::to_string);
    client.state = ClientState::Ready;

    if !send_line(writer, &StratumResponse::success(request.id.clone(), json!(true)).to_line()).await {
        return false;
    }
    if !send_line(writer, &StratumNotification::set_difficulty(client.diff).to_line()).await {
        return false;
    }
    client.last_difficulty_update_ms = now_ms();
    send_current_job(job_manager, client, writer).await.is_ok()
}

async fn handle_submit(
    request: &StratumRequest,
    client: &mut Client,
    job_manager: &Arc<JobManager>,
    rpc: &Arc<RpcClient>,
    config: &SessionConfig,
    writer: &mut BufWriter<OwnedWriteHalf>,
) -> bool {
    if !client.is_ready() {
        return send_line(writer, &StratumResponse::error(request.id.clone(), StratumErrorCode::UnauthorizedWorker).to_line()).await;
    }
    let params = &request.params;
    let (Some(worker_name), Some(job_id), Some(nonce_hex), Some(header_hash_hex), Some(mix_hash_hex)) = (
        params.first().and_then(|v| v.as_str()),
        params.get(1).and_then(|v| v.as_str()),
        params.get(2).and_then(|v| v.as_str()),
        params.get(3).and_then(|v| v.as_str()),
        params.get(4).and_then(|v| v.as_str()),
    ) else {
        return send_line(writer, &StratumResponse::protocol_error(request.id.clone(), "malformed submit").to_line()).await;
    };

    let submit_params = SubmitParams {
        worker_name: worker_name.to_string(),
        job_id: job_id.to_string(),
        nonce_hex: nonce_hex.to_string(),
        header_hash_hex: header_hash_hex.to_string(),
        mix_hash_hex: mix_hash_hex.to_string(),
    };

    let outcome = share_validator::validate_share(job_manager, client, &submit_params);

    let ok = match &outcome {
        ShareOutcome::Invalid(code) => {
            return send_line(writer, &StratumResponse::error(request.id.clone(), *code).to_line()).await;
        }
        ShareOutcome::ValidShare => true,
        ShareOutcome::ValidBlock { .. } => true,
    };

    client.share_timestamps.push(now_ms(), std::time::Instant::now());
    if !send_line(writer, &StratumResponse::success(request.id.clone(), json!(ok)).to_line()).await {
        return false;
    }

    if let ShareOutcome::ValidBlock { block_hex, block_hash_hex } = &outcome {
        info!(worker = %submit_params.worker_name, job = %submit_params.job_id, "found a block candidate");
        submit_block(rpc, job_manager, block_hex, block_hash_hex).await;
    }

    if let Some(new_diff) = maybe_retarget(client, &config.vardiff) {
        if !send_line(writer, &StratumNotification::set_difficulty(new_diff).to_line()).await {
            return false;
        }
    }

    true
}

/// Submit a found block upstream, then trigger an immediate job refresh and
/// confirm acceptance via `getblock` regardless of how `submitblock`
/// answered (a stale "rejected" can still mean a prior poll already won).
async fn submit_block(rpc: &Arc<RpcClient>, job_manager: &Arc<JobManager>, block_hex: &str, block_hash_hex: &str) {
    match rpc.submit_block(block_hex).await {
        Ok(None) => {
            info!("block accepted by upstream");
            confirm_block(rpc, block_hash_hex).await;
        }
        Ok(Some(reason)) => warn!("upstream rejected block: {reason}"),
        Err(err) => warn!("submitblock call failed: {err}"),
    }
    job_manager.poll_now().await;
}

/// Verify acceptance via `getblock(submittedHash)` and surface the
/// confirming transaction id.
async fn confirm_block(rpc: &Arc<RpcClient>, block_hash_hex: &str) {
    match rpc.get_block(block_hash_hex).await {
        Ok(block) => match extract_block_tx_id(&block) {
            Some(tx_id) => info!(hash = %block_hash_hex, blockTxId = %tx_id, "block confirmed via getblock"),
            None => warn!(hash = %block_hash_hex, "getblock returned no tx entries"),
        },
        Err(err) => warn!(hash = %block_hash_hex, "getblock confirmation failed: {err}"),
    }
}

/// The coinbase transaction id is the confirming `blockTxId`: the first
/// entry of `getblock`'s verbose `tx` array.
fn extract_block_tx_id(block: &Value) -> Option<&str> {
    block.get("tx")?.as_array()?.first()?.as_str()
}

async fn send_current_job(
    job_manager: &Arc<JobManager>,
    client: &Client,
    writer: &mut BufWriter<OwnedWriteHalf>,
) -> Result<(), ()> {
    let Some(job) = job_manager.current_job() else {
        return Ok(());
    };
    let target = kps_consensus::target_from_difficulty(client.diff);
    let target_le = hex::encode(target.iter().rev().copied().collect::<Vec<_>>());
    let notification = StratumNotification::notify(&job, &target_le);
    if send_line(writer, &notification.to_line()).await {
        Ok(())
    } else {
        Err(())
    }
}

async fn send_line(writer: &mut BufWriter<OwnedWriteHalf>, line: &str) -> bool {
    if writer.write_all(line.as_bytes()).await.is_err() {
        return false;
    }
    if writer.write_all(b"\n").await.is_err() {
        return false;
    }
    writer.flush().await.is_ok()
}

/// VarDiff check, run after each accepted share.
pub(crate) fn maybe_retarget(client: &mut Client, config: &VarDiffConfig) -> Option<f64> {
    let new_diff = vardiff::check_adjustment(
        config,
        client.diff,
        &client.share_timestamps,
        client.last_difficulty_update_ms,
        now_ms(),
    )?;
    client.diff = new_diff;
    client.last_difficulty_update_ms = now_ms();
    client.share_timestamps = kps_core::client::ShareTimestampRing::new();
    Some(new_diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_first_tx_as_block_tx_id() {
        let block = json!({"tx": ["abc123", "def456"]});
        assert_eq!(extract_block_tx_id(&block), Some("abc123"));
    }

    #[test]
    fn missing_tx_array_yields_no_block_tx_id() {
        assert_eq!(extract_block_tx_id(&json!({})), None);
        assert_eq!(extract_block_tx_id(&json!({"tx": []})), None);
    }
}
