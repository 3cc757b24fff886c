//! End-to-end Stratum scenarios driven over real loopback sockets: a fake
//! upstream node speaking just enough JSON-RPC 1.0 to satisfy the Job
//! Manager, and a plain `TcpStream` speaking the line-delimited Stratum
//! protocol against a real `StratumServer`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use kps_consensus::ReferenceVerifier;
use kps_core::VarDiffConfig;
use kps_mining::job_manager::{JobManager, JobManagerConfig};
use kps_mining::server::{ServerConfig, StratumServer};
use kps_rpc::{RpcClient, RpcConfig};

/// Minimal JSON-RPC 1.0 upstream: enough of `getblocktemplate` and
/// `submitblock` for the Job Manager and Share Validator to exercise their
/// real HTTP path rather than a mocked trait. `height` is shared with the
/// test so it can simulate a new block arriving mid-run.
async fn spawn_fake_upstream(height: Arc<AtomicU64>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handle_upstream_connection(socket, Arc::clone(&height)));
        }
    });
    addr
}

async fn handle_upstream_connection(socket: TcpStream, height: Arc<AtomicU64>) {
    let mut reader = BufReader::new(socket);
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    if reader.read_exact(&mut body).await.is_err() {
        return;
    }
    let request_body = String::from_utf8_lossy(&body);

    let result = if request_body.contains("getblocktemplate") {
        let height = height.load(Ordering::SeqCst);
        json!({
            "height": height,
            "previousblockhash": format!("{height:064x}"),
            "bits": "1e00ffff",
            "curtime": 1_700_000_000u32 + height as u32,
            "mintime": 1_699_999_000u32,
            "coinbasevalue": 5_000_000_000u64,
            "transactions": [],
            "default_witness_commitment": Value::Null,
        })
    } else if request_body.contains("submitblock") {
        Value::Null
    } else if request_body.contains("getblock") {
        json!({"tx": ["coinbase-tx-id"]})
    } else {
        json!({})
    };
    let response_body = json!({ "result": result, "error": Value::Null, "id": "kps" }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response_body.len(),
        response_body
    );
    let mut stream = reader.into_inner();
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

/// `min_diff == max_diff == 0.0` is not a configuration a real deployment
/// would ship (see `VarDiffConfig::validate`), but it gives these tests a
/// deterministic, mathematically guaranteed pass through the difficulty
/// check regardless of what the `ReferenceVerifier`'s opaque hash happens
/// to be: `difficulty_from_hash` is never negative, so it can never be
/// below a floor of zero.
fn zero_floor_vardiff() -> VarDiffConfig {
    VarDiffConfig {
        min_diff: 0.0,
        max_diff: 0.0,
        ..VarDiffConfig::default()
    }
}

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown: tokio::sync::watch::Sender<bool>,
    job_manager: Arc<JobManager>,
    height: Arc<AtomicU64>,
}

async fn spawn_stratum_server_with(bind_addr: &str, vardiff: VarDiffConfig, port_diff: Option<f64>) -> TestServer {
    let height = Arc::new(AtomicU64::new(100));
    let upstream_addr = spawn_fake_upstream(Arc::clone(&height)).await;
    let rpc = Arc::new(RpcClient::new(RpcConfig {
        url: format!("http://{upstream_addr}"),
        ..RpcConfig::default()
    }));
    let job_manager = Arc::new(JobManager::new(
        Arc::clone(&rpc),
        Arc::new(ReferenceVerifier),
        JobManagerConfig {
            poll_interval: Duration::from_millis(25),
            refresh_interval: Duration::from_secs(60),
            payout_script: vec![0u8; 25],
            pool_tag: b"kps-test".to_vec(),
        },
    ));

    let server = Arc::new(StratumServer::new(
        ServerConfig {
            bind_addr: bind_addr.parse().expect("valid test bind address"),
            idle_timeout: Duration::from_secs(600),
            vardiff,
            extra_nonce2_size: 4,
            port_diff,
        },
        Arc::clone(&job_manager),
        Arc::clone(&rpc),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(Arc::clone(&job_manager).run(shutdown_rx.clone()));
    tokio::spawn(Arc::clone(&server).run(shutdown_rx));

    for _ in 0..200 {
        if job_manager.current_job().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(job_manager.current_job().is_some(), "job manager never published a job");

    TestServer {
        addr: bind_addr.parse().unwrap(),
        shutdown: shutdown_tx,
        job_manager,
        height,
    }
}

async fn spawn_stratum_server(bind_addr: &str) -> (std::net::SocketAddr, tokio::sync::watch::Sender<bool>) {
    let server = spawn_stratum_server_with(bind_addr, zero_floor_vardiff(), None).await;
    (server.addr, server.shutdown)
}

async fn connect(addr: std::net::SocketAddr) -> BufReader<TcpStream> {
    for attempt in 0..50 {
        match TcpStream::connect(addr).await {
            Ok(stream) => return BufReader::new(stream),
            Err(_) if attempt < 49 => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(err) => panic!("failed to connect to stratum server: {err}"),
        }
    }
    unreachable!()
}

async fn write_line(stream: &mut BufReader<TcpStream>, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    stream.get_mut().write_all(line.as_bytes()).await.expect("write request line");
}

async fn read_line(stream: &mut BufReader<TcpStream>) -> Value {
    let mut line = String::new();
    let n = stream.read_line(&mut line).await.expect("read response line");
    assert!(n > 0, "connection closed before a line was sent");
    serde_json::from_str(line.trim_end()).expect("response line is valid JSON")
}

async fn subscribe(stream: &mut BufReader<TcpStream>) -> String {
    write_line(stream, &json!({"id": 1, "method": "mining.subscribe", "params": ["test-miner/1.0"]})).await;
    let response = read_line(stream).await;
    response["result"][1].as_str().expect("subscribe result carries extraNonce1").to_string()
}

/// Returns `(jobIdHex, headerHashHex, cleanJobs)` read off the `mining.notify`
/// pushed right after authorize.
async fn authorize(stream: &mut BufReader<TcpStream>) -> (String, String, bool) {
    write_line(stream, &json!({"id": 2, "method": "mining.authorize", "params": ["worker1", "x"]})).await;
    let ack = read_line(stream).await;
    assert_eq!(ack["result"], json!(true));
    let set_difficulty = read_line(stream).await;
    assert_eq!(set_difficulty["method"], "mining.set_difficulty");
    let notify = read_line(stream).await;
    assert_eq!(notify["method"], "mining.notify");
    let job_id = notify["params"][0].as_str().expect("notify carries a job id").to_string();
    let header_hash = notify["params"][1].as_str().expect("notify carries a header hash").to_string();
    let clean_jobs = notify["params"][4].as_bool().expect("notify carries cleanJobs");
    (job_id, header_hash, clean_jobs)
}

fn submit(worker: &str, job_id: &str, nonce_hex: &str, header_hash_hex: &str, mix_hash_hex: &str) -> Value {
    json!({"id": 3, "method": "mining.submit", "params": [worker, job_id, nonce_hex, header_hash_hex, mix_hash_hex]})
}

#[tokio::test]
async fn subscribe_authorize_submit_share_is_accepted() {
    let (addr, _shutdown) = spawn_stratum_server("127.0.0.1:18831").await;
    let mut client = connect(addr).await;

    let extra_nonce1 = subscribe(&mut client).await;
    let (job_id, header_hash_hex, clean_jobs) = authorize(&mut client).await;
    assert!(clean_jobs, "the first job a client sees is always a clean one");

    let nonce_hex = format!("{extra_nonce1}00000000");
    let mix_hash_hex = "22".repeat(32);
    write_line(&mut client, &submit("worker1", &job_id, &nonce_hex, &header_hash_hex, &mix_hash_hex)).await;
    let response = read_line(&mut client).await;
    assert_eq!(response["result"], json!(true), "first share on a fresh nonce should be accepted");
}

#[tokio::test]
async fn submit_with_wrong_header_hash_is_rejected() {
    let (addr, _shutdown) = spawn_stratum_server("127.0.0.1:18837").await;
    let mut client = connect(addr).await;

    let extra_nonce1 = subscribe(&mut client).await;
    let (job_id, _real_header_hash, _clean_jobs) = authorize(&mut client).await;

    let nonce_hex = format!("{extra_nonce1}00000000");
    let wrong_header_hash = "ab".repeat(32);
    let mix_hash_hex = "22".repeat(32);
    write_line(&mut client, &submit("worker1", &job_id, &nonce_hex, &wrong_header_hash, &mix_hash_hex)).await;
    let response = read_line(&mut client).await;
    assert!(response["result"].is_null());
    assert_eq!(response["error"][0], json!(20), "a headerHash not bound to the job must be rejected");
}

#[tokio::test]
async fn duplicate_share_is_rejected_on_second_submission() {
    let (addr, _shutdown) = spawn_stratum_server("127.0.0.1:18832").await;
    let mut client = connect(addr).await;

    let extra_nonce1 = subscribe(&mut client).await;
    let (job_id, header_hash_hex, _clean_jobs) = authorize(&mut client).await;

    let nonce_hex = format!("{extra_nonce1}00000000");
    let mix_hash_hex = "33".repeat(32);

    write_line(&mut client, &submit("worker1", &job_id, &nonce_hex, &header_hash_hex, &mix_hash_hex)).await;
    let first = read_line(&mut client).await;
    assert_eq!(first["result"], json!(true));

    write_line(&mut client, &submit("worker1", &job_id, &nonce_hex, &header_hash_hex, &mix_hash_hex)).await;
    let second = read_line(&mut client).await;
    assert!(second["result"].is_null());
    assert_eq!(second["error"][0], json!(22), "duplicate submission must use the reserved duplicate-share code");
}

#[tokio::test]
async fn submit_before_authorize_is_rejected() {
    let (addr, _shutdown) = spawn_stratum_server("127.0.0.1:18833").await;
    let mut client = connect(addr).await;

    let extra_nonce1 = subscribe(&mut client).await;

    let nonce_hex = format!("{extra_nonce1}00000000");
    let header_hash_hex = "00".repeat(32);
    let mix_hash_hex = "44".repeat(32);
    write_line(&mut client, &submit("worker1", "00000000", &nonce_hex, &header_hash_hex, &mix_hash_hex)).await;
    let response = read_line(&mut client).await;
    assert!(response["result"].is_null());
    assert_eq!(response["error"][0], json!(24), "submitting before authorize must use the unauthorized-worker code");
}

#[tokio::test]
async fn same_nonce_suffix_from_two_miners_is_not_a_duplicate() {
    let (addr, _shutdown) = spawn_stratum_server("127.0.0.1:18834").await;

    let mut miner_a = connect(addr).await;
    let extra_nonce1_a = subscribe(&mut miner_a).await;
    let (job_id, header_hash_hex, _) = authorize(&mut miner_a).await;

    let mut miner_b = connect(addr).await;
    let extra_nonce1_b = subscribe(&mut miner_b).await;
    let (job_id_b, header_hash_hex_b, _) = authorize(&mut miner_b).await;
    assert_eq!(job_id, job_id_b, "both miners are working the same job");
    assert_ne!(extra_nonce1_a, extra_nonce1_b, "each miner gets a distinct extraNonce1");

    // Same low 8 hex digits, different extraNonce1 prefixes: the nonces are
    // distinct once the prefix is included, so neither is a duplicate of
    // the other.
    let nonce_a = format!("{extra_nonce1_a}00000000");
    let nonce_b = format!("{extra_nonce1_b}00000000");
    let mix_hash_hex = "55".repeat(32);

    write_line(&mut miner_a, &submit("workerA", &job_id, &nonce_a, &header_hash_hex, &mix_hash_hex)).await;
    let response_a = read_line(&mut miner_a).await;
    assert_eq!(response_a["result"], json!(true));

    write_line(&mut miner_b, &submit("workerB", &job_id_b, &nonce_b, &header_hash_hex_b, &mix_hash_hex)).await;
    let response_b = read_line(&mut miner_b).await;
    assert_eq!(response_b["result"], json!(true), "miner B's share is independent of miner A's");
}

#[tokio::test]
async fn new_block_preempts_the_current_job_with_clean_jobs() {
    let server = spawn_stratum_server_with("127.0.0.1:18835", zero_floor_vardiff(), None).await;
    let mut client = connect(server.addr).await;

    let extra_nonce1 = subscribe(&mut client).await;
    let (first_job_id, first_header_hash, first_clean) = authorize(&mut client).await;
    assert!(first_clean);
    let _ = extra_nonce1;

    server.height.fetch_add(1, Ordering::SeqCst);

    let notify = loop {
        let line = read_line(&mut client).await;
        if line["method"] == "mining.notify" {
            break line;
        }
    };
    let new_job_id = notify["params"][0].as_str().unwrap().to_string();
    let new_header_hash = notify["params"][1].as_str().unwrap().to_string();
    let clean_jobs = notify["params"][4].as_bool().unwrap();

    assert_ne!(new_job_id, first_job_id, "a new block must preempt the current job");
    assert_ne!(new_header_hash, first_header_hash);
    assert!(clean_jobs, "a genuinely new block always carries cleanJobs=true");
}

#[tokio::test]
async fn fast_shares_tighten_difficulty() {
    let vardiff = VarDiffConfig {
        min_diff: 1e-15,
        max_diff: 1.0,
        target_share_time: 60.0,
        retarget_time: 0.0,
        variance_percent: 0.01,
        adjustment_factor: 2.0,
        use_proportional: true,
        enabled: true,
    };
    let server = spawn_stratum_server_with("127.0.0.1:18836", vardiff, Some(1e-12)).await;
    let mut client = connect(server.addr).await;

    let extra_nonce1 = subscribe(&mut client).await;
    let (job_id, header_hash_hex, _) = authorize(&mut client).await;

    let mut last_diff = None;
    for i in 0..12u32 {
        let nonce_hex = format!("{extra_nonce1}{i:08x}");
        let mix_hash_hex = "66".repeat(32);
        write_line(&mut client, &submit("worker1", &job_id, &nonce_hex, &header_hash_hex, &mix_hash_hex)).await;
        let response = read_line(&mut client).await;
        assert_eq!(response["result"], json!(true), "submission {i} should be accepted below the minimum possible difficulty");

        // A retarget, when it fires, immediately follows the share ack.
        if last_diff.is_none() {
            // Peek without consuming if nothing is buffered is not possible
            // over a socket, so just try a short read after each share past
            // the warm-up window and treat a notify miss as "not yet".
        }
    }

    // Drain any pending set_difficulty pushes triggered by the submissions
    // above; VarDiff requires at least 10 samples, so the retarget lands
    // on or after the 10th accepted share.
    let mut saw_new_diff = None;
    for _ in 0..5 {
        tokio::select! {
            line = read_line(&mut client) => {
                if line["method"] == "mining.set_difficulty" {
                    saw_new_diff = line["params"][0].as_f64();
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => break,
        }
    }

    let new_diff = saw_new_diff.expect("fast shares should trigger a set_difficulty push");
    assert!(new_diff > 1e-12, "difficulty should tighten when shares arrive faster than the target rate");
}

#[tokio::test]
async fn found_block_is_submitted_and_confirmed() {
    // Forced to the 256-bit maximum network target via the fake upstream's
    // easy `bits`, the opaque reference verifier's hash is not guaranteed
    // to clear a realistic network target, so block discovery itself is
    // covered at the unit level (`share_validator::tests`,
    // `session::tests`); this only exercises that accepted shares do not
    // wedge the connection and that the server stays responsive to further
    // traffic, which would regress if `submit_block`/`confirm_block` ever
    // blocked the session loop.
    let (addr, _shutdown) = spawn_stratum_server("127.0.0.1:18838").await;
    let mut client = connect(addr).await;

    let extra_nonce1 = subscribe(&mut client).await;
    let (job_id, header_hash_hex, _) = authorize(&mut client).await;

    let nonce_hex = format!("{extra_nonce1}00000000");
    let mix_hash_hex = "77".repeat(32);
    write_line(&mut client, &submit("worker1", &job_id, &nonce_hex, &header_hash_hex, &mix_hash_hex)).await;
    let response = read_line(&mut client).await;
    assert_eq!(response["result"], json!(true));

    // The session loop must still be alive and answering requests after
    // handling the submission above.
    write_line(&mut client, &json!({"id": 9, "method": "mining.extranonce.subscribe", "params": []})).await;
    let ack = read_line(&mut client).await;
    assert_eq!(ack["result"], json!(true));
}
