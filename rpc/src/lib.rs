//! JSON-RPC 1.0 client for the upstream node.
//!
//! Talks to the daemon's `getblocktemplate`/`submitblock`/etc RPC port over
//! HTTP Basic Auth, the way any Bitcoin-derived node expects. Transport
//! failures (connection refused, timeout) are retried with backoff; auth
//! failures and JSON-RPC logical errors never are — see [`RpcClientError`].

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub mod error;
pub mod methods;

pub use error::RpcClientError;
pub use methods::{BlockTemplateRequest, GetBlockTemplateResponse, ValidateAddressResponse};

/// Connection settings for one upstream daemon.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Number of retry attempts for transport-level failures (0 = one
    /// attempt, no retries).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_backoff: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8766".to_string(),
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'a str,
    method: &'a str,
    params: Value,
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// A JSON-RPC 1.0 client bound to one upstream node.
pub struct RpcClient {
    config: RpcConfig,
    http: reqwest::Client,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("building the reqwest client cannot fail with these options");
        Self { config, http }
    }

    /// Call `method` with `params`, retrying transport failures up to
    /// `max_retries` times with exponential backoff. Auth and JSON-RPC
    /// logical errors return immediately.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcClientError> {
        let mut attempt = 0;
        loop {
            match self.call_once(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff * 2u32.pow(attempt);
                    warn!(method, attempt, ?delay, "retrying after transport error: {err}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "1.0",
            id: "kps",
            method,
            params,
        };

        debug!(method, "sending upstream RPC call");

        let response = self
            .http
            .post(&self.config.url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&request)
            .send()
            .await
            .map_err(|source| RpcClientError::Transport {
                method: method.to_string(),
                source,
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(RpcClientError::Auth {
                method: method.to_string(),
            });
        }

        let body_text = response
            .text()
            .await
            .map_err(|source| RpcClientError::Transport {
                method: method.to_string(),
                source,
            })?;

        if !status.is_success() {
            return Err(RpcClientError::Http {
                method: method.to_string(),
                status: status.as_u16(),
                body: body_text,
            });
        }

        // Some daemons emit bare `nan`/`-nan` literals for unset float
        // fields (e.g. `difficulty` before the first block); fix those up
        // before handing the body to serde_json.
        let fixed = kps_util::fix_json_nan(&body_text);

        let parsed: JsonRpcResponse =
            serde_json::from_str(&fixed).map_err(|source| RpcClientError::MalformedResponse {
                method: method.to_string(),
                source,
            })?;

        if let Some(error) = parsed.error {
            return Err(RpcClientError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(parsed.result).map_err(|source| RpcClientError::MalformedResponse {
            method: method.to_string(),
            source,
        })
    }

    /// `getblocktemplate`.
    pub async fn get_block_template(
        &self,
        request: &BlockTemplateRequest,
    ) -> Result<GetBlockTemplateResponse, RpcClientError> {
        self.call("getblocktemplate", json!([request])).await
    }

    /// `submitblock`, returning the daemon's rejection reason if any
    /// (`None` on outright acceptance).
    pub async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, RpcClientError> {
        self.call("submitblock", json!([block_hex])).await
    }

    /// `getblock` in verbose (object) mode.
    pub async fn get_block(&self, hash_hex: &str) -> Result<Value, RpcClientError> {
        self.call("getblock", json!([hash_hex, true])).await
    }

    /// `getblockchaininfo`.
    pub async fn get_blockchain_info(&self) -> Result<Value, RpcClientError> {
        self.call("getblockchaininfo", json!([])).await
    }

    /// `validateaddress`.
    pub async fn validate_address(
        &self,
        address: &str,
    ) -> Result<ValidateAddressResponse, RpcClientError> {
        self.call("validateaddress", json!([address])).await
    }
}
