//! Layered configuration: a TOML file (or environment variables prefixed
//! `KPS__`) overridden by a handful of CLI flags. Field names mirror the
//! terms used for the configuration surface (`coinbaseAddress`,
//! `port.number`, `rpc.host`, `vardiff.*`, ...).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use kps_core::VarDiffConfig;
use kps_rpc::RpcConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub coinbase_address: String,
    pub block_brand: String,
    pub host: String,
    pub port: PortConfig,
    pub rpc: RpcSection,
    pub job_update_interval: u64,
    pub block_poll_interval_ms: u64,
    pub startup_retry_attempts: u32,
    pub startup_retry_delay_ms: u64,
    pub idle_timeout_secs: u64,
    pub vardiff: VarDiffSection,
    pub debug: bool,
    pub log_file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            coinbase_address: String::new(),
            block_brand: "kps-stratum".to_string(),
            host: "0.0.0.0".to_string(),
            port: PortConfig::default(),
            rpc: RpcSection::default(),
            job_update_interval: 55,
            block_poll_interval_ms: 250,
            startup_retry_attempts: 10,
            startup_retry_delay_ms: 2_000,
            idle_timeout_secs: 600,
            vardiff: VarDiffSection::default(),
            debug: false,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PortConfig {
    pub number: u16,
    pub diff: Option<f64>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self { number: 3333, diff: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcSection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8766,
            user: String::new(),
            password: String::new(),
            timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VarDiffSection {
    pub enabled: bool,
    pub min_diff: f64,
    pub max_diff: f64,
    pub target_share_time: f64,
    pub retarget_time: f64,
    pub variance_percent: f64,
    pub adjustment_factor: f64,
    pub use_proportional: bool,
}

impl Default for VarDiffSection {
    fn default() -> Self {
        let d = VarDiffConfig::default();
        Self {
            enabled: d.enabled,
            min_diff: d.min_diff,
            max_diff: d.max_diff,
            target_share_time: d.target_share_time,
            retarget_time: d.retarget_time,
            variance_percent: d.variance_percent,
            adjustment_factor: d.adjustment_factor,
            use_proportional: d.use_proportional,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KPS")
                .separator("__")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }

    pub fn stratum_bind(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port.number).parse()
    }

    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            url: format!("http://{}:{}", self.rpc.host, self.rpc.port),
            username: self.rpc.user.clone(),
            password: self.rpc.password.clone(),
            timeout: Duration::from_millis(self.rpc.timeout_ms),
            max_retries: self.rpc.retry_attempts,
            retry_backoff: Duration::from_millis(self.rpc.retry_delay_ms),
        }
    }

    pub fn vardiff_config(&self) -> VarDiffConfig {
        VarDiffConfig {
            enabled: self.vardiff.enabled,
            min_diff: self.vardiff.min_diff,
            max_diff: self.vardiff.max_diff,
            target_share_time: self.vardiff.target_share_time,
            retarget_time: self.vardiff.retarget_time,
            variance_percent: self.vardiff.variance_percent,
            adjustment_factor: self.vardiff.adjustment_factor,
            use_proportional: self.vardiff.use_proportional,
        }
    }
}
