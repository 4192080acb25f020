use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::rpc::evm::parse_rpc_urls;
use crate::rpc::BackoffPolicy;

/// Main configuration for the relayer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Chain holding the lock contract (emits `Deposit`, exposes `unlock`)
    pub source: ChainConfig,
    /// Chain holding the wrapped token (emits `Burn`, exposes `mint`)
    pub destination: ChainConfig,
    pub relayer: RelayerConfig,
    pub rpc: RpcConfig,
    pub api: ApiConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// One side of the bridge
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// Ordered endpoint candidates; the first one starts active
    pub rpc_urls: Vec<String>,
    pub bridge_address: String,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    pub block_time_ms: u64,
    /// Cursor seed when no cursor is persisted; chain head otherwise
    #[serde(default)]
    pub start_block: Option<u64>,
}

impl ChainConfig {
    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.block_time_ms)
    }
}

/// Relayer configuration
#[derive(Clone, Deserialize)]
pub struct RelayerConfig {
    pub private_key: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for RelayerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayerConfig")
            .field("private_key", &"<redacted>")
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .finish()
    }
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Endpoint failover tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl RpcConfig {
    pub fn backoff_policy(&self, retry_delay_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            retry_delay: Duration::from_millis(retry_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Control API bind
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .wrap_err_with(|| format!("Invalid API bind address {}:{}", self.bind_address, self.port))
    }
}

/// Durable state location
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(eyre!("LOG_FORMAT must be 'pretty' or 'json', got '{}'", other)),
        }
    }
}

/// Default functions
fn default_confirmations() -> u64 {
    6
}

fn default_source_block_time() -> u64 {
    12_000
}

fn default_dest_block_time() -> u64 {
    3_000
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_backoff_initial() -> u64 {
    5000
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    4
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_state_file() -> PathBuf {
    PathBuf::from("relayer-state.json")
}

fn default_max_records() -> usize {
    10_000
}

/// Read a required variable
fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

/// Read an optional variable, failing loudly if it is set but unparseable
fn optional<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| eyre!("{} is invalid: {}", name, e)),
        _ => Ok(None),
    }
}

fn chain_from_env(prefix: &str, default_block_time: u64) -> Result<ChainConfig> {
    let rpc_urls = parse_rpc_urls(&required(&format!("{}_RPC_URLS", prefix))?);
    if rpc_urls.is_empty() {
        return Err(eyre!("{}_RPC_URLS cannot be empty", prefix));
    }

    Ok(ChainConfig {
        name: required(&format!("{}_CHAIN_NAME", prefix))?,
        rpc_urls,
        bridge_address: required(&format!("{}_BRIDGE_ADDRESS", prefix))?,
        confirmations: optional(&format!("{}_CONFIRMATIONS", prefix))?
            .unwrap_or_else(default_confirmations),
        block_time_ms: optional(&format!("{}_BLOCK_TIME_MS", prefix))?
            .unwrap_or(default_block_time),
        start_block: optional(&format!("{}_START_BLOCK", prefix))?,
    })
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let source = chain_from_env("SOURCE", default_source_block_time())?;
        let destination = chain_from_env("DEST", default_dest_block_time())?;

        let relayer = RelayerConfig {
            private_key: required("RELAYER_PRIVATE_KEY")?,
            poll_interval_ms: optional("POLL_INTERVAL_MS")?.unwrap_or_else(default_poll_interval),
            retry_delay_ms: optional("RETRY_DELAY_MS")?.unwrap_or_else(default_retry_delay),
        };

        let rpc = RpcConfig {
            backoff_initial_ms: optional("RPC_BACKOFF_INITIAL_MS")?
                .unwrap_or_else(default_backoff_initial),
            backoff_max_ms: optional("RPC_BACKOFF_MAX_MS")?.unwrap_or_else(default_backoff_max),
            max_attempts: optional("RPC_MAX_ATTEMPTS")?.unwrap_or_else(default_max_attempts),
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| default_bind_address()),
            port: optional("API_PORT")?.unwrap_or_else(default_api_port),
        };

        let state = StateConfig {
            path: env::var("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_state_file()),
            max_records: optional("MAX_RECORDS")?.unwrap_or_else(default_max_records),
        };

        let config = Config {
            source,
            destination,
            relayer,
            rpc,
            api,
            state,
            log_format: optional("LOG_FORMAT")?.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Backoff policy shared by both endpoint pools
    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.rpc.backoff_policy(self.relayer.retry_delay_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (side, chain) in [("source", &self.source), ("destination", &self.destination)] {
            if chain.name.trim().is_empty() {
                return Err(eyre!("{}.name cannot be empty", side));
            }
            if chain.rpc_urls.is_empty() {
                return Err(eyre!("{}.rpc_urls needs at least one URL", side));
            }
            if chain.bridge_address.len() != 42 || Address::from_str(&chain.bridge_address).is_err()
            {
                return Err(eyre!(
                    "{}.bridge_address must be a valid hex address (42 chars with 0x prefix)",
                    side
                ));
            }
            if chain.confirmations == 0 {
                return Err(eyre!("{}.confirmations must be at least 1", side));
            }
            if chain.block_time_ms == 0 {
                return Err(eyre!("{}.block_time_ms must be at least 1", side));
            }
        }

        // Cursors and records are keyed by chain name
        if self.source.name == self.destination.name {
            return Err(eyre!(
                "source and destination chain names must differ (both are '{}')",
                self.source.name
            ));
        }

        if self.relayer.private_key.len() != 66 || !self.relayer.private_key.starts_with("0x") {
            return Err(eyre!(
                "relayer.private_key must be 66 chars (0x + 64 hex chars)"
            ));
        }

        if self.rpc.backoff_initial_ms > self.rpc.backoff_max_ms {
            return Err(eyre!(
                "rpc.backoff_initial_ms ({}) cannot exceed rpc.backoff_max_ms ({})",
                self.rpc.backoff_initial_ms,
                self.rpc.backoff_max_ms
            ));
        }

        if self.rpc.max_attempts == 0 {
            return Err(eyre!("rpc.max_attempts must be at least 1"));
        }

        if self.state.max_records == 0 {
            return Err(eyre!("state.max_records must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(name: &str) -> ChainConfig {
        ChainConfig {
            name: name.to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            bridge_address: "0x0000000000000000000000000000000000000001".to_string(),
            confirmations: 6,
            block_time_ms: 12_000,
            start_block: None,
        }
    }

    fn test_config() -> Config {
        Config {
            source: chain("sepolia"),
            destination: chain("bsc-testnet"),
            relayer: RelayerConfig {
                private_key: "0x0000000000000000000000000000000000000000000000000000000000000001"
                    .to_string(),
                poll_interval_ms: default_poll_interval(),
                retry_delay_ms: default_retry_delay(),
            },
            rpc: RpcConfig {
                backoff_initial_ms: default_backoff_initial(),
                backoff_max_ms: default_backoff_max(),
                max_attempts: default_max_attempts(),
            },
            api: ApiConfig {
                bind_address: default_bind_address(),
                port: default_api_port(),
            },
            state: StateConfig {
                path: default_state_file(),
                max_records: default_max_records(),
            },
            log_format: LogFormat::Pretty,
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_confirmations(), 6);
        assert_eq!(default_poll_interval(), 5000);
        assert_eq!(default_retry_delay(), 2000);
        assert_eq!(default_api_port(), 3000);
        assert_eq!(default_state_file(), PathBuf::from("relayer-state.json"));
    }

    #[test]
    fn test_valid_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_bridge_address_validation() {
        let mut config = test_config();
        config.destination.bridge_address = "0x1234".to_string();
        assert!(config.validate().is_err());

        config.destination.bridge_address = "0xzz00000000000000000000000000000000000001".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_chain_names_rejected() {
        let mut config = test_config();
        config.destination.name = config.source.name.clone();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_zero_confirmations_rejected() {
        let mut config = test_config();
        config.source.confirmations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_private_key_validation() {
        let mut config = test_config();
        config.relayer.private_key = "deadbeef".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_bounds() {
        let mut config = test_config();
        config.rpc.backoff_initial_ms = 120_000;
        assert!(config.validate().is_err());

        let config = test_config();
        let policy = config.backoff_policy();
        assert_eq!(policy.initial, Duration::from_secs(5));
        assert_eq!(policy.max, Duration::from_secs(60));
        assert_eq!(policy.retry_delay, Duration::from_secs(2));
        assert_eq!(policy.max_attempts, 4);
    }

    #[test]
    fn test_private_key_redacted_in_debug() {
        let config = test_config();
        let debug = format!("{:?}", config.relayer);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("0000000000000001"));
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("PRETTY".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_socket_addr() {
        let config = test_config();
        assert_eq!(config.api.socket_addr().unwrap().port(), 3000);
    }
}
