use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres store; the in-memory store is used when absent
    pub database: Option<DatabaseConfig>,
    pub chain: ChainConfig,
    pub home: HomeConfig,
    pub engine: EngineConfig,
    pub api: ApiConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// External chain configuration
#[derive(Clone)]
pub struct ChainConfig {
    pub name: String,
    pub rpc_url: String,
    /// Tried in order by the read client when `rpc_url` is unreachable
    pub rpc_fallback_urls: Vec<String>,
    pub chain_id: u64,
    pub bridge_address: String,
    pub private_key: String,
    /// Home-chain asset id of the external native asset
    pub native_asset_id: u32,
    pub native_decimals: u8,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("name", &self.name)
            .field("rpc_url", &self.rpc_url)
            .field("rpc_fallback_urls", &self.rpc_fallback_urls)
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &"<redacted>")
            .field("native_asset_id", &self.native_asset_id)
            .field("native_decimals", &self.native_decimals)
            .finish()
    }
}

impl ChainConfig {
    /// Primary endpoint followed by the fallbacks
    pub fn rpc_urls(&self) -> Vec<String> {
        std::iter::once(self.rpc_url.clone())
            .chain(self.rpc_fallback_urls.iter().cloned())
            .collect()
    }
}

/// Home chain configuration
#[derive(Debug, Clone)]
pub struct HomeConfig {
    pub rpc_url: String,
}

/// HTTP surface configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub confirmations: u64,
    pub start_height: Option<u64>,
    pub skip_backlog_on_start: bool,
    pub resend_max: u32,
    pub wait_interval: Duration,
    pub pending_timeout: Duration,
    pub receipt_timeout: Duration,
    pub height_lookup_retries: u32,
    /// Rollback-safety window in home-chain blocks
    pub rollback_window: u64,
    pub max_committee_size: usize,
    /// External blocks a sent broadcast must age before the ladder may restart
    pub validate_blocks: u64,
    pub gas_bump_percent: u64,
    pub max_gas_multiplier: f64,
    pub ingest_interval: Duration,
    pub confirm_interval: Duration,
    pub waiting_interval: Duration,
}

/// Default functions
fn default_confirmations() -> u64 {
    30
}

fn default_resend_max() -> u32 {
    5
}

fn default_wait_interval_secs() -> u64 {
    180
}

fn default_pending_timeout_secs() -> u64 {
    180
}

fn default_receipt_timeout_secs() -> u64 {
    1800
}

fn default_rollback_window() -> u64 {
    30
}

fn default_max_committee_size() -> usize {
    15
}

fn default_api_bind() -> &'static str {
    "0.0.0.0:9090"
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirmations: default_confirmations(),
            start_height: None,
            skip_backlog_on_start: true,
            resend_max: default_resend_max(),
            wait_interval: Duration::from_secs(default_wait_interval_secs()),
            pending_timeout: Duration::from_secs(default_pending_timeout_secs()),
            receipt_timeout: Duration::from_secs(default_receipt_timeout_secs()),
            height_lookup_retries: 3,
            rollback_window: default_rollback_window(),
            max_committee_size: default_max_committee_size(),
            validate_blocks: default_confirmations(),
            gas_bump_percent: 20,
            max_gas_multiplier: 3.0,
            ingest_interval: Duration::from_millis(5000),
            confirm_interval: Duration::from_millis(10_000),
            waiting_interval: Duration::from_millis(10_000),
        }
    }
}

impl EngineConfig {
    pub fn wait_interval_ms(&self) -> u64 {
        self.wait_interval.as_millis() as u64
    }
}

/// Split a comma-separated RPC list, dropping blanks
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| eyre!("{} environment variable is required", key))
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

    fn load_from_env() -> Result<Self> {
        let database = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| DatabaseConfig { url });

        let rpc_urls = parse_rpc_urls(&required("EVM_RPC_URL")?);
        if rpc_urls.is_empty() {
            return Err(eyre!("EVM_RPC_URL cannot be empty"));
        }

        let chain = ChainConfig {
            name: env::var("CHAIN_NAME").unwrap_or_else(|_| "ETH".to_string()),
            rpc_url: rpc_urls[0].clone(),
            rpc_fallback_urls: rpc_urls[1..].to_vec(),
            chain_id: required("EVM_CHAIN_ID")?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            bridge_address: required("BRIDGE_ADDRESS")?,
            private_key: required("EVM_PRIVATE_KEY")?,
            native_asset_id: env_or("NATIVE_ASSET_ID", 1),
            native_decimals: env_or("NATIVE_DECIMALS", 18),
        };

        let home = HomeConfig {
            rpc_url: required("HOME_RPC_URL")?,
        };

        let confirmations = env_or("CONFIRMATIONS", default_confirmations());
        let engine = EngineConfig {
            confirmations,
            start_height: env::var("START_HEIGHT").ok().and_then(|v| v.parse().ok()),
            skip_backlog_on_start: env_or("SKIP_BACKLOG_ON_START", true),
            resend_max: env_or("RESEND_MAX", default_resend_max()),
            wait_interval: Duration::from_secs(env_or(
                "WAIT_INTERVAL_SECS",
                default_wait_interval_secs(),
            )),
            pending_timeout: Duration::from_secs(env_or(
                "PENDING_TIMEOUT_SECS",
                default_pending_timeout_secs(),
            )),
            receipt_timeout: Duration::from_secs(env_or(
                "RECEIPT_TIMEOUT_SECS",
                default_receipt_timeout_secs(),
            )),
            height_lookup_retries: env_or("HEIGHT_LOOKUP_RETRIES", 3),
            rollback_window: env_or("ROLLBACK_WINDOW", default_rollback_window()),
            max_committee_size: env_or("MAX_COMMITTEE_SIZE", default_max_committee_size()),
            validate_blocks: env_or("VALIDATE_BLOCKS", confirmations),
            gas_bump_percent: env_or("GAS_BUMP_PERCENT", 20),
            max_gas_multiplier: env_or("MAX_GAS_MULTIPLIER", 3.0),
            ingest_interval: Duration::from_millis(env_or("INGEST_INTERVAL_MS", 5000)),
            confirm_interval: Duration::from_millis(env_or("CONFIRM_INTERVAL_MS", 10_000)),
            waiting_interval: Duration::from_millis(env_or("WAITING_INTERVAL_MS", 10_000)),
        };

        let bind = env::var("API_BIND").unwrap_or_else(|_| default_api_bind().to_string());
        let api = ApiConfig {
            bind: bind
                .parse()
                .wrap_err_with(|| format!("API_BIND is not a socket address: {}", bind))?,
        };

        let config = Config {
            database,
            chain,
            home,
            engine,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(db) = &self.database {
            if db.url.is_empty() {
                return Err(eyre!("database.url cannot be empty"));
            }
        }

        if self.chain.rpc_url.is_empty() {
            return Err(eyre!("chain.rpc_url cannot be empty"));
        }

        if self.chain.bridge_address.len() != 42 || !self.chain.bridge_address.starts_with("0x") {
            return Err(eyre!(
                "chain.bridge_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if self.chain.private_key.len() != 66 || !self.chain.private_key.starts_with("0x") {
            return Err(eyre!("chain.private_key must be 66 chars (0x + 64 hex chars)"));
        }

        if self.home.rpc_url.is_empty() {
            return Err(eyre!("home.rpc_url cannot be empty"));
        }

        if self.engine.confirmations == 0 {
            return Err(eyre!("engine.confirmations must be at least 1"));
        }

        if self.engine.resend_max == 0 {
            return Err(eyre!("engine.resend_max must be at least 1"));
        }

        if self.engine.max_committee_size == 0 {
            return Err(eyre!("engine.max_committee_size must be at least 1"));
        }

        if self.engine.max_gas_multiplier < 1.0 {
            return Err(eyre!("engine.max_gas_multiplier cannot be below 1.0"));
        }

        if self.engine.height_lookup_retries == 0 {
            return Err(eyre!("engine.height_lookup_retries must be at least 1"));
        }

        Ok(())
    }
}
