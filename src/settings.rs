use crate::types::SupportedChain;
use config::{Config, ConfigError, File, FileFormat};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use url::Url;

pub const CONFIG_PATH_ENV: &str = "DISTRIBUTOR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "Config.toml";

#[derive(Debug, Deserialize, Clone)]
pub struct ChainEndpoint {
    pub rpc_url: String,
    #[serde(default = "default_multicall")]
    pub multicall: Address,
}

fn default_multicall() -> Address {
    // Multicall3, same address on every chain
    Address::from_slice(&[
        0xca, 0x11, 0xbd, 0xe0, 0x59, 0x77, 0xb3, 0x63, 0x11, 0x67, 0x02, 0x88, 0x62, 0xbe, 0x2a, 0x17, 0x39, 0x76,
        0xca, 0x11,
    ])
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenSettings {
    /// Tracked ERC20 whose Transfer log is replayed.
    pub address: Address,
    pub liquidity_pool: Address,
    pub distributor: Address,
    /// Deployment block of the token; replay starts here.
    pub init_block: u64,
    #[serde(default = "default_home_chain")]
    pub home_chain: u64,
}

fn default_home_chain() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct Replay {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_multicall_batch_size")]
    pub multicall_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_batch_size() -> u64 {
    2_000
}
fn default_multicall_batch_size() -> usize {
    200
}
fn default_max_retries() -> usize {
    3
}

impl Default for Replay {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            multicall_batch_size: default_multicall_batch_size(),
            max_retries: default_max_retries(),
        }
    }
}

/// Where distribution, allocation and whitelist rounds read their holder set from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundSource {
    Subgraph,
    Checkpoints,
}

impl Default for RoundSource {
    fn default() -> Self {
        RoundSource::Subgraph
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Subgraph {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_page_size() -> usize {
    1_000
}
fn default_max_pages() -> usize {
    21
}

impl Default for Subgraph {
    fn default() -> Self {
        Self {
            url: None,
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Keyed by chain id ("1", "42161").
    #[serde(default)]
    pub chains: HashMap<String, ChainEndpoint>,
    pub token: TokenSettings,
    #[serde(default)]
    pub replay: Replay,
    #[serde(default)]
    pub round_source: RoundSource,
    #[serde(default)]
    pub subgraph: Subgraph,
    #[serde(default)]
    pub database: Database,
}

impl Settings {
    /// Loads `Config.toml` (or `$DISTRIBUTOR_CONFIG`), then environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = Self::from_file(&path)?;
        settings.apply_overrides(|key| env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::new(path, FileFormat::Toml))
            .build()?;
        s.try_deserialize()
    }

    /// Applies `RPC_URL`, `ARBITRUM_RPC_URL`, `SUBGRAPH_URL`, `BATCH_SIZE`
    /// and `DATABASE_URL` when set and non-empty.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        for (key, chain) in [("RPC_URL", SupportedChain::Mainnet), ("ARBITRUM_RPC_URL", SupportedChain::Arbitrum)] {
            if let Some(url) = get(key) {
                self.chains
                    .entry(chain.id().to_string())
                    .and_modify(|c| c.rpc_url = url.clone())
                    .or_insert_with(|| ChainEndpoint {
                        rpc_url: url,
                        multicall: default_multicall(),
                    });
            }
        }
        if let Some(url) = get("SUBGRAPH_URL") {
            self.subgraph.url = Some(url);
        }
        if let Some(raw) = get("BATCH_SIZE") {
            match raw.parse() {
                Ok(size) => self.replay.batch_size = size,
                Err(e) => log::warn!("Ignoring BATCH_SIZE={}: {}", raw, e),
            }
        }
        if let Some(url) = get("DATABASE_URL") {
            self.database.url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay.batch_size == 0 {
            return Err(ConfigError::Message("replay.batch_size must be greater than 0".into()));
        }
        if self.replay.multicall_batch_size == 0 {
            return Err(ConfigError::Message("replay.multicall_batch_size must be greater than 0".into()));
        }
        if self.token.init_block == 0 {
            return Err(ConfigError::Message("token.init_block must be greater than 0".into()));
        }
        SupportedChain::try_from(self.token.home_chain).map_err(|e| ConfigError::Message(e.to_string()))?;

        for (key, endpoint) in &self.chains {
            let id: u64 = key
                .parse()
                .map_err(|_| ConfigError::Message(format!("chains.{}: key must be a chain id", key)))?;
            SupportedChain::try_from(id).map_err(|e| ConfigError::Message(format!("chains.{}: {}", key, e)))?;
            check_url(&format!("chains.{}.rpc_url", key), &endpoint.rpc_url)?;
        }
        if let Some(url) = &self.subgraph.url {
            check_url("subgraph.url", url)?;
        }
        if self.subgraph.page_size == 0 || self.subgraph.max_pages == 0 {
            return Err(ConfigError::Message("subgraph.page_size and max_pages must be greater than 0".into()));
        }
        if let Some(url) = &self.database.url {
            check_url("database.url", url)?;
        }
        Ok(())
    }

    pub fn home_chain(&self) -> Result<SupportedChain, ConfigError> {
        SupportedChain::try_from(self.token.home_chain).map_err(|e| ConfigError::Message(e.to_string()))
    }

    pub fn endpoint(&self, chain: SupportedChain) -> Option<&ChainEndpoint> {
        self.chains.get(&chain.id().to_string())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::Message("DATABASE_URL must be defined".into()))
    }

    pub fn subgraph_url(&self) -> Result<&str, ConfigError> {
        self.subgraph
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::Message("SUBGRAPH_URL must be defined".into()))
    }
}

fn check_url(field: &str, raw: &str) -> Result<(), ConfigError> {
    Url::parse(raw)
        .map(|_| ())
        .map_err(|e| ConfigError::Message(format!("{}: invalid url {:?}: {}", field, raw, e)))
}
