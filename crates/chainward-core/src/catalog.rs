//! Template catalog: per-blockchain, per-mode container templates.
//!
//! The catalog data itself is operator supplied. `StaticCatalog` loads it
//! from a TOML file shaped like:
//!
//! ```toml
//! [[chains]]
//! id = "bitcoin"
//! name = "Bitcoin Core"
//! modes = ["full", "pruned"]
//! ports = { rpc = 8332, p2p = 8333 }
//! health_check = { kind = "utxo" }
//!
//! [[chains.templates]]
//! mode = "pruned"
//! image = "bitcoin/bitcoin:27.0"
//! command = ["-prune=550", "-server=1"]
//! volumes = ["{{DATA_DIR}}:/home/bitcoin/.bitcoin"]
//! requirements = { disk_gb = 10, memory_gb = 2 }
//! prune = { kind = "bitcoin-rpc", keep_blocks = 288 }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{NodeMode, PortSet};

/// The only host path a template volume may reference. It is replaced by
/// the node's data directory when a container is created.
pub const DATA_DIR_PLACEHOLDER: &str = "{{DATA_DIR}}";

/// A blockchain known to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainSpec {
    pub id: String,
    pub name: String,
    /// Modes the runtime declares support for.
    pub modes: Vec<NodeMode>,
    /// Default ports; also the ports the node listens on inside its container.
    pub ports: PortSet,
    /// How the node's RPC interface is probed for sync status.
    pub health_check: HealthCheck,
    #[serde(default)]
    pub templates: Vec<Template>,
}

/// Container template for one blockchain + mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub mode: NodeMode,
    /// Image reference, e.g. `bitcoin/bitcoin:27.0`.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Bind specs `host:container[:ro]`; host must use `{{DATA_DIR}}`.
    #[serde(default)]
    pub volumes: Vec<String>,
    pub requirements: Requirements,
    /// Overrides the chain-level health check for this mode.
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    /// In-place pruning routine, if the chain supports one.
    #[serde(default)]
    pub prune: Option<PruneRoutine>,
}

impl Template {
    /// A template is runnable only if it names an image.
    pub fn is_runnable(&self) -> bool {
        !self.image.trim().is_empty()
    }
}

/// Minimum host resources for a template.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Requirements {
    pub disk_gb: f64,
    pub memory_gb: f64,
}

/// RPC probe family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// `getblockchaininfo` style JSON-RPC (Bitcoin and forks).
    Utxo,
    /// Ethereum JSON-RPC (`web3_clientVersion`, `eth_syncing`).
    Evm,
    /// Solana JSON-RPC (`getHealth`, `getSlot`).
    Solana,
    /// Tendermint / CometBFT `GET /status`.
    Tendermint,
    /// Plain HTTP GET on a chain-specific path; liveness only.
    Rest,
}

/// Health-check descriptor for a node's RPC interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub kind: ProbeKind,
    /// HTTP path for the request (defaults to `/` or `/status`).
    #[serde(default)]
    pub path: Option<String>,
    /// Raw `Authorization` header value sent with every probe.
    #[serde(default)]
    pub authorization: Option<String>,
}

/// Chain-specific pruning routine executed inside a running container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PruneRoutine {
    /// `bitcoin-cli pruneblockchain <tip - keep_blocks>`.
    BitcoinRpc {
        #[serde(default = "default_bitcoin_cli")]
        cli: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_keep_blocks")]
        keep_blocks: u64,
    },
    /// A literal command line.
    Command { argv: Vec<String> },
}

fn default_bitcoin_cli() -> String {
    "bitcoin-cli".to_string()
}

fn default_keep_blocks() -> u64 {
    288
}

/// Read-only lookup of chains and templates.
pub trait TemplateCatalog: Send + Sync {
    /// Look up a chain by id.
    fn chain(&self, blockchain: &str) -> Option<&ChainSpec>;

    /// All chains, in no particular order.
    fn chains(&self) -> Vec<&ChainSpec>;

    /// The template for a chain and mode, if one is defined.
    fn template(&self, blockchain: &str, mode: NodeMode) -> Option<&Template> {
        self.chain(blockchain)?
            .templates
            .iter()
            .find(|t| t.mode == mode)
    }

    /// The effective health check for a chain and mode.
    fn health_check(&self, blockchain: &str, mode: NodeMode) -> Option<HealthCheck> {
        let chain = self.chain(blockchain)?;
        let from_template = self
            .template(blockchain, mode)
            .and_then(|t| t.health_check.clone());
        Some(from_template.unwrap_or_else(|| chain.health_check.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    chains: Vec<ChainSpec>,
}

/// In-memory catalog, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    chains: HashMap<String, ChainSpec>,
}

impl StaticCatalog {
    pub fn new(chains: Vec<ChainSpec>) -> Self {
        Self {
            chains: chains.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = toml::from_str(content)?;
        Ok(Self::new(file.chains))
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

impl TemplateCatalog for StaticCatalog {
    fn chain(&self, blockchain: &str) -> Option<&ChainSpec> {
        self.chains.get(blockchain)
    }

    fn chains(&self) -> Vec<&ChainSpec> {
        self.chains.values().collect()
    }
}
