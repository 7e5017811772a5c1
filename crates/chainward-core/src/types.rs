//! Shared types used across chainward crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a blockchain in the template catalog (e.g. `bitcoin`).
pub type BlockchainId = String;

/// Unique identifier of a managed node.
pub type NodeId = String;

/// Operating mode of a node, trading disk usage for retained history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    Full,
    Pruned,
    Light,
}

impl NodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Full => "full",
            NodeMode::Pruned => "pruned",
            NodeMode::Light => "light",
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a mode string is not one of `full`, `pruned`, `light`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown node mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for NodeMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(NodeMode::Full),
            "pruned" => Ok(NodeMode::Pruned),
            "light" => Ok(NodeMode::Light),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

/// RPC / P2P / optional WebSocket port triple.
///
/// Used both for a chain's declared defaults (container side) and for the
/// host ports allocated to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortSet {
    pub rpc: u16,
    pub p2p: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws: Option<u16>,
}

impl PortSet {
    pub fn new(rpc: u16, p2p: u16, ws: Option<u16>) -> Self {
        Self { rpc, p2p, ws }
    }

    /// All ports in the set, rpc first.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        [Some(self.rpc), Some(self.p2p), self.ws].into_iter().flatten()
    }

    /// Whether any port of `self` also appears in `other`.
    pub fn overlaps(&self, other: &PortSet) -> bool {
        self.ports().any(|p| other.ports().any(|q| p == q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Pruned".parse::<NodeMode>(), Ok(NodeMode::Pruned));
        assert_eq!(" full ".parse::<NodeMode>(), Ok(NodeMode::Full));
        assert!("archive".parse::<NodeMode>().is_err());
    }

    #[test]
    fn mode_serializes_lowercase() {
        let json = serde_json::to_string(&NodeMode::Light).unwrap();
        assert_eq!(json, "\"light\"");
    }

    #[test]
    fn port_set_iterates_optional_ws() {
        let a = PortSet::new(8332, 8333, None);
        assert_eq!(a.ports().collect::<Vec<_>>(), vec![8332, 8333]);

        let b = PortSet::new(8545, 30303, Some(8546));
        assert_eq!(b.ports().count(), 3);
    }

    #[test]
    fn port_set_overlap() {
        let a = PortSet::new(8545, 30303, Some(8546));
        let b = PortSet::new(8546, 30313, None);
        let c = PortSet::new(8555, 30313, Some(8556));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
