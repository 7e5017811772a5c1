//! Port allocation.
//!
//! Each node needs an RPC, a P2P and optionally a WS port. Allocation
//! starts at the chain's default ports and shifts the whole set by a fixed
//! stride until every port is free, both among chainward's own nodes and
//! on the host.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use chainward_core::PortSet;
use chainward_core::config::NodesConfig;
use tracing::debug;

use crate::error::PlacementError;

/// Checks whether the host has a port available.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding the port on the loopback interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPortProbe;

impl PortProbe for OsPortProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

/// Treats every port as free on the host; only chainward's own
/// allocations count.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnprobedPorts;

impl PortProbe for UnprobedPorts {
    fn is_free(&self, _port: u16) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct PortAllocator {
    stride: u16,
    max_attempts: u32,
    probe: Arc<dyn PortProbe>,
}

impl PortAllocator {
    pub fn new(stride: u16, max_attempts: u32, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            stride: stride.max(1),
            max_attempts: max_attempts.max(1),
            probe,
        }
    }

    pub fn from_config(config: &NodesConfig, probe: Arc<dyn PortProbe>) -> Self {
        Self::new(config.port_stride, config.port_max_attempts, probe)
    }

    /// Find a free port set for `blockchain`, starting from `defaults`.
    ///
    /// `in_use` holds ports claimed by existing node records. The caller is
    /// expected to serialize allocations so two nodes never race for the
    /// same candidate.
    pub fn allocate(
        &self,
        blockchain: &str,
        defaults: &PortSet,
        in_use: &HashSet<u16>,
    ) -> Result<PortSet, PlacementError> {
        for attempt in 0..self.max_attempts {
            let offset = attempt * u32::from(self.stride);
            let Some(candidate) = shift(defaults, offset) else {
                // Past 65535; further attempts can only be larger.
                return Err(PlacementError::PortExhausted {
                    blockchain: blockchain.to_string(),
                    attempts: attempt,
                });
            };
            let free = candidate
                .ports()
                .all(|p| !in_use.contains(&p) && self.probe.is_free(p));
            if free {
                debug!(blockchain, attempt, rpc = candidate.rpc, p2p = candidate.p2p, "ports allocated");
                return Ok(candidate);
            }
        }
        Err(PlacementError::PortExhausted {
            blockchain: blockchain.to_string(),
            attempts: self.max_attempts,
        })
    }
}

fn shift(ports: &PortSet, offset: u32) -> Option<PortSet> {
    let add = |p: u16| u16::try_from(u32::from(p) + offset).ok();
    Some(PortSet {
        rpc: add(ports.rpc)?,
        p2p: add(ports.p2p)?,
        ws: match ports.ws {
            Some(ws) => Some(add(ws)?),
            None => None,
        },
    })
}
