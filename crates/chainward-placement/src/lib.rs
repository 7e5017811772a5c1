//! chainward-placement: deciding whether and where a node fits on this host.
//!
//! # Components
//!
//! - **`ports`**: non-colliding RPC/P2P/WS port triples per node
//! - **`gate`**: pre-flight disk/RAM/mode checks against the template catalog
//! - **`host`**: host resource sampling (sysinfo) behind a probe trait

pub mod error;
pub mod gate;
pub mod host;
pub mod ports;

pub use error::PlacementError;
pub use gate::{GateFailure, GateVerdict, ResourceGate};
pub use host::{FixedHost, HostProbe, HostResources, SysinfoProbe};
pub use ports::{OsPortProbe, PortAllocator, PortProbe, UnprobedPorts};
