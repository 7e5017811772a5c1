//! chainward-runtime: talking to the container runtime.
//!
//! The rest of chainward only sees the [`ContainerRuntime`] trait:
//! run a container from an image with binds and published ports, tail
//! its logs, stop/kill/remove it, and a few read-only queries.
//!
//! # Architecture
//!
//! ```text
//! ConnectionResolver
//!   ├── operator override endpoint
//!   ├── platform default sockets
//!   └── TCP fallback (loopback / allow-listed private subnet only)
//!         │ first endpoint that answers a ping
//!         ▼
//! DockerRuntime ──impl──▶ ContainerRuntime ◀──impl── InMemoryRuntime
//! ```

pub mod docker;
pub mod error;
pub mod memory;
pub mod resolver;
pub mod runtime;

pub use docker::DockerRuntime;
pub use error::{ConnectAttempt, RuntimeError};
pub use memory::InMemoryRuntime;
pub use resolver::{ConnectionResolver, Endpoint, Subnet};
pub use runtime::*;
