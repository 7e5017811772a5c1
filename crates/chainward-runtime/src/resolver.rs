//! Runtime endpoint resolution.
//!
//! Produces the ordered list of places the container runtime may be
//! listening and enforces the TCP policy: a TCP endpoint must be loopback
//! or fall inside an operator allow-listed private subnet.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chainward_core::config::RuntimeConfig;
use tracing::{debug, info};

use crate::error::{ConnectAttempt, RuntimeError};

/// Where a container runtime API may be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    NamedPipe(String),
    Tcp(SocketAddr),
}

impl Endpoint {
    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp(_))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::NamedPipe(name) => write!(f, "npipe://{name}"),
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(RuntimeError::InvalidEndpoint(format!(
                    "unix socket path must be absolute: {s}"
                )));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(name) = s.strip_prefix("npipe://") {
            if name.is_empty() {
                return Err(RuntimeError::InvalidEndpoint(format!("empty pipe name: {s}")));
            }
            return Ok(Endpoint::NamedPipe(name.to_string()));
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            return parse_tcp(rest.trim_end_matches('/')).map(Endpoint::Tcp);
        }
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        Err(RuntimeError::InvalidEndpoint(format!(
            "expected unix://, npipe://, tcp:// or an absolute socket path: {s}"
        )))
    }
}

fn parse_tcp(hostport: &str) -> Result<SocketAddr, RuntimeError> {
    if let Ok(addr) = hostport.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // Only "localhost" is resolved; other hostnames could point anywhere.
    if let Some(port) = hostport.strip_prefix("localhost:") {
        let port: u16 = port
            .parse()
            .map_err(|_| RuntimeError::InvalidEndpoint(format!("bad port in tcp://{hostport}")))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    Err(RuntimeError::InvalidEndpoint(format!(
        "tcp endpoint must be an IP address and port: tcp://{hostport}"
    )))
}

/// An IPv4 or IPv6 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn parse(s: &str) -> Result<Self, RuntimeError> {
        let invalid = || RuntimeError::InvalidEndpoint(format!("invalid CIDR block: {s}"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self {
            network: mask(addr, prefix),
            prefix,
        })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        if ip.is_ipv4() != self.network.is_ipv4() {
            return false;
        }
        mask(ip, self.prefix) == self.network
    }

    /// Whether every address in the block is private (RFC 1918 or ULA).
    pub fn is_private(&self) -> bool {
        is_private_ip(self.network) && is_private_ip(self.last())
    }

    fn last(&self) -> IpAddr {
        match self.network {
            IpAddr::V4(v4) => {
                let host_bits = 32 - u32::from(self.prefix);
                let host_mask = if host_bits == 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
                IpAddr::V4((u32::from(v4) | host_mask).into())
            }
            IpAddr::V6(v6) => {
                let host_bits = 128 - u32::from(self.prefix);
                let host_mask = if host_bits == 128 { u128::MAX } else { (1u128 << host_bits) - 1 };
                IpAddr::V6((u128::from(v6) | host_mask).into())
            }
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask(ip: IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
            IpAddr::V4((bits & m).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) };
            IpAddr::V6((bits & m).into())
        }
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Ordered candidate endpoints for the container runtime.
#[derive(Debug, Clone)]
pub struct ConnectionResolver {
    candidates: Vec<Endpoint>,
    allowed: Vec<Subnet>,
}

impl ConnectionResolver {
    /// Build from `[runtime]` config using this platform's default sockets.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::new(
            config.endpoint.as_deref(),
            platform_default_endpoints(),
            config.tcp_fallback.as_deref(),
            &config.allowed_subnets,
        )
    }

    /// Build from explicit parts. Order is override, defaults, TCP
    /// fallback; duplicates keep their first position.
    pub fn new(
        override_endpoint: Option<&str>,
        defaults: Vec<Endpoint>,
        tcp_fallback: Option<&str>,
        allowed_subnets: &[String],
    ) -> Result<Self, RuntimeError> {
        let mut allowed = Vec::with_capacity(allowed_subnets.len());
        for entry in allowed_subnets {
            let subnet = Subnet::parse(entry)?;
            if !subnet.is_private() {
                return Err(RuntimeError::Policy(format!(
                    "allow-listed subnet {subnet} is not a private range"
                )));
            }
            allowed.push(subnet);
        }

        let mut resolver = Self {
            candidates: Vec::new(),
            allowed,
        };

        if let Some(raw) = override_endpoint {
            let endpoint: Endpoint = raw.parse()?;
            resolver.check_policy(&endpoint)?;
            resolver.push(endpoint);
        }
        for endpoint in defaults {
            resolver.push(endpoint);
        }
        if let Some(raw) = tcp_fallback {
            let endpoint: Endpoint = raw.parse()?;
            if !endpoint.is_tcp() {
                return Err(RuntimeError::InvalidEndpoint(format!(
                    "tcp fallback must be a tcp:// endpoint: {raw}"
                )));
            }
            resolver.check_policy(&endpoint)?;
            resolver.push(endpoint);
        }

        debug!(
            candidates = ?resolver.candidates.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            "runtime endpoints resolved"
        );
        Ok(resolver)
    }

    pub fn candidates(&self) -> &[Endpoint] {
        &self.candidates
    }

    /// Whether a TCP address is acceptable: loopback or allow-listed.
    pub fn tcp_allowed(&self, addr: &SocketAddr) -> bool {
        let ip = addr.ip();
        ip.is_loopback() || self.allowed.iter().any(|s| s.contains(ip))
    }

    fn check_policy(&self, endpoint: &Endpoint) -> Result<(), RuntimeError> {
        match endpoint {
            Endpoint::Tcp(addr) if !self.tcp_allowed(addr) => Err(RuntimeError::Policy(format!(
                "tcp://{addr} is neither loopback nor inside an allow-listed private subnet"
            ))),
            _ => Ok(()),
        }
    }

    fn push(&mut self, endpoint: Endpoint) {
        if !self.candidates.contains(&endpoint) {
            self.candidates.push(endpoint);
        }
    }

    /// Try each candidate in order with `connector`; the first success wins.
    pub async fn connect<T, F, Fut>(&self, mut connector: F) -> Result<(Endpoint, T), RuntimeError>
    where
        F: FnMut(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let mut attempts = Vec::new();
        for endpoint in &self.candidates {
            match connector(endpoint.clone()).await {
                Ok(client) => {
                    info!(endpoint = %endpoint, "connected to container runtime");
                    return Ok((endpoint.clone(), client));
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "runtime endpoint failed");
                    attempts.push(ConnectAttempt {
                        endpoint: endpoint.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Err(RuntimeError::ConnectionExhausted { attempts })
    }
}

/// Default runtime sockets for the current platform, most conventional first.
pub fn platform_default_endpoints() -> Vec<Endpoint> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let xdg = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
    defaults_for(std::env::consts::OS, home.as_deref(), xdg.as_deref())
}

fn defaults_for(os: &str, home: Option<&Path>, xdg_runtime: Option<&Path>) -> Vec<Endpoint> {
    let mut out = Vec::new();
    match os {
        "windows" => out.push(Endpoint::NamedPipe("//./pipe/docker_engine".to_string())),
        "macos" => {
            if let Some(home) = home {
                out.push(Endpoint::Unix(home.join(".docker/run/docker.sock")));
                out.push(Endpoint::Unix(home.join(".colima/default/docker.sock")));
            }
            out.push(Endpoint::Unix(PathBuf::from("/var/run/docker.sock")));
        }
        _ => {
            out.push(Endpoint::Unix(PathBuf::from("/var/run/docker.sock")));
            if let Some(xdg) = xdg_runtime {
                out.push(Endpoint::Unix(xdg.join("docker.sock")));
                out.push(Endpoint::Unix(xdg.join("podman/podman.sock")));
            }
            if let Some(home) = home {
                out.push(Endpoint::Unix(home.join(".docker/run/docker.sock")));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix(p: &str) -> Endpoint {
        Endpoint::Unix(PathBuf::from(p))
    }

    #[test]
    fn parses_endpoint_forms() {
        assert_eq!("unix:///var/run/docker.sock".parse::<Endpoint>().unwrap(), unix("/var/run/docker.sock"));
        assert_eq!("/run/podman.sock".parse::<Endpoint>().unwrap(), unix("/run/podman.sock"));
        assert_eq!(
            "npipe:////./pipe/docker_engine".parse::<Endpoint>().unwrap(),
            Endpoint::NamedPipe("//./pipe/docker_engine".into())
        );
        assert_eq!(
            "tcp://localhost:2375".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:2375".parse().unwrap())
        );
        assert_eq!(
            "tcp://[::1]:2375".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("[::1]:2375".parse().unwrap())
        );
        assert!("tcp://docker.internal:2375".parse::<Endpoint>().is_err());
        assert!("docker.sock".parse::<Endpoint>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for raw in ["unix:///var/run/docker.sock", "tcp://10.0.0.5:2376", "npipe:////./pipe/x"] {
            let endpoint: Endpoint = raw.parse().unwrap();
            assert_eq!(endpoint.to_string(), raw);
        }
    }

    #[test]
    fn subnet_membership() {
        let net = Subnet::parse("192.168.64.0/24").unwrap();
        assert!(net.contains("192.168.64.7".parse().unwrap()));
        assert!(!net.contains("192.168.65.7".parse().unwrap()));
        assert!(!net.contains("::1".parse().unwrap()));
        assert_eq!(Subnet::parse("10.1.2.3/8").unwrap().to_string(), "10.0.0.0/8");
        assert!(Subnet::parse("10.0.0.0/33").is_err());
        assert!(Subnet::parse("10.0.0.0").is_err());
    }

    #[test]
    fn subnet_privacy_checks_both_ends() {
        assert!(Subnet::parse("10.0.0.0/8").unwrap().is_private());
        assert!(Subnet::parse("172.16.0.0/12").unwrap().is_private());
        assert!(Subnet::parse("fd00:1::/64").unwrap().is_private());
        // 172.16.0.0/11 spills into public 172.32.0.0/12.
        assert!(!Subnet::parse("172.16.0.0/11").unwrap().is_private());
        assert!(!Subnet::parse("0.0.0.0/0").unwrap().is_private());
        assert!(!Subnet::parse("8.8.8.0/24").unwrap().is_private());
    }

    #[test]
    fn public_allow_list_entry_refuses_to_build() {
        let err = ConnectionResolver::new(None, vec![], None, &["1.2.3.0/24".into()]).unwrap_err();
        assert!(matches!(err, RuntimeError::Policy(_)));
    }

    #[test]
    fn public_tcp_override_is_rejected() {
        let err = ConnectionResolver::new(Some("tcp://203.0.113.10:2375"), vec![], None, &[])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Policy(_)));
    }

    #[test]
    fn private_tcp_requires_allow_list() {
        let err = ConnectionResolver::new(None, vec![], Some("tcp://192.168.64.2:2375"), &[])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Policy(_)));

        let resolver = ConnectionResolver::new(
            None,
            vec![],
            Some("tcp://192.168.64.2:2375"),
            &["192.168.64.0/24".into()],
        )
        .unwrap();
        assert_eq!(resolver.candidates().len(), 1);
    }

    #[test]
    fn orders_and_deduplicates_candidates() {
        let resolver = ConnectionResolver::new(
            Some("unix:///var/run/docker.sock"),
            vec![unix("/var/run/docker.sock"), unix("/run/user/1000/docker.sock")],
            Some("tcp://127.0.0.1:2375"),
            &[],
        )
        .unwrap();
        let got: Vec<String> = resolver.candidates().iter().map(|e| e.to_string()).collect();
        assert_eq!(
            got,
            vec![
                "unix:///var/run/docker.sock",
                "unix:///run/user/1000/docker.sock",
                "tcp://127.0.0.1:2375",
            ]
        );
    }

    #[test]
    fn linux_defaults_use_xdg_and_home() {
        let got = defaults_for("linux", Some(Path::new("/home/op")), Some(Path::new("/run/user/1000")));
        assert_eq!(
            got,
            vec![
                unix("/var/run/docker.sock"),
                unix("/run/user/1000/docker.sock"),
                unix("/run/user/1000/podman/podman.sock"),
                unix("/home/op/.docker/run/docker.sock"),
            ]
        );
        assert_eq!(
            defaults_for("windows", None, None),
            vec![Endpoint::NamedPipe("//./pipe/docker_engine".into())]
        );
    }

    #[tokio::test]
    async fn connect_returns_first_success() {
        let resolver = ConnectionResolver::new(
            None,
            vec![unix("/missing.sock"), unix("/present.sock")],
            None,
            &[],
        )
        .unwrap();
        let (endpoint, value) = resolver
            .connect(|ep| async move {
                match ep {
                    Endpoint::Unix(p) if p == Path::new("/present.sock") => Ok(7u32),
                    other => Err(RuntimeError::Unreachable(format!("{other} not found"))),
                }
            })
            .await
            .unwrap();
        assert_eq!(endpoint, unix("/present.sock"));
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn connect_exhaustion_reports_every_attempt() {
        let resolver =
            ConnectionResolver::new(None, vec![unix("/a.sock"), unix("/b.sock")], None, &[]).unwrap();
        let err = resolver
            .connect(|_| async { Err::<(), _>(RuntimeError::Unreachable("refused".into())) })
            .await
            .unwrap_err();
        match err {
            RuntimeError::ConnectionExhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].endpoint, "unix:///a.sock");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
