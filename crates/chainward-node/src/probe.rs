//! RPC sync probes.
//!
//! The probe is the authoritative sync signal. Each chain family has its
//! own query; all of them reduce to a [`ProbeReport`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chainward_core::ProbeKind;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

/// Where and how to probe one node.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTarget {
    pub kind: ProbeKind,
    pub addr: SocketAddr,
    pub path: Option<String>,
    pub authorization: Option<String>,
}

impl ProbeTarget {
    fn path(&self) -> &str {
        match (&self.path, self.kind) {
            (Some(p), _) => p,
            (None, ProbeKind::Tendermint) => "/status",
            (None, _) => "/",
        }
    }
}

/// What a successful probe learned. `synced` is an explicit verdict from
/// the node itself; when `None`, height against `peer_best` decides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub height: Option<u64>,
    pub peer_best: Option<u64>,
    pub peers: Option<u32>,
    /// 0.0–100.0
    pub progress: Option<f64>,
    pub synced: Option<bool>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("rpc error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("malformed response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SyncProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> Result<ProbeReport, ProbeError>;
}

/// Probes nodes over their HTTP JSON-RPC / REST interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcProbe;

#[async_trait]
impl SyncProbe for RpcProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<ProbeReport, ProbeError> {
        match target.kind {
            ProbeKind::Utxo => probe_utxo(target).await,
            ProbeKind::Evm => probe_evm(target).await,
            ProbeKind::Solana => probe_solana(target).await,
            ProbeKind::Tendermint => probe_tendermint(target).await,
            ProbeKind::Rest => {
                let (status, _) = request(target, Method::GET, None).await?;
                if status.is_success() {
                    Ok(ProbeReport::default())
                } else {
                    Err(ProbeError::Status(status.as_u16()))
                }
            }
        }
    }
}

async fn probe_utxo(target: &ProbeTarget) -> Result<ProbeReport, ProbeError> {
    let info = rpc_call(target, "getblockchaininfo").await?;
    let blocks = info.get("blocks").and_then(as_u64);
    let headers = info.get("headers").and_then(as_u64);
    let ibd = info
        .get("initialblockdownload")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let progress = info
        .get("verificationprogress")
        .and_then(Value::as_f64)
        .map(|p| (p * 100.0).clamp(0.0, 100.0));
    let peers = rpc_call(target, "getconnectioncount")
        .await
        .ok()
        .and_then(|v| as_u64(&v))
        .map(saturate_u32);

    Ok(ProbeReport {
        height: blocks,
        peer_best: headers,
        peers,
        progress,
        // Still in initial block download is an explicit "not yet".
        synced: ibd.then_some(false),
    })
}

async fn probe_evm(target: &ProbeTarget) -> Result<ProbeReport, ProbeError> {
    // A client version answer means the RPC server is up at all.
    rpc_call(target, "web3_clientVersion").await?;
    let syncing = rpc_call(target, "eth_syncing").await?;
    let head = rpc_call(target, "eth_blockNumber")
        .await
        .ok()
        .and_then(|v| as_u64(&v));
    let peers = rpc_call(target, "net_peerCount")
        .await
        .ok()
        .and_then(|v| as_u64(&v))
        .map(saturate_u32);

    if syncing.is_object() {
        let current = syncing.get("currentBlock").and_then(as_u64).or(head);
        let highest = syncing.get("highestBlock").and_then(as_u64);
        let progress = match (current, highest) {
            (Some(c), Some(h)) if h > 0 => Some((c as f64 / h as f64 * 100.0).min(100.0)),
            _ => None,
        };
        return Ok(ProbeReport {
            height: current,
            peer_best: highest,
            peers,
            progress,
            synced: None,
        });
    }

    // Not syncing only means "caught up" once the node has peers to compare with.
    let has_peers = peers.is_some_and(|p| p > 0);
    Ok(ProbeReport {
        height: head,
        peer_best: if has_peers { head } else { None },
        peers,
        progress: has_peers.then_some(100.0),
        synced: has_peers.then_some(true),
    })
}

async fn probe_solana(target: &ProbeTarget) -> Result<ProbeReport, ProbeError> {
    let slot = as_u64(&rpc_call(target, "getSlot").await?);
    match rpc_call(target, "getHealth").await {
        Ok(_) => Ok(ProbeReport {
            height: slot,
            peer_best: slot,
            peers: None,
            progress: Some(100.0),
            synced: Some(true),
        }),
        Err(ProbeError::Rpc { data, .. }) => {
            let behind = data
                .as_ref()
                .and_then(|d| d.get("numSlotsBehind"))
                .and_then(as_u64);
            Ok(ProbeReport {
                height: slot,
                peer_best: slot.zip(behind).map(|(s, b)| s + b),
                peers: None,
                progress: None,
                synced: Some(false),
            })
        }
        Err(e) => Err(e),
    }
}

async fn probe_tendermint(target: &ProbeTarget) -> Result<ProbeReport, ProbeError> {
    let (status, body) = request(target, Method::GET, None).await?;
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }
    let doc: Value = serde_json::from_slice(&body).map_err(|e| ProbeError::Decode(e.to_string()))?;
    let root = doc.get("result").unwrap_or(&doc);
    let sync = root
        .get("sync_info")
        .ok_or_else(|| ProbeError::Decode("missing sync_info".into()))?;
    let height = sync.get("latest_block_height").and_then(as_u64);
    let catching_up = sync
        .get("catching_up")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    Ok(ProbeReport {
        height,
        peer_best: None,
        peers: None,
        progress: (!catching_up).then_some(100.0),
        synced: Some(!catching_up),
    })
}

/// One JSON-RPC call with no params; returns `result`.
async fn rpc_call(target: &ProbeTarget, method: &str) -> Result<Value, ProbeError> {
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": []});
    let bytes = serde_json::to_vec(&body).map_err(|e| ProbeError::Decode(e.to_string()))?;
    let (status, body) = request(target, Method::POST, Some(bytes)).await?;

    // bitcoind answers RPC errors with HTTP 500 and a JSON body.
    let doc: Value = match serde_json::from_slice(&body) {
        Ok(doc) => doc,
        Err(_) if !status.is_success() => return Err(ProbeError::Status(status.as_u16())),
        Err(e) => return Err(ProbeError::Decode(e.to_string())),
    };
    match doc.get("error") {
        Some(err) if !err.is_null() => Err(ProbeError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            data: err.get("data").cloned(),
        }),
        _ => doc
            .get("result")
            .cloned()
            .ok_or_else(|| ProbeError::Decode(format!("{method}: no result"))),
    }
}

async fn request(
    target: &ProbeTarget,
    method: Method,
    body: Option<Vec<u8>>,
) -> Result<(StatusCode, Bytes), ProbeError> {
    let stream = tokio::net::TcpStream::connect(target.addr)
        .await
        .map_err(|e| ProbeError::Connect(e.to_string()))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "probe connection closed with error");
        }
    });

    let mut builder = Request::builder()
        .method(method)
        .uri(target.path())
        .header(HOST, target.addr.to_string())
        .header(USER_AGENT, "chainward-probe/0.1");
    if let Some(auth) = &target.authorization {
        builder = builder.header(AUTHORIZATION, auth.as_str());
    }
    let req = match body {
        Some(bytes) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(bytes))),
        None => builder.body(Full::new(Bytes::new())),
    }
    .map_err(|e| ProbeError::Http(e.to_string()))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?;
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| ProbeError::Http(e.to_string()))?
        .to_bytes();
    Ok((status, body))
}

/// Numbers as JSON numbers, `0x` hex strings, or decimal strings.
fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => match s.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    }
}

fn saturate_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

/// A probe that replays scripted results, for tests and dry runs.
#[derive(Default)]
pub struct ScriptedProbe {
    queue: Mutex<VecDeque<Result<ProbeReport, ProbeError>>>,
    fallback: Mutex<Option<ProbeReport>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<ProbeReport, ProbeError>) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(result);
    }

    /// Returned once the queue is empty. `None` makes the probe fail to connect.
    pub fn set_fallback(&self, report: Option<ProbeReport>) {
        *self.fallback.lock().unwrap_or_else(|p| p.into_inner()) = report;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncProbe for ScriptedProbe {
    async fn probe(&self, _target: &ProbeTarget) -> Result<ProbeReport, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front() {
            return next;
        }
        self.fallback
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| ProbeError::Connect("connection refused".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server answering JSON-RPC by method name and GETs by path.
    async fn serve(routes: HashMap<&'static str, &'static str>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(routes);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = sock.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf);
                        if let Some(end) = text.find("\r\n\r\n") {
                            let len = text[..end]
                                .lines()
                                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap_or(0)))
                                .unwrap_or(0);
                            if buf.len() >= end + 4 + len {
                                break;
                            }
                        }
                    }
                    let text = String::from_utf8_lossy(&buf).to_string();
                    let key = routes
                        .keys()
                        .find(|k| text.contains(&format!("\"method\":\"{k}\"")) || text.starts_with(&format!("GET {k} ")))
                        .copied();
                    let (status, body) = match key {
                        Some(k) => ("200 OK", routes[k]),
                        None => ("404 Not Found", "{}"),
                    };
                    let resp = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn target(kind: ProbeKind, addr: SocketAddr) -> ProbeTarget {
        ProbeTarget {
            kind,
            addr,
            path: None,
            authorization: Some("Basic dXNlcjpwYXNz".into()),
        }
    }

    #[tokio::test]
    async fn evm_syncing_reports_heights() {
        let addr = serve(HashMap::from([
            ("web3_clientVersion", r#"{"jsonrpc":"2.0","id":1,"result":"Geth/v1.14.0"}"#),
            ("eth_syncing", r#"{"jsonrpc":"2.0","id":1,"result":{"currentBlock":"0x64","highestBlock":"0xc8"}}"#),
            ("eth_blockNumber", r#"{"jsonrpc":"2.0","id":1,"result":"0x64"}"#),
            ("net_peerCount", r#"{"jsonrpc":"2.0","id":1,"result":"0x5"}"#),
        ]))
        .await;
        let report = RpcProbe.probe(&target(ProbeKind::Evm, addr)).await.unwrap();
        assert_eq!(report.height, Some(100));
        assert_eq!(report.peer_best, Some(200));
        assert_eq!(report.peers, Some(5));
        assert_eq!(report.progress, Some(50.0));
        assert_eq!(report.synced, None);
    }

    #[tokio::test]
    async fn evm_not_syncing_with_peers_is_synced() {
        let addr = serve(HashMap::from([
            ("web3_clientVersion", r#"{"jsonrpc":"2.0","id":1,"result":"Geth/v1.14.0"}"#),
            ("eth_syncing", r#"{"jsonrpc":"2.0","id":1,"result":false}"#),
            ("eth_blockNumber", r#"{"jsonrpc":"2.0","id":1,"result":"0x1000"}"#),
            ("net_peerCount", r#"{"jsonrpc":"2.0","id":1,"result":"0x3"}"#),
        ]))
        .await;
        let report = RpcProbe.probe(&target(ProbeKind::Evm, addr)).await.unwrap();
        assert_eq!(report.synced, Some(true));
        assert_eq!(report.height, Some(4096));
    }

    #[tokio::test]
    async fn utxo_rpc_error_is_surfaced() {
        let addr = serve(HashMap::from([(
            "getblockchaininfo",
            r#"{"result":null,"error":{"code":-28,"message":"Loading block index..."},"id":1}"#,
        )]))
        .await;
        let err = RpcProbe.probe(&target(ProbeKind::Utxo, addr)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Rpc { code: -28, .. }));
    }

    #[tokio::test]
    async fn utxo_initial_download_is_not_synced() {
        let addr = serve(HashMap::from([
            (
                "getblockchaininfo",
                r#"{"result":{"blocks":700000,"headers":840000,"verificationprogress":0.5,"initialblockdownload":true},"error":null,"id":1}"#,
            ),
            ("getconnectioncount", r#"{"result":8,"error":null,"id":1}"#),
        ]))
        .await;
        let report = RpcProbe.probe(&target(ProbeKind::Utxo, addr)).await.unwrap();
        assert_eq!(report.height, Some(700000));
        assert_eq!(report.peer_best, Some(840000));
        assert_eq!(report.peers, Some(8));
        assert_eq!(report.synced, Some(false));
    }

    #[tokio::test]
    async fn tendermint_status() {
        let addr = serve(HashMap::from([(
            "/status",
            r#"{"jsonrpc":"2.0","id":-1,"result":{"sync_info":{"latest_block_height":"12345","catching_up":false}}}"#,
        )]))
        .await;
        let report = RpcProbe.probe(&target(ProbeKind::Tendermint, addr)).await.unwrap();
        assert_eq!(report.height, Some(12345));
        assert_eq!(report.synced, Some(true));
    }

    #[tokio::test]
    async fn closed_port_fails_to_connect() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = RpcProbe.probe(&target(ProbeKind::Rest, addr)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)));
    }

    #[test]
    fn numbers_in_every_encoding() {
        assert_eq!(as_u64(&json!(7)), Some(7));
        assert_eq!(as_u64(&json!("0x1f")), Some(31));
        assert_eq!(as_u64(&json!("42")), Some(42));
        assert_eq!(as_u64(&json!(null)), None);
    }

    #[tokio::test]
    async fn scripted_probe_replays_then_falls_back() {
        let probe = ScriptedProbe::new();
        let t = target(ProbeKind::Utxo, "127.0.0.1:1".parse().unwrap());
        probe.push(Ok(ProbeReport {
            height: Some(1),
            ..Default::default()
        }));
        assert_eq!(probe.probe(&t).await.unwrap().height, Some(1));
        assert!(probe.probe(&t).await.is_err());
        probe.set_fallback(Some(ProbeReport::default()));
        assert!(probe.probe(&t).await.is_ok());
        assert_eq!(probe.calls(), 3);
    }
}
