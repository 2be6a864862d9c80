//! Test harness for end-to-end agent scenarios.
//!
//! Spawns real listeners on ephemeral ports: a mock HTTP upstream, a mock
//! WebSocket backend, a raw TCP upstream, and a mock collector that records
//! every shipped log record.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocketUpgrade};
use axum::extract::{Json, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use palisade_agent::server::AgentServer;
use palisade_collector_client::CollectorClient;
use palisade_core::config::{
    AgentConfig, ListenProtocol, LoggingOptions, OperationMode, RuleOptions, ServiceConfig,
};
use palisade_core::rules::matcher::Matcher;
use palisade_core::rules::{Rule, RuleAction, RuleScope, Severity};

pub const AGENT_UUID: &str = "6d9a76f2-51a4-4b2e-8a1e-28f0a64d3c10";

// ---------------------------------------------------------------------------
// Generic helpers
// ---------------------------------------------------------------------------

/// Reserve an ephemeral port.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("binding ephemeral port");
    listener.local_addr().unwrap().port()
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// A drop-scoped rule matching `pattern` as a case-insensitive substring.
pub fn substring_rule(
    id: &str,
    action: Option<RuleAction>,
    scopes: &[RuleScope],
    pattern: &str,
) -> Rule {
    Rule {
        id: id.to_string(),
        name: format!("rule {id}"),
        description: "test rule".to_string(),
        severity: Severity::High,
        classification: "test".to_string(),
        action,
        scopes: scopes.to_vec(),
        matcher: Matcher::Substring {
            pattern: pattern.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Mock collector
// ---------------------------------------------------------------------------

type Records = Arc<Mutex<Vec<Value>>>;

pub struct MockCollector {
    pub url: String,
    pub records: Records,
}

impl MockCollector {
    pub async fn spawn() -> Self {
        let records: Records = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/agents/register",
                post(|| async { Json(json!({ "uuid": AGENT_UUID })) }),
            )
            .route("/agents/{id}/logs", post(record_log))
            .route(
                "/healthcheck",
                get(|| async { Json(json!({ "status": "alive" })) }),
            )
            .with_state(records.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            records,
        }
    }

    pub fn records(&self) -> Vec<Value> {
        self.records.lock().unwrap().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

async fn record_log(State(records): State<Records>, Json(value): Json<Value>) -> StatusCode {
    records.lock().unwrap().push(value);
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Mock HTTP upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub path_and_query: String,
    pub user_agent: String,
    pub body: Vec<u8>,
}

type Requests = Arc<Mutex<Vec<ReceivedRequest>>>;

pub struct HttpUpstream {
    pub url: String,
    pub requests: Requests,
}

impl HttpUpstream {
    pub async fn spawn() -> Self {
        let requests: Requests = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .fallback(handle_upstream)
            .with_state(requests.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle_upstream(State(requests): State<Requests>, request: Request) -> impl IntoResponse {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
    let user_agent = parts
        .headers
        .get("user-agent")
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    requests.lock().unwrap().push(ReceivedRequest {
        method: parts.method.to_string(),
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_default(),
        user_agent,
        body: body.to_vec(),
    });
    ([("x-upstream", "yes")], "upstream says hi")
}

// ---------------------------------------------------------------------------
// Mock WebSocket backend
// ---------------------------------------------------------------------------

type Messages = Arc<Mutex<Vec<String>>>;

pub struct WsBackend {
    pub url: String,
    pub received: Messages,
}

impl WsBackend {
    /// A backend that records every text frame and never replies.
    pub async fn spawn() -> Self {
        let received: Messages = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/", axum::routing::any(handle_ws_backend))
            .with_state(received.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            url: format!("http://{addr}"),
            received,
        }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

async fn handle_ws_backend(State(received): State<Messages>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        while let Some(Ok(message)) = socket.recv().await {
            if let WsMessage::Text(text) = message {
                received.lock().unwrap().push(text.as_str().to_string());
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Mock TCP upstream
// ---------------------------------------------------------------------------

type Chunks = Arc<Mutex<Vec<Vec<u8>>>>;

pub struct TcpUpstream {
    pub addr: SocketAddr,
    pub chunks: Chunks,
}

impl TcpUpstream {
    /// A raw TCP server that records every chunk and writes `reply` once,
    /// after the first chunk arrives.
    pub async fn spawn(reply: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let chunks: Chunks = Arc::new(Mutex::new(Vec::new()));
        let state = chunks.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let state = state.clone();
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    let mut first = true;
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                state.lock().unwrap().push(buf[..n].to_vec());
                                if first {
                                    first = false;
                                    let _ = socket.write_all(&reply).await;
                                }
                            }
                        }
                    }
                });
            }
        });
        Self { addr, chunks }
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Agent under test
// ---------------------------------------------------------------------------

pub struct RunningAgent {
    pub port: u16,
    shutdown: broadcast::Sender<()>,
}

impl RunningAgent {
    pub fn http_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/", self.port)
    }

    pub fn addr(&self) -> SocketAddr {
        format!("127.0.0.1:{}", self.port).parse().unwrap()
    }
}

impl Drop for RunningAgent {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Start an agent with one configured service and wait until it accepts
/// connections.
pub async fn start_agent(
    protocol: ListenProtocol,
    remote_url: &str,
    rules: Vec<Rule>,
    mode: OperationMode,
    collector_url: &str,
) -> RunningAgent {
    let port = free_port();
    let remote = reqwest::Url::parse(remote_url).expect("valid remote url");
    let service = ServiceConfig {
        name: format!("Service {port}"),
        listen_protocol: protocol,
        listen_address: "127.0.0.1".to_string(),
        listen_port: port,
        remote_url: remote_url.to_string(),
        remote_protocol: remote.scheme().to_string(),
        remote_address: remote.host_str().unwrap_or_default().to_string(),
        remote_port: remote.port_or_known_default().unwrap_or_default(),
    };
    let config = AgentConfig {
        services: vec![service],
        ssl: None,
        rules: RuleOptions::default(),
        logging: LoggingOptions::default(),
        collector_url: collector_url.to_string(),
        uuid: AGENT_UUID.to_string(),
        operation_mode: mode,
    };

    let collector = CollectorClient::new(collector_url).unwrap();
    let server = AgentServer::new(
        Arc::new(config),
        Arc::new(rules),
        Arc::new(collector),
    );
    let (shutdown, _) = broadcast::channel(1);
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(&server_shutdown).await;
    });

    // Wait for the listener to come up.
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent listener did not start on {addr}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    RunningAgent { port, shutdown }
}
