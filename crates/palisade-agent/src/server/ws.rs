//! WebSocket handler: bidirectional message proxy with per-message
//! inspection.
//!
//! Entered after a successful HTTP upgrade on the client side. The agent
//! opens an outbound WebSocket to the backend (scheme mapped `http -> ws`,
//! `https -> wss`) and spawns one forwarder per direction. A dropped
//! message is never forwarded; its origin receives a forbidden JSON frame
//! and the session stays open. The first transport error on either leg
//! closes both.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use palisade_core::record::{LogRecord, LogType, Verdict};
use palisade_core::rules::runner::WsMessageKind;

use super::ServiceContext;

type UpstreamWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = Arc<Mutex<SplitSink<WebSocket, ClientMessage>>>;
type UpstreamSink = Arc<Mutex<SplitSink<UpstreamWs, UpstreamMessage>>>;

/// Proxy one upgraded WebSocket session until the first error on either
/// leg.
pub async fn proxy_session(ctx: Arc<ServiceContext>, client: WebSocket, peer: SocketAddr) {
    let url = upstream_ws_url(&ctx.service.remote_url);
    let upstream = match connect_async(url.as_str()).await {
        Ok((upstream, _)) => upstream,
        Err(e) => {
            error!(url = %url, error = %e, "could not open the upstream websocket");
            return;
        }
    };
    info!(%peer, url = %url, "websocket session established");

    let (client_sink, client_stream) = client.split();
    let (upstream_sink, upstream_stream) = upstream.split();
    let client_sink: ClientSink = Arc::new(Mutex::new(client_sink));
    let upstream_sink: UpstreamSink = Arc::new(Mutex::new(upstream_sink));

    // First error from either leg wins; the second is discarded.
    let (errc_tx, mut errc_rx) = mpsc::channel::<String>(2);

    let ingress = tokio::spawn(client_to_upstream(
        ctx.clone(),
        peer,
        client_stream,
        upstream_sink.clone(),
        client_sink.clone(),
        errc_tx.clone(),
    ));
    let egress = tokio::spawn(upstream_to_client(
        ctx,
        peer,
        upstream_stream,
        client_sink.clone(),
        upstream_sink.clone(),
        errc_tx,
    ));

    if let Some(reason) = errc_rx.recv().await {
        debug!(%peer, reason, "websocket session closing");
    }
    ingress.abort();
    egress.abort();
    let _ = client_sink.lock().await.close().await;
    let _ = upstream_sink.lock().await.close().await;
}

/// Forward client messages to the backend, inspecting each one.
async fn client_to_upstream(
    ctx: Arc<ServiceContext>,
    peer: SocketAddr,
    mut stream: SplitStream<WebSocket>,
    dest: UpstreamSink,
    origin: ClientSink,
    errc: mpsc::Sender<String>,
) {
    let remote_ip = peer.ip().to_string();
    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                let _ = errc.try_send(format!("client websocket error: {e}"));
                return;
            }
        };
        let forward = match message {
            ClientMessage::Text(text) => {
                if inspect_message(&ctx, &remote_ip, WsMessageKind::Text, text.as_bytes(), true)
                    .await
                {
                    let notice = forbidden_notice(&ctx);
                    if origin
                        .lock()
                        .await
                        .send(ClientMessage::Text(notice.into()))
                        .await
                        .is_err()
                    {
                        let _ = errc.try_send("client websocket closed".to_string());
                        return;
                    }
                    continue;
                }
                UpstreamMessage::Text(text.as_str().into())
            }
            ClientMessage::Binary(payload) => {
                if inspect_message(&ctx, &remote_ip, WsMessageKind::Binary, &payload, true).await {
                    let notice = forbidden_notice(&ctx);
                    if origin
                        .lock()
                        .await
                        .send(ClientMessage::Text(notice.into()))
                        .await
                        .is_err()
                    {
                        let _ = errc.try_send("client websocket closed".to_string());
                        return;
                    }
                    continue;
                }
                UpstreamMessage::Binary(payload)
            }
            // Control frames pass through uninspected.
            ClientMessage::Ping(payload) => UpstreamMessage::Ping(payload),
            ClientMessage::Pong(payload) => UpstreamMessage::Pong(payload),
            ClientMessage::Close(frame) => {
                UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
                    code: f.code.into(),
                    reason: f.reason.as_str().into(),
                }))
            }
        };
        if let Err(e) = dest.lock().await.send(forward).await {
            let _ = errc.try_send(format!("upstream websocket error: {e}"));
            return;
        }
    }
    let _ = errc.try_send("client websocket closed".to_string());
}

/// Forward backend messages to the client, inspecting each one.
async fn upstream_to_client(
    ctx: Arc<ServiceContext>,
    peer: SocketAddr,
    mut stream: SplitStream<UpstreamWs>,
    dest: ClientSink,
    origin: UpstreamSink,
    errc: mpsc::Sender<String>,
) {
    let remote_ip = peer.ip().to_string();
    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                let _ = errc.try_send(format!("upstream websocket error: {e}"));
                return;
            }
        };
        let forward = match message {
            UpstreamMessage::Text(text) => {
                if inspect_message(&ctx, &remote_ip, WsMessageKind::Text, text.as_bytes(), false)
                    .await
                {
                    let notice = forbidden_notice(&ctx);
                    if origin
                        .lock()
                        .await
                        .send(UpstreamMessage::Text(notice.as_str().into()))
                        .await
                        .is_err()
                    {
                        let _ = errc.try_send("upstream websocket closed".to_string());
                        return;
                    }
                    continue;
                }
                ClientMessage::Text(text.as_str().into())
            }
            UpstreamMessage::Binary(payload) => {
                if inspect_message(&ctx, &remote_ip, WsMessageKind::Binary, &payload, false).await {
                    let notice = forbidden_notice(&ctx);
                    if origin
                        .lock()
                        .await
                        .send(UpstreamMessage::Text(notice.as_str().into()))
                        .await
                        .is_err()
                    {
                        let _ = errc.try_send("upstream websocket closed".to_string());
                        return;
                    }
                    continue;
                }
                ClientMessage::Binary(payload)
            }
            UpstreamMessage::Ping(payload) => ClientMessage::Ping(payload),
            UpstreamMessage::Pong(payload) => ClientMessage::Pong(payload),
            UpstreamMessage::Close(frame) => ClientMessage::Close(frame.map(|f| CloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().into(),
            })),
            // Raw frames are an internal tungstenite detail.
            UpstreamMessage::Frame(_) => continue,
        };
        if let Err(e) = dest.lock().await.send(forward).await {
            let _ = errc.try_send(format!("client websocket error: {e}"));
            return;
        }
    }
    let _ = errc.try_send("upstream websocket closed".to_string());
}

/// Run the `ws-message` rules on a payload, ship the log record, and report
/// whether the message is blocked in the current operation mode.
async fn inspect_message(
    ctx: &ServiceContext,
    remote_ip: &str,
    kind: WsMessageKind,
    payload: &[u8],
    from_client: bool,
) -> bool {
    let findings = ctx.runner.run_on_ws_message(kind, payload);
    let verdict = ctx.verdict(&findings);
    let blocked = verdict == Verdict::Drop && ctx.enforcing();

    let mut record = LogRecord::new(ctx.agent_id(), remote_ip, LogType::Websocket, verdict);
    if from_client {
        record.request = BASE64.encode(payload);
        record.request_findings = findings;
        if blocked {
            record.response = BASE64.encode(forbidden_notice(ctx).as_bytes());
        }
    } else {
        record.response = BASE64.encode(payload);
        record.response_findings = findings;
    }
    ctx.ship(record).await;
    blocked
}

/// The JSON frame sent to the origin peer instead of a dropped message.
fn forbidden_notice(ctx: &ServiceContext) -> String {
    serde_json::json!({ "message": ctx.config.rules.forbidden_tcp_message }).to_string()
}

/// Derive the backend WebSocket URL from the remote URL.
fn upstream_ws_url(remote: &str) -> String {
    if let Some(rest) = remote.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = remote.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if remote.starts_with("ws://") || remote.starts_with("wss://") {
        remote.to_string()
    } else if let Some((_, rest)) = remote.split_once("://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{remote}")
    }
}
