//! HTTP(S) handler: the request/response pipeline with inline inspection.
//!
//! Every request goes through: canonical dump, `http-request` rules,
//! verdict, forbidden page or upstream forward (redirects disabled,
//! path and query preserved), `http-response` rules, verdict, forbidden
//! page or relay. One log record is shipped per exchange. WebSocket
//! upgrades are handed to the WebSocket handler before any of this runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::{to_bytes, Body};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Request, State};
use axum::http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use palisade_core::dump::{RequestDump, ResponseDump};
use palisade_core::record::{LogRecord, LogType, Verdict};

use super::{ws, ServiceContext, HTTP_HANDLER_TIMEOUT, HTTP_READ_TIMEOUT, SHUTDOWN_DRAIN};

/// Run one HTTP(S) listener until shutdown, then drain.
pub async fn run_listener(
    ctx: Arc<ServiceContext>,
    tls: Option<axum_server::tls_rustls::RustlsConfig>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<()> {
    let addr = SocketAddr::new(
        ctx.service
            .listen_address
            .parse()
            .context("parsing listen address")?,
        ctx.service.listen_port,
    );
    let service_name = ctx.service.name.clone();
    let app = router(ctx);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            handle.graceful_shutdown(Some(SHUTDOWN_DRAIN));
        });
    }

    info!(service = %service_name, %addr, tls = tls.is_some(), "http listener started");
    match tls {
        Some(tls) => {
            let mut server = axum_server::bind_rustls(addr, tls).handle(handle);
            server
                .http_builder()
                .http1()
                .timer(hyper_util::rt::TokioTimer::new())
                .header_read_timeout(HTTP_READ_TIMEOUT);
            server.serve(make_service).await?
        }
        None => {
            let mut server = axum_server::bind(addr).handle(handle);
            server
                .http_builder()
                .http1()
                .timer(hyper_util::rt::TokioTimer::new())
                .header_read_timeout(HTTP_READ_TIMEOUT);
            server.serve(make_service).await?
        }
    }
    info!(service = %service_name, "http listener stopped");
    Ok(())
}

/// The catch-all application: every method on every path lands in
/// [`handle_request`].
pub fn router(ctx: Arc<ServiceContext>) -> Router {
    Router::new()
        .route("/", any(handle_request))
        .route("/{*path}", any(handle_request))
        .layer(TimeoutLayer::new(HTTP_HANDLER_TIMEOUT))
        .layer(DefaultBodyLimit::disable())
        .with_state(ctx)
}

async fn handle_request(
    State(ctx): State<Arc<ServiceContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    if is_websocket_upgrade(request.headers()) {
        debug!(%peer, "websocket upgrade received");
        let (mut parts, _body) = request.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => {
                upgrade.on_upgrade(move |socket| ws::proxy_session(ctx, socket, peer))
            }
            Err(rejection) => rejection.into_response(),
        };
    }
    handle_exchange(ctx, peer, request).await
}

/// `Upgrade: websocket` plus `Connection: Upgrade` marks an upgrade
/// request.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    upgrade && connection
}

async fn handle_exchange(ctx: Arc<ServiceContext>, peer: SocketAddr, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    info!(method = %parts.method, path = %parts.uri.path(), %peer, "received request");

    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "could not read the request body");
            return internal_error();
        }
    };
    let dump = request_dump(&parts, &body);
    let remote_ip = peer.ip().to_string();

    let started = Instant::now();
    let request_findings = ctx.runner.run_on_request(&dump);
    debug!(
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        findings = request_findings.len(),
        "applied rules on request"
    );

    let request_verdict = ctx.verdict(&request_findings);
    if request_verdict == Verdict::Drop && ctx.enforcing() {
        let mut record = LogRecord::new(ctx.agent_id(), &remote_ip, LogType::Http, Verdict::Drop);
        record.request = BASE64.encode(dump.canonical());
        record.response = BASE64.encode(raw_forbidden_response(ctx.forbidden_http()));
        record.request_findings = request_findings;
        ctx.ship(record).await;
        return forbidden_page(ctx.forbidden_http());
    }

    let upstream = match forward_request(&ctx, &dump).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "could not forward the request upstream");
            return internal_error();
        }
    };
    let response = match response_dump(upstream).await {
        Ok(dump) => dump,
        Err(e) => {
            error!(error = %e, "could not read the upstream response");
            return internal_error();
        }
    };

    let response_findings = ctx.runner.run_on_response(&response);
    let response_verdict = ctx.verdict(&response_findings);
    debug!(findings = response_findings.len(), verdict = %response_verdict, "applied rules on response");

    let overall = if request_verdict == Verdict::Drop || response_verdict == Verdict::Drop {
        Verdict::Drop
    } else {
        Verdict::Allow
    };
    let mut record = LogRecord::new(ctx.agent_id(), &remote_ip, LogType::Http, overall);
    record.request = BASE64.encode(dump.canonical());
    record.response = BASE64.encode(response.canonical());
    record.request_findings = request_findings;
    record.response_findings = response_findings;
    ctx.ship(record).await;

    if response_verdict == Verdict::Drop && ctx.enforcing() {
        return forbidden_page(ctx.forbidden_http());
    }
    relay_response(&response)
}

/// Rebuild the request against the remote URL and execute it. The original
/// method, path, query, headers, and body are preserved; hop-by-hop headers
/// are stripped and redirects are never followed.
async fn forward_request(ctx: &ServiceContext, dump: &RequestDump) -> Result<reqwest::Response> {
    let mut url =
        reqwest::Url::parse(&ctx.service.remote_url).context("parsing the remote url")?;
    url.set_path(&dump.path);
    url.set_query(dump.query.as_deref());

    let method = reqwest::Method::from_bytes(dump.method.as_bytes())
        .context("rebuilding the request method")?;

    let mut headers = HeaderMap::new();
    for (name, value) in &dump.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            warn!(header = %name, "skipping unrepresentable header on the outbound request");
            continue;
        };
        headers.append(name, value);
    }

    let response = ctx
        .upstream
        .request(method, url)
        .headers(headers)
        .body(dump.body.clone())
        .send()
        .await?;
    debug!(status = response.status().as_u16(), "upstream responded");
    Ok(response)
}

/// Snapshot a request for inspection and logging.
fn request_dump(parts: &Parts, body: &[u8]) -> RequestDump {
    let host = parts
        .headers
        .get(header::HOST)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .or_else(|| parts.uri.host().map(str::to_string))
        .unwrap_or_default();
    let headers = parts
        .headers
        .iter()
        .filter(|(name, _)| **name != header::HOST)
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    RequestDump {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        version: format!("{:?}", parts.version),
        host,
        headers,
        body: body.to_vec(),
    }
}

/// Snapshot the upstream response, buffering the body.
async fn response_dump(response: reqwest::Response) -> Result<ResponseDump> {
    let status = response.status();
    let version = format!("{:?}", response.version());
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .context("reading the upstream response body")?;
    Ok(ResponseDump {
        version,
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        body: body.to_vec(),
    })
}

/// Relay the upstream response to the client, preserving the status code
/// and multi-valued headers.
fn relay_response(dump: &ResponseDump) -> Response {
    let mut builder = Response::builder().status(dump.status);
    for (name, value) in &dump.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from(dump.body.clone())) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "could not rebuild the upstream response");
            internal_error()
        }
    }
}

/// The 403 page served for blocked traffic.
fn forbidden_page(body: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/html")],
        body.to_string(),
    )
        .into_response()
}

/// Raw bytes of the forbidden response, as recorded in log records.
fn raw_forbidden_response(body: &str) -> Vec<u8> {
    let mut raw = b"HTTP/1.1 403 Forbidden\r\nContent-Type: text/html\r\n\r\n".to_vec();
    raw.extend_from_slice(body.as_bytes());
    raw
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
}

/// Hop-by-hop headers are connection-scoped and never forwarded.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
