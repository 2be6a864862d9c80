//! TCP(S) handler: bidirectional byte-stream proxy with per-chunk
//! inspection and per-stream sequencing.
//!
//! Every accepted connection dials its own upstream connection and gets a
//! fresh stream UUID. Chunks of up to 8 KiB are inspected per direction;
//! each one produces a log record whose `streamIndex` is taken under the
//! stream's index mutex, giving a gapless total order over the
//! conversation. A dropped chunk is never forwarded: the client receives
//! the configured forbidden bytes and the session keeps running. The first
//! I/O error on either leg closes the client socket, then the upstream
//! socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use palisade_core::record::{Direction, LogRecord, LogType, Verdict};

use super::ServiceContext;

/// Read size per chunk; also the inspection granularity.
const TCP_BUFFER_SIZE: usize = 8192;

/// Per-connection stream bookkeeping shared by the two forwarders.
struct ClientStream {
    stream_uuid: String,
    remote_ip: String,
    index: StdMutex<i64>,
}

impl ClientStream {
    fn new(peer: SocketAddr) -> Self {
        Self {
            stream_uuid: Uuid::new_v4().to_string(),
            remote_ip: peer.ip().to_string(),
            index: StdMutex::new(0),
        }
    }

    /// Claim the next stream index. Strictly increasing, no gaps.
    fn next_index(&self) -> i64 {
        let mut index = self.index.lock().expect("stream index mutex poisoned");
        let claimed = *index;
        *index += 1;
        claimed
    }
}

/// Run one TCP(S) listener until shutdown. Each accepted connection is
/// handled on its own task.
pub async fn run_listener(
    ctx: Arc<ServiceContext>,
    tls: Option<TlsAcceptor>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = SocketAddr::new(
        ctx.service
            .listen_address
            .parse::<IpAddr>()
            .context("parsing listen address")?,
        ctx.service.listen_port,
    );
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding tcp listener on {addr}"))?;
    info!(service = %ctx.service.name, %addr, tls = tls.is_some(), "tcp listener started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(service = %ctx.service.name, "tcp listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(service = %ctx.service.name, error = %e, "accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(socket).await {
                            Ok(stream) => handle_connection(ctx, stream, peer).await,
                            Err(e) => warn!(%peer, error = %e, "tls handshake failed"),
                        },
                        None => handle_connection(ctx, socket, peer).await,
                    }
                });
            }
        }
    }
}

/// Proxy one client connection against its own upstream connection.
async fn handle_connection<S>(ctx: Arc<ServiceContext>, client: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let upstream = match TcpStream::connect((
        ctx.service.remote_address.clone(),
        ctx.service.remote_port,
    ))
    .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            error!(
                remote = %ctx.service.remote_url,
                error = %e,
                "could not connect to the upstream server"
            );
            return;
        }
    };

    let stream = Arc::new(ClientStream::new(peer));
    debug!(stream = %stream.stream_uuid, %peer, "tcp session established");

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let client_write = Arc::new(Mutex::new(client_write));
    let upstream_write = Arc::new(Mutex::new(upstream_write));

    // First error from either forwarder wins; the second is discarded.
    let (errc_tx, mut errc_rx) = mpsc::channel::<String>(2);

    let ingress = tokio::spawn(pump(
        ctx.clone(),
        stream.clone(),
        Direction::Ingress,
        client_read,
        upstream_write.clone(),
        client_write.clone(),
        errc_tx.clone(),
    ));
    let egress = tokio::spawn(pump(
        ctx,
        stream.clone(),
        Direction::Egress,
        upstream_read,
        client_write.clone(),
        client_write.clone(),
        errc_tx,
    ));

    if let Some(reason) = errc_rx.recv().await {
        debug!(stream = %stream.stream_uuid, reason, "tcp session closing");
    }
    ingress.abort();
    egress.abort();

    // Client first, then upstream; close errors are logged, never retried.
    if let Err(e) = client_write.lock().await.shutdown().await {
        debug!(stream = %stream.stream_uuid, error = %e, "error closing the client socket");
    }
    let upstream_shutdown_result = upstream_write.lock().await.shutdown().await;
    if let Err(e) = upstream_shutdown_result {
        debug!(stream = %stream.stream_uuid, error = %e, "error closing the upstream socket");
    }
}

/// One forwarding direction: read a chunk, inspect it, log it, then either
/// forward it or notify the client that it was dropped.
async fn pump<R, W, N>(
    ctx: Arc<ServiceContext>,
    stream: Arc<ClientStream>,
    direction: Direction,
    mut read: R,
    dest: Arc<Mutex<W>>,
    client: Arc<Mutex<N>>,
    errc: mpsc::Sender<String>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    N: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; TCP_BUFFER_SIZE];
    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) => {
                let _ = errc.try_send(format!("{direction} peer closed the connection"));
                return;
            }
            Ok(n) => n,
            Err(e) => {
                error!(stream = %stream.stream_uuid, %direction, error = %e, "read failed");
                let _ = errc.try_send(e.to_string());
                return;
            }
        };
        let chunk = &buf[..n];
        debug!(stream = %stream.stream_uuid, %direction, bytes = n, "received chunk");

        let findings = ctx.runner.run_on_tcp_chunk(direction, chunk);
        let verdict = ctx.verdict(&findings);
        let blocked = verdict == Verdict::Drop && ctx.enforcing();

        let mut record = LogRecord::new(ctx.agent_id(), &stream.remote_ip, LogType::Tcp, verdict);
        record.stream_uuid = Some(stream.stream_uuid.clone());
        record.direction = Some(direction);
        match direction {
            Direction::Ingress => {
                record.request = BASE64.encode(chunk);
                record.request_findings = findings;
            }
            Direction::Egress => {
                record.response = BASE64.encode(chunk);
                record.response_findings = findings;
            }
        }
        record.stream_index = Some(stream.next_index());
        ctx.ship(record).await;

        if blocked {
            if let Err(e) = client.lock().await.write_all(ctx.forbidden_tcp()).await {
                error!(
                    stream = %stream.stream_uuid,
                    error = %e,
                    "could not send the forbidden message to the client"
                );
            }
            // The dropped chunk is never forwarded; keep reading.
            continue;
        }

        if let Err(e) = dest.lock().await.write_all(chunk).await {
            error!(stream = %stream.stream_uuid, %direction, error = %e, "write failed");
            let _ = errc.try_send(e.to_string());
            return;
        }
    }
}
