//! Listener registry and per-service context.
//!
//! One listener per configured service: an axum application for `http` /
//! `https`, an accept loop for `tcp` / `tcps`. Listeners run concurrently;
//! a failing listener is logged without tearing down the others. Shutdown
//! is coordinated over a broadcast channel; HTTP listeners get a bounded
//! drain window, TCP sessions are terminated by closing their sockets.

pub mod http;
pub mod tcp;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use palisade_collector_client::CollectorClient;
use palisade_core::config::{AgentConfig, ListenProtocol, ServiceConfig};
use palisade_core::record::{Finding, LogRecord, Verdict};
use palisade_core::rules::runner::RuleRunner;
use palisade_core::rules::{verdict, Rule};

use crate::tls;

/// Per-request head read timeout on HTTP listeners.
pub(crate) const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(15);
/// Ceiling on producing a response for one HTTP exchange.
pub(crate) const HTTP_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);
/// Drain window granted to HTTP listeners on shutdown.
pub(crate) const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Everything a protocol handler needs for one configured service.
///
/// The rule set and the collector client are shared by reference across all
/// handlers; per-connection state lives in the handlers themselves.
pub struct ServiceContext {
    pub config: Arc<AgentConfig>,
    pub service: ServiceConfig,
    pub runner: RuleRunner,
    pub rules: Arc<Vec<Rule>>,
    pub collector: Arc<CollectorClient>,
    /// Shared upstream HTTP client: redirects disabled so redirect bodies
    /// stay inspectable, idle pooling disabled so each request dials its
    /// own upstream connection.
    pub upstream: reqwest::Client,
}

impl ServiceContext {
    pub fn new(
        config: Arc<AgentConfig>,
        service: ServiceConfig,
        rules: Arc<Vec<Rule>>,
        collector: Arc<CollectorClient>,
    ) -> Result<Self> {
        let upstream = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .build()
            .context("building the upstream HTTP client")?;
        Ok(Self {
            runner: RuleRunner::new(rules.clone()),
            config,
            service,
            rules,
            collector,
            upstream,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.config.uuid
    }

    /// Whether drop verdicts block traffic in the current operation mode.
    pub fn enforcing(&self) -> bool {
        self.config.operation_mode.enforcing()
    }

    pub fn verdict(&self, findings: &[Finding]) -> Verdict {
        verdict::resolve(findings, &self.rules, self.config.rules.default_action)
    }

    pub fn forbidden_http(&self) -> &str {
        &self.config.rules.forbidden_http_message
    }

    pub fn forbidden_tcp(&self) -> &[u8] {
        self.config.rules.forbidden_tcp_message.as_bytes()
    }

    /// Ship a log record to the collector. Best-effort: failures are logged
    /// and never touch the data path.
    pub async fn ship(&self, record: LogRecord) {
        if record.agent_id.is_empty() {
            debug!("agent is not registered, skipping log shipping");
            return;
        }
        if let Err(e) = self.collector.send_log(&record).await {
            warn!(error = %e, "failed to ship log record to the collector");
        }
    }
}

/// Owns the listeners for every configured service.
pub struct AgentServer {
    config: Arc<AgentConfig>,
    rules: Arc<Vec<Rule>>,
    collector: Arc<CollectorClient>,
}

impl AgentServer {
    pub fn new(
        config: Arc<AgentConfig>,
        rules: Arc<Vec<Rule>>,
        collector: Arc<CollectorClient>,
    ) -> Self {
        Self {
            config,
            rules,
            collector,
        }
    }

    /// Start one listener per service and run until every listener has
    /// stopped. Each listener subscribes to `shutdown`; a listener that
    /// fails is logged and the rest keep serving.
    pub async fn run(&self, shutdown: &broadcast::Sender<()>) -> Result<()> {
        let mut listeners = JoinSet::new();

        for service in self.config.services.clone() {
            let ctx = Arc::new(ServiceContext::new(
                self.config.clone(),
                service.clone(),
                self.rules.clone(),
                self.collector.clone(),
            )?);
            let name = service.name.clone();
            let rx = shutdown.subscribe();
            let ssl = self.config.ssl.clone();

            listeners.spawn(async move {
                let result = match ctx.service.listen_protocol {
                    ListenProtocol::Http => http::run_listener(ctx, None, rx).await,
                    ListenProtocol::Https => match ssl {
                        Some(ssl) => match tls::https_config(&ssl.certificate, &ssl.key).await {
                            Ok(config) => http::run_listener(ctx, Some(config), rx).await,
                            Err(e) => Err(e),
                        },
                        None => Err(anyhow::anyhow!("ssl section missing for https service")),
                    },
                    ListenProtocol::Tcp => tcp::run_listener(ctx, None, rx).await,
                    ListenProtocol::Tcps => match ssl {
                        Some(ssl) => match tls::tcps_acceptor(&ssl.certificate, &ssl.key) {
                            Ok(acceptor) => tcp::run_listener(ctx, Some(acceptor), rx).await,
                            Err(e) => Err(e),
                        },
                        None => Err(anyhow::anyhow!("ssl section missing for tcps service")),
                    },
                };
                (name, result)
            });
        }

        while let Some(joined) = listeners.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(service = %name, "listener finished"),
                Ok((name, Err(e))) => error!(service = %name, error = %e, "listener failed"),
                Err(e) => error!(error = %e, "listener task panicked"),
            }
        }
        Ok(())
    }
}
