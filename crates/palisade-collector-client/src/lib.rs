//! # palisade-collector-client
//!
//! Async HTTP client for the collector wire contract. The agent uses it to
//! register itself, ship [`LogRecord`]s, and probe collector health. Log
//! shipping is best-effort by design: callers log failures and move on;
//! nothing on the data path ever waits on a retry.

pub mod error;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use palisade_core::record::LogRecord;

use crate::error::{CollectorError, Result};

/// Error body the collector returns with non-200 statuses.
#[derive(Debug, Deserialize)]
struct ApiError {
    detail: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// Stateless client over the collector HTTP API.
#[derive(Debug, Clone)]
pub struct CollectorClient {
    base_url: String,
    http: Client,
}

impl CollectorClient {
    /// Create a new client for the given collector base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("palisade-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_http_client(base_url, http))
    }

    /// Create a client with a custom HTTP client (for testing with mockito).
    pub fn with_http_client(base_url: impl Into<String>, http: Client) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, http }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register this agent and return the UUID the collector issued.
    pub async fn register_agent(&self) -> Result<String> {
        let url = format!("{}/agents/register", self.base_url);
        let response = self.http.post(&url).send().await?;
        let response = Self::check_status(response).await?;
        let body: RegisterResponse = response
            .json()
            .await
            .map_err(|e| CollectorError::UnexpectedResponse(e.to_string()))?;
        Ok(body.uuid)
    }

    /// Ship one log record. The record's own `agentId` selects the endpoint.
    pub async fn send_log(&self, record: &LogRecord) -> Result<()> {
        let url = format!("{}/agents/{}/logs", self.base_url, record.agent_id);
        debug!(url = %url, r#type = ?record.log_type, "shipping log record");
        let response = self.http.post(&url).json(record).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// Probe the collector health endpoint.
    pub async fn healthcheck(&self) -> Result<()> {
        let url = format!("{}/healthcheck", self.base_url);
        let response = self.http.get(&url).send().await?;
        let response = Self::check_status(response).await?;
        let body: HealthResponse = response
            .json()
            .await
            .map_err(|e| CollectorError::UnexpectedResponse(e.to_string()))?;
        if body.status != "alive" {
            return Err(CollectorError::UnexpectedResponse(format!(
                "health status '{}'",
                body.status
            )));
        }
        Ok(())
    }

    /// Map non-200 responses to [`CollectorError::Api`], decoding the
    /// collector's `{detail}` body when present.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status() == StatusCode::OK {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let detail = match response.json::<ApiError>().await {
            Ok(body) => body.detail,
            Err(e) => format!("undecodable error body: {e}"),
        };
        Err(CollectorError::Api { status, detail })
    }
}
