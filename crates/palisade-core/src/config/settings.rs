//! Configuration document parsing, validation, and defaulting.
//!
//! The agent is configured from a single YAML file. The document is read
//! once at startup and immutable afterwards; the only write path is
//! persisting a freshly issued agent UUID back to disk after registration.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;
use url::Url;

use crate::rules::RuleAction;

/// Protocols a service can listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenProtocol {
    Http,
    Https,
    Tcp,
    Tcps,
}

impl ListenProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            ListenProtocol::Http => "http",
            ListenProtocol::Https => "https",
            ListenProtocol::Tcp => "tcp",
            ListenProtocol::Tcps => "tcps",
        }
    }

    /// Whether this listener terminates TLS and therefore needs the `ssl`
    /// section.
    pub fn requires_tls(self) -> bool {
        matches!(self, ListenProtocol::Https | ListenProtocol::Tcps)
    }

    pub fn is_http(self) -> bool {
        matches!(self, ListenProtocol::Http | ListenProtocol::Https)
    }
}

impl FromStr for ListenProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ListenProtocol::Http),
            "https" => Ok(ListenProtocol::Https),
            "tcp" => Ok(ListenProtocol::Tcp),
            "tcps" => Ok(ListenProtocol::Tcps),
            other => Err(format!(
                "unknown protocol '{other}', allowed values are http, https, tcp, tcps"
            )),
        }
    }
}

impl std::fmt::Display for ListenProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ListenProtocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ListenProtocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Operation mode of the agent: `waf` enforces verdicts, `testing` runs all
/// inspection and logging but forwards traffic regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationMode {
    #[default]
    Waf,
    Testing,
}

impl OperationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::Waf => "waf",
            OperationMode::Testing => "testing",
        }
    }

    /// Whether drop verdicts actually block traffic.
    pub fn enforcing(self) -> bool {
        matches!(self, OperationMode::Waf)
    }
}

impl FromStr for OperationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waf" => Ok(OperationMode::Waf),
            "testing" => Ok(OperationMode::Testing),
            other => Err(format!(
                "unknown operation mode '{other}', allowed values are waf, testing"
            )),
        }
    }
}

impl Serialize for OperationMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OperationMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One proxied service: where the agent listens and where surviving traffic
/// is forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "lprotocol")]
    pub listen_protocol: ListenProtocol,
    #[serde(rename = "laddress")]
    pub listen_address: String,
    #[serde(rename = "lport")]
    pub listen_port: u16,
    /// Remote URL; synthesized from the triple below when absent.
    #[serde(rename = "rurl", default)]
    pub remote_url: String,
    #[serde(rename = "rprotocol", default)]
    pub remote_protocol: String,
    #[serde(rename = "raddress", default)]
    pub remote_address: String,
    #[serde(rename = "rport", default)]
    pub remote_port: u16,
}

/// Rule-related options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOptions {
    #[serde(default)]
    pub rules_directory: String,
    #[serde(default)]
    pub ignore_rules_directories: Vec<PathBuf>,
    /// Fallback verdict action for empty finding sets.
    #[serde(default)]
    pub default_action: Option<RuleAction>,
    /// HTML body served with blocked HTTP traffic.
    #[serde(default = "default_forbidden_http_message")]
    pub forbidden_http_message: String,
    /// Optional file whose content replaces `forbidden_http_message`.
    #[serde(default)]
    pub forbidden_http_path: Option<PathBuf>,
    /// Raw bytes written to blocked TCP and WebSocket peers.
    #[serde(default = "default_forbidden_tcp_message")]
    pub forbidden_tcp_message: String,
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            rules_directory: String::new(),
            ignore_rules_directories: Vec::new(),
            default_action: None,
            forbidden_http_message: default_forbidden_http_message(),
            forbidden_http_path: None,
            forbidden_tcp_message: default_forbidden_tcp_message(),
        }
    }
}

fn default_forbidden_http_message() -> String {
    "<html>\n\
     <h1>Forbidden</h1>\n\
     <p>You don't have access for this resource</p>\n\
     <p>If you think you did nothing wrong, contact the administrator</p>\n\
     </html>\n"
        .to_string()
}

fn default_forbidden_tcp_message() -> String {
    "Forbidden\n".to_string()
}

/// TLS material for `https`/`tcps` listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslOptions {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Logging options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingOptions {
    #[serde(default)]
    pub logger_type: String,
    #[serde(default)]
    pub log_filepath: Option<PathBuf>,
    #[serde(default)]
    pub log_url: Option<String>,
    /// Lowers the default log filter to debug.
    #[serde(default)]
    pub debug: bool,
}

/// The whole agent configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub ssl: Option<SslOptions>,
    pub rules: RuleOptions,
    pub logging: LoggingOptions,
    /// Base URL of the collector.
    #[serde(rename = "cranberry_url")]
    pub collector_url: String,
    /// Agent identity issued by the collector; empty until registered.
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub operation_mode: OperationMode,
}

const ALLOWED_REMOTE_PROTOCOLS: [&str; 4] = ["http", "https", "tcp", "tcps"];

impl AgentConfig {
    /// Load, validate, and default a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let mut config: AgentConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        config.validate()?;
        config.complete_defaults()?;
        Ok(config)
    }

    /// Persist the configuration back to disk (used to save a freshly
    /// issued agent UUID).
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("serializing configuration")?;
        fs::write(path, content)
            .with_context(|| format!("writing configuration file {}", path.display()))
    }

    /// Whether any service terminates TLS.
    pub fn needs_tls(&self) -> bool {
        self.services
            .iter()
            .any(|s| s.listen_protocol.requires_tls())
    }

    fn validate(&self) -> Result<()> {
        if self.services.is_empty() {
            bail!("services are not defined");
        }
        if self.collector_url.is_empty() {
            bail!("collector url is not defined");
        }

        for (i, service) in self.services.iter().enumerate() {
            if service.listen_address.parse::<IpAddr>().is_err() {
                bail!(
                    "listening address '{}' is not a valid ip address in service {i}",
                    service.listen_address
                );
            }
            if service.listen_port == 0 {
                bail!("listening port must be between 1 and 65535 in service {i}");
            }

            let has_triple = !service.remote_protocol.is_empty()
                && !service.remote_address.is_empty()
                && service.remote_port != 0;
            if service.remote_url.is_empty() && !has_triple {
                bail!(
                    "either rurl or raddress, rport and rprotocol must be specified in service {i}"
                );
            }
            if !service.remote_url.is_empty() {
                let url = Url::parse(&service.remote_url)
                    .with_context(|| format!("remote url is not valid in service {i}"))?;
                if !ALLOWED_REMOTE_PROTOCOLS.contains(&url.scheme()) {
                    bail!(
                        "remote url scheme '{}' invalid in service {i}, allowed values are {:?}",
                        url.scheme(),
                        ALLOWED_REMOTE_PROTOCOLS
                    );
                }
                if url.host_str().is_none() {
                    bail!("remote url is missing a host in service {i}");
                }
            }
            if !service.remote_protocol.is_empty()
                && !ALLOWED_REMOTE_PROTOCOLS.contains(&service.remote_protocol.to_lowercase().as_str())
            {
                bail!(
                    "remote protocol '{}' invalid in service {i}, allowed values are {:?}",
                    service.remote_protocol,
                    ALLOWED_REMOTE_PROTOCOLS
                );
            }
        }

        if self.needs_tls() && self.ssl.is_none() {
            bail!("ssl section is required when a service listens on https or tcps");
        }

        Ok(())
    }

    fn complete_defaults(&mut self) -> Result<()> {
        for service in &mut self.services {
            if service.name.is_empty() {
                service.name = format!("Service {}", service.listen_port);
            }
            service.remote_protocol = service.remote_protocol.to_lowercase();

            if service.remote_url.is_empty() {
                service.remote_url = format!(
                    "{}://{}:{}",
                    service.remote_protocol, service.remote_address, service.remote_port
                );
            } else {
                // Derive the triple from the URL.
                let url = Url::parse(&service.remote_url)
                    .with_context(|| format!("remote url is not valid in service '{}'", service.name))?;
                service.remote_protocol = url.scheme().to_string();
                service.remote_address = url.host_str().unwrap_or_default().to_string();
                service.remote_port = url.port_or_known_default().unwrap_or(0);
            }

            if !service.listen_protocol.is_http() && service.remote_port == 0 {
                bail!(
                    "remote port cannot be derived for tcp service '{}'; specify it in rurl or rport",
                    service.name
                );
            }
        }

        if let Some(path) = self.rules.forbidden_http_path.clone() {
            match fs::read_to_string(&path) {
                Ok(content) => self.rules.forbidden_http_message = content,
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "cannot read forbidden page, keeping the configured message"
                ),
            }
        }

        Ok(())
    }
}
