use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use pollsight_common::{Format, LoggingConfig};

use crate::error::{AgentError, Result};
use crate::query::{MetricQuery, QuerySource};

/// Root configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Serialization format of the upstream payload.
    #[serde(default)]
    pub serialization: Format,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Scheduling and identity settings.
    #[serde(default)]
    pub agent: AgentSettings,

    /// Upstream collector.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Metric queries, by name.
    #[serde(default)]
    pub queries: HashMap<String, MetricQuery>,

    /// Endpoints to poll.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Agent-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Host name reported in the payload ("auto" resolves the local host name).
    #[serde(default = "default_host")]
    pub host: String,

    /// Component type identifier reported for every endpoint.
    #[serde(default = "default_guid")]
    pub guid: String,

    /// Seconds between poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Poll and aggregate but never submit upstream.
    #[serde(default)]
    pub collect_only: bool,

    /// Endpoints polled at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Upper bound on the time spent on one endpoint per cycle.
    #[serde(default = "default_endpoint_timeout")]
    pub endpoint_timeout_secs: u64,

    /// Timeout of a single SNMP request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_host() -> String {
    "auto".to_string()
}

fn default_guid() -> String {
    "com.pollsight.agent".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_concurrency() -> usize {
    8
}

fn default_endpoint_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    5000
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            guid: default_guid(),
            poll_interval_secs: default_poll_interval(),
            collect_only: false,
            max_concurrency: default_max_concurrency(),
            endpoint_timeout_secs: default_endpoint_timeout(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl AgentSettings {
    /// Resolve the configured host name.
    pub fn resolve_host(&self) -> String {
        if self.host == "auto" {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        } else {
            self.host.clone()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Upstream collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Endpoint receiving one POST per cycle.
    #[serde(default)]
    pub url: String,

    /// Sent as the `X-License-Key` header.
    #[serde(default)]
    pub license_key: String,

    /// Request timeout in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

fn default_upstream_timeout() -> u64 {
    20
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            license_key: String::new(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

/// Configuration for a single endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name, reported as the component name.
    pub name: String,

    /// How to reach the endpoint.
    pub connection: ConnectionConfig,

    /// Names of the queries to run, in order.
    #[serde(default)]
    pub queries: Vec<String>,

    /// Instance glob patterns to keep (empty keeps everything).
    #[serde(default)]
    pub include: Vec<String>,

    /// Instance glob patterns to drop (applied after `include`).
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Endpoint connection descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// SNMP agent.
    Snmp {
        /// Agent address (e.g., "192.168.1.1:161").
        address: String,
        #[serde(default = "default_community")]
        community: String,
        #[serde(default)]
        version: SnmpVersion,
    },

    /// SQLite database file.
    Sql { path: String },
}

fn default_community() -> String {
    "public".to_string()
}

impl ConnectionConfig {
    /// Short name of the connection kind, matching [`QuerySource::kind`].
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionConfig::Snmp { .. } => "snmp",
            ConnectionConfig::Sql { .. } => "sql",
        }
    }
}

/// SNMP protocol version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnmpVersion {
    #[serde(rename = "v1")]
    V1,
    #[default]
    #[serde(rename = "v2c")]
    V2c,
}

impl AgentConfig {
    /// Load and validate configuration from a JSON5 file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON5 file without validating it, so that
    /// command line overrides can be applied first.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AgentError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse_unvalidated(&content)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self> {
        let config = Self::parse_unvalidated(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_unvalidated(content: &str) -> Result<Self> {
        let mut config: Self = pollsight_common::parse_config(content)?;
        for (name, query) in config.queries.iter_mut() {
            query.name = name.clone();
        }
        Ok(config)
    }

    /// Check cross references and required settings.
    pub fn validate(&self) -> Result<()> {
        if self.agent.poll_interval_secs == 0 {
            return Err(AgentError::validation(
                "poll_interval_secs must be positive",
            ));
        }
        if self.agent.max_concurrency == 0 {
            return Err(AgentError::validation("max_concurrency must be positive"));
        }
        if self.agent.endpoint_timeout_secs == 0 {
            return Err(AgentError::validation(
                "endpoint_timeout_secs must be positive",
            ));
        }
        if self.agent.request_timeout_ms == 0 {
            return Err(AgentError::validation(
                "request_timeout_ms must be positive",
            ));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(AgentError::validation(
                "upstream.timeout_secs must be positive",
            ));
        }
        if !self.agent.collect_only {
            if self.upstream.url.is_empty() {
                return Err(AgentError::validation(
                    "upstream.url is required unless collect_only is set",
                ));
            }
            if self.upstream.license_key.is_empty() {
                return Err(AgentError::validation(
                    "upstream.license_key is required unless collect_only is set",
                ));
            }
        }

        for (name, query) in &self.queries {
            if query.fields.is_empty() {
                return Err(AgentError::validation(format!(
                    "query '{}' has no fields",
                    name
                )));
            }
            if let QuerySource::Snmp { oids, walk } = &query.source
                && oids.is_empty()
                && walk.is_none()
            {
                return Err(AgentError::validation(format!(
                    "query '{}' has neither oids nor walk",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.name.is_empty() {
                return Err(AgentError::validation("endpoint name cannot be empty"));
            }
            if !seen.insert(endpoint.name.as_str()) {
                return Err(AgentError::validation(format!(
                    "duplicate endpoint '{}'",
                    endpoint.name
                )));
            }
            if let ConnectionConfig::Snmp { address, .. } = &endpoint.connection
                && address.is_empty()
            {
                return Err(AgentError::validation(format!(
                    "endpoint '{}' has no address",
                    endpoint.name
                )));
            }
            for query_name in &endpoint.queries {
                let query = self.queries.get(query_name).ok_or_else(|| {
                    AgentError::validation(format!(
                        "endpoint '{}' references unknown query '{}'",
                        endpoint.name, query_name
                    ))
                })?;
                if query.source.kind() != endpoint.connection.kind() {
                    return Err(AgentError::validation(format!(
                        "endpoint '{}' is {} but query '{}' is {}",
                        endpoint.name,
                        endpoint.connection.kind(),
                        query_name,
                        query.source.kind()
                    )));
                }
            }
            for pattern in endpoint.include.iter().chain(&endpoint.exclude) {
                glob::Pattern::new(pattern).map_err(|e| {
                    AgentError::validation(format!(
                        "endpoint '{}' has invalid pattern '{}': {}",
                        endpoint.name, pattern, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}
