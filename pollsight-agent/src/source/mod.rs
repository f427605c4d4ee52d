//! Data sources: per-endpoint handles that turn a [`MetricQuery`] into rows.
//!
//! Handles are created by a [`SourceFactory`] for every endpoint at every
//! cycle and dropped when the endpoint is done. There is no shared client.

mod snmp;
mod sql;

use std::time::Duration;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::PollError;
use crate::query::{MetricQuery, QueryResult};
use crate::registry::Endpoint;

pub use snmp::{SnmpSource, snmp_value_to_raw};
pub use sql::SqlSource;

/// Live connection to one endpoint.
#[async_trait]
pub trait DataSource: Send {
    /// Run one query and return its rows.
    ///
    /// Connectivity errors (see [`PollError::is_connectivity`]) mean the
    /// endpoint is unusable for the rest of the cycle.
    async fn fetch(&mut self, query: &MetricQuery) -> Result<Vec<QueryResult>, PollError>;
}

/// Opens [`DataSource`]s for endpoints.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DataSource>, PollError>;
}

/// Factory for the built-in SNMP and SQLite sources.
#[derive(Debug, Clone)]
pub struct DefaultSourceFactory {
    request_timeout: Duration,
}

impl DefaultSourceFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for DefaultSourceFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl SourceFactory for DefaultSourceFactory {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DataSource>, PollError> {
        match &endpoint.connection {
            ConnectionConfig::Snmp {
                address,
                community,
                version,
            } => {
                let source =
                    SnmpSource::connect(address, community, *version, self.request_timeout)
                        .await?;
                Ok(Box::new(source))
            }
            ConnectionConfig::Sql { path } => Ok(Box::new(SqlSource::open(path).await?)),
        }
    }
}
