//! Collector registry: endpoints and their compiled queries.
//!
//! Poll cycles work on an immutable [`RegistrySnapshot`]. A reload builds a
//! complete new snapshot and swaps it in; cycles already running keep the
//! snapshot they started with.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{AgentConfig, ConnectionConfig, EndpointConfig};
use crate::error::{AgentError, Result};
use crate::mapper::MetricMapper;
use crate::query::MetricQuery;

/// A query together with its compiled field table.
#[derive(Debug)]
pub struct RegisteredQuery {
    pub query: MetricQuery,
    pub mapper: MetricMapper,
}

impl RegisteredQuery {
    /// Compile `query`.
    pub fn compile(query: MetricQuery) -> Result<Self> {
        let mapper = MetricMapper::compile(&query)?;
        Ok(Self { query, mapper })
    }

    pub fn name(&self) -> &str {
        &self.query.name
    }
}

/// Include/exclude glob patterns on the instance a row describes.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    include: Vec<glob::Pattern>,
    exclude: Vec<glob::Pattern>,
}

impl InstanceFilter {
    /// Compile include and exclude patterns.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p).map_err(|e| {
                        AgentError::validation(format!("invalid pattern '{}': {}", p, e))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };

        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Check if an instance passes the filter.
    pub fn allows(&self, instance: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(instance)) {
            return false;
        }
        !self.exclude.iter().any(|p| p.matches(instance))
    }
}

/// A monitored target with everything needed to poll it.
#[derive(Debug)]
pub struct Endpoint {
    pub name: String,
    pub connection: ConnectionConfig,
    pub queries: Vec<Arc<RegisteredQuery>>,
    pub filter: InstanceFilter,
}

impl Endpoint {
    /// Create an endpoint without instance filters.
    pub fn new(
        name: impl Into<String>,
        connection: ConnectionConfig,
        queries: Vec<Arc<RegisteredQuery>>,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            queries,
            filter: InstanceFilter::default(),
        }
    }

    fn from_config(
        config: &EndpointConfig,
        queries: &HashMap<String, Arc<RegisteredQuery>>,
    ) -> Result<Self> {
        let resolved = config
            .queries
            .iter()
            .map(|name| {
                queries.get(name).cloned().ok_or_else(|| {
                    AgentError::validation(format!(
                        "endpoint '{}' references unknown query '{}'",
                        config.name, name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: config.name.clone(),
            connection: config.connection.clone(),
            queries: resolved,
            filter: InstanceFilter::new(&config.include, &config.exclude)?,
        })
    }
}

/// Immutable view of the registry used by one poll cycle.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// Incremented on every replace.
    pub generation: u64,
    pub endpoints: Vec<Arc<Endpoint>>,
}

impl RegistrySnapshot {
    /// Build a snapshot from configuration, compiling each query once.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let mut queries = HashMap::with_capacity(config.queries.len());
        for (name, query) in &config.queries {
            let mut query = query.clone();
            query.name = name.clone();
            queries.insert(name.clone(), Arc::new(RegisteredQuery::compile(query)?));
        }

        let endpoints = config
            .endpoints
            .iter()
            .map(|e| Endpoint::from_config(e, &queries).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            generation: 0,
            endpoints,
        })
    }

    /// Build a snapshot from already assembled endpoints.
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            generation: 0,
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn endpoint(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Holder of the current snapshot.
#[derive(Debug, Default)]
pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Swap in a new snapshot and return its generation.
    pub fn replace(&self, mut snapshot: RegistrySnapshot) -> u64 {
        let mut current = self.current.write();
        snapshot.generation = current.generation + 1;
        let generation = snapshot.generation;
        *current = Arc::new(snapshot);
        generation
    }
}
