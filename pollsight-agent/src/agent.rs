//! Poll cycle orchestration and scheduling.
//!
//! One cycle takes a registry snapshot, polls every endpoint concurrently,
//! maps and aggregates their rows inside the endpoint tasks, waits for all
//! tasks to settle and flushes the resulting batch exactly once.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

use pollsight_common::AgentInfo;

use crate::aggregator::Aggregator;
use crate::config::{AgentConfig, AgentSettings};
use crate::error::{PollError, Result};
use crate::health::{AgentHealth, EndpointStatus};
use crate::poller::{EndpointPoll, Poller};
use crate::rate::RateTracker;
use crate::registry::{Registry, RegistrySnapshot};
use crate::reporter::{FlushOutcome, HttpTransport, Reporter};
use crate::source::DefaultSourceFactory;

/// What one endpoint contributed to a cycle.
#[derive(Debug)]
pub struct EndpointSummary {
    pub endpoint: String,
    pub records: usize,
    pub error: Option<PollError>,
    pub elapsed: Duration,
}

/// Result of one poll cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub endpoints: Vec<EndpointSummary>,
    pub records: usize,
    pub duration: Duration,
    pub flush: FlushOutcome,
}

impl CycleReport {
    pub fn failed_endpoints(&self) -> usize {
        self.endpoints.iter().filter(|e| e.error.is_some()).count()
    }
}

/// The polling agent.
pub struct Agent {
    registry: Registry,
    poller: Poller,
    reporter: Reporter,
    rates: Arc<RateTracker>,
    health: AgentHealth,
    guid: String,
    agent_info: AgentInfo,
    poll_interval: Duration,
    cycles: AtomicU64,
}

impl Agent {
    /// Assemble an agent from its parts.
    pub fn new(
        snapshot: RegistrySnapshot,
        poller: Poller,
        reporter: Reporter,
        settings: &AgentSettings,
    ) -> Self {
        Self {
            registry: Registry::new(snapshot),
            poller,
            reporter,
            rates: Arc::new(RateTracker::new()),
            health: AgentHealth::new(),
            guid: settings.guid.clone(),
            agent_info: AgentInfo::current(settings.resolve_host()),
            poll_interval: settings.poll_interval(),
            cycles: AtomicU64::new(0),
        }
    }

    /// Build an agent with the built-in data sources and HTTP transport.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let snapshot = RegistrySnapshot::from_config(config)?;

        let factory = Arc::new(DefaultSourceFactory::new(config.agent.request_timeout()));
        let poller = Poller::new(
            factory,
            config.agent.max_concurrency,
            config.agent.endpoint_timeout(),
        );

        let reporter = if config.agent.collect_only {
            Reporter::collect_only(config.serialization)
        } else {
            let transport = HttpTransport::new(&config.upstream)?;
            Reporter::new(Arc::new(transport), config.serialization)
        };

        Ok(Self::new(snapshot, poller, reporter, &config.agent))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn health(&self) -> &AgentHealth {
        &self.health
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Replace endpoints and queries from a new configuration.
    ///
    /// On error the current registry stays in place. Scheduling, upstream and
    /// identity settings only take effect on restart.
    pub fn reload(&self, config: &AgentConfig) -> Result<u64> {
        let snapshot = RegistrySnapshot::from_config(config)?;
        let generation = self.registry.replace(snapshot);

        let current = self.registry.snapshot();
        self.retain_registered(&current);

        tracing::info!(generation, endpoints = current.len(), "Registry reloaded");
        Ok(generation)
    }

    /// Drop rate samples and health of endpoints not in `snapshot`.
    fn retain_registered(&self, snapshot: &RegistrySnapshot) {
        let names: HashSet<&str> = snapshot.endpoints.iter().map(|e| e.name.as_str()).collect();
        self.rates.retain_endpoints(|name| names.contains(name));
        self.health.retain(|name| names.contains(name));
    }

    /// Run one poll cycle and flush its batch.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle_id = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let start = Instant::now();
        let snapshot = self.registry.snapshot();

        let aggregator = Arc::new(Aggregator::new(cycle_id));
        for endpoint in &snapshot.endpoints {
            aggregator.register(&endpoint.name);
        }

        let summaries = {
            let aggregator = aggregator.clone();
            let rates = self.rates.clone();
            self.poller
                .poll_each(cycle_id, &snapshot.endpoints, move |poll| {
                    collect(poll, &aggregator, &rates)
                })
                .await
        };

        for summary in &summaries {
            match &summary.error {
                None => self.health.record_success(&summary.endpoint),
                Some(e) => self.health.record_failure(&summary.endpoint, e),
            };
        }

        // A reload while this cycle ran may have removed endpoints it just
        // recorded state for.
        let current = self.registry.snapshot();
        if current.generation != snapshot.generation {
            self.retain_registered(&current);
        }

        let batch = aggregator.seal(
            &self.guid,
            self.poll_interval.as_secs(),
            self.agent_info.clone(),
        );
        let records = batch.record_count();
        let flush = self.reporter.flush(batch).await;

        let duration = start.elapsed();
        self.health
            .record_cycle(duration.as_millis() as u64, records, flush.is_success());
        let health = self.health.snapshot();

        let report = CycleReport {
            cycle_id,
            endpoints: summaries,
            records,
            duration,
            flush,
        };

        tracing::info!(
            cycle = cycle_id,
            endpoints = report.endpoints.len(),
            failed = report.failed_endpoints(),
            online = health.endpoints_online,
            failing = health.endpoints_failed,
            records,
            duration_ms = duration.as_millis() as u64,
            flush = %report.flush,
            "Poll cycle complete"
        );

        report
    }

    /// Run cycles on the poll interval until `shutdown` turns true.
    ///
    /// A cycle in progress is always completed and flushed before the agent
    /// stops. Ticks missed while a cycle overruns are delayed, not replayed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.poll_interval.as_secs(),
            endpoints = self.registry.snapshot().len(),
            collect_only = self.reporter.is_collect_only(),
            "Starting poll loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            self.run_cycle().await;

            if *shutdown.borrow() {
                break;
            }
        }

        let health = self.health.snapshot();
        tracing::info!(
            cycles = health.cycles,
            uptime_secs = health.uptime_secs,
            records_flushed = health.records_flushed,
            flush_failures = health.flush_failures,
            "Poll loop stopped"
        );

        for endpoint in self.health.endpoints() {
            if endpoint.status != EndpointStatus::Online {
                tracing::warn!(
                    endpoint = %endpoint.endpoint,
                    status = %endpoint.status,
                    failures = endpoint.consecutive_failures,
                    error = endpoint.last_error.as_deref().unwrap_or(""),
                    "Endpoint not online at shutdown"
                );
            }
        }
    }
}

/// Map, filter and aggregate one endpoint's rows. Runs inside the endpoint task.
fn collect(poll: EndpointPoll, aggregator: &Aggregator, rates: &RateTracker) -> EndpointSummary {
    let endpoint = poll.endpoint;

    let outputs = match poll.outcome {
        Ok(outputs) => outputs,
        Err(error) => {
            return EndpointSummary {
                endpoint: endpoint.name.clone(),
                records: 0,
                error: Some(error),
                elapsed: poll.elapsed,
            };
        }
    };

    let at = Instant::now();
    let mut records = 0;

    for output in outputs {
        let mapper = &output.query.mapper;
        for row in &output.rows {
            if let Some(instance) = mapper.instance(row)
                && !endpoint.filter.allows(&instance)
            {
                tracing::trace!(
                    instance = %instance,
                    query = %mapper.query(),
                    "Instance filtered out"
                );
                continue;
            }

            let mapped = rates.apply(&endpoint.name, mapper.map(row), at);
            records += mapped.len();
            aggregator.extend(&endpoint.name, mapped);
        }
    }

    EndpointSummary {
        endpoint: endpoint.name.clone(),
        records,
        error: None,
        elapsed: poll.elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::error::ReportError;
    use crate::query::{FieldMapping, MetricQuery, QueryResult, QuerySource};
    use crate::registry::{Endpoint, InstanceFilter, RegisteredQuery};
    use crate::reporter::Transport;
    use crate::source::{DataSource, SourceFactory};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pollsight_common::{Format, Transform};

    struct CounterFactory {
        value: Arc<Mutex<i64>>,
        delay: Duration,
    }

    struct CounterSource {
        value: i64,
        delay: Duration,
    }

    #[async_trait]
    impl SourceFactory for CounterFactory {
        async fn connect(
            &self,
            _endpoint: &Endpoint,
        ) -> std::result::Result<Box<dyn DataSource>, PollError> {
            Ok(Box::new(CounterSource {
                value: *self.value.lock(),
                delay: self.delay,
            }))
        }
    }

    #[async_trait]
    impl DataSource for CounterSource {
        async fn fetch(
            &mut self,
            _query: &MetricQuery,
        ) -> std::result::Result<Vec<QueryResult>, PollError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![
                QueryResult::new()
                    .with("db", "northwind")
                    .with("reads", self.value),
                QueryResult::new()
                    .with("db", "tempdb")
                    .with("reads", self.value),
            ])
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        submissions: Mutex<usize>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn submit(
            &self,
            _payload: Vec<u8>,
            _content_type: &str,
        ) -> std::result::Result<(), ReportError> {
            *self.submissions.lock() += 1;
            Ok(())
        }
    }

    fn agent(value: Arc<Mutex<i64>>, transport: Arc<CountingTransport>) -> Agent {
        slow_agent(value, transport, Duration::ZERO)
    }

    fn slow_agent(
        value: Arc<Mutex<i64>>,
        transport: Arc<CountingTransport>,
        delay: Duration,
    ) -> Agent {
        let query = Arc::new(
            RegisteredQuery::compile(MetricQuery {
                name: "io".to_string(),
                source: QuerySource::Sql {
                    statement: "SELECT db, reads FROM io".to_string(),
                    params: vec![],
                },
                metric_prefix: "Databases".to_string(),
                instance_field: Some("db".to_string()),
                fields: vec![FieldMapping::new("reads", "{db}/Reads", Transform::Rate)],
            })
            .unwrap(),
        );
        let mut endpoint = Endpoint::new(
            "sql01",
            ConnectionConfig::Sql {
                path: "sql01.db".to_string(),
            },
            vec![query],
        );
        endpoint.filter = InstanceFilter::new(&[], &["temp*".to_string()]).unwrap();

        let factory = Arc::new(CounterFactory { value, delay });
        let poller = Poller::new(factory, 4, Duration::from_secs(5));
        let settings = AgentSettings {
            host: "agent-host".to_string(),
            ..Default::default()
        };
        Agent::new(
            RegistrySnapshot::from_endpoints(vec![endpoint]),
            poller,
            Reporter::new(transport, Format::Json),
            &settings,
        )
    }

    #[tokio::test]
    async fn test_rate_needs_two_cycles_and_filter_applies() {
        let value = Arc::new(Mutex::new(100));
        let transport = Arc::new(CountingTransport::default());
        let agent = agent(value.clone(), transport.clone());

        let first = agent.run_cycle().await;
        assert_eq!(first.cycle_id, 1);
        assert_eq!(first.records, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        *value.lock() = 200;
        let second = agent.run_cycle().await;

        assert_eq!(second.cycle_id, 2);
        assert_eq!(second.records, 1);
        assert_eq!(second.endpoints[0].records, 1);
        assert_eq!(*transport.submissions.lock(), 2);
        assert!(second.flush.is_success());

        let health = agent.health().snapshot();
        assert_eq!(health.cycles, 2);
        assert_eq!(health.endpoints_online, 1);
    }

    #[tokio::test]
    async fn test_reload_replaces_endpoints() {
        let transport = Arc::new(CountingTransport::default());
        let agent = agent(Arc::new(Mutex::new(1)), transport);
        agent.run_cycle().await;
        assert!(agent.health().endpoint("sql01").is_some());

        let config = AgentConfig::parse("{ agent: { collect_only: true } }").unwrap();
        let generation = agent.reload(&config).unwrap();

        assert_eq!(generation, 1);
        assert!(agent.registry().snapshot().is_empty());
        assert!(agent.health().endpoint("sql01").is_none());

        let report = agent.run_cycle().await;
        assert!(report.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_reload_during_cycle_drops_removed_state() {
        let transport = Arc::new(CountingTransport::default());
        let agent = Arc::new(slow_agent(
            Arc::new(Mutex::new(1)),
            transport,
            Duration::from_millis(200),
        ));

        let cycle = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run_cycle().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let config = AgentConfig::parse("{ agent: { collect_only: true } }").unwrap();
        agent.reload(&config).unwrap();
        assert!(agent.rates.is_empty());

        let report = cycle.await.unwrap();

        // the cycle still polled the endpoint it started with
        assert_eq!(report.endpoints.len(), 1);
        assert!(agent.health().endpoint("sql01").is_none());
        assert!(agent.rates.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let transport = Arc::new(CountingTransport::default());
        let agent = Arc::new(agent(Arc::new(Mutex::new(1)), transport.clone()));
        let (tx, rx) = watch::channel(false);

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(rx).await })
        };

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        runner.await.unwrap();

        assert_eq!(*transport.submissions.lock(), 1);
    }
}
