//! Integration tests for the poll, map, aggregate and report pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use pollsight_agent::agent::Agent;
use pollsight_agent::config::{AgentConfig, AgentSettings, ConnectionConfig};
use pollsight_agent::error::{PollError, ReportError};
use pollsight_agent::poller::Poller;
use pollsight_agent::query::{FieldMapping, MetricQuery, NumericType, QueryResult, QuerySource};
use pollsight_agent::registry::{Endpoint, RegisteredQuery, RegistrySnapshot};
use pollsight_agent::reporter::{Reporter, Transport};
use pollsight_agent::source::{DataSource, DefaultSourceFactory, SourceFactory};
use pollsight_common::{Format, MetricValue, ReportBatch, Transform, decode};

/// Rows served per endpoint name; endpoints without rows refuse connections.
#[derive(Default)]
struct FakeFactory {
    rows: HashMap<String, Vec<QueryResult>>,
}

struct FakeSource {
    rows: Vec<QueryResult>,
}

#[async_trait]
impl SourceFactory for FakeFactory {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DataSource>, PollError> {
        match self.rows.get(&endpoint.name) {
            Some(rows) => Ok(Box::new(FakeSource { rows: rows.clone() })),
            None => Err(PollError::ConnectionRefused(format!(
                "{}: connection refused",
                endpoint.name
            ))),
        }
    }
}

#[async_trait]
impl DataSource for FakeSource {
    async fn fetch(&mut self, _query: &MetricQuery) -> Result<Vec<QueryResult>, PollError> {
        Ok(self.rows.clone())
    }
}

/// Transport that keeps every submitted payload.
#[derive(Default)]
struct RecordingTransport {
    payloads: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn submit(&self, payload: Vec<u8>, _content_type: &str) -> Result<(), ReportError> {
        self.payloads.lock().push(payload);
        Ok(())
    }
}

fn three_metric_query() -> Arc<RegisteredQuery> {
    Arc::new(
        RegisteredQuery::compile(MetricQuery {
            name: "device".to_string(),
            source: QuerySource::Sql {
                statement: "SELECT connections, memory, waits FROM stats".to_string(),
                params: vec![],
            },
            metric_prefix: "Component".to_string(),
            instance_field: None,
            fields: vec![
                FieldMapping::new("connections", "Connections/Current", Transform::Count),
                FieldMapping::new("memory", "Memory/Used", Transform::Value).with_unit("bytes"),
                FieldMapping::new("waits", "Waits/Total", Transform::Count)
                    .with_target(NumericType::I32),
            ],
        })
        .unwrap(),
    )
}

fn stats_row(waits: i64) -> QueryResult {
    QueryResult::new()
        .with("connections", 12i64)
        .with("memory", 4096.0)
        .with("waits", waits)
}

fn endpoint(name: &str, query: &Arc<RegisteredQuery>) -> Endpoint {
    Endpoint::new(
        name,
        ConnectionConfig::Sql {
            path: format!("{}.db", name),
        },
        vec![query.clone()],
    )
}

fn build_agent(factory: FakeFactory, endpoints: Vec<Endpoint>, reporter: Reporter) -> Agent {
    let poller = Poller::new(Arc::new(factory), 8, Duration::from_secs(5));
    let settings = AgentSettings {
        host: "test-host".to_string(),
        guid: "com.example.device".to_string(),
        ..Default::default()
    };
    Agent::new(
        RegistrySnapshot::from_endpoints(endpoints),
        poller,
        reporter,
        &settings,
    )
}

fn submitted(transport: &RecordingTransport) -> Vec<ReportBatch> {
    transport
        .payloads
        .lock()
        .iter()
        .map(|p| decode(p, Format::Json).unwrap())
        .collect()
}

#[tokio::test]
async fn test_unreachable_endpoint_has_zero_records() {
    let query = three_metric_query();
    let mut factory = FakeFactory::default();
    factory.rows.insert("up".to_string(), vec![stats_row(1)]);

    let transport = Arc::new(RecordingTransport::default());
    let agent = build_agent(
        factory,
        vec![endpoint("up", &query), endpoint("down", &query)],
        Reporter::new(transport.clone(), Format::Json),
    );

    let report = agent.run_cycle().await;
    assert_eq!(report.failed_endpoints(), 1);

    let batches = submitted(&transport);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].component("up").unwrap().metrics.len(), 3);
    assert!(batches[0].component("down").unwrap().metrics.is_empty());

    let down = agent.health().endpoint("down").unwrap();
    assert_eq!(down.consecutive_failures, 1);
}

#[tokio::test]
async fn test_value_above_target_clamps_to_max() {
    let query = three_metric_query();
    let mut factory = FakeFactory::default();
    factory
        .rows
        .insert("db".to_string(), vec![stats_row(9_000_000_000)]);

    let transport = Arc::new(RecordingTransport::default());
    let agent = build_agent(
        factory,
        vec![endpoint("db", &query)],
        Reporter::new(transport.clone(), Format::Json),
    );

    agent.run_cycle().await;

    let batch = &submitted(&transport)[0];
    let waits = batch
        .component("db")
        .unwrap()
        .metrics
        .iter()
        .find(|m| m.name == "Component/Waits/Total")
        .unwrap();
    assert_eq!(waits.value, MetricValue::Int(i32::MAX as i64));
}

#[tokio::test]
async fn test_one_submission_per_cycle() {
    for count in [1usize, 50] {
        let query = three_metric_query();
        let mut factory = FakeFactory::default();
        let endpoints = (0..count)
            .map(|i| {
                let name = format!("ep{:02}", i);
                factory.rows.insert(name.clone(), vec![stats_row(1)]);
                endpoint(&name, &query)
            })
            .collect();

        let transport = Arc::new(RecordingTransport::default());
        let agent = build_agent(
            factory,
            endpoints,
            Reporter::new(transport.clone(), Format::Json),
        );

        let report = agent.run_cycle().await;

        let batches = submitted(&transport);
        assert_eq!(batches.len(), 1, "{} endpoints", count);
        assert_eq!(batches[0].components.len(), count);
        assert_eq!(report.records, count * 3);
    }
}

#[tokio::test]
async fn test_collect_only_accumulates_without_submitting() {
    let query = three_metric_query();
    let mut factory = FakeFactory::default();
    factory.rows.insert("db".to_string(), vec![stats_row(1)]);

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let reporter =
        Reporter::collect_only(Format::Json).with_hook(move |batch| sink.lock().push(batch.clone()));

    let agent = build_agent(factory, vec![endpoint("db", &query)], reporter);
    let report = agent.run_cycle().await;

    assert!(report.flush.is_success());
    let observed = observed.lock();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].record_count(), 3);
    assert_eq!(observed[0].agent.host, "test-host");
}

#[tokio::test]
async fn test_two_endpoints_three_metrics_grouped() {
    let query = three_metric_query();
    let mut factory = FakeFactory::default();
    factory.rows.insert("alpha".to_string(), vec![stats_row(1)]);
    factory.rows.insert("beta".to_string(), vec![stats_row(2)]);

    let transport = Arc::new(RecordingTransport::default());
    let agent = build_agent(
        factory,
        vec![endpoint("alpha", &query), endpoint("beta", &query)],
        Reporter::new(transport.clone(), Format::Json),
    );

    agent.run_cycle().await;

    let batch = &submitted(&transport)[0];
    assert_eq!(batch.record_count(), 6);
    for component in &batch.components {
        assert_eq!(component.guid, "com.example.device");
        let names: Vec<&str> = component.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Component/Connections/Current",
                "Component/Memory/Used",
                "Component/Waits/Total"
            ]
        );
    }
    assert_eq!(
        batch.component("beta").unwrap().metrics[2].value,
        MetricValue::Int(2)
    );
}

#[tokio::test]
async fn test_sqlite_endpoint_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("inventory.db");
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE databases (name TEXT, size_kb INTEGER, sessions INTEGER);
             INSERT INTO databases VALUES ('northwind', 2048, 7);
             INSERT INTO databases VALUES ('tempdb', 512, 2);
             INSERT INTO databases VALUES ('pubs', 128, NULL);",
        )
        .unwrap();
    }

    let content = format!(
        r#"{{
            agent: {{ collect_only: true, guid: "com.example.sqlite" }},
            queries: {{
                databases: {{
                    source: {{ sql: {{ statement: "SELECT name, size_kb, sessions FROM databases ORDER BY name" }} }},
                    metric_prefix: "Databases",
                    instance_field: "name",
                    fields: [
                        {{ field: "size_kb", metric: "{{name}}/Size", unit: "bytes", scale: 1024, target: "u64" }},
                        {{ field: "sessions", metric: "{{name}}/Sessions", transform: "count" }},
                    ],
                }},
            }},
            endpoints: [
                {{
                    name: "inventory",
                    connection: {{ sql: {{ path: {:?} }} }},
                    queries: ["databases"],
                    exclude: ["temp*"],
                }},
                {{
                    name: "missing",
                    connection: {{ sql: {{ path: {:?} }} }},
                    queries: ["databases"],
                }},
            ],
        }}"#,
        db_path.to_str().unwrap(),
        dir.path().join("absent.db").to_str().unwrap(),
    );
    let config = AgentConfig::parse(&content).unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let reporter =
        Reporter::collect_only(Format::Json).with_hook(move |batch| sink.lock().push(batch.clone()));
    let poller = Poller::new(
        Arc::new(DefaultSourceFactory::default()),
        config.agent.max_concurrency,
        config.agent.endpoint_timeout(),
    );
    let agent = Agent::new(
        RegistrySnapshot::from_config(&config).unwrap(),
        poller,
        reporter,
        &config.agent,
    );

    let report = agent.run_cycle().await;
    assert_eq!(report.failed_endpoints(), 1);

    let observed = observed.lock();
    let inventory = observed[0].component("inventory").unwrap();
    let names: Vec<&str> = inventory.metrics.iter().map(|m| m.name.as_str()).collect();
    // pubs has a NULL session count, tempdb is excluded
    assert_eq!(
        names,
        vec![
            "Databases/northwind/Size",
            "Databases/northwind/Sessions",
            "Databases/pubs/Size"
        ]
    );
    assert_eq!(inventory.metrics[0].value, MetricValue::UInt(2048 * 1024));
    assert_eq!(inventory.guid, "com.example.sqlite");
    assert!(observed[0].component("missing").unwrap().metrics.is_empty());
}
