//! Concurrent, failure-isolated polling of all endpoints for one cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::Instrument;

use crate::error::PollError;
use crate::query::QueryResult;
use crate::registry::{Endpoint, RegisteredQuery};
use crate::source::SourceFactory;

/// Rows returned by one query of an endpoint.
#[derive(Debug)]
pub struct QueryOutput {
    pub query: Arc<RegisteredQuery>,
    pub rows: Vec<QueryResult>,
}

/// Everything one endpoint produced in one cycle.
#[derive(Debug)]
pub struct EndpointPoll {
    pub endpoint: Arc<Endpoint>,
    pub cycle_id: u64,
    /// Query outputs in query order, or the connectivity error that voided
    /// the whole endpoint.
    pub outcome: Result<Vec<QueryOutput>, PollError>,
    pub elapsed: Duration,
}

impl EndpointPoll {
    /// Total rows across all queries (zero for a failed endpoint).
    pub fn row_count(&self) -> usize {
        match &self.outcome {
            Ok(outputs) => outputs.iter().map(|o| o.rows.len()).sum(),
            Err(_) => 0,
        }
    }
}

/// Polls endpoints through data sources from an injected factory.
pub struct Poller {
    factory: Arc<dyn SourceFactory>,
    max_concurrency: usize,
    endpoint_timeout: Duration,
}

impl Poller {
    pub fn new(
        factory: Arc<dyn SourceFactory>,
        max_concurrency: usize,
        endpoint_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            max_concurrency: max_concurrency.max(1),
            endpoint_timeout,
        }
    }

    /// Poll every endpoint and return their results in endpoint order.
    pub async fn poll(&self, cycle_id: u64, endpoints: &[Arc<Endpoint>]) -> Vec<EndpointPoll> {
        self.poll_each(cycle_id, endpoints, |poll| poll).await
    }

    /// Poll every endpoint, running `handler` on each endpoint's result inside
    /// that endpoint's task, and return the handler outputs in endpoint order.
    ///
    /// Returns once every endpoint task has settled. A task that panics is
    /// logged and missing from the output.
    pub async fn poll_each<F, T>(
        &self,
        cycle_id: u64,
        endpoints: &[Arc<Endpoint>],
        handler: F,
    ) -> Vec<T>
    where
        F: Fn(EndpointPoll) -> T + Send + Sync + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let handler = Arc::new(handler);
        let mut tasks = JoinSet::new();

        for (index, endpoint) in endpoints.iter().enumerate() {
            let semaphore = semaphore.clone();
            let handler = handler.clone();
            let factory = self.factory.clone();
            let endpoint = endpoint.clone();
            let endpoint_timeout = self.endpoint_timeout;
            let span = tracing::info_span!("endpoint", endpoint = %endpoint.name, cycle = cycle_id);

            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let poll =
                        poll_endpoint(factory.as_ref(), endpoint, cycle_id, endpoint_timeout).await;
                    (index, handler(poll))
                }
                .instrument(span),
            );
        }

        let mut results = Vec::with_capacity(endpoints.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(cycle = cycle_id, error = %e, "Endpoint task failed"),
            }
        }

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, output)| output).collect()
    }
}

async fn poll_endpoint(
    factory: &dyn SourceFactory,
    endpoint: Arc<Endpoint>,
    cycle_id: u64,
    endpoint_timeout: Duration,
) -> EndpointPoll {
    let start = Instant::now();

    let outcome = match timeout(endpoint_timeout, run_queries(factory, &endpoint)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(PollError::Timeout(endpoint_timeout.as_millis() as u64)),
    };

    match &outcome {
        Ok(outputs) => tracing::debug!(
            queries = outputs.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Endpoint polled"
        ),
        Err(e) => tracing::warn!(
            error = %e,
            error_type = %e.error_type(),
            "Endpoint poll failed, skipping for this cycle"
        ),
    }

    EndpointPoll {
        endpoint,
        cycle_id,
        outcome,
        elapsed: start.elapsed(),
    }
}

async fn run_queries(
    factory: &dyn SourceFactory,
    endpoint: &Endpoint,
) -> Result<Vec<QueryOutput>, PollError> {
    let mut source = factory.connect(endpoint).await?;
    let mut outputs = Vec::with_capacity(endpoint.queries.len());

    for registered in &endpoint.queries {
        match source.fetch(&registered.query).await {
            Ok(rows) => outputs.push(QueryOutput {
                query: registered.clone(),
                rows,
            }),
            Err(e) if e.is_connectivity() => return Err(e),
            Err(e) => {
                tracing::warn!(query = %registered.name(), error = %e, "Query failed, skipping");
            }
        }
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::query::{FieldMapping, MetricQuery, QuerySource};
    use crate::source::DataSource;
    use async_trait::async_trait;
    use pollsight_common::Transform;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Behavior {
        Rows(usize),
        Refuse,
        Hang,
        QueryFails(&'static str),
    }

    struct FakeFactory {
        behaviors: HashMap<String, Behavior>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct FakeSource {
        behavior: Behavior,
        running: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceFactory for FakeFactory {
        async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn DataSource>, PollError> {
            let behavior = self.behaviors[&endpoint.name].clone();
            if let Behavior::Refuse = behavior {
                return Err(PollError::ConnectionRefused(endpoint.name.clone()));
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(FakeSource {
                behavior,
                running: self.running.clone(),
            }))
        }
    }

    impl Drop for FakeSource {
        fn drop(&mut self) {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DataSource for FakeSource {
        async fn fetch(&mut self, query: &MetricQuery) -> Result<Vec<QueryResult>, PollError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            match &self.behavior {
                Behavior::Rows(n) => Ok((0..*n as i64)
                    .map(|i| QueryResult::new().with("v", i))
                    .collect()),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(vec![])
                }
                Behavior::QueryFails(name) if query.name == *name => {
                    Err(PollError::query(&query.name, "syntax error"))
                }
                Behavior::QueryFails(_) => Ok(vec![QueryResult::new().with("v", 1i64)]),
                Behavior::Refuse => unreachable!(),
            }
        }
    }

    fn registered(name: &str) -> Arc<RegisteredQuery> {
        Arc::new(
            RegisteredQuery::compile(MetricQuery {
                name: name.to_string(),
                source: QuerySource::Sql {
                    statement: "SELECT v".to_string(),
                    params: vec![],
                },
                metric_prefix: String::new(),
                instance_field: None,
                fields: vec![FieldMapping::new("v", "V", Transform::Value)],
            })
            .unwrap(),
        )
    }

    fn setup(
        endpoints: &[(&str, Behavior)],
        max_concurrency: usize,
    ) -> (Poller, Vec<Arc<Endpoint>>, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let factory = FakeFactory {
            behaviors: endpoints
                .iter()
                .map(|(n, b)| (n.to_string(), b.clone()))
                .collect(),
            running: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        };
        let queries = vec![registered("first"), registered("second")];
        let endpoints = endpoints
            .iter()
            .map(|(name, _)| {
                Arc::new(Endpoint::new(
                    *name,
                    ConnectionConfig::Sql {
                        path: format!("{}.db", name),
                    },
                    queries.clone(),
                ))
            })
            .collect();
        let poller = Poller::new(
            Arc::new(factory),
            max_concurrency,
            Duration::from_millis(200),
        );
        (poller, endpoints, peak)
    }

    #[tokio::test]
    async fn test_failure_isolated_per_endpoint() {
        let (poller, endpoints, _) = setup(
            &[
                ("ok1", Behavior::Rows(2)),
                ("refused", Behavior::Refuse),
                ("ok2", Behavior::Rows(3)),
            ],
            8,
        );

        let polls = poller.poll(7, &endpoints).await;

        assert_eq!(polls.len(), 3);
        assert_eq!(polls[0].endpoint.name, "ok1");
        assert_eq!(polls[0].row_count(), 4);
        assert!(matches!(
            polls[1].outcome,
            Err(PollError::ConnectionRefused(_))
        ));
        assert_eq!(polls[1].row_count(), 0);
        assert_eq!(polls[2].row_count(), 6);
        assert!(polls.iter().all(|p| p.cycle_id == 7));
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_siblings() {
        let (poller, endpoints, _) =
            setup(&[("slow", Behavior::Hang), ("fast", Behavior::Rows(1))], 8);

        let polls = poller.poll(1, &endpoints).await;

        assert!(matches!(polls[0].outcome, Err(PollError::Timeout(200))));
        assert_eq!(polls[1].row_count(), 2);
    }

    #[tokio::test]
    async fn test_query_error_skips_only_that_query() {
        let (poller, endpoints, _) = setup(&[("db", Behavior::QueryFails("first"))], 8);

        let polls = poller.poll(1, &endpoints).await;
        let outputs = polls[0].outcome.as_ref().unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].query.name(), "second");
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let endpoints: Vec<(String, Behavior)> = (0..12)
            .map(|i| (format!("ep{}", i), Behavior::Rows(1)))
            .collect();
        let refs: Vec<(&str, Behavior)> = endpoints
            .iter()
            .map(|(n, b)| (n.as_str(), b.clone()))
            .collect();
        let (poller, endpoints, peak) = setup(&refs, 3);

        let polls = poller.poll(1, &endpoints).await;

        assert_eq!(polls.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_handler_runs_per_endpoint() {
        let behaviors = [("a", Behavior::Rows(1)), ("b", Behavior::Refuse)];
        let (poller, endpoints, _) = setup(&behaviors, 8);

        let summarize = |poll: EndpointPoll| (poll.endpoint.name.clone(), poll.outcome.is_ok());
        let names = poller.poll_each(3, &endpoints, summarize).await;

        assert_eq!(names, vec![("a".to_string(), true), ("b".to_string(), false)]);
    }
}
