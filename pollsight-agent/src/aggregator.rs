//! Per-cycle accumulation of metric records, grouped by endpoint.

use std::collections::HashMap;

use parking_lot::Mutex;

use pollsight_common::{AgentInfo, ComponentReport, MetricRecord, ReportBatch};

/// Accumulates the records of one poll cycle.
///
/// Shared by all endpoint tasks of the cycle. Records of one endpoint keep
/// insertion order; there is no ordering between endpoints until [`seal`]
/// sorts components by name.
///
/// [`seal`]: Aggregator::seal
#[derive(Debug)]
pub struct Aggregator {
    cycle_id: u64,
    records: Mutex<HashMap<String, Vec<MetricRecord>>>,
}

impl Aggregator {
    pub fn new(cycle_id: u64) -> Self {
        Self {
            cycle_id,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn cycle_id(&self) -> u64 {
        self.cycle_id
    }

    /// Make sure `endpoint` appears in the batch even if it adds nothing.
    pub fn register(&self, endpoint: &str) {
        self.records.lock().entry(endpoint.to_string()).or_default();
    }

    /// Add one record for `endpoint`.
    pub fn add(&self, endpoint: &str, record: MetricRecord) {
        self.records
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push(record);
    }

    /// Add several records for `endpoint` under a single lock.
    pub fn extend(&self, endpoint: &str, records: impl IntoIterator<Item = MetricRecord>) {
        self.records
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .extend(records);
    }

    /// Number of records accumulated so far.
    pub fn record_count(&self) -> usize {
        self.records.lock().values().map(Vec::len).sum()
    }

    /// Records of one endpoint.
    pub fn records(&self, endpoint: &str) -> Vec<MetricRecord> {
        self.records
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    /// Drain the accumulated records into the cycle's batch.
    pub fn seal(&self, guid: &str, duration_secs: u64, agent: AgentInfo) -> ReportBatch {
        let drained = std::mem::take(&mut *self.records.lock());
        let mut components: Vec<ComponentReport> = drained
            .into_iter()
            .map(|(name, metrics)| ComponentReport {
                name,
                guid: guid.to_string(),
                duration_secs,
                metrics,
            })
            .collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));

        ReportBatch::new(self.cycle_id, components).with_agent(agent)
    }
}
