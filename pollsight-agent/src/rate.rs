//! Per-second rates from counter samples across poll cycles.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use pollsight_common::{MetricRecord, MetricValue, Transform};

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    at: Instant,
}

/// Last counter sample per endpoint and metric name.
///
/// State lives in memory only: after a restart every rate metric needs one
/// cycle to re-establish its baseline.
#[derive(Debug, Default)]
pub struct RateTracker {
    samples: Mutex<HashMap<(String, String), Sample>>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a counter sample and return the rate since the previous one.
    ///
    /// Returns `None` for the first sample, for a counter that went backwards
    /// (the new value becomes the baseline) and when no time has elapsed.
    pub fn observe(&self, endpoint: &str, metric: &str, value: f64, at: Instant) -> Option<f64> {
        let mut samples = self.samples.lock();
        let previous = samples.insert(
            (endpoint.to_string(), metric.to_string()),
            Sample { value, at },
        )?;

        let elapsed = at.checked_duration_since(previous.at)?.as_secs_f64();
        let delta = value - previous.value;

        if delta < 0.0 {
            tracing::debug!(endpoint, metric, "Counter reset, rebasing");
            return None;
        }
        if elapsed <= 0.0 {
            return None;
        }

        Some(delta / elapsed)
    }

    /// Replace the counter value of every rate record with its per-second
    /// rate. Records without a rate yet are dropped; other records pass
    /// through untouched.
    pub fn apply(
        &self,
        endpoint: &str,
        records: Vec<MetricRecord>,
        at: Instant,
    ) -> Vec<MetricRecord> {
        records
            .into_iter()
            .filter_map(|mut record| {
                if record.transform != Transform::Rate {
                    return Some(record);
                }
                let rate = self.observe(endpoint, &record.name, record.value.as_f64(), at)?;
                record.value = MetricValue::Float(rate);
                Some(record)
            })
            .collect()
    }

    /// Forget samples of endpoints for which `keep` returns false.
    pub fn retain_endpoints(&self, keep: impl Fn(&str) -> bool) {
        self.samples
            .lock()
            .retain(|(endpoint, _), _| keep(endpoint));
    }

    /// Number of tracked counters.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}
