//! Agent health and per-endpoint liveness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use pollsight_common::current_timestamp_millis;

use crate::error::{ErrorType, PollError};

/// Consecutive failed cycles after which an endpoint is reported offline.
const OFFLINE_AFTER: u32 = 3;

/// Endpoint availability status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Last poll succeeded.
    Online,
    /// Failing, but not yet long enough to be considered offline.
    Degraded,
    /// Failed several cycles in a row.
    Offline,
    /// Never polled.
    #[default]
    Unknown,
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointStatus::Online => write!(f, "online"),
            EndpointStatus::Degraded => write!(f, "degraded"),
            EndpointStatus::Offline => write!(f, "offline"),
            EndpointStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Liveness of one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub status: EndpointStatus,
    /// Last successful poll (millis since epoch, 0 if never).
    pub last_seen: i64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_type: Option<ErrorType>,
}

/// Health snapshot for logging and serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub uptime_secs: u64,
    pub cycles: u64,
    pub endpoints_total: u64,
    pub endpoints_online: u64,
    pub endpoints_failed: u64,
    pub records_flushed: u64,
    pub flush_failures: u64,
    pub last_cycle_duration_ms: u64,
}

/// Agent health tracker.
#[derive(Debug)]
pub struct AgentHealth {
    start_time: Instant,
    cycles: AtomicU64,
    records_flushed: AtomicU64,
    flush_failures: AtomicU64,
    last_cycle_duration_ms: AtomicU64,
    endpoints: RwLock<HashMap<String, EndpointHealth>>,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentHealth {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            cycles: AtomicU64::new(0),
            records_flushed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            last_cycle_duration_ms: AtomicU64::new(0),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Record that an endpoint poll succeeded. Returns the new status if it
    /// changed.
    pub fn record_success(&self, endpoint: &str) -> Option<EndpointStatus> {
        let previous = {
            let mut endpoints = self.endpoints.write();
            let state = entry(&mut endpoints, endpoint);
            let previous = state.status;

            state.status = EndpointStatus::Online;
            state.last_seen = current_timestamp_millis();
            state.consecutive_failures = 0;
            state.last_error = None;
            state.last_error_type = None;
            previous
        };

        match previous {
            EndpointStatus::Online => None,
            EndpointStatus::Unknown => {
                tracing::debug!(endpoint, "Endpoint online");
                Some(EndpointStatus::Online)
            }
            EndpointStatus::Degraded | EndpointStatus::Offline => {
                tracing::info!(endpoint, previous = %previous, "Endpoint recovered");
                Some(EndpointStatus::Online)
            }
        }
    }

    /// Record that an endpoint poll failed. Returns the new status if it
    /// changed.
    pub fn record_failure(&self, endpoint: &str, error: &PollError) -> Option<EndpointStatus> {
        let (previous, status, failures) = {
            let mut endpoints = self.endpoints.write();
            let state = entry(&mut endpoints, endpoint);
            let previous = state.status;

            state.consecutive_failures += 1;
            state.last_error = Some(error.to_string());
            state.last_error_type = Some(error.error_type());
            state.status = if state.consecutive_failures >= OFFLINE_AFTER {
                EndpointStatus::Offline
            } else {
                EndpointStatus::Degraded
            };
            (previous, state.status, state.consecutive_failures)
        };

        if status == previous {
            return None;
        }
        if status == EndpointStatus::Offline {
            tracing::warn!(endpoint, failures, error = %error, "Endpoint offline");
        } else {
            tracing::debug!(endpoint, previous = %previous, error = %error, "Endpoint degraded");
        }
        Some(status)
    }

    /// Record a finished cycle.
    pub fn record_cycle(&self, duration_ms: u64, records: usize, flushed: bool) {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        self.last_cycle_duration_ms
            .store(duration_ms, Ordering::SeqCst);
        if flushed {
            self.records_flushed
                .fetch_add(records as u64, Ordering::SeqCst);
        } else {
            self.flush_failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Forget endpoints for which `keep` returns false.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) {
        self.endpoints.write().retain(|name, _| keep(name));
    }

    /// Liveness of one endpoint.
    pub fn endpoint(&self, endpoint: &str) -> Option<EndpointHealth> {
        self.endpoints.read().get(endpoint).cloned()
    }

    /// Liveness of every known endpoint, sorted by name.
    pub fn endpoints(&self) -> Vec<EndpointHealth> {
        let mut all: Vec<_> = self.endpoints.read().values().cloned().collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }

    /// Get a snapshot of current health metrics.
    pub fn snapshot(&self) -> HealthSnapshot {
        let endpoints = self.endpoints.read();
        let online = endpoints
            .values()
            .filter(|e| e.status == EndpointStatus::Online)
            .count() as u64;
        let failed = endpoints
            .values()
            .filter(|e| matches!(e.status, EndpointStatus::Degraded | EndpointStatus::Offline))
            .count() as u64;

        HealthSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            cycles: self.cycles.load(Ordering::SeqCst),
            endpoints_total: endpoints.len() as u64,
            endpoints_online: online,
            endpoints_failed: failed,
            records_flushed: self.records_flushed.load(Ordering::SeqCst),
            flush_failures: self.flush_failures.load(Ordering::SeqCst),
            last_cycle_duration_ms: self.last_cycle_duration_ms.load(Ordering::SeqCst),
        }
    }
}

fn entry<'a>(
    endpoints: &'a mut HashMap<String, EndpointHealth>,
    endpoint: &str,
) -> &'a mut EndpointHealth {
    endpoints
        .entry(endpoint.to_string())
        .or_insert_with(|| EndpointHealth {
            endpoint: endpoint.to_string(),
            ..Default::default()
        })
}
