use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// How the upstream collector should interpret a metric value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    /// Discrete count of things (connections, sessions).
    Count,

    /// Point-in-time measurement (bytes used, percent).
    #[default]
    Value,

    /// Per-second rate derived from a monotonically increasing counter.
    Rate,
}

impl Transform {
    /// Get the string representation used in payloads and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transform::Count => "count",
            Transform::Value => "value",
            Transform::Rate => "rate",
        }
    }
}

impl std::fmt::Display for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Numeric value of a metric record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    /// Signed integral value (already clamped to its target type).
    Int(i64),

    /// Unsigned integral value (already clamped to its target type).
    UInt(u64),

    /// Floating point value.
    Float(f64),
}

impl MetricValue {
    /// Get the value as an `f64`.
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Int(v) => *v as f64,
            MetricValue::UInt(v) => *v as f64,
            MetricValue::Float(v) => *v,
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::UInt(v)
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

/// One normalized measurement ready for upstream submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Full metric name (e.g., "Component/Databases/northwind/Reads").
    pub name: String,

    /// Unit of the value (e.g., "bytes", "conn/sec").
    pub unit: String,

    /// The measured value.
    pub value: MetricValue,

    /// How the value should be interpreted.
    pub transform: Transform,
}

impl MetricRecord {
    /// Create a new metric record.
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        value: MetricValue,
        transform: Transform,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            value,
            transform,
        }
    }
}

/// All records of one endpoint for one poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentReport {
    /// Component name (the endpoint name).
    pub name: String,

    /// Component type identifier shared by every component of this agent.
    pub guid: String,

    /// Seconds covered by these measurements (the poll interval).
    #[serde(default)]
    pub duration_secs: u64,

    /// Records in query order.
    #[serde(default)]
    pub metrics: Vec<MetricRecord>,
}

impl ComponentReport {
    /// Create an empty component report.
    pub fn new(name: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guid: guid.into(),
            duration_secs: 0,
            metrics: Vec::new(),
        }
    }
}

/// Identity of the reporting agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Host the agent runs on.
    pub host: String,

    /// Process id of the agent.
    pub pid: u32,

    /// Agent version.
    pub version: String,
}

impl AgentInfo {
    /// Describe the current process on `host`.
    pub fn current(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Every record of one poll cycle, submitted upstream as a single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBatch {
    /// Poll cycle this batch belongs to.
    pub cycle_id: u64,

    /// Unix epoch milliseconds when the batch was sealed.
    pub timestamp: i64,

    /// Reporting agent.
    pub agent: AgentInfo,

    /// One entry per polled endpoint.
    pub components: Vec<ComponentReport>,
}

impl ReportBatch {
    /// Create a batch stamped with the current time.
    pub fn new(cycle_id: u64, components: Vec<ComponentReport>) -> Self {
        Self {
            cycle_id,
            timestamp: current_timestamp_millis(),
            agent: AgentInfo::current("localhost"),
            components,
        }
    }

    /// Replace the agent identity.
    pub fn with_agent(mut self, agent: AgentInfo) -> Self {
        self.agent = agent;
        self
    }

    /// Total number of records across all components.
    pub fn record_count(&self) -> usize {
        self.components.iter().map(|c| c.metrics.len()).sum()
    }

    /// Look up a component by name.
    pub fn component(&self, name: &str) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
