//! pollsight agent
//!
//! Polls SNMP devices and SQL databases on a fixed interval, maps each raw
//! result field into a typed [`MetricRecord`](pollsight_common::MetricRecord)
//! through a declarative field table, and submits one batch per cycle to an
//! upstream collector.
//!
//! - [`registry`] - Endpoints and compiled queries, swapped wholesale on reload
//! - [`poller`] - Bounded concurrent polling with per-endpoint failure isolation
//! - [`mapper`] - Field table compilation, name templates and clamping
//! - [`aggregator`] - Per-cycle records grouped by endpoint
//! - [`reporter`] - One upstream submission per cycle, or none in collect-only mode
//! - [`agent`] - Cycle orchestration and scheduling

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod error;
pub mod health;
pub mod mapper;
pub mod oid;
pub mod poller;
pub mod query;
pub mod rate;
pub mod registry;
pub mod reporter;
pub mod source;

pub use agent::{Agent, CycleReport, EndpointSummary};
pub use config::AgentConfig;
pub use error::{AgentError, PollError, ReportError, Result};
