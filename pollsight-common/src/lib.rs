//! pollsight common library
//!
//! Payload model and plumbing shared by the pollsight agent and its tests:
//!
//! - [`metric`] - `MetricRecord`, `ComponentReport` and the per-cycle `ReportBatch`
//! - [`serialization`] - JSON/CBOR payload encoding
//! - [`config`] - JSON5 parsing and the `logging` section
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod metric;
pub mod serialization;

pub use config::{LogFormat, LoggingConfig, parse_config};
pub use error::{Error, Result};
pub use metric::{
    AgentInfo, ComponentReport, MetricRecord, MetricValue, ReportBatch, Transform,
    current_timestamp_millis,
};
pub use serialization::{Format, decode, encode};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level` when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init(),
    };

    installed.map_err(|e| Error::Logging(e.to_string()))
}
