//! Upstream submission of one batch per cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use pollsight_common::{Format, ReportBatch, encode};

use crate::config::UpstreamConfig;
use crate::error::{AgentError, ReportError};

/// Header carrying the license key.
pub const LICENSE_KEY_HEADER: &str = "X-License-Key";

/// Delivers an encoded batch upstream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(&self, payload: Vec<u8>, content_type: &str) -> Result<(), ReportError>;
}

/// HTTP POST transport.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    license_key: String,
}

impl HttpTransport {
    /// Build a transport for `config`.
    pub fn new(config: &UpstreamConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("pollsight-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::Client(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            license_key: config.license_key.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, payload: Vec<u8>, content_type: &str) -> Result<(), ReportError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(LICENSE_KEY_HEADER, &self.license_key)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("[failed to read response body: {}]", e));
        Err(ReportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Observer of every batch handed to [`Reporter::flush`].
pub type BatchHook = Arc<dyn Fn(&ReportBatch) + Send + Sync>;

/// Result of flushing one batch.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Accepted upstream.
    Submitted { records: usize, bytes: usize },
    /// Collect-only mode: nothing was sent.
    CollectOnly { records: usize },
    /// Encoding or submission failed; the batch is gone.
    Dropped { records: usize, error: ReportError },
}

impl FlushOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, FlushOutcome::Dropped { .. })
    }

    pub fn records(&self) -> usize {
        match self {
            FlushOutcome::Submitted { records, .. }
            | FlushOutcome::CollectOnly { records }
            | FlushOutcome::Dropped { records, .. } => *records,
        }
    }
}

impl std::fmt::Display for FlushOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushOutcome::Submitted { .. } => write!(f, "submitted"),
            FlushOutcome::CollectOnly { .. } => write!(f, "collect_only"),
            FlushOutcome::Dropped { .. } => write!(f, "dropped"),
        }
    }
}

/// Encodes and submits batches, one call per cycle.
pub struct Reporter {
    transport: Option<Arc<dyn Transport>>,
    format: Format,
    hooks: Vec<BatchHook>,
}

impl Reporter {
    /// Reporter that submits through `transport`.
    pub fn new(transport: Arc<dyn Transport>, format: Format) -> Self {
        Self {
            transport: Some(transport),
            format,
            hooks: Vec::new(),
        }
    }

    /// Reporter that never submits.
    pub fn collect_only(format: Format) -> Self {
        Self {
            transport: None,
            format,
            hooks: Vec::new(),
        }
    }

    /// Add an observer of every flushed batch.
    pub fn with_hook(mut self, hook: impl Fn(&ReportBatch) + Send + Sync + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn is_collect_only(&self) -> bool {
        self.transport.is_none()
    }

    /// Submit `batch` once. Failures are logged and the batch is dropped.
    pub async fn flush(&self, batch: ReportBatch) -> FlushOutcome {
        for hook in &self.hooks {
            hook(&batch);
        }

        let records = batch.record_count();
        let Some(transport) = &self.transport else {
            tracing::debug!(cycle = batch.cycle_id, records, "Collect-only, not submitting");
            return FlushOutcome::CollectOnly { records };
        };

        let payload = match encode(&batch, self.format) {
            Ok(payload) => payload,
            Err(e) => {
                let error = ReportError::from(e);
                tracing::error!(cycle = batch.cycle_id, error = %error, "Failed to encode batch");
                return FlushOutcome::Dropped { records, error };
            }
        };
        let bytes = payload.len();

        match transport.submit(payload, self.format.mime_type()).await {
            Ok(()) => {
                tracing::debug!(cycle = batch.cycle_id, records, bytes, "Batch submitted");
                FlushOutcome::Submitted { records, bytes }
            }
            Err(error) => {
                tracing::warn!(
                    cycle = batch.cycle_id,
                    records,
                    error = %error,
                    "Upstream submission failed, dropping batch"
                );
                FlushOutcome::Dropped { records, error }
            }
        }
    }
}
