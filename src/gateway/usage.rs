//! One usage record per backend attempt.
//!
//! The gateway hands every record to a [`UsageSink`]; where records end up is
//! the sink's business. The CLI prints them to stderr with `--usage`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::ProviderError;
use super::types::{ChatRequest, ChatResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    pub caller: &'static str,
    pub stage: Option<&'static str>,
    pub item_id: Option<String>,
    pub resource: String,
    /// The request continued an existing session.
    pub chained: bool,
    pub input_chars: usize,
    pub max_output_tokens: u32,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<&'static str>,
    pub http_status: Option<u16>,
}

impl UsageRecord {
    /// Record for `req`, filled from whatever the attempt produced.
    pub fn for_attempt(req: &ChatRequest, outcome: Result<&ChatResponse, &ProviderError>) -> Self {
        let mut record = Self {
            timestamp: Utc::now(),
            run_id: req.attribution.run_id,
            caller: req.attribution.caller,
            stage: req.attribution.stage,
            item_id: req.attribution.item_id.clone(),
            resource: req.resource.clone(),
            chained: req.is_chained(),
            input_chars: req.input.chars().count(),
            max_output_tokens: req.max_output_tokens,
            input_tokens: None,
            output_tokens: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            http_status: None,
        };
        match outcome {
            Ok(resp) => {
                record.input_tokens = resp.input_tokens;
                record.output_tokens = resp.output_tokens;
                record.latency_ms = resp.latency.as_millis() as u64;
            }
            Err(err) => {
                record.status = CallStatus::Error;
                record.error_code = Some(err.code());
                record.http_status = err.http_status();
            }
        }
        record
    }
}

/// Destination for usage records. Recording never fails the call.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: UsageRecord) {}
}

/// Prints each record as one JSON line on stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: UsageRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => eprintln!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize usage record"),
        }
    }
}
