//! Per-item call trace for stage runs, written as JSON lines.

use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::mpsc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::conversation::ModeLabel;
use crate::retry::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    /// Result written.
    Completed,
    /// Backend answered but the output never validated.
    ParseFailed,
    /// Gave up on backend errors.
    Failed,
    /// Prompt builder offered nothing for the item.
    Skipped,
    /// Planned only; nothing sent.
    DryRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallTrace {
    pub timestamp_ms: i64,
    pub run_id: Uuid,
    pub stage: &'static str,
    pub slot: &'static str,
    pub item_id: String,
    pub outcome: TraceOutcome,
    pub resource: Option<String>,
    pub mode: Option<ModeLabel>,
    /// Output budget of the last request.
    pub max_output_tokens: Option<u32>,
    pub estimated_input_tokens: Option<u32>,
    pub input_chars: Option<usize>,
    /// Backend calls made for this item.
    pub calls: u32,
    pub fallback_used: bool,
    pub error_class: Option<ErrorClass>,
    pub error: Option<String>,
    /// Raw output that failed to parse.
    pub raw: Option<String>,
    /// Transmitted input, recorded for dry runs.
    pub input: Option<String>,
}

impl CallTrace {
    pub fn new(
        run_id: Uuid,
        stage: &'static str,
        slot: &'static str,
        item_id: impl Into<String>,
        outcome: TraceOutcome,
    ) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            run_id,
            stage,
            slot,
            item_id: item_id.into(),
            outcome,
            resource: None,
            mode: None,
            max_output_tokens: None,
            estimated_input_tokens: None,
            input_chars: None,
            calls: 0,
            fallback_used: false,
            error_class: None,
            error: None,
            raw: None,
            input: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("cannot write trace: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot encode trace record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("trace writer has stopped")]
    Closed,
    #[error("trace writer panicked")]
    Panicked,
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: CallTrace) -> Result<(), TraceError>;
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn record(&self, _event: CallTrace) -> Result<(), TraceError> {
        Ok(())
    }
}

/// Sends records to a writer thread that appends one JSON object per line.
///
/// Every line is flushed as it is written, so an interrupted run keeps the
/// trace of every item it finished.
#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<CallTrace>,
}

/// Handle on the writer thread. The thread exits once every sink clone is dropped.
pub struct TraceWorker {
    handle: std::thread::JoinHandle<Result<(), TraceError>>,
}

impl TraceWorker {
    /// Wait for the writer to drain; returns its first write error.
    pub fn join(self) -> Result<(), TraceError> {
        self.handle.join().map_err(|_| TraceError::Panicked)?
    }
}

impl JsonlTraceSink {
    /// Create or truncate `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        Ok(Self::spawn(File::create(path)?))
    }

    /// Append to `path`, keeping earlier runs.
    pub fn append(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::spawn(file))
    }

    fn spawn(file: File) -> (Self, TraceWorker) {
        let (sender, receiver) = mpsc::channel();
        let handle = std::thread::spawn(move || -> Result<(), TraceError> {
            let mut out = LineWriter::new(file);
            for event in receiver {
                serde_json::to_writer(&mut out, &event)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            Ok(())
        });
        (Self { sender }, TraceWorker { handle })
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: CallTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}
