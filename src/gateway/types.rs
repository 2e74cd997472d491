//! Core types for the chat gateway.

use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage records and debugging.
///
/// Every request through the gateway carries attribution so usage records
/// can be tied back to:
/// - The pipeline run that issued it (run_id)
/// - The item and stage being processed
/// - Which code path triggered it (caller)
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Run this request is part of.
    pub run_id: Option<Uuid>,
    /// Item identifier being processed.
    pub item_id: Option<String>,
    /// Stage name being processed.
    pub stage: Option<&'static str>,
    /// Which code path made this call, e.g. "pipeline::call".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_stage(mut self, stage: &'static str) -> Self {
        self.stage = Some(stage);
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Request for one turn of a stateful conversation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Resource (loaded model) that must serve the turn.
    pub resource: String,
    /// Content of the turn. For a fresh conversation this is the full context.
    pub input: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Requested output limit in tokens.
    pub max_output_tokens: u32,
    /// Session to continue. `None` starts a new conversation.
    pub previous_response_id: Option<String>,
    /// Whether to ask for an incrementally streamed answer.
    pub stream: bool,
    /// Attribution for usage records.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(
        resource: impl Into<String>,
        input: impl Into<String>,
        attribution: Attribution,
    ) -> Self {
        Self {
            resource: resource.into(),
            input: input.into(),
            temperature: 0.2,
            max_output_tokens: 512,
            previous_response_id: None,
            stream: false,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }

    /// Continue the conversation identified by `session`.
    pub fn continuing(mut self, session: impl Into<String>) -> Self {
        self.previous_response_id = Some(session.into());
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn is_chained(&self) -> bool {
        self.previous_response_id.is_some()
    }
}

/// One block of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlock {
    /// Block type as reported by the backend ("message", "reasoning", ...).
    pub kind: String,
    pub text: String,
}

impl ContentBlock {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            text: text.into(),
        }
    }

    /// Message and plain-text blocks carry the answer; other kinds are side channels.
    pub fn is_message(&self) -> bool {
        matches!(self.kind.as_str(), "message" | "text")
    }
}

/// Response from one conversation turn.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Session id for continuing this conversation, if the backend returned one.
    pub response_id: Option<String>,
    /// Output blocks in arrival order.
    pub blocks: Vec<ContentBlock>,
    /// Input tokens consumed, if reported.
    pub input_tokens: Option<u32>,
    /// Output tokens generated, if reported.
    pub output_tokens: Option<u32>,
    /// Time taken for the request.
    pub latency: Duration,
}

impl ChatResponse {
    /// Concatenated text of all message blocks.
    pub fn content(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.is_message())
            .map(|b| b.text.as_str())
            .collect()
    }
}
