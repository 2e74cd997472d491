//! Errors from one backend attempt, and how they map onto retry classes.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::retry::ErrorClass;

const SNIPPET_CHARS: usize = 200;

/// What a non-2xx answer from the backend means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// 404 on a fresh request: the resource is still loading.
    NotReady,
    /// 400/404 on a chained request naming the session.
    SessionRejected,
    /// 400/413: input plus requested output does not fit.
    TooLarge,
    /// 429.
    Throttled,
    /// 5xx.
    Backend,
    /// Anything else (401, 403, 422, ...).
    Refused,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::SessionRejected => "session_rejected",
            Self::TooLarge => "request_too_large",
            Self::Throttled => "throttled",
            Self::Backend => "backend_error",
            Self::Refused => "refused",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status line and body details of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub status: u16,
    /// Machine-readable code from the error body, if any.
    pub code: Option<String>,
    /// Body flattened to one line and cut to a readable length.
    pub body_snippet: Option<String>,
}

impl ErrorContext {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            code: None,
            body_snippet: None,
        }
    }

    pub fn with_code(self, code: Option<String>) -> Self {
        Self { code, ..self }
    }

    pub fn with_body(mut self, body: &str) -> Self {
        let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
        if !flat.is_empty() {
            self.body_snippet = Some(match flat.char_indices().nth(SNIPPET_CHARS) {
                Some((cut, _)) => format!("{}…", &flat[..cut]),
                None => flat,
            });
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// No complete answer within the client timeout.
    #[error("no answer within {after:?}")]
    Timeout { after: Duration },

    /// Connection refused or reset, or the body was cut off.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("{kind} (HTTP {}): {message}", context.status)]
    Status {
        kind: StatusKind,
        message: String,
        context: ErrorContext,
    },

    /// A 2xx answer that cannot be used.
    #[error("unusable answer: {message}")]
    Answer { message: String, retryable: bool },

    /// Bad base URL or token; nothing to retry.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn status(kind: StatusKind, message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Status {
            kind,
            message: message.into(),
            context,
        }
    }

    pub fn answer(message: impl Into<String>, retryable: bool) -> Self {
        Self::Answer {
            message: message.into(),
            retryable,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Status family, when the backend answered with an error status.
    pub fn kind(&self) -> Option<StatusKind> {
        match self {
            Self::Status { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Map onto the retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } | Self::Transport(_) => ErrorClass::Transient,
            Self::Status { kind, .. } => match kind {
                StatusKind::NotReady => ErrorClass::NotReady,
                StatusKind::SessionRejected => ErrorClass::StaleSession,
                StatusKind::TooLarge => ErrorClass::Oversized,
                StatusKind::Throttled => ErrorClass::Transient,
                StatusKind::Backend => ErrorClass::Broken,
                StatusKind::Refused => ErrorClass::Fatal,
            },
            Self::Answer { retryable: true, .. } => ErrorClass::Transient,
            Self::Answer { .. } | Self::Config(_) => ErrorClass::Fatal,
        }
    }

    /// Short code for usage records and log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Transport(_) => "transport_error",
            Self::Status { kind, .. } => kind.as_str(),
            Self::Answer { .. } => "bad_answer",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Status { context, .. } => Some(context),
            _ => None,
        }
    }

    /// HTTP status, when the backend answered at all.
    pub fn http_status(&self) -> Option<u16> {
        self.context().map(|c| c.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_status_families() {
        let err = |kind| ProviderError::status(kind, "x", ErrorContext::new(404));
        assert_eq!(err(StatusKind::NotReady).class(), ErrorClass::NotReady);
        assert_eq!(err(StatusKind::TooLarge).class(), ErrorClass::Oversized);
        assert_eq!(err(StatusKind::Backend).class(), ErrorClass::Broken);
        assert_eq!(err(StatusKind::Throttled).class(), ErrorClass::Transient);
        assert_eq!(err(StatusKind::Refused).class(), ErrorClass::Fatal);
        assert_eq!(
            ProviderError::Timeout {
                after: Duration::from_secs(1)
            }
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(ProviderError::answer("truncated json", true).class(), ErrorClass::Transient);
        assert_eq!(ProviderError::answer("error field", false).class(), ErrorClass::Fatal);
    }

    #[test]
    fn display_names_status_and_kind() {
        let err = ProviderError::status(
            StatusKind::SessionRejected,
            "previous_response_id not found",
            ErrorContext::new(404),
        );
        assert_eq!(
            err.to_string(),
            "session_rejected (HTTP 404): previous_response_id not found"
        );
        assert_eq!(err.http_status(), Some(404));
        assert_eq!(err.code(), "session_rejected");
    }

    #[test]
    fn body_snippet_is_flattened_and_truncated() {
        let long = "x\n".repeat(300);
        let ctx = ErrorContext::new(500).with_body(&long);
        let snippet = ctx.body_snippet.unwrap();
        assert!(!snippet.contains('\n'));
        assert!(snippet.ends_with('…'));
        assert_eq!(snippet.chars().count(), SNIPPET_CHARS + 1);

        assert!(ErrorContext::new(500).with_body("   ").body_snippet.is_none());
    }
}
