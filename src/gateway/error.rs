//! Tool error taxonomy shared by every external capability.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Classification of a failed tool call. Drives the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorKind {
    Timeout,
    RateLimited,
    Transient,
    Permanent,
    /// The owning session was cancelled while the call was pending.
    Cancelled,
}

impl ToolErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::Timeout => "TIMEOUT",
            ToolErrorKind::RateLimited => "RATE_LIMITED",
            ToolErrorKind::Transient => "TRANSIENT",
            ToolErrorKind::Permanent => "PERMANENT",
            ToolErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
    /// Server-provided hint (e.g. `Retry-After`), only meaningful for `RateLimited`.
    pub retry_after: Option<Duration>,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ToolErrorKind::RateLimited, message)
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Permanent, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ToolErrorKind::Cancelled, "call aborted by session cancellation")
    }

    /// Everything except `Permanent` and `Cancelled` is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, ToolErrorKind::Permanent | ToolErrorKind::Cancelled)
    }

    /// Classify a non-success HTTP status from a provider.
    pub fn from_status(
        provider: &str,
        status: reqwest::StatusCode,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = format!("{} returned {}: {}", provider, status, truncate(body, 300));
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Self::rate_limited(message, retry_after)
        } else if status == reqwest::StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }

    /// Classify a transport-level failure from `reqwest`.
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        let message = format!("{} request failed: {}", provider, err);
        if err.is_timeout() {
            Self::timeout(message)
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::transient(message)
        } else if err.is_decode() {
            Self::permanent(message)
        } else if let Some(status) = err.status() {
            Self::from_status(provider, status, "", None)
        } else {
            Self::transient(message)
        }
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
