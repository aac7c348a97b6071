use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a provider client saw when a model call failed, before any
/// classification. Clients that only have a status line use [`Self::Http`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("credential rejected: {0}")]
    Unauthorized(String),
    #[error("prompt of {actual} tokens exceeds the {limit} token window")]
    PromptTooLarge { limit: usize, actual: usize },
    #[error("throttled by provider")]
    Throttled { retry_after: Option<Duration> },
    #[error("provider overloaded")]
    Overloaded,
    #[error("connection lost: {0}")]
    Unreachable(String),
    #[error("no response within {0:?}")]
    TimedOut(Duration),
    #[error("call cancelled")]
    Cancelled,
}

impl TransportError {
    /// Delay hint carried by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } | Self::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failure categories the fallback manager reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Invalid or expired credential.
    Auth,
    RateLimit,
    Billing,
    /// Not a credential problem; the context guard must handle it.
    ContextOverflow,
    Timeout,
    Unknown,
}

impl FailureKind {
    /// Whether this kind puts the credential that produced it into cooldown.
    pub fn penalizes_credential(&self) -> bool {
        matches!(self, Self::Auth | Self::RateLimit | Self::Billing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Billing => "billing",
            Self::ContextOverflow => "context_overflow",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model-call failure after classification. This is the only error shape
/// the fallback manager consumes.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: FailureKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ClassifiedError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Auth, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimit, message)
    }

    pub fn billing(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Billing, message)
    }

    pub fn context_overflow(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ContextOverflow, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unknown, message)
    }
}
