use std::time::Duration;

use chrono::{DateTime, Utc};
use tron_core::{RunId, SessionKey};
use tron_llm::ModelReply;
use tron_store::StoreError;

/// Errors surfaced to the caller of a turn or a subagent operation.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("{resource} is busy (waited {waited:?})")]
    Busy { resource: String, waited: Duration },

    #[error("session {0} is recovering from an interrupted turn")]
    SessionInactive(SessionKey),

    #[error("context overflow: {tokens} tokens exceeds the hard limit of {limit}")]
    Overflow { tokens: u32, limit: u32 },

    #[error("all credentials are cooling down until {retry_at}")]
    CredentialsExhausted { retry_at: DateTime<Utc> },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The model answered but the session could not be updated. The reply is
    /// returned so the caller can still deliver it.
    #[error("reply could not be stored: {reason}")]
    ReplyNotSaved { reply: Box<ModelReply>, reason: String },

    #[error("spawn limit exceeded: {0}")]
    SpawnLimitExceeded(String),

    #[error("subagent run not found: {0}")]
    RunNotFound(RunId),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for TurnError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Busy { resource, waited } => Self::Busy { resource, waited },
            other => Self::Store(other),
        }
    }
}

impl TurnError {
    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. } | Self::SessionInactive(_) | Self::ModelUnavailable(_)
        )
    }

    /// Message suitable for showing to the end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Busy { .. } => {
                "This conversation is busy with another request. Please try again in a moment.".into()
            }
            Self::SessionInactive(_) => {
                "This conversation is recovering from a restart. Please try again shortly.".into()
            }
            Self::Overflow { .. } => "This conversation has grown too long to continue, even after \
                 summarizing older messages. Please start a new session."
                .into(),
            Self::CredentialsExhausted { retry_at } => format!(
                "All model credentials are temporarily unavailable. Try again at {} UTC.",
                retry_at.format("%Y-%m-%d %H:%M")
            ),
            Self::ModelUnavailable(_) => {
                "The model service is not responding right now. Please try again later.".into()
            }
            Self::ReplyNotSaved { .. } => {
                "This reply could not be saved to the conversation history.".into()
            }
            Self::SpawnLimitExceeded(reason) => {
                format!("Cannot start another background task: {reason}.")
            }
            Self::RunNotFound(id) => format!("No background task with id {id}."),
            Self::Store(_) => "An internal storage error occurred. Please try again.".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn busy_store_error_maps_to_busy() {
        let err = TurnError::from(StoreError::Busy {
            resource: "session:x".into(),
            waited: Duration::from_secs(5),
        });
        assert!(matches!(err, TurnError::Busy { .. }));
        assert!(err.is_retryable());

        let other = TurnError::from(StoreError::Io("disk".into()));
        assert!(matches!(other, TurnError::Store(_)));
        assert!(!other.is_retryable());
    }

    #[test]
    fn exhausted_message_carries_retry_time() {
        let retry_at = Utc.with_ymd_and_hms(2026, 3, 1, 14, 5, 0).unwrap();
        let msg = TurnError::CredentialsExhausted { retry_at }.user_message();
        assert!(msg.contains("2026-03-01 14:05"), "{msg}");
    }

    #[test]
    fn user_messages_hide_internals() {
        let err = TurnError::Store(StoreError::Io("/root/.tron/sessions: EACCES".into()));
        assert!(!err.user_message().contains("EACCES"));
        let overflow = TurnError::Overflow { tokens: 190_000, limit: 172_627 };
        assert!(!overflow.is_retryable());
        assert!(overflow.user_message().contains("new session"));
    }
}
