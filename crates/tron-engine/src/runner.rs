use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use tron_core::{SessionKey, Turn};
use tron_llm::{ChainEntry, FallbackError, FallbackManager, FallbackOutcome, ModelReply};
use tron_store::{RecoveryNotice, SentinelTracker, SessionStore};

use crate::context::{CompactionResult, Compactor, ContextGuard, Verdict};
use crate::error::TurnError;

/// Lock cycles spent trying to store a reply the model already produced.
const WRITE_BACK_ATTEMPTS: u32 = 3;

/// What a completed turn produced.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub reply: ModelReply,
    /// Restart notice to deliver alongside the reply.
    pub notice: Option<RecoveryNotice>,
    /// Whether compacted history was written back.
    pub compacted: bool,
    pub entry: ChainEntry,
    pub credential_id: String,
    pub attempts: usize,
}

/// Runs one inbound turn end to end: sentinel, load, guard, model call,
/// persist, clear.
///
/// The session lock is held only while reading and while writing back; it is
/// released across compaction and the model call. On return the writer
/// re-validates that the stored history still starts with the turns it
/// worked on before replacing them with a compacted version. The reply is
/// always appended; if it cannot be stored it is handed back in
/// [`TurnError::ReplyNotSaved`]. An input whose turn id is already stored is
/// not appended twice, so retrying with the same turn is safe.
pub struct TurnRunner {
    sessions: SessionStore,
    sentinels: SentinelTracker,
    compactor: Compactor,
    fallback: Arc<FallbackManager>,
}

impl TurnRunner {
    pub fn new(
        sessions: SessionStore,
        sentinels: SentinelTracker,
        compactor: Compactor,
        fallback: Arc<FallbackManager>,
    ) -> Self {
        Self {
            sessions,
            sentinels,
            compactor,
            fallback,
        }
    }

    pub fn guard(&self) -> &ContextGuard {
        self.compactor.guard()
    }

    pub fn fallback(&self) -> &Arc<FallbackManager> {
        &self.fallback
    }

    /// Process `input` for `key`. The sentinel is left in `processing` only if
    /// the process dies before this returns.
    #[instrument(skip(self, key, input), fields(session_key = %key))]
    pub async fn run_turn(&self, key: &SessionKey, input: Turn) -> Result<TurnOutcome, TurnError> {
        self.sentinels.mark_processing(key)?;
        let result = self.process(key, input).await;
        if let Err(e) = self.sentinels.clear(key) {
            warn!(error = %e, "failed to clear sentinel");
        }
        match &result {
            Ok(outcome) => info!(
                model = %outcome.entry,
                credential = %outcome.credential_id,
                attempts = outcome.attempts,
                compacted = outcome.compacted,
                "turn completed"
            ),
            Err(e) => warn!(error = %e, "turn failed"),
        }
        result
    }

    async fn process(&self, key: &SessionKey, input: Turn) -> Result<TurnOutcome, TurnError> {
        let snapshot = self
            .sessions
            .with_lock(key, |record| {
                if !record.active {
                    return Err(TurnError::SessionInactive(record.session_key.clone()));
                }
                if record.turns.iter().any(|t| t.id == input.id) {
                    debug!(turn_id = %input.id, "input already stored, not appending it again");
                } else {
                    record.append_turn(input);
                }
                Ok(record.turns.clone())
            })
            .await?;

        let mut compaction = self.guard_history(&snapshot).await?;
        let outcome = match self.call_model(&snapshot, compaction.as_ref()).await {
            Err(FallbackError::ContextOverflow { model, .. }) => {
                warn!(model = %model, "model rejected the context, forcing compaction");
                let forced = self.force_compaction(&snapshot, compaction.as_ref()).await?;
                let outcome = self
                    .call_model(&snapshot, Some(&forced))
                    .await
                    .map_err(|e| self.map_fallback(e, forced.tokens_after))?;
                compaction = Some(forced);
                outcome
            }
            other => other.map_err(|e| self.map_fallback(e, self.guard().check_turns(&snapshot).tokens()))?,
        };

        let reply_turn = outcome.reply.clone().into_turn();
        let mut attempt = 0;
        let (notice, compacted) = loop {
            attempt += 1;
            let reply_turn = reply_turn.clone();
            let written = self
                .sessions
                .with_lock(key, |record| {
                    let compacted = match &compaction {
                        Some(result) => {
                            let applied = result.apply_to(record, &snapshot);
                            if !applied {
                                warn!("history changed during the model call, compaction discarded");
                            }
                            applied
                        }
                        None => false,
                    };
                    record.append_turn(reply_turn);
                    Ok::<_, TurnError>((record.take_notice(), compacted))
                })
                .await;
            match written {
                Ok(done) => break done,
                Err(TurnError::Busy { resource, waited }) if attempt < WRITE_BACK_ATTEMPTS => {
                    warn!(
                        resource = %resource,
                        attempt,
                        waited_ms = waited.as_millis() as u64,
                        "session busy while storing the reply, trying again"
                    );
                }
                Err(e) => {
                    return Err(TurnError::ReplyNotSaved {
                        reply: Box::new(outcome.reply),
                        reason: e.to_string(),
                    })
                }
            }
        };

        let FallbackOutcome {
            reply,
            entry,
            credential_id,
            attempts,
        } = outcome;
        Ok(TurnOutcome {
            reply,
            notice,
            compacted,
            entry,
            credential_id,
            attempts,
        })
    }

    /// Check the budget before the model call and compact when asked to.
    async fn guard_history(&self, snapshot: &[Turn]) -> Result<Option<CompactionResult>, TurnError> {
        let hard = self.guard().config().hard_limit();
        match self.guard().check_turns(snapshot) {
            Verdict::Ok { tokens } => {
                debug!(tokens, "context within budget");
                Ok(None)
            }
            Verdict::MustAbort { tokens, limit } => Err(TurnError::Overflow { tokens, limit }),
            Verdict::MustCompact { tokens, urgent } => match self.compactor.compact(snapshot, 0).await {
                Ok(result) => match result.verdict {
                    Verdict::MustAbort { tokens, limit } => Err(TurnError::Overflow { tokens, limit }),
                    _ => Ok(Some(result)),
                },
                Err(e) if urgent => {
                    warn!(error = %e, tokens, "compaction failed above the hard limit");
                    Err(TurnError::Overflow { tokens, limit: hard })
                }
                Err(e) => {
                    warn!(error = %e, tokens, "proactive compaction failed, continuing with full history");
                    Ok(None)
                }
            },
        }
    }

    /// One escalation beyond whatever the pre-call compaction reached.
    async fn force_compaction(
        &self,
        snapshot: &[Turn],
        previous: Option<&CompactionResult>,
    ) -> Result<CompactionResult, TurnError> {
        let hard = self.guard().config().hard_limit();
        let escalation = previous.map_or(1, |c| c.escalation + 1);
        let result = self.compactor.compact(snapshot, escalation).await.map_err(|e| {
            warn!(error = %e, "forced compaction failed");
            TurnError::Overflow {
                tokens: previous.map_or_else(|| self.guard().check_turns(snapshot).tokens(), |c| c.tokens_after),
                limit: hard,
            }
        })?;
        if let Verdict::MustAbort { tokens, limit } = result.verdict {
            return Err(TurnError::Overflow { tokens, limit });
        }
        Ok(result)
    }

    async fn call_model(
        &self,
        snapshot: &[Turn],
        compaction: Option<&CompactionResult>,
    ) -> Result<FallbackOutcome, FallbackError> {
        let turns = compaction.map_or(snapshot, |c| c.turns.as_slice());
        self.fallback.run_turn(turns).await
    }

    fn map_fallback(&self, e: FallbackError, tokens: u32) -> TurnError {
        match e {
            FallbackError::CredentialsExhausted { retry_at } => TurnError::CredentialsExhausted { retry_at },
            FallbackError::ContextOverflow { .. } => TurnError::Overflow {
                tokens,
                limit: self.guard().config().hard_limit(),
            },
            other @ (FallbackError::NoCredentials | FallbackError::Unavailable { .. }) => {
                TurnError::ModelUnavailable(other.to_string())
            }
        }
    }
}
