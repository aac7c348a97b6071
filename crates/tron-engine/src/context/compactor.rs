//! History compaction.
//!
//! A pass folds the leading turns chosen by [`ContextGuard::plan_cutoff`]
//! (including any earlier summary) into one new summary turn. Passes repeat
//! with a shrinking preserved window while the result is still at or above
//! the hard limit, up to `max_escalations + 1` passes. Turns are never
//! dropped without being summarized.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use tron_core::tokens::{estimate_turn_tokens, estimate_turns_tokens};
use tron_core::{Role, Turn};
use tron_llm::FallbackManager;
use tron_store::SessionRecord;

use super::guard::{ContextGuard, Verdict};

#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("summarizer failed: {0}")]
    Failed(String),
    #[error("summarizer returned an empty summary")]
    Empty,
    #[error("summary ({summary} tokens) is not smaller than the {replaced} tokens it replaces")]
    NotSmaller { summary: u32, replaced: u32 },
    #[error("no history can be folded")]
    NothingToFold,
}

/// The summarization collaborator.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[Turn]) -> Result<String, SummarizeError>;
}

#[derive(Clone, Debug)]
pub struct CompactionResult {
    /// New history: one summary turn followed by the unfolded tail of the input.
    pub turns: Vec<Turn>,
    /// How many leading input turns the summary replaces.
    pub replaced: usize,
    pub passes: u32,
    /// Escalation level of the last pass.
    pub escalation: u32,
    pub tokens_before: u32,
    pub tokens_after: u32,
    pub verdict: Verdict,
}

impl CompactionResult {
    /// Apply to `record` if its history still begins with `snapshot`, the
    /// sequence this result was computed from. Turns appended after the
    /// snapshot are kept. Returns false when the history diverged.
    pub fn apply_to(&self, record: &mut SessionRecord, snapshot: &[Turn]) -> bool {
        if !record.starts_with_ids(snapshot) {
            return false;
        }
        let appended = record.turns.split_off(snapshot.len());
        record.turns = self.turns.clone();
        record.turns.extend(appended);
        record.compaction_cursor = 1;
        record.compactions = record.compactions.saturating_add(self.passes);
        record.refresh_token_estimate();
        true
    }
}

pub struct Compactor {
    guard: ContextGuard,
    summarizer: Arc<dyn Summarizer>,
}

impl Compactor {
    pub fn new(guard: ContextGuard, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { guard, summarizer }
    }

    pub fn guard(&self) -> &ContextGuard {
        &self.guard
    }

    /// Compact `turns`, starting at escalation level `start_escalation`.
    ///
    /// Any summarizer failure or invalid summary aborts the whole compaction;
    /// the caller keeps its original history.
    #[instrument(skip_all, fields(turns = turns.len(), start_escalation = start_escalation))]
    pub async fn compact(&self, turns: &[Turn], start_escalation: u32) -> Result<CompactionResult, SummarizeError> {
        let max_escalations = self.guard.config().max_escalations;
        let max_passes = max_escalations.saturating_add(1);
        let tokens_before = estimate_turns_tokens(turns);

        let mut current: Vec<Turn> = turns.to_vec();
        let mut replaced = 0usize;
        let mut passes = 0u32;
        let mut escalation = start_escalation.min(max_escalations);

        loop {
            let cutoff = self.guard.plan_cutoff(&current, escalation);
            let folded = &current[..cutoff];
            if folded.iter().all(Turn::is_summary) {
                if escalation < max_escalations {
                    escalation += 1;
                    continue;
                }
                if passes == 0 {
                    return Err(SummarizeError::NothingToFold);
                }
                break;
            }

            let summary = self.summarizer.summarize(folded).await?;
            let summary = summary.trim();
            if summary.is_empty() {
                return Err(SummarizeError::Empty);
            }
            let summary_turn = Turn::summary(summary);
            let replaced_tokens = estimate_turns_tokens(folded);
            let summary_tokens = estimate_turn_tokens(&summary_turn);
            if summary_tokens >= replaced_tokens {
                return Err(SummarizeError::NotSmaller {
                    summary: summary_tokens,
                    replaced: replaced_tokens,
                });
            }

            // After the first pass, index 0 is our own summary.
            replaced = if passes == 0 { cutoff } else { replaced + cutoff - 1 };
            let mut next = Vec::with_capacity(current.len() - cutoff + 1);
            next.push(summary_turn);
            next.extend_from_slice(&current[cutoff..]);
            current = next;
            passes += 1;

            let verdict = self.guard.check_turns(&current);
            debug!(
                pass = passes,
                escalation,
                folded = cutoff,
                summary_tokens,
                replaced_tokens,
                tokens = verdict.tokens(),
                "compaction pass"
            );
            if !verdict.blocks_call() || passes >= max_passes {
                break;
            }
            escalation = (escalation + 1).min(max_escalations);
        }

        let verdict = match self.guard.check_turns(&current) {
            Verdict::MustCompact { tokens, urgent: true } => Verdict::MustAbort {
                tokens,
                limit: self.guard.config().hard_limit(),
            },
            other => other,
        };
        let tokens_after = verdict.tokens();
        info!(passes, escalation, replaced, tokens_before, tokens_after, "history compacted");
        Ok(CompactionResult {
            turns: current,
            replaced,
            passes,
            escalation,
            tokens_before,
            tokens_after,
            verdict,
        })
    }
}

const SUMMARY_INSTRUCTIONS: &str = "Summarize the conversation below for your own future reference. \
Keep decisions, open tasks, facts about the user, and the outcome of every tool call. \
Be concise; reply with the summary only.";

/// Summarizes through the model chain, using the same fallback rules as a
/// regular turn.
pub struct ModelSummarizer {
    fallback: Arc<FallbackManager>,
}

impl ModelSummarizer {
    pub fn new(fallback: Arc<FallbackManager>) -> Self {
        Self { fallback }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, turns: &[Turn]) -> Result<String, SummarizeError> {
        let request = vec![Turn::user(format!("{SUMMARY_INSTRUCTIONS}\n\n{}", transcript(turns)))];
        self.fallback
            .run_turn(&request)
            .await
            .map(|outcome| outcome.reply.content)
            .map_err(|e| SummarizeError::Failed(e.to_string()))
    }
}

/// Plain-text rendering of turns for a summarization prompt.
pub fn transcript(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        match turn.role {
            Role::Tool => {
                for result in &turn.tool_results {
                    let status = if result.is_error { "error" } else { "ok" };
                    out.push_str(&format!("[tool {} {status}] {}\n", result.call_id, result.output));
                }
            }
            role => {
                if !turn.content.is_empty() {
                    out.push_str(&format!("[{role}] {}\n", turn.content));
                }
                for call in &turn.tool_calls {
                    out.push_str(&format!("[call {} {}] {}\n", call.id, call.name, call.arguments));
                }
            }
        }
    }
    out
}
