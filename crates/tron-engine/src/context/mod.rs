//! Token budget enforcement and history compaction.

pub mod compactor;
pub mod guard;

pub use compactor::{transcript, CompactionResult, Compactor, ModelSummarizer, SummarizeError, Summarizer};
pub use guard::{ContextGuard, GuardConfig, Verdict};
