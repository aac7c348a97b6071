//! Turn orchestration for the resilient execution core: context guarding
//! and compaction, the subagent registry, startup recovery, and the turn
//! runner that ties the store and the fallback manager together.

pub mod context;
pub mod error;
pub mod recovery;
pub mod runner;
pub mod runtime;
pub mod subagent;

pub use context::{CompactionResult, Compactor, ContextGuard, GuardConfig, ModelSummarizer, SummarizeError, Summarizer, Verdict};
pub use error::TurnError;
pub use recovery::{DefaultNoticeComposer, NoticeComposer, RecoveryReport, StartupRecovery};
pub use runner::{TurnOutcome, TurnRunner};
pub use runtime::{Runtime, RuntimeError};
pub use subagent::{RegistryFile, RunStatus, SpawnLimits, SubagentRecord, SubagentRegistry, WaitOutcome};
