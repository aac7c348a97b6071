pub mod atomic;
pub mod error;
pub mod lock;
pub mod paths;
pub mod schema;
pub mod sentinel;
pub mod sessions;

pub use error::StoreError;
pub use lock::{LockConfig, LockHandle, LockManager, LockRecord, LockStatus};
pub use paths::{session_resource, StoreLayout, LEDGER_RESOURCE, REGISTRY_RESOURCE};
pub use schema::Record;
pub use sentinel::{InterruptedSession, SentinelPhase, SentinelRecord, SentinelTracker};
pub use sessions::{
    DirectiveState, RecoveryNotice, SessionRecord, SessionStore, SessionSummary, ThinkingLevel,
};
