//! Model-call resilience: failure classification, credentials with
//! cooldowns, the model chain, and the fallback manager that ties them
//! together.

pub mod chain;
pub mod classify;
pub mod credentials;
pub mod fallback;
pub mod invoker;
pub mod ledger;
pub mod mock;

pub use chain::{ChainEntry, ModelChain};
pub use classify::{classify_transport, classify_http, classify_message};
pub use credentials::{
    load_credentials, load_credentials_with, CooldownPolicy, Credential, CredentialError, CredentialState,
};
pub use fallback::{FallbackConfig, FallbackError, FallbackManager, FallbackOutcome};
pub use invoker::{ModelInvoker, ModelReply};
pub use ledger::{CooldownLedger, LedgerEntry, LedgerStore};
