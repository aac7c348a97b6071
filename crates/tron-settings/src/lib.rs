//! Configuration for locks, context budgets, the fallback chain, subagent
//! limits and logging.
//!
//! Later layers win: compiled defaults, then `~/.tron/resilience.json`, then
//! `TRON_*` environment variables. Nothing is global; load once and hand the
//! value to whatever needs it.
//!
//! ```no_run
//! use tron_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("lock timeout: {:?}", settings.lock.timeout());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_explicit,
    load_settings_from_path, settings_path,
};
pub use types::*;
