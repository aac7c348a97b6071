//! Settings types. Every section is camelCase on disk and fully defaulted, so
//! a partial user file only needs the keys it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResilienceSettings {
    /// Root of all persisted artifacts. `~` expands to `$HOME`.
    pub data_dir: String,
    pub lock: LockSettings,
    pub context: ContextSettings,
    pub fallback: FallbackSettings,
    pub subagents: SubagentSettings,
    pub logging: LoggingSettings,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.tron".to_string(),
            lock: LockSettings::default(),
            context: ContextSettings::default(),
            fallback: FallbackSettings::default(),
            subagents: SubagentSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ResilienceSettings {
    pub fn data_dir_path(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }

    /// Reject values that would make the core misbehave rather than fail.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.trim().is_empty() {
            return Err(SettingsError::invalid("dataDir", "must not be empty"));
        }

        let lock = &self.lock;
        if lock.timeout_ms == 0 {
            return Err(SettingsError::invalid("lock.timeoutMs", "must be positive"));
        }
        if lock.retry_initial_ms == 0 {
            return Err(SettingsError::invalid("lock.retryInitialMs", "must be positive"));
        }
        if lock.retry_initial_ms > lock.retry_max_ms {
            return Err(SettingsError::invalid(
                "lock.retryInitialMs",
                format!("{} exceeds retryMaxMs {}", lock.retry_initial_ms, lock.retry_max_ms),
            ));
        }
        if lock.stale_after_secs == 0 {
            return Err(SettingsError::invalid("lock.staleAfterSecs", "must be positive"));
        }

        let ctx = &self.context;
        if ctx.reserve_output_tokens >= ctx.context_window {
            return Err(SettingsError::invalid(
                "context.reserveOutputTokens",
                "must be smaller than contextWindow",
            ));
        }
        for (field, ratio) in [
            ("context.softRatio", ctx.soft_ratio),
            ("context.hardRatio", ctx.hard_ratio),
            ("context.targetRatio", ctx.target_ratio),
            ("context.largeTurnRatio", ctx.large_turn_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(SettingsError::invalid(field, format!("{ratio} is outside (0, 1]")));
            }
        }
        if ctx.soft_ratio >= ctx.hard_ratio {
            return Err(SettingsError::invalid(
                "context.softRatio",
                format!("{} must be below hardRatio {}", ctx.soft_ratio, ctx.hard_ratio),
            ));
        }
        if ctx.target_ratio > ctx.soft_ratio {
            return Err(SettingsError::invalid(
                "context.targetRatio",
                format!("{} must not exceed softRatio {}", ctx.target_ratio, ctx.soft_ratio),
            ));
        }
        if ctx.preserve_recent_turns == 0 {
            return Err(SettingsError::invalid("context.preserveRecentTurns", "must be at least 1"));
        }

        let fb = &self.fallback;
        if fb.chain.is_empty() {
            return Err(SettingsError::invalid("fallback.chain", "must name at least one model"));
        }
        if let Some(entry) = fb.chain.iter().find(|e| e.provider.is_empty() || e.model.is_empty()) {
            return Err(SettingsError::invalid(
                "fallback.chain",
                format!("entry {entry:?} has an empty provider or model"),
            ));
        }
        if fb.rate_limit_cooldown_secs == 0 || fb.auth_cooldown_secs == 0 || fb.billing_cooldown_secs == 0 {
            return Err(SettingsError::invalid("fallback", "cooldown durations must be positive"));
        }
        if fb.max_cooldown_secs < fb.rate_limit_cooldown_secs {
            return Err(SettingsError::invalid(
                "fallback.maxCooldownSecs",
                "must be at least rateLimitCooldownSecs",
            ));
        }

        let sub = &self.subagents;
        if sub.max_children == 0 {
            return Err(SettingsError::invalid("subagents.maxChildren", "must be at least 1"));
        }
        if sub.wait_poll_ms == 0 {
            return Err(SettingsError::invalid("subagents.waitPollMs", "must be positive"));
        }
        Ok(())
    }
}

// ── Process lock ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    /// Upper bound on waiting for a held lock. Seconds, not minutes.
    pub timeout_ms: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// Age after which a lock owned by an unverifiable (remote) process is stale.
    pub stale_after_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            retry_initial_ms: 25,
            retry_max_ms: 500,
            stale_after_secs: 300,
        }
    }
}

impl LockSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

// ── Context guard ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    pub context_window: u32,
    pub reserve_output_tokens: u32,
    /// Fraction of the budget at which compaction is proposed.
    pub soft_ratio: f64,
    /// Fraction of the budget at or above which a model call is refused.
    pub hard_ratio: f64,
    /// Fraction of the budget compaction aims to land under.
    pub target_ratio: f64,
    pub preserve_recent_turns: usize,
    /// A single turn at or above this fraction of the budget forces full folding.
    pub large_turn_ratio: f64,
    pub max_escalations: u32,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            context_window: 200_000,
            reserve_output_tokens: 8_192,
            soft_ratio: 0.70,
            hard_ratio: 0.90,
            target_ratio: 0.50,
            preserve_recent_turns: 6,
            large_turn_ratio: 0.25,
            max_escalations: 2,
        }
    }
}

// ── Fallback manager ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEntrySettings {
    pub provider: String,
    pub model: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackSettings {
    pub chain: Vec<ChainEntrySettings>,
    /// Defaults to `<dataDir>/credentials.json` when unset.
    pub credentials_file: Option<String>,
    pub timeout_retries: u32,
    pub timeout_backoff_ms: u64,
    pub rate_limit_cooldown_secs: u64,
    pub auth_cooldown_secs: u64,
    pub billing_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    /// Share cooldowns with other local processes through the ledger file.
    pub share_cooldowns: bool,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            chain: vec![
                ChainEntrySettings {
                    provider: "anthropic".to_string(),
                    model: "claude-sonnet-4-5".to_string(),
                },
                ChainEntrySettings {
                    provider: "openai".to_string(),
                    model: "gpt-4.1".to_string(),
                },
            ],
            credentials_file: None,
            timeout_retries: 2,
            timeout_backoff_ms: 500,
            rate_limit_cooldown_secs: 60,
            auth_cooldown_secs: 300,
            billing_cooldown_secs: 3_600,
            max_cooldown_secs: 6 * 3_600,
            share_cooldowns: true,
        }
    }
}

impl FallbackSettings {
    /// Explicit credentials file, with `~` expanded.
    pub fn credentials_path(&self) -> Option<PathBuf> {
        self.credentials_file.as_deref().map(expand_home)
    }
}

// ── Subagents ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentSettings {
    pub max_depth: u32,
    /// Live (pending or running) children one parent session may have.
    pub max_children: usize,
    pub wait_poll_ms: u64,
    /// Terminal runs older than this are pruned.
    pub retention_hours: u64,
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children: 5,
            wait_poll_ms: 500,
            retention_hours: 7 * 24,
        }
    }
}

impl SubagentSettings {
    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3_600)
    }
}

// ── Logging ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Append warn+ events to `<dataDir>/logs/warn.jsonl`.
    pub persist_warnings: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            persist_warnings: true,
        }
    }
}

pub(crate) fn expand_home(raw: &str) -> PathBuf {
    let home = || std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    if raw == "~" {
        PathBuf::from(home())
    } else if let Some(rest) = raw.strip_prefix("~/") {
        PathBuf::from(home()).join(rest)
    } else {
        PathBuf::from(raw)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ResilienceSettings::default().validate().unwrap();
    }

    #[test]
    fn camel_case_on_disk() {
        let json = serde_json::to_value(ResilienceSettings::default()).unwrap();
        assert_eq!(json["lock"]["timeoutMs"], 5_000);
        assert_eq!(json["context"]["preserveRecentTurns"], 6);
        assert_eq!(json["subagents"]["maxChildren"], 5);
        assert!(json["fallback"]["chain"].is_array());
    }

    #[test]
    fn soft_must_be_below_hard() {
        let mut s = ResilienceSettings::default();
        s.context.soft_ratio = 0.95;
        let err = s.validate().unwrap_err();
        assert!(matches!(
            err,
            SettingsError::InvalidValue { field: "context.softRatio", .. }
        ));
    }

    #[test]
    fn zero_lock_timeout_rejected() {
        let mut s = ResilienceSettings::default();
        s.lock.timeout_ms = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn empty_chain_rejected() {
        let mut s = ResilienceSettings::default();
        s.fallback.chain.clear();
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("fallback.chain"));
    }

    #[test]
    fn reserve_must_fit_window() {
        let mut s = ResilienceSettings::default();
        s.context.reserve_output_tokens = s.context.context_window;
        assert!(s.validate().is_err());
    }

    #[test]
    fn expand_home_paths() {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        assert_eq!(expand_home("~/.tron"), PathBuf::from(&home).join(".tron"));
        assert_eq!(expand_home("/var/lib/tron"), PathBuf::from("/var/lib/tron"));
    }

    #[test]
    fn lock_durations() {
        let lock = LockSettings::default();
        assert_eq!(lock.timeout(), Duration::from_secs(5));
        assert_eq!(lock.stale_after(), Duration::from_secs(300));
    }
}
